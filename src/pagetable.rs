/*
 * Copyright 2025 Oxide Computer Company
 */

use crate::access::Access;
use crate::cache::CacheFlush;
use crate::frame_alloc::{Fill, FrameAlloc};
use crate::prelude::*;
use crate::tedium64::*;
use crate::tlb::{Cleanup, CpuSet, TableRef};
use crate::to_inclusive::ToInclusive;
use core::marker::PhantomData;
use core::ops::{RangeBounds, RangeInclusive};
use core::sync::atomic::AtomicU64;
use log::{debug, warn};
use static_assertions::const_assert_eq;
use x86::bits64::paging::{PAddr, VAddr};

/*
 * This is the machinery shared by every radix-tree page table we build: the
 * walk, node installation, leaf replacement, removal, and structural copies.
 * What an entry looks like is supplied by an EntryFormat; how entries are
 * read and written, flushed, allocated, and invalidated are supplied by the
 * policies in access.rs, cache.rs, frame_alloc.rs, and tlb.rs.  See hpt.rs
 * for the amd64 host instantiation.
 *
 * Levels are numbered from the bottom: level 0 entries map 4K frames and
 * the root is at level `levels - 1`.  A present entry at level 0 is always a
 * leaf; above that it is a leaf only if the level is below the table's
 * supported leaf level count and the entry carries the format's superpage
 * marker.
 *
 * Tables are shared by every core without a lock.  Readers never block and
 * every update is one atomic operation on one entry word, so for any single
 * address there is one agreed order of writers and the last one wins.
 */

pub type Level = u8;

pub const INDEX_BITS: u64 = 9;
pub const ENTRIES: usize = 1 << INDEX_BITS;
pub const PAGE_SHIFT: Shift64 = shift64!(12);
pub const MAX_LEVELS: Level = 5;

pub type Node = [AtomicU64; ENTRIES];

const_assert_eq!(core::mem::size_of::<Node>(), 4096);
const_assert_eq!(PAGE_SHIFT.size(), 4096);

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum Error {
	#[error("no frames left for page table nodes")]
	NoMemory,
	#[error("a larger mapping already covers this address")]
	LargerMappingExists,
	#[error("smaller mappings already exist beneath this address")]
	SmallerMappingsExist,
	#[error("leaf mappings at level {0} are not supported")]
	UnsupportedLeafLevel(Level),
}

pub const fn level_shift(level: Level) -> Shift64 {
	shift64!(PAGE_SHIFT.count() + INDEX_BITS * level as u64)
}

pub const fn level_size(level: Level) -> u64 {
	level_shift(level).size()
}

/*
 * The bit layout of an entry, as far as the engine needs to know it.
 */
pub trait EntryFormat {
	/// Bits that hold a node or frame address.
	const ADDR: Mask64;

	fn is_present(raw: u64) -> bool;

	/// The superpage marker.  Meaningless at level 0.
	fn is_large(raw: u64) -> bool;

	/// A leaf entry for `frame` at `level`, given the raw attribute bits.
	fn leaf(frame: PAddr, attr: u64, level: Level) -> u64;

	/// A non-leaf entry pointing at `node`.
	fn table(node: PAddr) -> u64;

	fn node(raw: u64) -> PAddr {
		PAddr(raw & Self::ADDR)
	}

	fn frame(raw: u64, level: Level) -> PAddr {
		PAddr(raw & Self::ADDR & Mask64::bits_from(level_shift(level).count()))
	}

	fn attr(raw: u64, _level: Level) -> u64 {
		raw & !Self::ADDR
	}
}

/*
 * A leaf as seen by a lookup, or as displaced by a replacement.
 */
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Mapping {
	pub frame: PAddr,
	pub attr: u64,
	pub level: Level,
}

impl Mapping {
	pub const fn size(&self) -> u64 {
		level_size(self.level)
	}

	pub fn translate(&self, va: VAddr) -> PAddr {
		let offset = va & Mask64::bits_to(level_shift(self.level).count());
		PAddr(self.frame.0 | offset.0)
	}
}

pub struct GenericPageTable<'a, A: Access, C: CacheFlush, F: EntryFormat> {
	root: PAddr,
	levels: Level,
	leaf_levels: Level,
	alloc: &'a dyn FrameAlloc,
	cleanup: &'a dyn Cleanup,
	active: CpuSet,
	stale: CpuSet,
	owned: bool,
	_policy: PhantomData<fn() -> (A, C, F)>,
}

impl<'a, A: Access, C: CacheFlush, F: EntryFormat> GenericPageTable<'a, A, C, F> {
	fn check_geometry(levels: Level, leaf_levels: Level) {
		assert!((1 ..= MAX_LEVELS).contains(&levels));
		assert!((1 ..= levels).contains(&leaf_levels));
	}

	/// A table with a fresh, empty root.
	pub fn new(
		levels: Level,
		leaf_levels: Level,
		alloc: &'a dyn FrameAlloc,
		cleanup: &'a dyn Cleanup,
	) -> Result<Self, Error> {
		Self::check_geometry(levels, leaf_levels);

		let root = alloc.alloc(1, Fill::Zero)?;
		let table = Self {
			root,
			levels,
			leaf_levels,
			alloc,
			cleanup,
			active: CpuSet::new(),
			stale: CpuSet::new(),
			owned: true,
			_policy: PhantomData,
		};
		C::flush_node(table.node(root));

		Ok(table)
	}

	///
	/// # Safety
	///
	/// `root` must be the root of a well-formed tree of this geometry
	/// whose nodes are all reachable through `alloc.phys_to_virt()`, and
	/// which outlives the returned table.  The returned table does not
	/// own those nodes and will not free them; nodes it creates itself
	/// become part of the existing tree and are never freed by it either.
	///
	pub unsafe fn from_root(
		levels: Level,
		leaf_levels: Level,
		root: PAddr,
		alloc: &'a dyn FrameAlloc,
		cleanup: &'a dyn Cleanup,
	) -> Self {
		Self::check_geometry(levels, leaf_levels);
		assert_eq!((root & !F::ADDR).0, 0, "bad page table root {:x}", root.0);

		Self {
			root,
			levels,
			leaf_levels,
			alloc,
			cleanup,
			active: CpuSet::new(),
			stale: CpuSet::new(),
			owned: false,
			_policy: PhantomData,
		}
	}

	pub fn root(&self) -> PAddr {
		self.root
	}

	pub fn levels(&self) -> Level {
		self.levels
	}

	pub fn leaf_levels(&self) -> Level {
		self.leaf_levels
	}

	pub fn active(&self) -> &CpuSet {
		&self.active
	}

	/// Record that `cpu` is about to start translating through this table.
	/// Returns true if what `cpu` cached for the table under its tag may be
	/// out of date, in which case the tag's entries must be discarded.
	pub fn activate(&self, cpu: usize) -> bool {
		if (!self.active.contains(cpu)) {
			debug!("page table {:x} now active on cpu {}", self.root.0, cpu);
		}
		self.active.insert(cpu);
		self.stale.remove(cpu)
	}

	fn table_ref(&self) -> TableRef<'_> {
		TableRef {
			root: self.root,
			active: &self.active,
			stale: &self.stale,
		}
	}

	/*
	 * Virtual addresses are sign-extended from the top bit the tree
	 * translates.
	 */
	fn va_bits(&self) -> u64 {
		PAGE_SHIFT.count() + INDEX_BITS * self.levels as u64
	}

	fn canonical(&self, va: u64) -> u64 {
		let s = 64 - self.va_bits();
		(((va << s) as i64) >> s) as u64
	}

	pub fn is_canonical(&self, va: u64) -> bool {
		self.canonical(va) == va
	}

	fn is_range_canonical(&self, r: &RangeInclusive<u64>) -> bool {
		let top = self.va_bits() - 1;
		self.is_canonical(*r.start()) &&
			self.is_canonical(*r.end()) &&
			(*r.start() >> top) == (*r.end() >> top)
	}

	fn index(va: VAddr, level: Level) -> usize {
		((va.0 >> level_shift(level).count()) & (ENTRIES as u64 - 1))
			as usize
	}

	fn is_leaf(&self, raw: u64, level: Level) -> bool {
		level == 0 || (level < self.leaf_levels && F::is_large(raw))
	}

	fn node(&self, pa: PAddr) -> &Node {
		/*
		 * Safe because the only physical addresses we are ever handed
		 * here are our root and the targets of present non-leaf
		 * entries in our own tree, and nodes are freed only in drop.
		 */
		unsafe { &*(self.alloc.phys_to_virt(pa) as *const Node) }
	}

	fn mapping(raw: u64, level: Level) -> Mapping {
		Mapping {
			frame: F::frame(raw, level),
			attr: F::attr(raw, level),
			level,
		}
	}

	/*
	 * Non-mutating walk: stops at the first hole or the first leaf.
	 */
	fn find_leaf(&self, va: VAddr) -> Option<(&AtomicU64, Level, u64)> {
		let mut node = self.node(self.root);
		let mut level = self.levels - 1;

		loop {
			let slot = &node[Self::index(va, level)];
			let raw = A::load(slot);

			if (!F::is_present(raw)) {
				return (None);
			}
			if (self.is_leaf(raw, level)) {
				return (Some((slot, level, raw)));
			}

			node = self.node(F::node(raw));
			level -= 1;
		}
	}

	/*
	 * Mutating walk: builds the path down to `target` and returns the slot
	 * there.
	 */
	fn walk_to(&self, va: VAddr, target: Level) -> Result<&AtomicU64, Error> {
		let mut node = self.node(self.root);
		let mut level = self.levels - 1;

		while (level > target) {
			let slot = &node[Self::index(va, level)];
			let mut raw = A::load(slot);

			if (!F::is_present(raw)) {
				raw = self.install_node(slot, raw)?;
			}
			if (self.is_leaf(raw, level)) {
				return (Err(Error::LargerMappingExists));
			}

			node = self.node(F::node(raw));
			level -= 1;
		}

		Ok(&node[Self::index(va, target)])
	}

	/*
	 * Hang a fresh node off an empty slot.  Whoever gets there first wins;
	 * a loser gives its node back and descends through the winner's.
	 */
	fn install_node(&self, slot: &AtomicU64, mut seen: u64) -> Result<u64, Error> {
		loop {
			let frame = self.alloc.alloc(1, Fill::Zero)?;
			C::flush_node(self.node(frame));
			let entry = F::table(frame);

			match (A::cas(slot, seen, entry)) {
				Ok(_) => {
					C::flush(slot);
					return (Ok(entry));
				}
				Err(now) => {
					/*
					 * Safe because the candidate was never
					 * published.
					 */
					unsafe {
						self.alloc.free(frame, 1);
					}
					debug!(
						"lost node installation race in {:x}",
						self.root.0
					);
					if (F::is_present(now)) {
						return (Ok(now));
					}
					seen = now;
				}
			}
		}
	}

	/*
	 * Put `new` in a leaf slot and return what was there.  Above level 0
	 * the slot may hold a pointer to a subtree instead, which we refuse to
	 * drop on the floor.
	 */
	fn swap_leaf(&self, slot: &AtomicU64, level: Level, new: u64) -> Result<u64, Error> {
		if (level == 0) {
			return (Ok(A::exchange(slot, new)));
		}

		let mut cur = A::load(slot);
		loop {
			if (F::is_present(cur) && !self.is_leaf(cur, level)) {
				return (Err(Error::SmallerMappingsExist));
			}
			match (A::cas(slot, cur, new)) {
				Ok(_) => return (Ok(cur)),
				Err(now) => cur = now,
			}
		}
	}

	/// Map `va` to `frame` with a leaf at `level` and return whatever
	/// mapping was displaced.  By the time this returns, no core can still
	/// be using the displaced translation; what becomes of its frame is up
	/// to the caller.
	pub fn replace(
		&self,
		va: VAddr,
		frame: PAddr,
		attr: u64,
		level: Level,
	) -> Result<Option<Mapping>, Error> {
		if (level >= self.leaf_levels) {
			warn!(
				"rejecting level {} mapping at {:x}: only {} leaf levels",
				level, va.0, self.leaf_levels
			);
			return (Err(Error::UnsupportedLeafLevel(level)));
		}

		let offset = level_size(level) - 1;
		assert_eq!(va.0 & offset, 0, "misaligned virtual address {:x}", va.0);
		assert_eq!(frame.0 & offset, 0, "misaligned frame {:x}", frame.0);
		assert_eq!((frame & !F::ADDR).0, 0, "bad frame {:x}", frame.0);
		assert!(self.is_canonical(va.0), "non-canonical address {:x}", va.0);

		let slot = self.walk_to(va, level)?;
		let old = self.swap_leaf(slot, level, F::leaf(frame, attr, level))?;
		C::flush(slot);

		if (!F::is_present(old)) {
			return (Ok(None));
		}

		self.cleanup.invalidate(self.table_ref(), va, old);
		Ok(Some(Self::mapping(old, level)))
	}

	pub fn insert(
		&self,
		va: VAddr,
		frame: PAddr,
		attr: u64,
		level: Level,
	) -> Result<(), Error> {
		self.replace(va, frame, attr, level).map(|_| ())
	}

	/// Clear the leaf covering `va`, of whatever size.  Nodes on the path
	/// stay where they are.
	pub fn remove(&self, va: VAddr) -> bool {
		let Some((slot, level, mut cur)) = self.find_leaf(va) else {
			return (false);
		};

		loop {
			match (A::cas(slot, cur, 0)) {
				Ok(_) => break,
				Err(now) => {
					if (!F::is_present(now) ||
						!self.is_leaf(now, level))
					{
						return (false);
					}
					cur = now;
				}
			}
		}
		C::flush(slot);

		let base = va & Mask64::bits_from(level_shift(level).count());
		self.cleanup.invalidate(self.table_ref(), base, cur);
		true
	}

	pub fn lookup(&self, va: VAddr) -> Option<Mapping> {
		let (_, level, raw) = self.find_leaf(va)?;
		Some(Self::mapping(raw, level))
	}

	pub fn translate(&self, va: VAddr) -> Option<PAddr> {
		self.lookup(va).map(|m| m.translate(va))
	}

	/// A new table whose structure over `range` matches ours, with its
	/// own nodes and the same leaf frames.  Nothing outside `range` is
	/// carried over.
	pub fn deep_copy<R: RangeBounds<u64>>(&self, range: R) -> Result<Self, Error> {
		let copy = Self::new(self.levels, self.leaf_levels, self.alloc, self.cleanup)?;

		let Some(r) = range.to_inclusive() else {
			return (Ok(copy));
		};

		let offset = level_size(0) - 1;
		assert_eq!(*r.start() & offset, 0, "misaligned range start");
		assert_eq!(r.end().wrapping_add(1) & offset, 0, "misaligned range end");
		assert!(self.is_range_canonical(&r), "non-canonical range");

		/*
		 * On failure the partial copy is dropped here, which returns
		 * every node it had already been given.
		 */
		self.copy_node(&copy, self.root, copy.root, self.levels - 1, 0, &r)?;

		Ok(copy)
	}

	fn copy_node(
		&self,
		copy: &Self,
		src: PAddr,
		dst: PAddr,
		level: Level,
		base: u64,
		r: &RangeInclusive<u64>,
	) -> Result<(), Error> {
		let shift = level_shift(level).count();
		let span = level_size(level) - 1;
		let to = copy.node(dst);

		for (idx, slot) in self.node(src).iter().enumerate() {
			let raw_va = base | ((idx as u64) << shift);
			let lo = self.canonical(raw_va);
			if (lo + span < *r.start() || lo > *r.end()) {
				continue;
			}

			let raw = A::load(slot);
			if (!F::is_present(raw)) {
				continue;
			}

			if (self.is_leaf(raw, level)) {
				A::store(&to[idx], raw);
				C::flush(&to[idx]);
				continue;
			}

			let child = copy.alloc.alloc(1, Fill::Zero)?;
			C::flush_node(copy.node(child));
			A::store(&to[idx], (raw & !F::ADDR) | (child.0 & F::ADDR));
			C::flush(&to[idx]);

			self.copy_node(copy, F::node(raw), child, level - 1, raw_va, r)?;
		}

		Ok(())
	}

	/// Visit every present leaf in address order.
	pub fn for_each_leaf(&self, f: &mut dyn FnMut(VAddr, Mapping)) {
		self.visit(self.root, self.levels - 1, 0, f);
	}

	fn visit(
		&self,
		node: PAddr,
		level: Level,
		base: u64,
		f: &mut dyn FnMut(VAddr, Mapping),
	) {
		let shift = level_shift(level).count();

		for (idx, slot) in self.node(node).iter().enumerate() {
			let raw = A::load(slot);
			if (!F::is_present(raw)) {
				continue;
			}

			let raw_va = base | ((idx as u64) << shift);
			if (self.is_leaf(raw, level)) {
				f(VAddr(self.canonical(raw_va)), Self::mapping(raw, level));
			} else {
				self.visit(F::node(raw), level - 1, raw_va, f);
			}
		}
	}

	fn free_node(&self, pa: PAddr, level: Level) {
		if (level > 0) {
			for slot in self.node(pa).iter() {
				let raw = A::load(slot);
				if (F::is_present(raw) && !self.is_leaf(raw, level)) {
					self.free_node(F::node(raw), level - 1);
				}
			}
		}

		/*
		 * Safe because we are being dropped, so nothing can walk
		 * through this node any more, and it came from our allocator.
		 */
		unsafe {
			self.alloc.free(pa, 1);
		}
	}
}

impl<A: Access, C: CacheFlush, F: EntryFormat> Drop for GenericPageTable<'_, A, C, F> {
	fn drop(&mut self) {
		if (!self.owned) {
			return;
		}

		self.free_node(self.root, self.levels - 1);
	}
}
