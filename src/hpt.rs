/*
 * Copyright 2025 Oxide Computer Company
 */

use crate::access::AtomicAccess;
use crate::cache::{CacheFlush, DefaultCache};
use crate::cpu::Cpu;
use crate::frame_alloc::FrameAlloc;
use crate::mem_regions::{self, PAGE_SIZE};
use crate::pagetable::{EntryFormat, Error, GenericPageTable, Level, Mapping};
use crate::prelude::*;
use crate::tedium64::*;
use crate::tlb::Cleanup;
use crate::to_inclusive::ToInclusive;
use bitflags::bitflags;
use core::fmt::{self, Display};
use core::ops::RangeBounds;
use log::{debug, trace};
use static_assertions::const_assert_eq;
use x86::bits64::paging::{PAddr, VAddr};

/*
 * The host page table: the hypervisor's own amd64 4-level tables, built on
 * the generic engine in pagetable.rs.  Everything amd64-specific lives here:
 * the entry bit layout, the translation from abstract rights to hardware
 * bits, loading CR3 with a PCID, and the remap window through which
 * arbitrary physical memory is reached.
 */

pub const LEVELS: Level = 4;
pub const MAX_LEAF_LEVELS: Level = 3;

pub const HPT_ADDR: Mask64 = mask64_bits!(12 ..= 51);

/* P, W, U, A: non-leaf entries never restrict what their leaves allow. */
const TABLE_ATTR: Mask64 = mask64_bits!(0, 1, 2, 5);

bitflags! {
	pub struct HptFlags: u64 {
		const P = mask64_bits!(0).as_u64();
		const W = mask64_bits!(1).as_u64();
		const U = mask64_bits!(2).as_u64();
		const UC = mask64_bits!(4).as_u64();
		const A = mask64_bits!(5).as_u64();
		const D = mask64_bits!(6).as_u64();
		const S = mask64_bits!(7).as_u64();
		const G = mask64_bits!(8).as_u64();
		const NX = mask64_bits!(63).as_u64();

		const SW_LOW = mask64_bits!(9 ..= 11).as_u64();
		const SW_HIGH = mask64_bits!(52 ..= 62).as_u64();

		const MASK = Self::NX.bits | 0xFFF;
		const ALL_RIGHTS = Self::P.bits | Self::W.bits | Self::U.bits |
			Self::A.bits | Self::D.bits;
	}
}

impl HptFlags {
	pub fn sw_bits_low(self) -> u64 {
		(self & Self::SW_LOW).bits() >> 9
	}

	pub fn sw_bits_high(self) -> u64 {
		(self & Self::SW_HIGH).bits() >> 52
	}
}

const_assert_eq!(HptFlags::MASK.bits() & HPT_ADDR.as_u64(), 0);
const_assert_eq!(HptFlags::SW_HIGH.bits() & HPT_ADDR.as_u64(), 0);

bitflags! {
	/*
	 * Access rights as kept by the mapping database; hw_attr() turns them
	 * into entry bits.
	 */
	pub struct MemRights: u32 {
		const READ = 1 << 0;
		const WRITE = 1 << 1;
		const EXEC = 1 << 2;
		const UNCACHEABLE = 1 << 3;
		const GLOBAL = 1 << 4;
		const SUPERVISOR = 1 << 5;

		const RWX = Self::READ.bits | Self::WRITE.bits | Self::EXEC.bits;
	}
}

pub struct HostFormat;

impl EntryFormat for HostFormat {
	const ADDR: Mask64 = HPT_ADDR;

	fn is_present(raw: u64) -> bool {
		raw & HptFlags::P.bits() != 0
	}

	fn is_large(raw: u64) -> bool {
		raw & HptFlags::S.bits() != 0
	}

	fn leaf(frame: PAddr, attr: u64, level: Level) -> u64 {
		assert_eq!(attr & HPT_ADDR, 0, "attributes {:x} overlap address", attr);

		/* At level 0 bit 7 is PAT, and it is the caller's business. */
		if (level > 0) {
			frame.0 | attr | HptFlags::S.bits()
		} else {
			frame.0 | attr
		}
	}

	fn table(node: PAddr) -> u64 {
		(node | TABLE_ATTR).0
	}

	fn attr(raw: u64, _level: Level) -> u64 {
		raw & HptFlags::MASK.bits()
	}
}

/*
 * Boot-time parameters every host table is built against.  It is filled in
 * once, early, and then lent immutably to every table for the rest of time.
 */
#[derive(Debug)]
pub struct HostConfig {
	supported_leaf_levels: Option<Level>,
	remap_base: VAddr,
	remap_slots: usize,
}

impl HostConfig {
	pub const fn new() -> Self {
		Self {
			supported_leaf_levels: None,
			remap_base: VAddr(mem_regions::REMAP_WINDOW_BASE),
			remap_slots: mem_regions::REMAP_SLOTS,
		}
	}

	/// A configuration with leaf support set from what `cpu` reports.
	pub fn detect(cpu: &dyn Cpu) -> Self {
		let mut config = Self::new();
		config.set_supported_leaf_levels(if (cpu.supports_1g_pages()) {
			3
		} else {
			2
		});
		config
	}

	/// How many levels, counting from the 4K level, may hold leaves:
	/// 1 for 4K only, 2 to add 2M pages, 3 to add 1G pages.
	pub fn set_supported_leaf_levels(&mut self, levels: Level) {
		assert!(
			self.supported_leaf_levels.is_none(),
			"supported leaf levels already set"
		);
		assert!((1 ..= MAX_LEAF_LEVELS).contains(&levels));

		debug!("host page tables support {} leaf levels", levels);
		self.supported_leaf_levels = Some(levels);
	}

	pub fn supported_leaf_levels(&self) -> Level {
		self.supported_leaf_levels.unwrap_or(1)
	}

	pub fn set_remap_window(&mut self, base: VAddr, slots: usize) {
		assert!(slots > 0);
		assert_eq!(base.0 & (mem_regions::REMAP_SLOT_SIZE - 1), 0);

		let last = base.0 + slots as u64 * mem_regions::REMAP_SLOT_SIZE - 1;
		assert!(mem_regions::is_range_canonical(&(base.0 ..= last)));

		self.remap_base = base;
		self.remap_slots = slots;
	}

	pub fn remap_slot(&self, slot: usize) -> VAddr {
		assert!(slot < self.remap_slots, "remap slot {} out of range", slot);
		VAddr(self.remap_base.0 + slot as u64 * mem_regions::REMAP_SLOT_SIZE)
	}
}

impl Default for HostConfig {
	fn default() -> Self {
		Self::new()
	}
}

/*
 * How make_current() should treat the tag's cached translations.
 */
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TagFlush {
	/// The tag is still ours; whatever the TLB holds for it is good.
	None,
	/// The tag is new to this table; discard what it tagged before.
	Tag,
	/// Tags have wrapped around; discard everything on this core.
	All,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct AsTag {
	pcid: u16,
	flush: TagFlush,
}

impl AsTag {
	/// For cores running without PCIDs.
	pub const fn untagged() -> Self {
		Self { pcid: 0, flush: TagFlush::Tag }
	}

	/// A tag this table was given earlier in the current generation.
	pub const fn reuse(pcid: u16) -> Self {
		assert!(pcid != 0 && pcid <= TagAllocator::MAX_PCID);
		Self { pcid, flush: TagFlush::None }
	}

	pub fn pcid(&self) -> u16 {
		self.pcid
	}

	pub fn flush(&self) -> TagFlush {
		self.flush
	}
}

/*
 * Per-core PCID allocation.  Tags are handed out in order; once they run out
 * a new generation begins, and the first tag of it asks for a full flush so
 * that nothing cached under any older tag survives.  A caller keeps the
 * (tag, generation) pair per table and may reuse the tag while the
 * generation is unchanged.
 */
#[derive(Debug)]
pub struct TagAllocator {
	next: u16,
	generation: u64,
}

impl TagAllocator {
	pub const MAX_PCID: u16 = 4095;

	pub const fn new() -> Self {
		Self { next: 1, generation: 0 }
	}

	pub fn generation(&self) -> u64 {
		self.generation
	}

	pub fn assign(&mut self) -> AsTag {
		let mut flush = TagFlush::Tag;

		if (self.next > Self::MAX_PCID) {
			self.generation += 1;
			self.next = 1;
			flush = TagFlush::All;
			debug!("pcid rollover, generation {}", self.generation);
		}

		let pcid = self.next;
		self.next += 1;

		AsTag { pcid, flush }
	}
}

impl Default for TagAllocator {
	fn default() -> Self {
		Self::new()
	}
}

const CR3_NOFLUSH: u64 = 1 << 63;
const CR3_PCID: Mask64 = mask64_bits!(0 ..= 11);

type Engine<'a, C> = GenericPageTable<'a, AtomicAccess, C, HostFormat>;

pub struct HostPageTable<'a, C: CacheFlush = DefaultCache> {
	pt: Engine<'a, C>,
	config: &'a HostConfig,
}

impl<'a, C: CacheFlush> HostPageTable<'a, C> {
	pub fn new(
		config: &'a HostConfig,
		alloc: &'a dyn FrameAlloc,
		cleanup: &'a dyn Cleanup,
	) -> Result<Self, Error> {
		let pt = Engine::new(
			LEVELS,
			config.supported_leaf_levels(),
			alloc,
			cleanup,
		)?;

		Ok(Self { pt, config })
	}

	///
	/// # Safety
	///
	/// As for `GenericPageTable::from_root()`; typically `root` is the
	/// table the loader left in CR3.
	///
	pub unsafe fn from_root(
		config: &'a HostConfig,
		root: PAddr,
		alloc: &'a dyn FrameAlloc,
		cleanup: &'a dyn Cleanup,
	) -> Self {
		let pt = Engine::from_root(
			LEVELS,
			config.supported_leaf_levels(),
			root,
			alloc,
			cleanup,
		);

		Self { pt, config }
	}

	pub fn hw_attr(rights: MemRights) -> u64 {
		if (!rights.intersects(MemRights::RWX)) {
			return (0);
		}

		let mut attr = HptFlags::P | HptFlags::A | HptFlags::D;
		if (rights.contains(MemRights::WRITE)) {
			attr |= HptFlags::W;
		}
		if (!rights.contains(MemRights::EXEC)) {
			attr |= HptFlags::NX;
		}
		if (rights.contains(MemRights::UNCACHEABLE)) {
			attr |= HptFlags::UC;
		}
		if (rights.contains(MemRights::GLOBAL)) {
			attr |= HptFlags::G;
		}
		if (!rights.contains(MemRights::SUPERVISOR)) {
			attr |= HptFlags::U;
		}

		attr.bits()
	}

	pub fn root(&self) -> PAddr {
		self.pt.root()
	}

	pub fn config(&self) -> &'a HostConfig {
		self.config
	}

	pub fn insert(
		&self,
		va: VAddr,
		frame: PAddr,
		attr: u64,
		level: Level,
	) -> Result<(), Error> {
		self.pt.insert(va, frame, attr, level)
	}

	pub fn map(
		&self,
		va: VAddr,
		frame: PAddr,
		rights: MemRights,
		level: Level,
	) -> Result<(), Error> {
		self.insert(va, frame, Self::hw_attr(rights), level)
	}

	/// Point `va` at a 4K kernel data frame and return the frame it
	/// pointed at before, if any.
	pub fn replace(&self, va: VAddr, frame: PAddr) -> Result<Option<PAddr>, Error> {
		let attr = HptFlags::P | HptFlags::W | HptFlags::A | HptFlags::D |
			HptFlags::NX;

		Ok(self.pt.replace(va, frame, attr.bits(), 0)?.map(|m| m.frame))
	}

	pub fn remove(&self, va: VAddr) -> bool {
		self.pt.remove(va)
	}

	pub fn lookup(&self, va: VAddr) -> Option<Mapping> {
		self.pt.lookup(va)
	}

	pub fn translate(&self, va: VAddr) -> Option<PAddr> {
		self.pt.translate(va)
	}

	pub fn for_each_leaf(&self, f: &mut dyn FnMut(VAddr, Mapping)) {
		self.pt.for_each_leaf(f)
	}

	pub fn deep_copy<R: RangeBounds<u64>>(&self, range: R) -> Result<Self, Error> {
		if let Some(r) = range.to_inclusive() {
			assert!(
				mem_regions::is_range_canonical(&r),
				"non-canonical range {:x}..={:x}",
				r.start(),
				r.end()
			);
		}

		Ok(Self { pt: self.pt.deep_copy(range)?, config: self.config })
	}

	///
	/// # Safety
	///
	/// This method may be called only at CPL = 0, and the table must map
	/// the code, stack, and data the caller goes on to use.  `tag` must
	/// have come from this core's TagAllocator (or be untagged on a core
	/// without PCIDs enabled).  A reused tag keeps its cached translations
	/// unless a change to the table since its last load here may have
	/// missed them.
	///
	pub unsafe fn make_current(&self, cpu: &dyn Cpu, tag: AsTag) {
		let root = self.pt.root();
		assert_eq!((root & !HPT_ADDR).0, 0, "bad page table root {:x}", root.0);

		let stale = self.pt.activate(cpu.id());
		if (stale && tag.flush == TagFlush::None) {
			trace!("pcid {} is stale for {:x}", tag.pcid, root.0);
		}

		let mut cr3 = root.0 | (tag.pcid as u64 & CR3_PCID);
		if (tag.pcid != 0 && tag.flush == TagFlush::None && !stale) {
			cr3 |= CR3_NOFLUSH;
		}
		cpu.load_root(cr3);

		if (tag.flush == TagFlush::All) {
			cpu.flush_all();
		}
	}

	/// Write every present leaf, one per line.
	pub fn dump(&self, w: &mut dyn fmt::Write) -> fmt::Result {
		writeln!(
			w,
			"root {:x}, {} leaf levels",
			self.pt.root().0,
			self.pt.leaf_levels()
		)?;
		writeln!(w, "  {:>16}/SZ X SWH LGSDACUWP | {:>13}", "VIRTUAL", "PFN")?;

		let mut res = Ok(());
		self.pt.for_each_leaf(&mut |va, m| {
			if (res.is_ok()) {
				res = writeln!(
					w,
					"  {:16x}/{} {}",
					va.0,
					m.level,
					HostPte(m.frame.0 | m.attr)
				);
			}
		});

		res
	}
}

impl<C: CacheFlush> Display for HostPageTable<'_, C> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		self.dump(f)
	}
}

/*
 * Which table a remap goes through.  Early in boot, before any other table
 * exists, that is the boot table; afterwards it is whatever the calling
 * context has loaded.
 */
pub enum RemapTarget<'t, 'a, C: CacheFlush = DefaultCache> {
	Boot,
	Current(&'t HostPageTable<'a, C>),
}

pub struct Remapper<'t, 'a, C: CacheFlush = DefaultCache> {
	boot: &'t HostPageTable<'a, C>,
}

impl<'t, 'a, C: CacheFlush> Remapper<'t, 'a, C> {
	pub fn new(boot: &'t HostPageTable<'a, C>) -> Self {
		Self { boot }
	}

	///
	/// Make `phys` reachable through remap slot `slot`, and return the
	/// virtual address at which it can be accessed.  The page holding
	/// `phys` and the one after it are both mapped, so a page-sized access
	/// starting at the returned pointer is always covered; if the second
	/// page lies beyond physical memory, that half of the slot is left
	/// unmapped.
	///
	/// # Safety
	///
	/// Nothing else may use `slot` in the chosen table while the returned
	/// pointer is in use; in practice each core owns its own slots.  The
	/// pointer is valid only until the slot is remapped.
	///
	pub unsafe fn remap(
		&self,
		slot: usize,
		phys: PAddr,
		target: RemapTarget<'_, 'a, C>,
	) -> Result<*mut u8, Error> {
		let hpt = match target {
			RemapTarget::Boot => self.boot,
			RemapTarget::Current(t) => t,
		};

		assert!(
			mem_regions::PHYS_RANGE.contains(&phys.0),
			"physical address {:x} out of range",
			phys.0
		);

		let window = hpt.config.remap_slot(slot);
		let offset = phys.0 & (PAGE_SIZE - 1);
		let base = phys.0 - offset;
		let attr = HptFlags::P | HptFlags::W | HptFlags::A | HptFlags::D |
			HptFlags::NX;

		for page in 0 .. mem_regions::REMAP_SLOT_PAGES {
			let pa = base + page * PAGE_SIZE;
			let va = VAddr(window.0 + page * PAGE_SIZE);
			if (!mem_regions::PHYS_RANGE.contains(&pa)) {
				hpt.remove(va);
				continue;
			}

			let current = hpt.lookup(va);
			if (current.map_or(false, |m| {
				m.level == 0 && m.frame.0 == pa && m.attr == attr.bits()
			})) {
				continue;
			}

			trace!("remap slot {} page {} -> {:x}", slot, page, pa);
			hpt.replace(va, PAddr(pa))?;
		}

		Ok((window.0 + offset) as *mut u8)
	}
}

macro_rules! write_bits {
	($f:expr, $b:expr, $($flag:expr),*) => {
		$(write!($f, "{}",
			 if ($b.contains($flag)) { "*" } else { "-" })?;)*
	};
}

/*
 * A raw host entry, for diagnostics.
 */
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct HostPte(pub u64);

impl Display for HostPte {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let flags = HptFlags::from_bits_truncate(self.0);

		write_bits!(f, flags, HptFlags::NX);
		write!(f, "{:03x}", flags.sw_bits_high())?;
		write!(f, "{:01x}", flags.sw_bits_low())?;
		write_bits!(
			f,
			flags,
			HptFlags::G,
			HptFlags::S,
			HptFlags::D,
			HptFlags::A,
			HptFlags::UC,
			HptFlags::U,
			HptFlags::W,
			HptFlags::P
		);
		write!(f, " > {:13x}", (self.0 & HPT_ADDR) >> 12)
	}
}
