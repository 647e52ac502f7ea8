/*
 * Copyright 2025 Oxide Computer Company
 */

#![allow(dead_code)]

use hpt::cache::NoClflush;
use hpt::cpu::Cpu;
use hpt::frame_alloc::ArenaAlloc;
use hpt::hpt::{HostConfig, HostPageTable};
use hpt::tlb::{Cleanup, TableRef};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use x86::bits64::paging::{PAddr, VAddr};

pub type Hpt<'a> = HostPageTable<'a, NoClflush>;

pub const ARENA_WORDS: usize = 4;

#[repr(C, align(4096))]
pub struct Frame([u8; 4096]);

/*
 * Page table frames out of the heap.  "Physical" addresses are the heap
 * addresses themselves, so phys_to_virt() is the identity.
 */
pub struct Arena {
	_mem: Vec<Frame>,
	pub alloc: ArenaAlloc<ARENA_WORDS>,
}

impl Arena {
	pub fn new(frames: usize) -> Self {
		let mut mem: Vec<Frame> = (0 .. frames).map(|_| Frame([0; 4096])).collect();
		let va = mem.as_mut_ptr() as *mut u8;
		let alloc = unsafe { ArenaAlloc::new(PAddr(va as u64), va, frames) };

		Self { _mem: mem, alloc }
	}

	pub fn used(&self) -> usize {
		self.alloc.capacity() - self.alloc.free_frames()
	}
}

pub fn config(leaf_levels: u8) -> HostConfig {
	let mut config = HostConfig::new();
	config.set_supported_leaf_levels(leaf_levels);
	config
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Invalidation {
	pub root: u64,
	pub active: u64,
	pub va: u64,
	pub old: u64,
}

#[derive(Default)]
pub struct RecordingCleanup(Mutex<Vec<Invalidation>>);

impl RecordingCleanup {
	pub fn take(&self) -> Vec<Invalidation> {
		std::mem::take(&mut *self.0.lock().unwrap())
	}
}

impl Cleanup for RecordingCleanup {
	fn invalidate(&self, table: TableRef<'_>, va: VAddr, old: u64) {
		self.0.lock().unwrap().push(Invalidation {
			root: table.root.0,
			active: table.active.snapshot().as_u64(),
			va: va.0,
			old,
		});
	}
}

#[derive(Default)]
pub struct FakeCpu {
	pub id: usize,
	pub no_gigapages: bool,
	pub roots: Mutex<Vec<u64>>,
	pub flushed: Mutex<Vec<u64>>,
	pub full_flushes: AtomicUsize,
}

impl FakeCpu {
	pub fn new(id: usize) -> Self {
		Self { id, ..Default::default() }
	}

	pub fn full_flushes(&self) -> usize {
		self.full_flushes.load(Ordering::Relaxed)
	}
}

impl Cpu for FakeCpu {
	fn id(&self) -> usize {
		self.id
	}

	unsafe fn load_root(&self, cr3: u64) {
		self.roots.lock().unwrap().push(cr3);
	}

	fn flush_page(&self, va: VAddr) {
		self.flushed.lock().unwrap().push(va.0);
	}

	fn flush_all(&self) {
		self.full_flushes.fetch_add(1, Ordering::Relaxed);
	}

	fn supports_1g_pages(&self) -> bool {
		!self.no_gigapages
	}
}

#[derive(Default)]
struct Tlb {
	pcid: u16,
	cached: BTreeMap<(u16, u64), u64>,
}

/*
 * A core whose TLB is tagged the way PCIDs tag it: a CR3 load without the
 * no-flush bit drops the new tag's entries, invlpg only reaches the loaded
 * tag, and flush_all drops everything.  Translations get cached through
 * fill(), standing in for a page walk.
 */
#[derive(Default)]
pub struct TaggedCpu {
	pub id: usize,
	tlb: Mutex<Tlb>,
}

impl TaggedCpu {
	pub fn new(id: usize) -> Self {
		Self { id, ..Default::default() }
	}

	pub fn fill(&self, va: VAddr, pa: PAddr) {
		let mut tlb = self.tlb.lock().unwrap();
		let pcid = tlb.pcid;
		tlb.cached.insert((pcid, va.0), pa.0);
	}

	pub fn cached(&self, va: VAddr) -> Option<PAddr> {
		let tlb = self.tlb.lock().unwrap();
		tlb.cached.get(&(tlb.pcid, va.0)).map(|&pa| PAddr(pa))
	}
}

impl Cpu for TaggedCpu {
	fn id(&self) -> usize {
		self.id
	}

	unsafe fn load_root(&self, cr3: u64) {
		let mut tlb = self.tlb.lock().unwrap();
		let pcid = (cr3 & 0xFFF) as u16;
		if cr3 & (1 << 63) == 0 {
			tlb.cached.retain(|&(p, _), _| p != pcid);
		}
		tlb.pcid = pcid;
	}

	fn flush_page(&self, va: VAddr) {
		let mut tlb = self.tlb.lock().unwrap();
		let pcid = tlb.pcid;
		tlb.cached.remove(&(pcid, va.0));
	}

	fn flush_all(&self) {
		self.tlb.lock().unwrap().cached.clear();
	}

	fn supports_1g_pages(&self) -> bool {
		true
	}
}
