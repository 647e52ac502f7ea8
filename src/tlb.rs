/*
 * Copyright 2025 Oxide Computer Company
 */

use crate::cpu::Cpu;
use crate::tedium64::*;
use core::sync::atomic::{AtomicU64, Ordering};
use x86::bits64::paging::{PAddr, VAddr};

pub const MAX_CPUS: usize = 64;

/*
 * A set of cores, by the dense logical index Cpu::id() reports.
 */
pub struct CpuSet(AtomicU64);

impl CpuSet {
	pub const fn new() -> Self {
		Self(AtomicU64::new(0))
	}

	fn bit(cpu: usize) -> Mask64 {
		assert!(cpu < MAX_CPUS, "cpu {} out of range", cpu);
		Mask64::bit(cpu as u64)
	}

	pub fn insert(&self, cpu: usize) {
		self.0.fetch_or(Self::bit(cpu).as_u64(), Ordering::AcqRel);
	}

	pub fn insert_all(&self, cpus: Mask64) {
		self.0.fetch_or(cpus.as_u64(), Ordering::AcqRel);
	}

	/// Take `cpu` out of the set and say whether it was there.
	pub fn remove(&self, cpu: usize) -> bool {
		let bit = Self::bit(cpu);
		let prev = self.0.fetch_and(!bit.as_u64(), Ordering::AcqRel);
		Mask64::new(prev).contains(bit)
	}

	pub fn contains(&self, cpu: usize) -> bool {
		cpu < MAX_CPUS && self.snapshot().contains(Mask64::bit(cpu as u64))
	}

	pub fn snapshot(&self) -> Mask64 {
		Mask64::new(self.0.load(Ordering::Acquire))
	}
}

impl Default for CpuSet {
	fn default() -> Self {
		Self::new()
	}
}

/*
 * What a cleanup policy gets to know about the table whose entry changed.
 *
 * `active` holds every core the table has ever been made current on, and
 * only grows: with PCIDs a core keeps a table's translations cached after it
 * switches away.  `stale` holds the cores on which some of those cached
 * translations may have escaped invalidation because they sit under a tag
 * that was not loaded at the time; the next make_current() on such a core
 * must not keep what the tag cached.
 */
#[derive(Copy, Clone)]
pub struct TableRef<'t> {
	pub root: PAddr,
	pub active: &'t CpuSet,
	pub stale: &'t CpuSet,
}

/*
 * Called after a present mapping was replaced or removed.  When this returns,
 * no core may act on the old translation any more; the displaced frame is
 * handed back to the caller only after that.
 */
pub trait Cleanup: Sync {
	fn invalidate(&self, table: TableRef<'_>, va: VAddr, old: u64);
}

/*
 * For tables that have never been loaded anywhere.
 */
pub struct NoCleanup;

impl Cleanup for NoCleanup {
	fn invalidate(&self, _table: TableRef<'_>, _va: VAddr, _old: u64) {}
}

/*
 * Delivery of invalidation requests to other cores.  How the request travels
 * is not our business, but shootdown() must not return before every core in
 * `targets` has dropped its translation for `va` under the tag it has loaded.
 * Tags that are not loaded are covered by `table.stale`.
 */
pub trait Shootdown: Sync {
	fn shootdown(&self, table: TableRef<'_>, targets: Mask64, va: VAddr);
}

pub struct TlbCleanup<P, S> {
	cpu: P,
	remote: S,
}

impl<P: Cpu + Sync, S: Shootdown> TlbCleanup<P, S> {
	pub const fn new(cpu: P, remote: S) -> Self {
		Self { cpu, remote }
	}

	pub fn cpu(&self) -> &P {
		&self.cpu
	}

	pub fn remote(&self) -> &S {
		&self.remote
	}
}

impl<P: Cpu + Sync, S: Shootdown> Cleanup for TlbCleanup<P, S> {
	fn invalidate(&self, table: TableRef<'_>, va: VAddr, _old: u64) {
		let targets = table.active.snapshot();
		if (targets.is_empty()) {
			return;
		}

		/*
		 * invlpg reaches only the loaded tag.  Mark the targets before
		 * flushing so that a core loading the table concurrently either
		 * sees the mark or is already running under the table's tag
		 * when the flush reaches it.
		 */
		table.stale.insert_all(targets);

		let me = self.cpu.id();
		let local = Mask64::bit(me as u64);
		if (targets.contains(local)) {
			self.cpu.flush_page(va);
		}

		let remote = targets & !local;
		if (!remote.is_empty()) {
			self.remote.shootdown(table, remote, va);
		}
	}
}
