/*
 * Copyright 2025 Oxide Computer Company
 */

use crate::tlb::MAX_CPUS;
use x86::bits64::paging::VAddr;
use x86::controlregs::{self, Cr4};
use x86::cpuid::CpuId;

/*
 * The handful of privileged operations the paging code needs from the core it
 * is running on.  Keeping them behind a trait is what lets the rest of the
 * crate run (and be tested) somewhere other than CPL 0.
 */
pub trait Cpu {
	/// The executing core's logical index: dense, from 0, and below
	/// tlb::MAX_CPUS.  APIC IDs are none of those things.
	fn id(&self) -> usize;

	///
	/// # Safety
	///
	/// `cr3` must name a page table that maps everything the caller is
	/// about to touch, the code and stack included.
	///
	unsafe fn load_root(&self, cr3: u64);

	/// Drop any cached translation for `va` on this core.
	fn flush_page(&self, va: VAddr);

	/// Drop every cached translation on this core, for all address-space
	/// tags and global pages included.
	fn flush_all(&self);

	fn supports_1g_pages(&self) -> bool;
}

/*
 * The real thing.  Only usable at CPL = 0.  Each core builds its own with
 * the logical index the kernel gave it when it was brought up.
 */
pub struct X86Cpu {
	id: usize,
}

impl X86Cpu {
	pub const fn new(id: usize) -> Self {
		assert!(id < MAX_CPUS);
		Self { id }
	}
}

impl Cpu for X86Cpu {
	fn id(&self) -> usize {
		self.id
	}

	unsafe fn load_root(&self, cr3: u64) {
		controlregs::cr3_write(cr3);
	}

	fn flush_page(&self, va: VAddr) {
		/*
		 * Safe because CPL = 0.
		 */
		unsafe {
			x86::tlb::flush(va.as_usize());
		}
	}

	fn flush_all(&self) {
		/*
		 * Toggling PGE is the one operation that discards global
		 * entries and entries for every PCID at once.  Safe because
		 * CPL = 0 and PGE is restored before we return.
		 */
		unsafe {
			let cr4 = controlregs::cr4();
			controlregs::cr4_write(cr4 ^ Cr4::CR4_ENABLE_GLOBAL_PAGES);
			controlregs::cr4_write(cr4);
		}
	}

	fn supports_1g_pages(&self) -> bool {
		CpuId::new()
			.get_extended_processor_and_feature_identifiers()
			.map_or(false, |f| f.has_1gib_pages())
	}
}
