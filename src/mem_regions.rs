/*
 * Copyright 2025 Oxide Computer Company
 */

use core::ops::RangeInclusive;
use x86::bits64::paging;

include!(concat!(env!("OUT_DIR"), "/hptdefs.rs"));

/*
 * These are architecturally defined and cannot change (at least, not in a way
 * that would make them more restrictive).
 */
pub const PHYS_RANGE: RangeInclusive<u64> =
	(0 ..= (1u64 << paging::MAXPHYADDR) - 1);
pub const VIRT_RANGE_LOW: RangeInclusive<u64> = (0 ..= (1u64 << 47) - 1);
pub const VIRT_RANGE_HIGH: RangeInclusive<u64> =
	(0xFFFF_8000_0000_0000 ..= 0xFFFF_FFFF_FFFF_FFFF);

pub const PAGE_SIZE: u64 = 0x1000;

/*
 * The remap window is a run of REMAP_SLOTS slots of REMAP_SLOT_PAGES pages
 * each, reserved in every kernel address space.  Its location is fixed at
 * build time; see build.rs for the knobs.
 */
pub const REMAP_SLOT_SIZE: u64 = REMAP_SLOT_PAGES * PAGE_SIZE;
pub const REMAP_WINDOW: RangeInclusive<u64> = (REMAP_WINDOW_BASE ..=
	REMAP_WINDOW_BASE + (REMAP_SLOTS as u64 * REMAP_SLOT_SIZE) - 1);

pub fn is_canonical(va: u64) -> bool {
	VIRT_RANGE_LOW.contains(&va) || VIRT_RANGE_HIGH.contains(&va)
}

/*
 * A range is canonical only if it does not straddle the hole; both ends in
 * the same half is sufficient because the halves are themselves contiguous.
 */
pub fn is_range_canonical(range: &RangeInclusive<u64>) -> bool {
	let start = *range.start();
	let end = *range.end();

	(VIRT_RANGE_LOW.contains(&start) && VIRT_RANGE_LOW.contains(&end)) ||
		(VIRT_RANGE_HIGH.contains(&start) &&
			VIRT_RANGE_HIGH.contains(&end))
}
