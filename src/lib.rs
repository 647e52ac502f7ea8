/*
 * Copyright 2025 Oxide Computer Company
 */

#![cfg_attr(not(test), no_std)]
#![allow(unused_parens)]

pub mod access;
pub mod cache;
pub mod cpu;
pub mod frame_alloc;
pub mod hpt;
pub mod mem_regions;
pub mod pagetable;
pub mod tedium64;
pub mod tlb;
pub mod to_inclusive;

pub mod prelude {
	pub use crate::mask64_bits;
	pub use crate::shift64;
}
