/*
 * Copyright 2025 Oxide Computer Company
 */

use super::*;
use x86::bits64::paging::PAddr;

/*
 * Masking a physical address gives a physical address: frame bases, in-page
 * offsets, and entry address fields are all computed this way.
 */
impl BitAnd<Mask64> for PAddr {
	type Output = PAddr;
	#[inline(always)]
	fn bitand(self, rhs: Mask64) -> PAddr {
		PAddr(self.0 & rhs.0)
	}
}

impl BitOr<Mask64> for PAddr {
	type Output = PAddr;
	#[inline(always)]
	fn bitor(self, rhs: Mask64) -> PAddr {
		PAddr(self.0 | rhs.0)
	}
}
