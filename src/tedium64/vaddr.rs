/*
 * Copyright 2025 Oxide Computer Company
 */

use super::*;
use x86::bits64::paging::VAddr;

impl BitAnd<Mask64> for VAddr {
	type Output = VAddr;
	#[inline(always)]
	fn bitand(self, rhs: Mask64) -> VAddr {
		VAddr(self.0 & rhs.0)
	}
}

