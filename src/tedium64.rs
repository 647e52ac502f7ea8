/*
 * Copyright 2025 Oxide Computer Company
 */

use core::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not};

/*
 * Shift counts and masks over 64-bit words.  Everything in the paging code
 * that picks bits out of an entry, an address, or a CPU set goes through
 * these so that a shift is never mistaken for a count and a mask is never
 * mistaken for an address.
 */

#[derive(Debug, Copy, Clone, PartialOrd, Ord, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Shift64(u64);

impl Shift64 {
	pub const MAX: Self = Self(63);

	pub const fn new(s: u64) -> Self {
		assert!(s <= Self::MAX.0);
		Self(s)
	}

	pub const fn count(self) -> u64 {
		self.0
	}

	pub const fn size(self) -> u64 {
		1u64 << self.0
	}
}

#[macro_export]
macro_rules! shift64 {
	($e:expr) => {
		$crate::tedium64::Shift64::new($e)
	};
}

#[derive(Debug, Copy, Clone, PartialOrd, Ord, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Mask64(u64);

impl Mask64 {
	pub const NONE: Mask64 = Self(0u64);
	pub const FULL: Mask64 = Self(u64::MAX);

	pub const fn new(mask: u64) -> Self {
		Self(mask)
	}

	pub const fn bit(idx: u64) -> Self {
		Self(1u64 << idx)
	}

	/*
	 * [0, idx).  idx may be 64, which is the full mask.
	 */
	pub const fn bits_to(idx: u64) -> Self {
		if (idx >= 64) {
			Self::FULL
		} else {
			Self((1u64 << idx) - 1)
		}
	}

	/*
	 * [idx, 63].
	 */
	pub const fn bits_from(idx: u64) -> Self {
		Self(!Self::bits_to(idx).0)
	}

	pub const fn bits_range(from: u64, to: u64) -> Self {
		Self(Self::bits_to(to).0 & Self::bits_from(from).0)
	}

	pub const fn bits_range_inclusive(from: u64, to: u64) -> Self {
		Self(Self::bits_range(from, to).0 | (1u64 << to))
	}

	pub const fn union(self, other: Self) -> Self {
		Self(self.0 | other.0)
	}

	pub const fn as_u64(self) -> u64 {
		self.0
	}

	pub const fn is_empty(self) -> bool {
		self.0 == 0
	}

	pub const fn contains(self, other: Self) -> bool {
		(self.0 & other.0) == other.0
	}

	pub const fn count(self) -> u32 {
		self.0.count_ones()
	}

	pub fn lowest_bit(self) -> Option<Shift64> {
		if (self.0 == 0) {
			return (None);
		}

		Some(Shift64(self.0.trailing_zeros() as u64))
	}
}

#[macro_export]
macro_rules! mask64_bits {
	($f:literal ..= $t:literal) => {
		$crate::tedium64::Mask64::bits_range_inclusive($f, $t)
	};
	($f:literal .. $t:literal) => {
		$crate::tedium64::Mask64::bits_range($f, $t)
	};
	($b:literal) => {
		$crate::tedium64::Mask64::bit($b)
	};
	($b:literal, $($tail:literal),+) => {
		$crate::tedium64::Mask64::bit($b)
			.union($crate::mask64_bits!($($tail),+))
	};
}

impl BitAnd for Mask64 {
	type Output = Self;
	#[inline(always)]
	fn bitand(self, rhs: Self) -> Self {
		Self(self.0 & rhs.0)
	}
}

impl BitOr for Mask64 {
	type Output = Self;
	#[inline(always)]
	fn bitor(self, rhs: Self) -> Self {
		Self(self.0 | rhs.0)
	}
}

impl Not for Mask64 {
	type Output = Self;
	#[inline(always)]
	fn not(self) -> Self {
		Self(!self.0)
	}
}

impl BitAndAssign for Mask64 {
	#[inline(always)]
	fn bitand_assign(&mut self, rhs: Self) {
		self.0 &= rhs.0;
	}
}

impl BitOrAssign for Mask64 {
	#[inline(always)]
	fn bitor_assign(&mut self, rhs: Self) {
		self.0 |= rhs.0;
	}
}

/*
 * Raw entry words are plain u64s; masking one yields another raw word.
 */
impl BitAnd<Mask64> for u64 {
	type Output = u64;
	#[inline(always)]
	fn bitand(self, rhs: Mask64) -> u64 {
		self & rhs.0
	}
}

impl BitOr<Mask64> for u64 {
	type Output = u64;
	#[inline(always)]
	fn bitor(self, rhs: Mask64) -> u64 {
		self | rhs.0
	}
}

mod paddr;
mod vaddr;
