/*
 * Copyright 2025 Oxide Computer Company
 */

use core::ops::{Bound, RangeBounds, RangeInclusive};

/*
 * Virtual address ranges arrive in whatever form is convenient for the
 * caller: [start, end), [start, end], or open-ended.  Every nonempty range of
 * u64 can be written as a RangeInclusive<u64>, and that form is the only one
 * that can describe a range ending at the top of the address space, so the
 * paging code works exclusively with it.  An empty range has no inclusive
 * form and comes back as None.
 */
pub trait ToInclusive: RangeBounds<u64> {
	fn to_inclusive(&self) -> Option<RangeInclusive<u64>>;
}

impl<R: RangeBounds<u64>> ToInclusive for R {
	fn to_inclusive(&self) -> Option<RangeInclusive<u64>> {
		let start = match (self.start_bound()) {
			Bound::Unbounded => u64::MIN,
			Bound::Included(b) => *b,
			Bound::Excluded(b) => b.checked_add(1)?,
		};

		let end = match (self.end_bound()) {
			Bound::Unbounded => u64::MAX,
			Bound::Included(b) => *b,
			Bound::Excluded(b) => b.checked_sub(1)?,
		};

		if (start > end) {
			return (None);
		}

		Some(start ..= end)
	}
}
