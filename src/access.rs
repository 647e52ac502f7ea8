/*
 * Copyright 2025 Oxide Computer Company
 */

use core::sync::atomic::{AtomicU64, Ordering};

/*
 * How the engine reads and writes a single entry word.  Every operation works
 * on the whole word: a walker on another core may be reading the entry at any
 * moment, and it must see either the old value or the new one, never a mix.
 */
pub trait Access {
	fn load(slot: &AtomicU64) -> u64;
	fn store(slot: &AtomicU64, raw: u64);

	/// Install `new` only if the slot still holds `old`.  On failure the
	/// value actually found is returned.
	fn cas(slot: &AtomicU64, old: u64, new: u64) -> Result<u64, u64>;

	fn exchange(slot: &AtomicU64, new: u64) -> u64 {
		let mut cur = Self::load(slot);
		loop {
			match (Self::cas(slot, cur, new)) {
				Ok(prev) => return (prev),
				Err(seen) => cur = seen,
			}
		}
	}
}

/*
 * Loads acquire so that a walker that sees a freshly installed node pointer
 * also sees the node's zeroed contents; everything that publishes an entry
 * releases.
 */
pub struct AtomicAccess;

impl Access for AtomicAccess {
	#[inline(always)]
	fn load(slot: &AtomicU64) -> u64 {
		slot.load(Ordering::Acquire)
	}

	#[inline(always)]
	fn store(slot: &AtomicU64, raw: u64) {
		slot.store(raw, Ordering::Release)
	}

	#[inline(always)]
	fn cas(slot: &AtomicU64, old: u64, new: u64) -> Result<u64, u64> {
		slot.compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
	}

	#[inline(always)]
	fn exchange(slot: &AtomicU64, new: u64) -> u64 {
		slot.swap(new, Ordering::AcqRel)
	}
}
