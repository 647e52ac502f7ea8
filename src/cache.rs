/*
 * Copyright 2025 Oxide Computer Company
 */

use crate::pagetable::Node;
use core::sync::atomic::AtomicU64;

const CACHE_LINE: usize = 64;
const ENTRIES_PER_LINE: usize = CACHE_LINE / core::mem::size_of::<u64>();

/*
 * Page-walking hardware that is not part of the coherency domain (some IOMMUs,
 * mostly) reads entries straight from memory, so whatever we write must be
 * pushed out of the cache before it can matter.  The CPU's own walker snoops
 * and needs nothing.
 */
pub trait CacheFlush {
	fn flush(slot: &AtomicU64);

	/// Write back a whole node, typically right after it was zeroed.
	fn flush_node(node: &Node) {
		for line in node.chunks(ENTRIES_PER_LINE) {
			Self::flush(&line[0]);
		}
	}
}

pub struct NoClflush;

impl CacheFlush for NoClflush {
	#[inline(always)]
	fn flush(_slot: &AtomicU64) {}

	#[inline(always)]
	fn flush_node(_node: &Node) {}
}

pub struct Clflush;

impl CacheFlush for Clflush {
	#[inline(always)]
	fn flush(slot: &AtomicU64) {
		/*
		 * Safe because the slot is a live reference; clflush neither
		 * reads nor writes through it architecturally.
		 */
		#[cfg(target_arch = "x86_64")]
		unsafe {
			core::arch::x86_64::_mm_clflush(slot.as_ptr() as *const u8);
		}
		#[cfg(not(target_arch = "x86_64"))]
		let _ = slot;
	}
}

#[cfg(feature = "clflush")]
pub type DefaultCache = Clflush;
#[cfg(not(feature = "clflush"))]
pub type DefaultCache = NoClflush;

#[cfg(test)]
mod tests {
	use super::*;
	use core::sync::atomic::Ordering;

	#[test]
	fn clflush_leaves_contents_alone() {
		let node: Node = core::array::from_fn(|i| AtomicU64::new(i as u64));
		Clflush::flush_node(&node);
		NoClflush::flush_node(&node);
		assert_eq!(node[511].load(Ordering::Relaxed), 511);
	}
}
