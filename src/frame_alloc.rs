/*
 * Copyright 2025 Oxide Computer Company
 */

use crate::pagetable::Error;
use crate::prelude::*;
use crate::tedium64::*;
use core::ptr;
use core::sync::atomic::{AtomicU64, Ordering};
use log::warn;
use x86::bits64::paging::PAddr;

const FRAME_SHIFT: Shift64 = shift64!(12);
const FRAME_SIZE: u64 = FRAME_SHIFT.size();

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Fill {
	Zero,
	None,
}

/*
 * The source of frames for intermediate page table nodes.  Allocation can
 * fail, and failure is reported rather than fatal: the caller of a mapping
 * operation may well be able to release memory and try again.
 */
pub trait FrameAlloc: Sync {
	/// Allocate `count` physically contiguous frames.
	fn alloc(&self, count: usize, fill: Fill) -> Result<PAddr, Error>;

	///
	/// # Safety
	///
	/// `frame` must have come from `alloc` on this allocator with the same
	/// `count`, and nothing may reference the frames afterwards.
	///
	unsafe fn free(&self, frame: PAddr, count: usize);

	/// The kernel virtual address at which `pa` can be accessed.
	fn phys_to_virt(&self, pa: PAddr) -> *mut u8;
}

/*
 * Page table pages from a contiguous arena of at most 64 * WORDS frames that
 * is mapped at a fixed offset from its physical address.  The free map has a
 * bit per frame, set when the frame is free; a run of frames is always taken
 * from within a single word so that claiming it is one compare-and-swap.
 */
pub struct ArenaAlloc<const WORDS: usize> {
	base_pa: u64,
	base_va: usize,
	frames: usize,
	freemap: [AtomicU64; WORDS],
}

impl<const WORDS: usize> ArenaAlloc<WORDS> {
	///
	/// # Safety
	///
	/// `[base_va, base_va + frames * 4K)` must be writable memory that
	/// nothing else uses for the lifetime of the allocator, and it must be
	/// the mapping of `[base_pa, base_pa + frames * 4K)`.
	///
	pub unsafe fn new(base_pa: PAddr, base_va: *mut u8, frames: usize) -> Self {
		assert_eq!(base_pa.0 & (FRAME_SIZE - 1), 0);
		assert_eq!(base_va as u64 & (FRAME_SIZE - 1), 0);
		assert!(frames <= WORDS * 64);

		let freemap = core::array::from_fn(|w| {
			let first = (w * 64) as u64;
			let avail = (frames as u64).saturating_sub(first).min(64);
			AtomicU64::new(Mask64::bits_to(avail).as_u64())
		});

		Self {
			base_pa: base_pa.0,
			base_va: base_va as usize,
			frames,
			freemap,
		}
	}

	pub fn capacity(&self) -> usize {
		self.frames
	}

	pub fn free_frames(&self) -> usize {
		self.freemap
			.iter()
			.map(|w| w.load(Ordering::Relaxed).count_ones() as usize)
			.sum()
	}

	fn frame_pa(&self, idx: usize) -> PAddr {
		PAddr(self.base_pa + ((idx as u64) << FRAME_SHIFT.count()))
	}

	fn frame_idx(&self, pa: PAddr) -> usize {
		assert_eq!(pa.0 & (FRAME_SIZE - 1), 0);
		assert!(pa.0 >= self.base_pa);
		let idx = ((pa.0 - self.base_pa) >> FRAME_SHIFT.count()) as usize;
		assert!(idx < self.frames);
		idx
	}

	/*
	 * Lowest position in `map` holding `run` consecutive set bits.
	 */
	fn find_run(map: Mask64, run: Mask64) -> Option<u64> {
		let mut free = map;
		while let Some(low) = free.lowest_bit() {
			let at = low.count();
			if ((run.as_u64() << at) >> at != run.as_u64()) {
				return (None);
			}
			let want = Mask64::new(run.as_u64() << at);
			if (map.contains(want)) {
				return (Some(at));
			}
			free &= !Mask64::bit(at);
		}
		None
	}

	fn claim(&self, count: usize) -> Option<usize> {
		let run = Mask64::bits_to(count as u64);

		for (w, word) in self.freemap.iter().enumerate() {
			let mut cur = word.load(Ordering::Acquire);
			while let Some(at) = Self::find_run(Mask64::new(cur), run) {
				let new = cur & !(run.as_u64() << at);
				match (word.compare_exchange(
					cur,
					new,
					Ordering::AcqRel,
					Ordering::Acquire,
				)) {
					Ok(_) => return (Some(w * 64 + at as usize)),
					Err(seen) => cur = seen,
				}
			}
		}

		None
	}
}

impl<const WORDS: usize> FrameAlloc for ArenaAlloc<WORDS> {
	fn alloc(&self, count: usize, fill: Fill) -> Result<PAddr, Error> {
		assert!(count > 0 && count <= 64);

		let Some(idx) = self.claim(count) else {
			warn!("page table arena exhausted ({} frames wanted)", count);
			return (Err(Error::NoMemory));
		};

		let pa = self.frame_pa(idx);
		if (fill == Fill::Zero) {
			/*
			 * Safe because the frames were just claimed from our own
			 * arena, which the constructor's caller vouched for.
			 */
			unsafe {
				ptr::write_bytes(
					self.phys_to_virt(pa),
					0,
					count * FRAME_SIZE as usize,
				);
			}
		}

		Ok(pa)
	}

	unsafe fn free(&self, frame: PAddr, count: usize) {
		let idx = self.frame_idx(frame);
		assert!(count > 0 && idx % 64 + count <= 64);

		let bits = Mask64::bits_to(count as u64).as_u64() << (idx % 64);
		let prev = self.freemap[idx / 64].fetch_or(bits, Ordering::AcqRel);
		assert_eq!(prev & bits, 0, "double free of frame {:x}", frame.0);
	}

	fn phys_to_virt(&self, pa: PAddr) -> *mut u8 {
		(self.base_va + (pa.0 - self.base_pa) as usize) as *mut u8
	}
}
