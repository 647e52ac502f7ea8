/*
 * Copyright 2025 Oxide Computer Company
 */

mod common;

use common::*;
use hpt::tlb::NoCleanup;
use proptest::prelude::*;
use std::collections::BTreeMap;
use x86::bits64::paging::{PAddr, VAddr};

/*
 * Addresses spread across both halves and every level's index boundaries,
 * so that sequences of operations share some nodes and not others.
 */
const ADDRS: [u64; 8] = [
	0x0000_0000_0000_0000,
	0x0000_0000_0000_1000,
	0x0000_0000_001F_F000,
	0x0000_0000_4000_0000,
	0x0000_0080_0000_0000,
	0x0000_7FFF_FFFF_F000,
	0xFFFF_8000_0000_0000,
	0xFFFF_FFFF_FFFF_F000,
];

#[derive(Debug, Clone)]
enum Op {
	Replace(usize, u64),
	Remove(usize),
}

fn arb_op() -> impl Strategy<Value = Op> {
	prop_oneof![
		(0 .. ADDRS.len(), 1u64 .. 0x10_0000)
			.prop_map(|(a, pfn)| Op::Replace(a, pfn << 12)),
		(0 .. ADDRS.len()).prop_map(Op::Remove),
	]
}

proptest! {
	#[test]
	fn behaves_like_a_map(ops in proptest::collection::vec(arb_op(), 1 .. 64)) {
		let arena = Arena::new(64);
		let config = config(3);
		let hpt = Hpt::new(&config, &arena.alloc, &NoCleanup).unwrap();
		let mut model: BTreeMap<u64, u64> = BTreeMap::new();

		for op in ops {
			match op {
				Op::Replace(a, frame) => {
					let va = ADDRS[a];
					let old = hpt.replace(VAddr(va), PAddr(frame)).unwrap();
					prop_assert_eq!(old.map(|pa| pa.0), model.insert(va, frame));
				}
				Op::Remove(a) => {
					let va = ADDRS[a];
					prop_assert_eq!(hpt.remove(VAddr(va)), model.remove(&va).is_some());
				}
			}
		}

		for va in ADDRS {
			prop_assert_eq!(
				hpt.translate(VAddr(va | 0x123)).map(|pa| pa.0),
				model.get(&va).map(|f| f | 0x123)
			);
		}

		/* Canonical addresses sort the same way as the tree walks them. */
		let mut leaves = Vec::new();
		hpt.for_each_leaf(&mut |va, m| leaves.push((va.0, m.frame.0)));
		let expect: Vec<(u64, u64)> = model.iter().map(|(&v, &f)| (v, f)).collect();
		prop_assert_eq!(leaves, expect);
	}

	#[test]
	fn copies_match_the_source_over_their_range(
		ops in proptest::collection::vec(arb_op(), 1 .. 32),
		high in any::<bool>(),
	) {
		let arena = Arena::new(128);
		let config = config(3);
		let src = Hpt::new(&config, &arena.alloc, &NoCleanup).unwrap();

		for op in ops {
			match op {
				Op::Replace(a, frame) => {
					src.replace(VAddr(ADDRS[a]), PAddr(frame)).unwrap();
				}
				Op::Remove(a) => {
					src.remove(VAddr(ADDRS[a]));
				}
			}
		}

		let range = if high {
			0xFFFF_8000_0000_0000 ..= u64::MAX
		} else {
			0 ..= 0x7FFF_FFFF_FFFF
		};
		let before = arena.used();
		let copy = src.deep_copy(range.clone()).unwrap();

		for va in ADDRS {
			let expect = if range.contains(&va) {
				src.translate(VAddr(va))
			} else {
				None
			};
			prop_assert_eq!(copy.translate(VAddr(va)), expect);
		}

		drop(copy);
		prop_assert_eq!(arena.used(), before);
	}
}
