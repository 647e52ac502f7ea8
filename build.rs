/*
 * XXX Work around cargo#4423 host/target flags gap
 */
#![allow(unused_parens)]

use std::env;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

struct Defs {
	remap_window_base: u64,
	remap_slots: usize,
}

/*
 * The default window sits in the second-to-last PML4 slot, well away from
 * both the kernel image and the direct map.
 */
static DEFS: Defs = Defs {
	remap_window_base: 0xFFFF_FF00_0000_0000,
	remap_slots: 64,
};

const PAGE_SIZE: u64 = 0x1000;
const REMAP_SLOT_PAGES: u64 = 2;

fn parse_u64(s: &str) -> Option<u64> {
	let s = s.trim().replace('_', "");
	match (s.strip_prefix("0x").or_else(|| s.strip_prefix("0X"))) {
		Some(hex) => u64::from_str_radix(hex, 16).ok(),
		None => s.parse::<u64>().ok(),
	}
}

fn is_canonical(va: u64) -> bool {
	let high = va >> 47;
	high == 0 || high == 0x1_FFFF
}

fn main() {
	let out = &PathBuf::from(env::var_os("OUT_DIR").unwrap());
	let mut defs_file = File::create(out.join("hptdefs.rs")).unwrap();

	let base = env::var("HPT_REMAP_WINDOW_BASE")
		.ok()
		.and_then(|s| parse_u64(&s))
		.unwrap_or(DEFS.remap_window_base);
	let slots = env::var("HPT_REMAP_SLOTS")
		.ok()
		.and_then(|s| s.trim().parse::<usize>().ok())
		.unwrap_or(DEFS.remap_slots);

	let span = slots as u64 * REMAP_SLOT_PAGES * PAGE_SIZE;

	assert_eq!(base & (PAGE_SIZE - 1), 0, "remap window must be page aligned");
	assert!(slots > 0 && slots <= 64, "remap slots must be in 1 ..= 64");
	assert!(
		is_canonical(base) &&
			base.checked_add(span - 1).map_or(false, is_canonical),
		"remap window must be canonical"
	);

	writeln!(defs_file, "pub const REMAP_WINDOW_BASE: u64 = {:#x};", base)
		.unwrap();
	writeln!(defs_file, "pub const REMAP_SLOTS: usize = {};", slots)
		.unwrap();
	writeln!(
		defs_file,
		"pub const REMAP_SLOT_PAGES: u64 = {};",
		REMAP_SLOT_PAGES
	)
	.unwrap();

	println!("cargo:rerun-if-changed=build.rs");
	println!("cargo:rerun-if-env-changed=HPT_REMAP_WINDOW_BASE");
	println!("cargo:rerun-if-env-changed=HPT_REMAP_SLOTS");
}
