//! The name hash.
//!
//! Directory entries store a 32-bit hash of their name; its upper bits
//! select the slot in an extendible-hash directory's table. Log headers
//! reuse the same function as an integrity check. The function is a
//! reflected CRC-32 with the polynomial below, all-ones initial value and
//! a final complement.

use std::sync::OnceLock;

/// The generator polynomial of the name hash, reflected.
const HASH_POLYNOM: u32 = 0xedb88320;

/// One shift-or-divide step of the reflected CRC.
fn hash_step(value: u32) -> u32 {
	if value & 1 != 0 {
		(value >> 1) ^ HASH_POLYNOM
	} else {
		value >> 1
	}
}

/// The per-byte remainder table, built once on first use.
fn hash_table() -> &'static [u32; 256] {
	static TABLE: OnceLock<[u32; 256]> = OnceLock::new();

	TABLE.get_or_init(|| {
		let mut table = [0u32; 256];
		for (byte, slot) in table.iter_mut().enumerate() {
			let mut rem = byte as u32;
			for _ in 0..8 {
				rem = hash_step(rem);
			}
			*slot = rem;
		}
		table
	})
}

/// Folds more bytes into a running hash state. The state carries no
/// pre- or post-conditioning, so runs over split buffers compose.
pub fn hash_more(state: u32, data: &[u8]) -> u32 {
	let table = hash_table();

	data.iter().fold(state, |hash, byte| {
		table[((hash ^ *byte as u32) & 0xff) as usize] ^ (hash >> 8)
	})
}

/// Returns the on-disk hash of a directory entry name.
pub fn disk_hash(data: &[u8]) -> u32 {
	!hash_more(!0, data)
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn hash_known_values() {
		// The standard check value for this polynomial
		assert_eq!(disk_hash(b"123456789"), 0xcbf43926);
		assert_eq!(disk_hash(b""), 0);
	}

	#[test]
	fn hash_composes_over_split_input() {
		let whole = disk_hash(b"some_file_name");
		let state = hash_more(!0, b"some_");
		let state = hash_more(state, b"file_");
		let state = hash_more(state, b"name");
		assert_eq!(!state, whole);
	}

	#[test]
	fn table_matches_bitwise_hash() {
		// The table walk must agree with running the shift register over
		// every bit of the input
		for byte in [0u8, 1, 0x42, 0x80, 0xff] {
			let mut rem = byte as u32;
			for _ in 0..8 {
				rem = hash_step(rem);
			}
			assert_eq!(hash_more(0, &[byte]), rem);
		}
	}

	#[test]
	fn hash_distinct_names() {
		assert_ne!(disk_hash(b"."), disk_hash(b".."));
		assert_ne!(disk_hash(b"foo"), disk_hash(b"bar"));
		assert_ne!(disk_hash(b"foo"), disk_hash(b"foO"));
	}
}
