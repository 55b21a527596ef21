//! Resource groups: the index, the headers and the allocation bitmaps.

use crate::inode::Inode;
use crate::log_debug;
use crate::log_err;
use crate::ondisk::*;
use crate::sbd::Sbd;
use crate::FsckError;
use std::collections::BTreeMap;

/// How far the resource group index can be trusted, from most to least.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TrustLevel {
	/// The index reads clean; use it as-is.
	BlindFaith,
	/// The index is mostly sane; keep the sane entries.
	LittleFaith,
	/// Reconstruct the index assuming evenly spaced groups.
	OpenMinded,
	/// Count the groups by scanning the device for their headers.
	Distrust,
	/// Scan, and accept headers whose own fields are damaged.
	Indignation,
}

impl TrustLevel {
	pub fn next(self) -> Option<Self> {
		match self {
			Self::BlindFaith => Some(Self::LittleFaith),
			Self::LittleFaith => Some(Self::OpenMinded),
			Self::OpenMinded => Some(Self::Distrust),
			Self::Distrust => Some(Self::Indignation),
			Self::Indignation => None,
		}
	}
}

/// Byte bookkeeping for one bitmap block of a resource group.
#[derive(Clone, Copy, Debug, Default)]
pub struct RgBitmap {
	/// Offset of the first bitmap byte inside the block.
	pub offset: u32,
	/// Position of this block's first byte in the whole bitmap.
	pub start: u32,
	/// Number of bitmap bytes in this block.
	pub len: u32,
}

/// One resource group.
#[derive(Clone, Debug, Default)]
pub struct Rgrp {
	pub addr: u64,
	pub length: u32,
	pub data0: u64,
	pub data: u32,
	pub bitbytes: u32,
	pub flags: u32,
	pub free: u32,
	pub dinodes: u32,
	pub used_meta: u32,
	pub free_meta: u32,
	pub bits: Vec<RgBitmap>,
}

impl Rgrp {
	pub fn from_rindex(ri: &RIndex) -> Self {
		Self {
			addr: ri.addr,
			length: ri.length,
			data0: ri.data0,
			data: ri.data,
			bitbytes: ri.bitbytes,
			..Default::default()
		}
	}

	pub fn to_rindex(&self) -> RIndex {
		RIndex {
			addr: self.addr,
			length: self.length,
			data0: self.data0,
			data: self.data,
			bitbytes: self.bitbytes,
		}
	}

	/// Size of the whole group in blocks, header included.
	pub fn size(&self) -> u64 {
		self.length as u64 + self.data as u64
	}

	/// Tells whether the given block falls inside this group's data span.
	pub fn contains(&self, block: u64) -> bool {
		block >= self.data0 && block < self.data0 + self.data as u64
	}

	/// Tells whether the given block is one of the group's header or
	/// bitmap blocks.
	pub fn contains_meta(&self, block: u64) -> bool {
		block >= self.addr && block < self.addr + self.length as u64
	}

	/// Computes the per-block bitmap bookkeeping.
	///
	/// Fails when the byte counts cannot tile `length` blocks, which is
	/// how a corrupt index entry is usually caught.
	pub fn compute_bitstructs(&mut self, bsize: u32) -> Result<(), ()> {
		let length = self.length;
		// A group tops out at 2GiB; with the smallest block size that is
		// far fewer bitmap blocks than this.
		if length == 0 || length > 2149 {
			return Err(());
		}

		self.bits.clear();
		let mut bytes_left = self.bitbytes;
		for x in 0..length {
			let bi = if length == 1 {
				RgBitmap {
					offset: SIZEOF_RGRP as u32,
					start: 0,
					len: bytes_left,
				}
			} else if x == 0 {
				RgBitmap {
					offset: SIZEOF_RGRP as u32,
					start: 0,
					len: bsize - SIZEOF_RGRP as u32,
				}
			} else if x + 1 == length {
				RgBitmap {
					offset: SIZEOF_MH as u32,
					start: self.bitbytes - bytes_left,
					len: bytes_left,
				}
			} else {
				RgBitmap {
					offset: SIZEOF_MH as u32,
					start: self.bitbytes - bytes_left,
					len: bsize - SIZEOF_MH as u32,
				}
			};
			if bi.len > bytes_left {
				return Err(());
			}
			bytes_left -= bi.len;
			self.bits.push(bi);
		}
		if bytes_left != 0 {
			return Err(());
		}

		let last = self.bits.last().unwrap();
		if (last.start + last.len) * NBBY != self.data {
			return Err(());
		}
		Ok(())
	}

	/// Reads the group's counters from its on-disk header.
	pub fn read_header(&mut self, sdp: &Sbd) -> Result<(), FsckError> {
		let bh = sdp.bcache.read(self.addr)?;
		let buf = bh.borrow();
		if !check_meta(&buf.data, METATYPE_RG) {
			return Err(FsckError::BadMeta {
				block: self.addr,
				expected: "resource group",
			});
		}
		let hdr = RgHeader::read(&buf.data);
		self.flags = hdr.flags;
		self.free = hdr.free;
		self.dinodes = hdr.dinodes;
		self.used_meta = hdr.used_meta;
		self.free_meta = hdr.free_meta;
		Ok(())
	}

	/// Writes the group's counters back into its on-disk header.
	pub fn write_header(&self, sdp: &Sbd) -> Result<(), FsckError> {
		let bh = sdp.bcache.read(self.addr)?;
		let mut buf = bh.borrow_mut();
		RgHeader {
			flags: self.flags,
			free: self.free,
			dinodes: self.dinodes,
			used_meta: self.used_meta,
			free_meta: self.free_meta,
			data0: self.data0,
			length: self.length,
			data: self.data,
			bitbytes: self.bitbytes,
		}
		.write(&mut buf.data);
		buf.modify();
		Ok(())
	}
}

/// Returns the resource group whose data span contains `block`, header and
/// bitmap blocks included.
pub fn blk2rg(sdp: &Sbd, block: u64) -> Option<&Rgrp> {
	sdp.rgtree
		.range(..=block)
		.next_back()
		.map(|(_, rg)| rg)
		.filter(|rg| block < rg.data0 + rg.data as u64)
}

/// Same as [`blk2rg`] but returns the tree key, for later mutation.
pub fn blk2rg_addr(sdp: &Sbd, block: u64) -> Option<u64> {
	blk2rg(sdp, block).map(|rg| rg.addr)
}

/// Reads the allocation state of one block from its group's bitmap.
pub fn bitmap_get(sdp: &Sbd, rg: &Rgrp, block: u64) -> Result<u8, FsckError> {
	let (blk_index, byte_index, bit) = bitmap_locate(rg, block)?;
	let bh = sdp.bcache.read(rg.addr + blk_index as u64)?;
	let buf = bh.borrow();
	Ok((buf.data[byte_index] >> bit) & BIT_MASK)
}

/// Rewrites the allocation state of one block in its group's bitmap.
pub fn bitmap_set(
	sdp: &Sbd,
	rg: &Rgrp,
	block: u64,
	state: u8,
) -> Result<(), FsckError> {
	let (blk_index, byte_index, bit) = bitmap_locate(rg, block)?;
	let bh = sdp.bcache.read(rg.addr + blk_index as u64)?;
	let mut buf = bh.borrow_mut();
	let cur = (buf.data[byte_index] >> bit) & BIT_MASK;
	buf.data[byte_index] ^= cur << bit;
	buf.data[byte_index] |= (state & BIT_MASK) << bit;
	buf.modify();
	Ok(())
}

/// Locates a block's bitmap position: (bitmap block index, byte offset in
/// that block, bit shift).
fn bitmap_locate(rg: &Rgrp, block: u64) -> Result<(u32, usize, u32), FsckError> {
	if !rg.contains(block) {
		return Err(FsckError::BadRange { block });
	}
	let rel = (block - rg.data0) as u32;

	let mut index = 0;
	for (i, bi) in rg.bits.iter().enumerate() {
		if rel < (bi.start + bi.len) * NBBY {
			index = i;
			break;
		}
	}
	let bi = &rg.bits[index];
	let byte = bi.offset + (rel / NBBY - bi.start);
	let bit = (rel % NBBY) * BIT_SIZE;
	Ok((index as u32, byte as usize, bit))
}

/// Counts the bitmap entries in a given state within a byte slice.
pub fn bitcount(buf: &[u8], state: u8) -> u32 {
	let mut count = 0;
	for byte in buf {
		for bit in 0..NBBY {
			if (byte >> (bit * BIT_SIZE)) & BIT_MASK == state {
				count += 1;
			}
		}
	}
	count
}

/// Finds a free block in the group, searching from its first data block.
pub fn find_free(sdp: &Sbd, rg: &Rgrp) -> Result<Option<u64>, FsckError> {
	for block in rg.data0..rg.data0 + rg.data as u64 {
		if bitmap_get(sdp, rg, block)? == BLKST_FREE {
			return Ok(Some(block));
		}
	}
	Ok(None)
}

/// Reads the resource group index file into a tree keyed by group address.
///
/// Returns the tree and a sanity verdict; an unsane index makes the caller
/// escalate its trust level. A sane index has sorted, contiguous and
/// internally consistent entries.
pub fn rindex_read(
	sdp: &Sbd,
	riinode: &Inode,
) -> Result<(BTreeMap<u64, Rgrp>, bool), FsckError> {
	let mut tree = BTreeMap::new();
	let mut ok = true;

	if riinode.di.size % SIZEOF_RINDEX as u64 != 0 {
		ok = false;
	}

	let count = riinode.di.size / SIZEOF_RINDEX as u64;
	let mut prev: Option<Rgrp> = None;
	let mut prev_spacing = 0;

	for i in 0..count {
		let mut raw = [0u8; SIZEOF_RINDEX];
		let n = crate::inode::readi(sdp, riinode, i * SIZEOF_RINDEX as u64, &mut raw)?;
		if n < SIZEOF_RINDEX {
			break;
		}
		let ri = RIndex::read(&raw);

		let mut addr = ri.addr;
		if !sdp.check_range(addr) {
			ok = false;
			match &prev {
				Some(p) => addr = p.data0 + p.data as u64,
				None => continue,
			}
		}

		let mut rg = Rgrp::from_rindex(&ri);
		rg.addr = addr;

		if let Some(p) = &prev {
			if p.addr >= rg.addr {
				ok = false;
			} else if !rg_seems_ok(&rg) {
				ok = false;
			} else if ok && i > 2 && prev_spacing != 0 {
				let spacing = rg.addr - p.addr;
				if spacing != prev_spacing && !rg_on_disk(sdp, rg.addr) {
					ok = false;
				}
			}
			prev_spacing = rg.addr - p.addr;
		}

		if rg.compute_bitstructs(sdp.sb.bsize).is_err() {
			ok = false;
			prev = Some(rg);
			continue;
		}

		prev = Some(rg.clone());
		tree.insert(rg.addr, rg);
	}

	if tree.is_empty() {
		ok = false;
	}
	Ok((tree, ok))
}

/// Internal consistency of a single index entry.
fn rg_seems_ok(rg: &Rgrp) -> bool {
	if rg.length == 0 {
		return false;
	}
	if rg.data0 != rg.addr + rg.length as u64 {
		return false;
	}
	if rg.bitbytes != rg.data / NBBY {
		return false;
	}
	true
}

/// Tells whether the block at `addr` really carries a resource group
/// header.
fn rg_on_disk(sdp: &Sbd, addr: u64) -> bool {
	match sdp.bcache.read(addr) {
		Ok(bh) => check_meta(&bh.borrow().data, METATYPE_RG),
		Err(_) => false,
	}
}

/// Computes the number of bitmap blocks and the data block count for a
/// group spanning `rgblocks` blocks in total.
pub fn rgblocks2bitblocks(bsize: u32, rgblocks: u32) -> (u32, u32) {
	let mut length = 1u32;
	loop {
		let data = (rgblocks - length) & !(NBBY - 1);
		let need = data / NBBY;
		let capacity =
			(bsize - SIZEOF_RGRP as u32) + (length - 1) * (bsize - SIZEOF_MH as u32);
		if capacity >= need {
			return (length, data);
		}
		length += 1;
	}
}

/// Rebuilds the group tree by scanning the device for resource group
/// headers.
///
/// With `tolerant` (the last trust level), headers whose own length/data
/// fields are damaged are reconstructed from the distance to the next
/// header.
pub fn rg_scan(sdp: &Sbd, tolerant: bool) -> Result<BTreeMap<u64, Rgrp>, FsckError> {
	let mut headers = Vec::new();

	for block in (sdp.sb_addr + 1)..sdp.fssize {
		let bh = sdp.bcache.read(block)?;
		let buf = bh.borrow();
		if !check_meta(&buf.data, METATYPE_RG) {
			continue;
		}
		let hdr = RgHeader::read(&buf.data);
		headers.push((block, hdr));
	}

	let mut tree = BTreeMap::new();
	for i in 0..headers.len() {
		let (addr, hdr) = &headers[i];
		let next_addr = headers
			.get(i + 1)
			.map(|(a, _)| *a)
			.unwrap_or(sdp.fssize);

		let mut rg = Rgrp {
			addr: *addr,
			length: hdr.length,
			data0: hdr.data0,
			data: hdr.data,
			bitbytes: hdr.bitbytes,
			..Default::default()
		};

		if rg.compute_bitstructs(sdp.sb.bsize).is_err() || !rg_seems_ok(&rg) {
			if !tolerant {
				log_debug!(
					"Skipping damaged resource group header at 0x{:x}",
					addr
				);
				continue;
			}
			// Infer the geometry from the gap to the next header
			let span = (next_addr - addr) as u32;
			let (length, data) = rgblocks2bitblocks(sdp.sb.bsize, span);
			rg.length = length;
			rg.data = data;
			rg.data0 = addr + length as u64;
			rg.bitbytes = data / NBBY;
			if rg.compute_bitstructs(sdp.sb.bsize).is_err() {
				log_err!(
					"Unable to reconstruct resource group at 0x{:x}",
					addr
				);
				continue;
			}
		}
		tree.insert(rg.addr, rg);
	}
	Ok(tree)
}

/// Rebuilds the group tree assuming evenly spaced groups: the spacing is
/// taken from the first two headers found on disk and extrapolated.
pub fn rg_grid(sdp: &Sbd) -> Result<BTreeMap<u64, Rgrp>, FsckError> {
	// Locate the first two headers
	let mut found = Vec::new();
	for block in (sdp.sb_addr + 1)..sdp.fssize {
		if rg_on_disk(sdp, block) {
			found.push(block);
			if found.len() == 2 {
				break;
			}
		}
	}
	if found.len() < 2 {
		return Ok(BTreeMap::new());
	}

	let first = found[0];
	let spacing = found[1] - found[0];
	let mut tree = BTreeMap::new();
	let mut addr = first;

	while addr < sdp.fssize {
		let span = (sdp.fssize - addr).min(spacing) as u32;
		if span <= 1 {
			break;
		}
		let (length, data) = rgblocks2bitblocks(sdp.sb.bsize, span);
		let mut rg = Rgrp {
			addr,
			length,
			data0: addr + length as u64,
			data,
			bitbytes: data / NBBY,
			..Default::default()
		};
		if rg.compute_bitstructs(sdp.sb.bsize).is_ok() {
			tree.insert(addr, rg);
		}
		addr += spacing;
	}
	Ok(tree)
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn bitstructs_single_block() {
		let mut rg = Rgrp {
			addr: 17,
			length: 1,
			data0: 18,
			data: 1024,
			bitbytes: 256,
			..Default::default()
		};
		rg.compute_bitstructs(4096).unwrap();
		assert_eq!(rg.bits.len(), 1);
		assert_eq!(rg.bits[0].offset, SIZEOF_RGRP as u32);
		assert_eq!(rg.bits[0].len, 256);
	}

	#[test]
	fn bitstructs_multi_block() {
		let bsize = 512u32;
		// One header block plus one continuation block
		let first = bsize - SIZEOF_RGRP as u32;
		let second = 100;
		let bitbytes = first + second;
		let mut rg = Rgrp {
			addr: 100,
			length: 2,
			data0: 102,
			data: bitbytes * NBBY,
			bitbytes,
			..Default::default()
		};
		rg.compute_bitstructs(bsize).unwrap();
		assert_eq!(rg.bits.len(), 2);
		assert_eq!(rg.bits[0].len, first);
		assert_eq!(rg.bits[1].offset, SIZEOF_MH as u32);
		assert_eq!(rg.bits[1].start, first);
		assert_eq!(rg.bits[1].len, second);
	}

	#[test]
	fn bitstructs_rejects_mismatch() {
		let mut rg = Rgrp {
			length: 1,
			data: 1000, // does not match bitbytes * NBBY
			bitbytes: 100,
			..Default::default()
		};
		assert!(rg.compute_bitstructs(4096).is_err());
		rg.length = 0;
		assert!(rg.compute_bitstructs(4096).is_err());
	}

	#[test]
	fn bitcount_states() {
		// 0b11100100: one block in each state
		let buf = [0b1110_0100u8];
		assert_eq!(bitcount(&buf, BLKST_FREE), 1);
		assert_eq!(bitcount(&buf, BLKST_USED), 1);
		assert_eq!(bitcount(&buf, BLKST_UNLINKED), 1);
		assert_eq!(bitcount(&buf, BLKST_DINODE), 1);
		assert_eq!(bitcount(&[0u8; 4], BLKST_FREE), 16);
	}

	#[test]
	fn rgblocks_to_bitblocks() {
		let (length, data) = rgblocks2bitblocks(4096, 1024);
		assert_eq!(length, 1);
		assert!(data <= 1024 - length);
		assert!(data / NBBY <= 4096 - SIZEOF_RGRP as u32);

		// A large group needs several bitmap blocks
		let (length, data) = rgblocks2bitblocks(512, 100_000);
		assert!(length > 1);
		let capacity = (512 - SIZEOF_RGRP as u32)
			+ (length - 1) * (512 - SIZEOF_MH as u32);
		assert!(data / NBBY <= capacity);
	}
}
