//! Filesystem operations the repair paths need: name lookup, directory
//! entry insertion and removal, and block allocation for rebuilt objects.

use crate::blockmap::BlockTag;
use crate::buf::BufHandle;
use crate::fsck::FsckCtx;
use crate::hash::disk_hash;
use crate::inode::get_leaf_ptr;
use crate::inode::Inode;
use crate::log_debug;
use crate::log_err;
use crate::metawalk;
use crate::metawalk::WalkOps;
use crate::metawalk::WalkRet;
use crate::ondisk::*;
use crate::rgrp;
use crate::sbd::Sbd;
use crate::FsckError;

/// One parsed directory entry.
pub struct DirEntry {
	pub name: Vec<u8>,
	pub inum: Inum,
	pub de_type: u8,
}

/// Collects the live entries of a directory, sentinels excluded. Damaged
/// leaves are skipped rather than repaired; this is a read-only helper.
pub fn dir_entries(sdp: &Sbd, dip: &Inode) -> Result<Vec<DirEntry>, FsckError> {
	let mut entries = Vec::new();

	if dip.di.flags & DIF_EXHASH != 0 {
		let slots: u32 = 1 << dip.di.depth;
		let mut old_leaf = 0;
		for index in 0..slots {
			let mut leaf_no = get_leaf_ptr(sdp, dip, index)?;
			if leaf_no == old_leaf {
				continue;
			}
			old_leaf = leaf_no;

			let mut hops = 0;
			while leaf_no != 0 && sdp.check_range(leaf_no) && hops < 1000 {
				let bh = sdp.bcache.read(leaf_no)?;
				if !check_meta(&bh.borrow().data, METATYPE_LF) {
					break;
				}
				collect_block_entries(sdp.bcache.bsize() as usize, &bh, SIZEOF_LEAF, &mut entries);
				let next = Leaf::read(&bh.borrow().data).next;
				if next == leaf_no {
					break;
				}
				leaf_no = next;
				hops += 1;
			}
		}
	} else {
		collect_block_entries(
			sdp.bcache.bsize() as usize,
			&dip.bh,
			SIZEOF_DINODE,
			&mut entries,
		);
	}
	Ok(entries)
}

fn collect_block_entries(
	bsize: usize,
	bh: &BufHandle,
	start: usize,
	entries: &mut Vec<DirEntry>,
) {
	let buf = bh.borrow();
	let mut off = start;

	while off + SIZEOF_DIRENT <= bsize {
		let de = Dirent::read(&buf.data, off);
		if de.rec_len as usize % 8 != 0
			|| (de.rec_len as usize) < dirent_size(de.name_len as usize)
			|| off + de.rec_len as usize > bsize
		{
			break;
		}
		if !de.is_sentinel() && de.name_len > 0 {
			let name_end = off + SIZEOF_DIRENT + de.name_len as usize;
			entries.push(DirEntry {
				name: buf.data[off + SIZEOF_DIRENT..name_end].to_vec(),
				inum: de.inum,
				de_type: de.de_type,
			});
		}
		let next = off + de.rec_len as usize;
		if next >= bsize {
			break;
		}
		off = next;
	}
}

/// Looks a name up in a directory.
pub fn lookupi(sdp: &Sbd, dip: &Inode, name: &[u8]) -> Result<Option<Inum>, FsckError> {
	Ok(dir_entries(sdp, dip)?
		.into_iter()
		.find(|e| e.name == name)
		.map(|e| e.inum))
}

/// Inserts a directory entry, reusing record slack. The directory is not
/// grown; repairs only ever add a handful of names.
pub fn dir_add(
	ctx: &mut FsckCtx,
	dip: &mut Inode,
	name: &[u8],
	inum: Inum,
	de_type: u8,
) -> Result<(), FsckError> {
	let hash = disk_hash(name);
	let bsize = ctx.sdp.bcache.bsize() as usize;

	let inserted = if dip.di.flags & DIF_EXHASH != 0 {
		let index = hash >> (32 - dip.di.depth);
		let mut leaf_no = get_leaf_ptr(&ctx.sdp, dip, index)?;
		let mut done = false;
		while leaf_no != 0 && ctx.sdp.check_range(leaf_no) {
			let bh = ctx.sdp.bcache.read(leaf_no)?;
			if !check_meta(&bh.borrow().data, METATYPE_LF) {
				break;
			}
			if insert_in_block(bsize, &bh, SIZEOF_LEAF, name, inum, hash, de_type) {
				let mut buf = bh.borrow_mut();
				let mut leaf = Leaf::read(&buf.data);
				leaf.entries += 1;
				leaf.write(&mut buf.data);
				buf.modify();
				done = true;
				break;
			}
			leaf_no = Leaf::read(&bh.borrow().data).next;
		}
		done
	} else {
		insert_in_block(bsize, &dip.bh.clone(), SIZEOF_DINODE, name, inum, hash, de_type)
	};

	if !inserted {
		return Err(FsckError::Alloc {
			what: "directory entry space",
		});
	}

	dip.di.entries += 1;
	if de_type == DT_DIR {
		// The new child's ".." references this directory
		dip.di.nlink += 1;
	}
	dip.save();
	Ok(())
}

/// Tries to fit a new entry into one directory block. Returns false when
/// no record has enough slack.
pub(crate) fn insert_in_block(
	bsize: usize,
	bh: &BufHandle,
	start: usize,
	name: &[u8],
	inum: Inum,
	hash: u32,
	de_type: u8,
) -> bool {
	let needed = dirent_size(name.len());
	let mut buf = bh.borrow_mut();
	let mut off = start;

	while off + SIZEOF_DIRENT <= bsize {
		let de = Dirent::read(&buf.data, off);
		if de.rec_len as usize % 8 != 0 || off + de.rec_len as usize > bsize {
			return false;
		}
		let used = if de.is_sentinel() {
			0
		} else {
			dirent_size(de.name_len as usize)
		};
		let slack = de.rec_len as usize - used;

		if slack >= needed {
			let (new_off, new_len) = if used == 0 {
				// Take over the sentinel's whole record
				(off, de.rec_len)
			} else {
				// Split the record's slack off
				let mut shrunk = de.clone();
				shrunk.rec_len = used as u16;
				shrunk.write(&mut buf.data, off);
				(off + used, (slack) as u16)
			};
			let new = Dirent {
				inum,
				hash,
				rec_len: new_len,
				name_len: name.len() as u8,
				de_type,
			};
			new.write(&mut buf.data, new_off);
			buf.data[new_off + SIZEOF_DIRENT..new_off + SIZEOF_DIRENT + name.len()]
				.copy_from_slice(name);
			buf.modify();
			return true;
		}

		let next = off + de.rec_len as usize;
		if next >= bsize || de.rec_len == 0 {
			return false;
		}
		off = next;
	}
	false
}

/// Dentry hook that deletes every entry pointing at one block address.
struct RemoveDentryOps {
	target: u64,
	removed: u32,
}

impl WalkOps for RemoveDentryOps {
	fn wants_dentries(&self) -> bool {
		true
	}

	fn check_dentry(
		&mut self,
		_ctx: &mut FsckCtx,
		_ip: &Inode,
		dent: &Dirent,
		_name: &[u8],
		bh: &BufHandle,
		prev_off: Option<usize>,
		off: usize,
		_lindex: u32,
		count: &mut u32,
	) -> Result<WalkRet, FsckError> {
		if dent.inum.addr == self.target {
			metawalk::dirent_del(bh, prev_off, off);
			self.removed += 1;
			return Ok(WalkRet::SkipOne);
		}
		*count += 1;
		Ok(WalkRet::Good)
	}
}

/// Removes the directory entry pointing at `dentry_block` from the
/// directory at `dir`.
///
/// Returns the number of entries removed.
pub fn remove_dentry_from_dir(
	ctx: &mut FsckCtx,
	dir: u64,
	dentry_block: u64,
) -> Result<u32, FsckError> {
	log_debug!(
		"Removing dentry for 0x{:x} from directory 0x{:x}",
		dentry_block,
		dir
	);
	if !ctx.sdp.check_range(dir) {
		log_err!("Parent directory out of range");
		return Ok(0);
	}
	if ctx.block_type(dir) != BlockTag::DirInode {
		log_debug!("Parent block is not a directory, ignoring");
		return Ok(0);
	}

	let mut ops = RemoveDentryOps {
		target: dentry_block,
		removed: 0,
	};
	metawalk::check_dir(ctx, dir, &mut ops)?;

	if ops.removed > 0 {
		let mut dip = Inode::load(&ctx.sdp, dir)?;
		dip.di.entries = dip.di.entries.saturating_sub(ops.removed);
		dip.save();
	}
	Ok(ops.removed)
}

/// Allocates one block from the resource groups, marking it in the bitmap
/// and the group header.
pub fn blk_alloc(ctx: &mut FsckCtx, state: u8) -> Result<u64, FsckError> {
	let rg_addrs: Vec<u64> = ctx.sdp.rgtree.keys().copied().collect();

	for addr in rg_addrs {
		let rg = ctx.sdp.rgtree.get(&addr).unwrap().clone();
		let Some(block) = rgrp::find_free(&ctx.sdp, &rg)? else {
			continue;
		};
		rgrp::bitmap_set(&ctx.sdp, &rg, block, state)?;

		let rg = ctx.sdp.rgtree.get_mut(&addr).unwrap();
		rg.free = rg.free.saturating_sub(1);
		if state == BLKST_DINODE {
			rg.dinodes += 1;
		}
		let rg = rg.clone();
		rg.write_header(&ctx.sdp)?;
		return Ok(block);
	}
	Err(FsckError::Alloc {
		what: "filesystem block",
	})
}

/// Hands out the next formal inode number, advancing the counter file.
pub fn next_formal_ino(ctx: &mut FsckCtx) -> Result<u64, FsckError> {
	if let Some(inum_addr) = ctx.sdp.md.inum {
		let ip = Inode::load(&ctx.sdp, inum_addr)?;
		if check_meta(&ip.bh.borrow().data, METATYPE_DI) && ip.di.size >= 8 {
			let mut raw = [0u8; 8];
			crate::inode::readi(&ctx.sdp, &ip, 0, &mut raw)?;
			let next = u64::from_be_bytes(raw);
			crate::inode::writei(&ctx.sdp, &ip, 0, &(next + 1).to_be_bytes())?;
			return Ok(next);
		}
	}
	// Fall back to one past the highest number seen in the scan
	let max = ctx
		.inodetree
		.values()
		.map(|ii| ii.inum.formal_ino)
		.max()
		.unwrap_or(0);
	Ok(max + 1)
}

/// Builds a fresh dinode in a newly allocated block.
///
/// Directories are created stuffed, with "." and ".." entries in place.
pub fn init_dinode(
	ctx: &mut FsckCtx,
	inum: Inum,
	mode: u32,
	flags: u32,
	parent: Inum,
) -> Result<Inode, FsckError> {
	let bsize = ctx.sdp.bcache.bsize() as usize;
	let is_dir = mode & 0o170000 == 0o040000;

	let bh = ctx.sdp.bcache.get(inum.addr)?;
	{
		let mut buf = bh.borrow_mut();
		buf.data.fill(0);

		let di = Dinode {
			header: MetaHeader::new(METATYPE_DI, FORMAT_DI),
			num: inum,
			mode,
			nlink: if is_dir { 2 } else { 1 },
			size: if is_dir {
				(bsize - SIZEOF_DINODE) as u64
			} else {
				0
			},
			blocks: 1,
			flags,
			payload_format: if is_dir { FORMAT_DE } else { 0 },
			entries: if is_dir { 2 } else { 0 },
			..Default::default()
		};
		di.write(&mut buf.data);

		if is_dir {
			let dot = Dirent {
				inum,
				hash: disk_hash(b"."),
				rec_len: dirent_size(1) as u16,
				name_len: 1,
				de_type: DT_DIR,
			};
			let mut off = SIZEOF_DINODE;
			dot.write(&mut buf.data, off);
			buf.data[off + SIZEOF_DIRENT] = b'.';
			off += dot.rec_len as usize;

			let dotdot = Dirent {
				inum: parent,
				hash: disk_hash(b".."),
				rec_len: (bsize - off) as u16,
				name_len: 2,
				de_type: DT_DIR,
			};
			dotdot.write(&mut buf.data, off);
			buf.data[off + SIZEOF_DIRENT..off + SIZEOF_DIRENT + 2]
				.copy_from_slice(b"..");
		}
		buf.modify();
	}

	Inode::load(&ctx.sdp, inum.addr)
}

/// Creates a new inode linked under `dip` with the given name.
pub fn createi(
	ctx: &mut FsckCtx,
	dip_addr: u64,
	name: &[u8],
	mode: u32,
	flags: u32,
) -> Result<Inode, FsckError> {
	let block = blk_alloc(ctx, BLKST_DINODE)?;
	let formal_ino = next_formal_ino(ctx)?;
	let inum = Inum {
		formal_ino,
		addr: block,
	};

	let mut dip = Inode::load(&ctx.sdp, dip_addr)?;
	let ip = init_dinode(ctx, inum, mode, flags, dip.di.num)?;

	let de_type = crate::inode::mode_to_de_type(mode).unwrap_or(DT_REG);
	dir_add(ctx, &mut dip, name, inum, de_type)?;

	let tag = match de_type {
		DT_DIR => BlockTag::DirInode,
		_ => BlockTag::FileInode,
	};
	ctx.blockmap_set(block, tag);
	log_debug!(
		"Created inode {} at 0x{:x} under 0x{:x}",
		inum,
		block,
		dip_addr
	);
	Ok(ip)
}

#[cfg(test)]
mod test {
	use super::*;
	use std::cell::RefCell;
	use std::rc::Rc;

	fn block_with_sentinel(bsize: usize, start: usize) -> BufHandle {
		let mut data = vec![0u8; bsize];
		let sent = Dirent {
			inum: Inum::default(),
			hash: 0,
			rec_len: (bsize - start) as u16,
			name_len: 0,
			de_type: 0,
		};
		sent.write(&mut data, start);
		Rc::new(RefCell::new(crate::buf::Buf {
			addr: 0,
			data,
			modified: false,
		}))
	}

	#[test]
	fn collect_entries_skips_sentinel() {
		let bh = block_with_sentinel(512, SIZEOF_LEAF);
		let mut entries = Vec::new();
		collect_block_entries(512, &bh, SIZEOF_LEAF, &mut entries);
		assert!(entries.is_empty());
	}

	#[test]
	fn insert_into_sentinel_block() {
		let bh = block_with_sentinel(512, SIZEOF_LEAF);
		let inum = Inum {
			formal_ino: 5,
			addr: 0x500,
		};
		let ok = insert_in_block(
			512,
			&bh,
			SIZEOF_LEAF,
			b"hello",
			inum,
			disk_hash(b"hello"),
			DT_REG,
		);
		assert!(ok);

		let mut entries = Vec::new();
		collect_block_entries(512, &bh, SIZEOF_LEAF, &mut entries);
		assert_eq!(entries.len(), 1);
		assert_eq!(entries[0].name, b"hello");
		assert_eq!(entries[0].inum, inum);
	}

	#[test]
	fn insert_splits_record_slack() {
		let bh = block_with_sentinel(512, SIZEOF_LEAF);
		let a = Inum {
			formal_ino: 1,
			addr: 0x100,
		};
		let b = Inum {
			formal_ino: 2,
			addr: 0x200,
		};
		assert!(insert_in_block(512, &bh, SIZEOF_LEAF, b"a", a, disk_hash(b"a"), DT_REG));
		assert!(insert_in_block(512, &bh, SIZEOF_LEAF, b"b", b, disk_hash(b"b"), DT_DIR));

		let mut entries = Vec::new();
		collect_block_entries(512, &bh, SIZEOF_LEAF, &mut entries);
		assert_eq!(entries.len(), 2);
		assert_eq!(entries[0].name, b"a");
		assert_eq!(entries[1].name, b"b");
		assert_eq!(entries[1].de_type, DT_DIR);

		// The records must still tile the block
		let buf = bh.borrow();
		let mut off = SIZEOF_LEAF;
		let mut total = 0;
		loop {
			let de = Dirent::read(&buf.data, off);
			total += de.rec_len as usize;
			if off + de.rec_len as usize >= 512 {
				break;
			}
			off += de.rec_len as usize;
		}
		assert_eq!(total, 512 - SIZEOF_LEAF);
	}
}
