//! Pass 1: walk every allocated dinode and build the block map.
//!
//! The resource groups are visited in address order and, within each
//! group, the bitmap in ascending order. Every block a dinode references
//! is tagged in the block map; blocks claimed twice land in the duplicate
//! tree for pass 1b.

use crate::blockmap::BlockTag;
use crate::fsck::DupRefType;
use crate::fsck::FsckCtx;
use crate::fsck::BAD_POINTER_TOLERANCE;
use crate::inode::Inode;
use crate::log_debug;
use crate::log_err;
use crate::log_info;
use crate::metawalk;
use crate::metawalk::DeleteOps;
use crate::metawalk::WalkOps;
use crate::metawalk::WalkRet;
use crate::ondisk::*;
use crate::FsckError;

/// The walk hooks of pass 1: range checks, duplicate detection and block
/// map tagging.
struct Pass1Checker {
	/// Out-of-range pointers seen in the current inode.
	bad_pointers: u32,
	/// Blocks counted for the inode, the dinode itself included.
	blocks: u64,
	/// Tag data blocks as journaled data.
	jdata: bool,
}

impl Pass1Checker {
	fn new(jdata: bool) -> Self {
		Self {
			bad_pointers: 0,
			blocks: 1,
			jdata,
		}
	}

	/// Counts one bad pointer; past the tolerance the inode is abandoned.
	fn bad_pointer(&mut self, ip: &Inode, block: u64) -> WalkRet {
		self.bad_pointers += 1;
		log_err!(
			"Bad pointer 0x{:x} (out of range) in inode 0x{:x} ({} so far)",
			block,
			ip.addr,
			self.bad_pointers
		);
		if self.bad_pointers > BAD_POINTER_TOLERANCE {
			log_err!(
				"Inode 0x{:x} has too many bad pointers to continue.",
				ip.addr
			);
			WalkRet::Error
		} else {
			WalkRet::SkipSubtree
		}
	}
}

impl WalkOps for Pass1Checker {
	fn check_metalist(
		&mut self,
		ctx: &mut FsckCtx,
		ip: &Inode,
		block: u64,
		_height: u16,
		is_valid: &mut bool,
		was_duplicate: &mut bool,
	) -> Result<WalkRet, FsckError> {
		*is_valid = true;
		*was_duplicate = false;

		if !ctx.sdp.check_range(block) {
			*is_valid = false;
			return Ok(self.bad_pointer(ip, block));
		}
		if ctx.block_type(block) != BlockTag::Free {
			*was_duplicate = true;
			ctx.add_duplicate_ref(ip.addr, block, DupRefType::AsMeta, false, true);
			self.blocks += 1;
			return Ok(WalkRet::Good);
		}

		let bh = ctx.sdp.bcache.read(block)?;
		if !check_meta(&bh.borrow().data, METATYPE_IN) {
			log_err!(
				"Inode 0x{:x} has a bad indirect block pointer 0x{:x}.",
				ip.addr,
				block
			);
			*is_valid = false;
			ctx.blockmap_set(block, BlockTag::InvalidMeta);
			return Ok(self.bad_pointer(ip, block));
		}

		ctx.blockmap_set(block, BlockTag::Indir);
		self.blocks += 1;
		Ok(WalkRet::Good)
	}

	fn check_data(
		&mut self,
		ctx: &mut FsckCtx,
		ip: &Inode,
		_metablock: u64,
		block: u64,
	) -> Result<WalkRet, FsckError> {
		if !ctx.sdp.check_range(block) {
			return Ok(self.bad_pointer(ip, block));
		}
		if ctx.block_type(block) != BlockTag::Free {
			ctx.add_duplicate_ref(ip.addr, block, DupRefType::AsData, false, true);
			self.blocks += 1;
			return Ok(WalkRet::Good);
		}
		let tag = if self.jdata {
			BlockTag::Jdata
		} else {
			BlockTag::Data
		};
		ctx.blockmap_set(block, tag);
		self.blocks += 1;
		Ok(WalkRet::Good)
	}

	fn check_leaf(
		&mut self,
		ctx: &mut FsckCtx,
		ip: &Inode,
		block: u64,
	) -> Result<WalkRet, FsckError> {
		if !ctx.sdp.check_range(block) {
			return Ok(self.bad_pointer(ip, block));
		}
		if ctx.block_type(block) != BlockTag::Free {
			ctx.add_duplicate_ref(ip.addr, block, DupRefType::AsMeta, false, true);
			self.blocks += 1;
			return Ok(WalkRet::SkipOne);
		}
		ctx.blockmap_set(block, BlockTag::DirLeaf);
		self.blocks += 1;
		Ok(WalkRet::Good)
	}

	fn check_eattr_indir(
		&mut self,
		ctx: &mut FsckCtx,
		ip: &Inode,
		block: u64,
		_parent: u64,
	) -> Result<WalkRet, FsckError> {
		if !ctx.sdp.check_range(block) {
			self.bad_pointer(ip, block);
			return Ok(WalkRet::SkipSubtree);
		}
		if ctx.block_type(block) != BlockTag::Free {
			ctx.add_duplicate_ref(ip.addr, block, DupRefType::AsEa, false, true);
			self.blocks += 1;
			return Ok(WalkRet::SkipSubtree);
		}
		let bh = ctx.sdp.bcache.read(block)?;
		if !check_meta(&bh.borrow().data, METATYPE_IN) {
			log_err!(
				"Inode 0x{:x} has a bad indirect extended attribute block 0x{:x}.",
				ip.addr,
				block
			);
			ctx.blockmap_set(block, BlockTag::InvalidMeta);
			return Ok(WalkRet::SkipSubtree);
		}
		ctx.blockmap_set(block, BlockTag::Indir);
		self.blocks += 1;
		Ok(WalkRet::Good)
	}

	fn check_eattr_leaf(
		&mut self,
		ctx: &mut FsckCtx,
		ip: &Inode,
		block: u64,
		_parent: u64,
	) -> Result<WalkRet, FsckError> {
		if !ctx.sdp.check_range(block) {
			self.bad_pointer(ip, block);
			return Ok(WalkRet::SkipOne);
		}
		if ctx.block_type(block) != BlockTag::Free {
			ctx.add_duplicate_ref(ip.addr, block, DupRefType::AsEa, false, true);
			self.blocks += 1;
			return Ok(WalkRet::SkipOne);
		}
		let bh = ctx.sdp.bcache.read(block)?;
		if !check_meta(&bh.borrow().data, METATYPE_EA) {
			log_err!(
				"Inode 0x{:x} has a bad extended attribute leaf 0x{:x}.",
				ip.addr,
				block
			);
			ctx.blockmap_set(block, BlockTag::InvalidMeta);
			return Ok(WalkRet::SkipOne);
		}
		ctx.blockmap_set(block, BlockTag::Eattr);
		self.blocks += 1;
		Ok(WalkRet::Good)
	}

	fn check_eattr_extentry(
		&mut self,
		ctx: &mut FsckCtx,
		ip: &Inode,
		_index: usize,
		ptr: u64,
		_bh: &crate::buf::BufHandle,
		_entry_off: usize,
		_hdr: &EaHeader,
	) -> Result<WalkRet, FsckError> {
		if ptr == 0 {
			return Ok(WalkRet::SkipOne);
		}
		if !ctx.sdp.check_range(ptr) {
			self.bad_pointer(ip, ptr);
			return Ok(WalkRet::SkipOne);
		}
		if ctx.block_type(ptr) != BlockTag::Free {
			ctx.add_duplicate_ref(ip.addr, ptr, DupRefType::AsEa, false, true);
			self.blocks += 1;
			return Ok(WalkRet::SkipOne);
		}
		ctx.blockmap_set(ptr, BlockTag::Eattr);
		self.blocks += 1;
		Ok(WalkRet::Good)
	}
}

/// Maps an inode mode to its block map tag.
fn inode_tag(mode: u32) -> Option<BlockTag> {
	match mode & 0o170000 {
		0o040000 => Some(BlockTag::DirInode),
		0o100000 => Some(BlockTag::FileInode),
		0o120000 => Some(BlockTag::LnkInode),
		0o060000 => Some(BlockTag::BlkInode),
		0o020000 => Some(BlockTag::ChrInode),
		0o010000 => Some(BlockTag::FifoInode),
		0o140000 => Some(BlockTag::SockInode),
		_ => None,
	}
}

/// Invalidates an inode: its block map entry is cleared and whatever its
/// tree already claimed is freed again (duplicates excepted).
fn invalidate_inode(ctx: &mut FsckCtx, ip: &Inode) -> Result<(), FsckError> {
	ctx.blockmap_set(ip.addr, BlockTag::InvalidInode);
	let mut del = DeleteOps;
	metawalk::check_metatree(ctx, ip, &mut del)?;
	metawalk::check_inode_eattr(ctx, ip, &mut del)?;
	ctx.inodetree.remove(&ip.addr);
	ctx.dirtree.remove(&ip.addr);
	Ok(())
}

/// Checks one dinode found allocated in a resource group bitmap.
fn handle_di(ctx: &mut FsckCtx, block: u64, unlinked: bool) -> Result<(), FsckError> {
	if ctx.block_type(block) != BlockTag::Free {
		// System inodes were walked before the group scan
		if ctx.is_system_inode(block) {
			return Ok(());
		}
		// Another inode already claimed this dinode's own block
		ctx.add_duplicate_ref(block, block, DupRefType::IsInode, false, true);
	}

	let ip = Inode::load(&ctx.sdp, block)?;
	if !check_meta(&ip.bh.borrow().data, METATYPE_DI) {
		log_err!(
			"Block 0x{:x} is marked as a dinode in the bitmap but is no dinode.",
			block
		);
		ctx.blockmap_set(block, BlockTag::Free);
		if ctx.query("Fix the bitmap? ") {
			ctx.check_n_fix_bitmap(block, BlockTag::Free)?;
		}
		return Ok(());
	}

	if ip.di.num.addr != block {
		// The real dinode lives elsewhere; this is a stale copy left by
		// journal replay
		log_err!(
			"Dinode at 0x{:x} claims address 0x{:x}; it appears to be a leftover journal copy.",
			block,
			ip.di.num.addr
		);
		ctx.blockmap_set(block, BlockTag::Free);
		if ctx.query("Free the stale block? ") {
			ctx.check_n_fix_bitmap(block, BlockTag::Free)?;
		}
		return Ok(());
	}

	let Some(tag) = inode_tag(ip.di.mode) else {
		log_err!(
			"Inode 0x{:x} has an invalid mode 0{:o}.",
			block,
			ip.di.mode
		);
		if ctx.query("Clear the invalid inode? ") {
			ctx.blockmap_set(block, BlockTag::InvalidInode);
			ctx.check_n_fix_bitmap(block, BlockTag::Free)?;
		} else {
			ctx.blockmap_set(block, BlockTag::InvalidInode);
		}
		return Ok(());
	};

	if ip.di.num.formal_ino == 0 {
		log_err!("Inode 0x{:x} has no formal inode number.", block);
		if ctx.query("Clear the invalid inode? ") {
			ctx.blockmap_set(block, BlockTag::InvalidInode);
			ctx.check_n_fix_bitmap(block, BlockTag::Free)?;
			return Ok(());
		}
	}

	if unlinked {
		// Open-but-unlinked somewhere in the cluster; its blocks are
		// accounted for but nothing may link to it. The bitmap pass
		// offers to reclaim it.
		ctx.blockmap_set(block, BlockTag::FreeMeta);
		return walk_inode(ctx, &ip, false);
	}
	ctx.blockmap_set(block, tag);

	if ip.di.is_dir() {
		if ip.di.flags & DIF_EXHASH != 0 {
			let table_size = 8u64 << ip.di.depth;
			if ip.di.depth > 16 || ip.di.size < table_size {
				log_err!(
					"Directory 0x{:x} has a corrupt hash table (depth {}, size {}).",
					block,
					ip.di.depth,
					ip.di.size
				);
				if ctx.query("Clear the corrupt directory? ") {
					invalidate_inode(ctx, &ip)?;
					ctx.check_n_fix_bitmap(block, BlockTag::Free)?;
					return Ok(());
				}
			}
		}
		ctx.dirtree_insert(block);
	}
	ctx.set_di_nlink(ip.di.num, ip.di.nlink);
	if ip.di.eattr != 0 {
		ctx.eattr_inodes.push(block);
	}

	walk_inode(ctx, &ip, false)
}

/// Walks an inode's tree and extended attributes with the pass 1 hooks,
/// fixing the block count afterwards.
fn walk_inode(ctx: &mut FsckCtx, ip: &Inode, jdata_file: bool) -> Result<(), FsckError> {
	let mut chk =
		Pass1Checker::new(jdata_file || (ip.di.flags & DIF_JDATA != 0 && !ip.di.is_dir()));

	if metawalk::check_metatree(ctx, ip, &mut chk)? == WalkRet::Error {
		if ctx.query("Inode has too many bad pointers. Clear it? ") {
			invalidate_inode(ctx, ip)?;
			ctx.check_n_fix_bitmap(ip.addr, BlockTag::Free)?;
		}
		return Ok(());
	}
	if metawalk::check_inode_eattr(ctx, ip, &mut chk)? == WalkRet::Error {
		log_err!("Inode 0x{:x} has unwalkable extended attributes.", ip.addr);
	}

	if chk.blocks != ip.di.blocks {
		log_err!(
			"Inode 0x{:x} block count is {}, should be {}.",
			ip.addr,
			ip.di.blocks,
			chk.blocks
		);
		if ctx.query("Fix the block count? ") {
			let mut fixed = Inode::load(&ctx.sdp, ip.addr)?;
			fixed.di.blocks = chk.blocks;
			fixed.save();
		}
	}
	Ok(())
}

/// Walks one system inode, marking its tree. Journals tag their data
/// blocks as journal data.
fn check_system_inode(
	ctx: &mut FsckCtx,
	addr: u64,
	name: &str,
	journal: bool,
) -> Result<(), FsckError> {
	if !ctx.sdp.check_range(addr) {
		log_err!("System inode \"{}\" is out of range.", name);
		return Ok(());
	}
	let ip = Inode::load(&ctx.sdp, addr)?;
	if !check_meta(&ip.bh.borrow().data, METATYPE_DI) {
		log_err!("System inode \"{}\" at 0x{:x} is damaged.", name, addr);
		return Ok(());
	}
	let Some(tag) = inode_tag(ip.di.mode) else {
		log_err!("System inode \"{}\" has an invalid mode.", name);
		return Ok(());
	};

	log_debug!("Checking system inode \"{}\" at 0x{:x}", name, addr);
	ctx.blockmap_set(addr, tag);
	if ip.di.is_dir() {
		ctx.dirtree_insert(addr);
	}
	ctx.set_di_nlink(ip.di.num, ip.di.nlink);
	if ip.di.eattr != 0 {
		ctx.eattr_inodes.push(addr);
	}
	walk_inode(ctx, &ip, journal)
}

/// Runs pass 1.
pub fn pass1(ctx: &mut FsckCtx) -> Result<(), FsckError> {
	ctx.skip_this_pass = false;

	// The system trees come first so their blocks claim priority
	let master = ctx.sdp.sb.master_dir.addr;
	let root = ctx.sdp.sb.root_dir.addr;
	check_system_inode(ctx, master, "master", false)?;
	check_system_inode(ctx, root, "root", false)?;

	let md = [
		(ctx.sdp.md.jiinode, "jindex"),
		(ctx.sdp.md.pinode, "per_node"),
		(ctx.sdp.md.inum, "inum"),
		(ctx.sdp.md.statfs, "statfs"),
		(ctx.sdp.md.riinode, "rindex"),
		(ctx.sdp.md.qinode, "quota"),
	];
	for (addr, name) in md {
		if let Some(addr) = addr {
			check_system_inode(ctx, addr, name, false)?;
		}
	}
	for (j, addr) in ctx.sdp.md.journals.clone().into_iter().enumerate() {
		check_system_inode(ctx, addr, &format!("journal{}", j), true)?;
	}

	// Then every dinode the bitmaps claim, in address order
	let rg_addrs: Vec<u64> = ctx.sdp.rgtree.keys().copied().collect();
	for (n, rg_addr) in rg_addrs.iter().enumerate() {
		log_info!("Checking resource group {}", n);
		let (data0, data) = {
			let rg = ctx.sdp.rgtree.get(rg_addr).unwrap();
			(rg.data0, rg.data)
		};
		for block in data0..data0 + data as u64 {
			if ctx.stop_or_skip()? {
				return Ok(());
			}
			let rg = ctx.sdp.rgtree.get(rg_addr).unwrap();
			let state = crate::rgrp::bitmap_get(&ctx.sdp, rg, block)?;
			match state {
				BLKST_DINODE => handle_di(ctx, block, false)?,
				BLKST_UNLINKED => {
					log_err!(
						"Unlinked inode found at block 0x{:x}.",
						block
					);
					handle_di(ctx, block, true)?;
				}
				_ => {}
			}
		}
	}
	Ok(())
}
