//! The metadata tree walker.
//!
//! Walks a dinode's indirect tree height by height, its directory leaves
//! and its extended attributes, handing every block and entry to a set of
//! per-pass callbacks. The walker owns the traversal and the structural
//! repairs every pass needs (record lengths, sentinel normalization, leaf
//! chains); the callbacks own the semantics.

use crate::blockmap::BlockTag;
use crate::buf::BufHandle;
use crate::fsck::FsckCtx;
use crate::inode::get_leaf_ptr;
use crate::inode::put_leaf_ptr;
use crate::inode::Inode;
use crate::log_debug;
use crate::log_err;
use crate::ondisk::*;
use crate::FsckError;

/// What a callback decided about the object it was handed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WalkRet {
	/// Keep going; descend into the object.
	Good,
	/// Skip this object but keep walking its siblings.
	SkipOne,
	/// Skip this object and everything below it.
	SkipSubtree,
	/// Give up on the whole inode.
	Error,
}

/// The callbacks a pass plugs into the walker. Unimplemented hooks accept
/// everything.
#[allow(unused_variables)]
pub trait WalkOps {
	/// Called for every indirect block pointer at every height.
	///
	/// `is_valid` reports whether the target looks like an indirect block;
	/// `was_duplicate` reports that another inode already claimed it. The
	/// walker descends only into valid, non-duplicate blocks.
	fn check_metalist(
		&mut self,
		ctx: &mut FsckCtx,
		ip: &Inode,
		block: u64,
		height: u16,
		is_valid: &mut bool,
		was_duplicate: &mut bool,
	) -> Result<WalkRet, FsckError> {
		*is_valid = true;
		*was_duplicate = false;
		Ok(WalkRet::Good)
	}

	/// Called for every data block pointer at the leaf height.
	fn check_data(
		&mut self,
		ctx: &mut FsckCtx,
		ip: &Inode,
		metablock: u64,
		block: u64,
	) -> Result<WalkRet, FsckError> {
		Ok(WalkRet::Good)
	}

	/// Called once for every distinct directory leaf block.
	fn check_leaf(
		&mut self,
		ctx: &mut FsckCtx,
		ip: &Inode,
		block: u64,
	) -> Result<WalkRet, FsckError> {
		Ok(WalkRet::Good)
	}

	/// Tells whether the walker should iterate directory entries and hand
	/// them to `check_dentry`.
	fn wants_dentries(&self) -> bool {
		false
	}

	/// Called for every live directory entry. Returns `SkipOne` when the
	/// entry was deleted, `Good` when it survives.
	fn check_dentry(
		&mut self,
		ctx: &mut FsckCtx,
		ip: &Inode,
		dent: &Dirent,
		name: &[u8],
		bh: &BufHandle,
		prev_off: Option<usize>,
		off: usize,
		lindex: u32,
		count: &mut u32,
	) -> Result<WalkRet, FsckError> {
		*count += 1;
		Ok(WalkRet::Good)
	}

	/// Called for the indirect extended attribute block, if any.
	fn check_eattr_indir(
		&mut self,
		ctx: &mut FsckCtx,
		ip: &Inode,
		block: u64,
		parent: u64,
	) -> Result<WalkRet, FsckError> {
		Ok(WalkRet::Good)
	}

	/// Called for every extended attribute leaf block.
	fn check_eattr_leaf(
		&mut self,
		ctx: &mut FsckCtx,
		ip: &Inode,
		block: u64,
		parent: u64,
	) -> Result<WalkRet, FsckError> {
		Ok(WalkRet::Good)
	}

	/// Called for every extended attribute entry in a leaf.
	fn check_eattr_entry(
		&mut self,
		ctx: &mut FsckCtx,
		ip: &Inode,
		bh: &BufHandle,
		off: usize,
		hdr: &EaHeader,
		prev_off: Option<usize>,
	) -> Result<WalkRet, FsckError> {
		Ok(WalkRet::Good)
	}

	/// Called for every auxiliary data block pointer of a large attribute
	/// value. `entry_off` locates the owning entry header in the leaf.
	fn check_eattr_extentry(
		&mut self,
		ctx: &mut FsckCtx,
		ip: &Inode,
		index: usize,
		ptr: u64,
		bh: &BufHandle,
		entry_off: usize,
		hdr: &EaHeader,
	) -> Result<WalkRet, FsckError> {
		Ok(WalkRet::Good)
	}

	/// Called after the indirect extended attribute walk with the number
	/// of leaf pointers seen and the number that failed.
	fn finish_eattr_indir(
		&mut self,
		ctx: &mut FsckCtx,
		ip: &Inode,
		leaf_pointers: usize,
		leaf_errors: usize,
	) -> Result<(), FsckError> {
		Ok(())
	}
}

/// Reads the nonzero pointers of a metadata block, starting after its
/// header.
fn collect_pointers(bh: &BufHandle, head_size: usize) -> Vec<u64> {
	let buf = bh.borrow();
	let mut ptrs = Vec::new();
	let mut off = head_size;
	while off + 8 <= buf.data.len() {
		let ptr = get_u64(&buf.data, off);
		if ptr != 0 {
			ptrs.push(ptr);
		}
		off += 8;
	}
	ptrs
}

/// Walks a dinode's data tree: every indirect pointer, then every data
/// pointer, then (for extendible-hash directories) the leaf blocks.
pub fn check_metatree(
	ctx: &mut FsckCtx,
	ip: &Inode,
	ops: &mut dyn WalkOps,
) -> Result<WalkRet, FsckError> {
	let height = ip.di.height as usize;

	if height > 0 {
		// One working list of live buffers per height, dinode at the top
		let mut metalist: Vec<Vec<BufHandle>> = vec![Vec::new(); height];
		metalist[0].push(ip.bh.clone());

		for h in 1..height {
			let prev: Vec<BufHandle> = metalist[h - 1].clone();
			for bh in prev {
				let head_size = if h == 1 { SIZEOF_DINODE } else { SIZEOF_MH };
				for ptr in collect_pointers(&bh, head_size) {
					let mut is_valid = true;
					let mut was_duplicate = false;
					match ops.check_metalist(
						ctx,
						ip,
						ptr,
						h as u16,
						&mut is_valid,
						&mut was_duplicate,
					)? {
						WalkRet::Error => return Ok(WalkRet::Error),
						WalkRet::SkipOne | WalkRet::SkipSubtree => continue,
						WalkRet::Good => {}
					}
					if !is_valid || was_duplicate {
						continue;
					}
					let nbh = ctx.sdp.bcache.read(ptr)?;
					metalist[h].push(nbh);
				}
			}
		}

		// The lowest level of indirect buffers points at data
		let head_size = if height == 1 { SIZEOF_DINODE } else { SIZEOF_MH };
		let leaves: Vec<BufHandle> = metalist[height - 1].clone();
		for bh in leaves {
			let metablock = bh.borrow().addr;
			for ptr in collect_pointers(&bh, head_size) {
				match ops.check_data(ctx, ip, metablock, ptr)? {
					WalkRet::Error => return Ok(WalkRet::Error),
					_ => continue,
				}
			}
		}
	}

	if ip.di.is_dir() && ip.di.flags & DIF_EXHASH != 0 {
		match check_leaf_blks(ctx, ip, ops)? {
			WalkRet::Error => return Ok(WalkRet::Error),
			_ => {}
		}
	} else if ip.di.is_dir() && ops.wants_dentries() {
		check_linear_dir(ctx, ip, ops)?;
	}

	Ok(WalkRet::Good)
}

/// Walks a directory through the pass's dentry hooks. Used by the passes
/// that only care about directory content.
pub fn check_dir(
	ctx: &mut FsckCtx,
	dinode: u64,
	ops: &mut dyn WalkOps,
) -> Result<WalkRet, FsckError> {
	let ip = Inode::load(&ctx.sdp, dinode)?;

	if ip.di.flags & DIF_EXHASH != 0 {
		check_leaf_blks(ctx, &ip, ops)
	} else {
		check_linear_dir(ctx, &ip, ops)
	}
}

/// Iterates the entries stored in the dinode block of a linear directory.
pub fn check_linear_dir(
	ctx: &mut FsckCtx,
	ip: &Inode,
	ops: &mut dyn WalkOps,
) -> Result<WalkRet, FsckError> {
	let mut count = 0;
	check_entries(ctx, ip, &ip.bh.clone(), false, 0, &mut count, ops)
}

/// Iterates the hash table of an extendible-hash directory, visiting each
/// distinct leaf and its chain.
pub fn check_leaf_blks(
	ctx: &mut FsckCtx,
	ip: &Inode,
	ops: &mut dyn WalkOps,
) -> Result<WalkRet, FsckError> {
	let slots: u32 = 1 << ip.di.depth;
	let mut old_leaf: u64 = 0;
	let mut bad_leaf: u64 = u64::MAX;
	let mut ref_count: u32 = 0;
	let mut exp_count: u32 = 0;

	for lindex in 0..slots {
		let leaf_no = get_leaf_ptr(&ctx.sdp, ip, lindex)?;

		// Consecutive slots may share one leaf; count them instead of
		// revisiting
		if leaf_no == bad_leaf {
			put_leaf_ptr(&ctx.sdp, ip, lindex, old_leaf)?;
			ref_count += 1;
			continue;
		}
		if leaf_no == old_leaf && old_leaf != 0 {
			ref_count += 1;
			continue;
		}

		// A leaf covers 2^(dir depth - leaf depth) slots; fix the leaf
		// depth when the reference count disagrees
		if old_leaf != 0 && ref_count != exp_count && exp_count != 0 {
			log_err!(
				"Directory 0x{:x} has {} pointers to leaf 0x{:x}, expected {}",
				ip.addr,
				ref_count,
				old_leaf,
				exp_count
			);
			if ctx.query("Fix the leaf depth? ") {
				let mut factor = 0;
				let mut divisor = ref_count;
				while divisor > 1 {
					factor += 1;
					divisor /= 2;
				}
				let bh = ctx.sdp.bcache.read(old_leaf)?;
				let mut buf = bh.borrow_mut();
				let mut leaf = Leaf::read(&buf.data);
				leaf.depth = ip.di.depth - factor;
				leaf.write(&mut buf.data);
				buf.modify();
			}
		}
		ref_count = 1;
		exp_count = 0;

		// Walk the leaf and its chain
		let slot_leaf = leaf_no;
		let mut cur = leaf_no;
		let mut patched = false;
		let mut chained = 0u32;
		loop {
			if !ctx.sdp.check_range(cur) {
				log_err!(
					"Directory 0x{:x} points to leaf 0x{:x} that is out of range",
					ip.addr,
					cur
				);
				warn_and_patch(ctx, ip, &mut cur, &mut bad_leaf, old_leaf, lindex)?;
				patched = true;
				break;
			}
			let bh = ctx.sdp.bcache.read(cur)?;
			if !check_meta(&bh.borrow().data, METATYPE_LF) {
				if chained == 0 {
					log_err!(
						"Directory 0x{:x} points to leaf 0x{:x} that is not really a leaf",
						ip.addr,
						cur
					);
					warn_and_patch(ctx, ip, &mut cur, &mut bad_leaf, old_leaf, lindex)?;
					patched = true;
				} else {
					// A chain that wanders off into garbage is cut; the
					// orphaned tail becomes lost blocks for later passes
					log_err!(
						"Leaf chain of directory 0x{:x} ends in a bad block 0x{:x}",
						ip.addr,
						cur
					);
				}
				break;
			}

			let mut leaf = Leaf::read(&bh.borrow().data);

			// An early format bug left a shifted dirent format; repair it
			// quietly
			if leaf.dirent_format == FORMAT_DE << 16 {
				log_debug!("Fixing dirent format at leaf 0x{:x}", cur);
				leaf.dirent_format = FORMAT_DE;
				let mut buf = bh.borrow_mut();
				leaf.write(&mut buf.data);
				buf.modify();
			}

			if chained == 0 {
				exp_count = 1 << (ip.di.depth.saturating_sub(leaf.depth));
			}

			match ops.check_leaf(ctx, ip, cur)? {
				WalkRet::Error => return Ok(WalkRet::Error),
				WalkRet::SkipOne | WalkRet::SkipSubtree => break,
				WalkRet::Good => {}
			}

			if ops.wants_dentries() {
				let mut count = 0;
				match check_entries(ctx, ip, &bh, true, lindex, &mut count, ops)? {
					WalkRet::Error => return Ok(WalkRet::Error),
					_ => {}
				}

				// The leaf may have been rewritten under us
				let leaf_now = Leaf::read(&bh.borrow().data);
				if count != leaf_now.entries as u32 {
					log_err!(
						"Leaf 0x{:x} of directory 0x{:x} claims {} entries, found {}",
						cur,
						ip.addr,
						leaf_now.entries,
						count
					);
					if ctx.query("Update the leaf entry count? ") {
						let mut buf = bh.borrow_mut();
						let mut fixed = leaf_now;
						fixed.entries = count as u16;
						fixed.write(&mut buf.data);
						buf.modify();
					}
				}
			}

			if leaf.next == 0 {
				break;
			}
			if leaf.next == cur {
				// A self-loop would walk forever
				log_err!(
					"Leaf 0x{:x} of directory 0x{:x} chains to itself",
					cur,
					ip.addr
				);
				if ctx.query("Truncate the leaf chain? ") {
					let mut buf = bh.borrow_mut();
					leaf.next = 0;
					leaf.write(&mut buf.data);
					buf.modify();
				}
				break;
			}
			log_debug!("Leaf chain detected in directory 0x{:x}", ip.addr);
			cur = leaf.next;
			chained += 1;
		}

		if !patched {
			old_leaf = slot_leaf;
		}
	}
	Ok(WalkRet::Good)
}

/// Points a broken hash table slot back at the previous leaf. Asked once
/// per bad leaf; repeats of the same bad pointer are patched silently.
fn warn_and_patch(
	ctx: &mut FsckCtx,
	ip: &Inode,
	leaf_no: &mut u64,
	bad_leaf: &mut u64,
	old_leaf: u64,
	lindex: u32,
) -> Result<(), FsckError> {
	if *leaf_no == *bad_leaf || ctx.query("Attempt to patch around it? ") {
		put_leaf_ptr(&ctx.sdp, ip, lindex, old_leaf)?;
	} else {
		log_err!("Bad leaf left in place.");
	}
	*bad_leaf = *leaf_no;
	*leaf_no = old_leaf;
	Ok(())
}

/// Iterates the directory entries tiling one block.
///
/// `is_leaf` selects the header size (leaf block or dinode block). Record
/// corruption is repaired here; the semantic checks live in the pass's
/// `check_dentry`.
pub fn check_entries(
	ctx: &mut FsckCtx,
	ip: &Inode,
	bh: &BufHandle,
	is_leaf: bool,
	lindex: u32,
	count: &mut u32,
	ops: &mut dyn WalkOps,
) -> Result<WalkRet, FsckError> {
	let bsize = ctx.sdp.bcache.bsize() as usize;
	let start = if is_leaf { SIZEOF_LEAF } else { SIZEOF_DINODE };

	let mut off = start;
	let mut prev: Option<usize> = None;
	let mut first = true;

	loop {
		if off + SIZEOF_DIRENT > bsize {
			break;
		}
		let mut de = {
			let buf = bh.borrow();
			Dirent::read(&buf.data, off)
		};

		let bad_rec = (de.rec_len as usize) < dirent_size(de.name_len as usize)
			|| de.rec_len as usize % 8 != 0
			|| off + de.rec_len as usize > bsize
			|| (!de.is_sentinel() && de.name_len == 0);
		if bad_rec {
			log_err!(
				"Entry {} in directory 0x{:x} (block 0x{:x}) is corrupt.",
				*count + 1,
				ip.addr,
				bh.borrow().addr
			);
			if ctx.query("Attempt to repair it? ") {
				if dirent_repair(ctx, bh, &mut de, off, first, is_leaf)? {
					break;
				}
			} else {
				log_err!(
					"Corrupt directory entry ignored, stopped after {} entries.",
					*count
				);
				break;
			}
		}

		if de.is_sentinel() {
			if first {
				if de.inum.addr != 0 {
					// Half-zeroed sentinel; normalize it quietly
					let mut buf = bh.borrow_mut();
					de.inum.addr = 0;
					de.write(&mut buf.data, off);
					buf.modify();
				}
				log_debug!("First dirent is a sentinel (place holder).");
			} else {
				log_err!(
					"Directory entry with inode number of zero in directory 0x{:x}",
					ip.addr
				);
				return Ok(WalkRet::Good);
			}
		} else if first && de.inum.addr == 0 {
			// The sentinel's halves were swapped on disk; swap them back
			log_debug!("First dirent is a reversed sentinel (place holder).");
			let mut buf = bh.borrow_mut();
			de.inum.addr = de.inum.formal_ino;
			de.inum.formal_ino = 0;
			de.write(&mut buf.data, off);
			buf.modify();
		} else {
			let name: Vec<u8> = {
				let buf = bh.borrow();
				let name_end = (off + SIZEOF_DIRENT + de.name_len as usize).min(bsize);
				buf.data[off + SIZEOF_DIRENT..name_end].to_vec()
			};
			let r = ops.check_dentry(ctx, ip, &de, &name, bh, prev, off, lindex, count)?;
			match r {
				WalkRet::Error => return Ok(WalkRet::Error),
				WalkRet::SkipOne => {
					// Entry deleted; the previous record absorbed it
					let next = off + de.rec_len as usize;
					if next >= bsize {
						break;
					}
					if first {
						prev = Some(off);
					}
					first = false;
					off = next;
					continue;
				}
				_ => {}
			}
		}

		let next = off + de.rec_len as usize;
		if next >= bsize {
			log_debug!("Last entry processed.");
			break;
		}
		prev = Some(off);
		first = false;
		off = next;
	}
	Ok(WalkRet::Good)
}

/// Rebuilds a corrupt dirent record in place: the probable name length is
/// measured from the bytes on disk and the record length recomputed.
///
/// Returns true when nothing could be salvaged and the block walk must
/// stop.
fn dirent_repair(
	ctx: &mut FsckCtx,
	bh: &BufHandle,
	de: &mut Dirent,
	off: usize,
	first: bool,
	is_leaf: bool,
) -> Result<bool, FsckError> {
	let bsize = ctx.sdp.bcache.bsize() as usize;

	if first && de.is_sentinel() {
		// A sentinel spans the whole block tail
		let head = if is_leaf { SIZEOF_LEAF } else { SIZEOF_DINODE };
		de.rec_len = (bsize - head) as u16;
	} else {
		let calc_len = {
			let buf = bh.borrow();
			let mut p = off + SIZEOF_DIRENT;
			let mut n = 0;
			while p < bsize && buf.data[p] != 0 && n < 255 {
				n += 1;
				p += 1;
			}
			n
		};
		if calc_len == 0 {
			return Ok(true);
		}
		// Noise often follows the name; trust the shorter length
		if de.name_len == 0 || (calc_len as u8) < de.name_len {
			de.name_len = calc_len as u8;
		}
		de.rec_len = dirent_size(de.name_len as usize) as u16;
	}
	let mut buf = bh.borrow_mut();
	de.write(&mut buf.data, off);
	buf.modify();
	Ok(false)
}

/// Removes a directory entry from its block: the previous record absorbs
/// its space, or, for the first record, the entry degrades to a sentinel.
pub fn dirent_del(bh: &BufHandle, prev_off: Option<usize>, off: usize) {
	let mut buf = bh.borrow_mut();
	let cur = Dirent::read(&buf.data, off);

	match prev_off {
		Some(p) => {
			let mut prev = Dirent::read(&buf.data, p);
			prev.rec_len += cur.rec_len;
			prev.write(&mut buf.data, p);
		}
		None => {
			let mut sent = cur;
			sent.inum = Inum::default();
			sent.hash = 0;
			sent.name_len = 0;
			sent.de_type = 0;
			sent.write(&mut buf.data, off);
		}
	}
	buf.modify();
}

/// Walks an inode's extended attributes through the pass's hooks.
pub fn check_inode_eattr(
	ctx: &mut FsckCtx,
	ip: &Inode,
	ops: &mut dyn WalkOps,
) -> Result<WalkRet, FsckError> {
	if ip.di.eattr == 0 {
		return Ok(WalkRet::Good);
	}
	log_debug!("Extended attributes exist for inode 0x{:x}.", ip.addr);

	if ip.di.flags & DIF_EA_INDIRECT != 0 {
		check_indirect_eattr(ctx, ip, ip.di.eattr, ops)
	} else {
		check_leaf_eattr(ctx, ip, ip.di.eattr, ip.addr, ops)
	}
}

/// Walks one extended attribute leaf block.
fn check_leaf_eattr(
	ctx: &mut FsckCtx,
	ip: &Inode,
	block: u64,
	parent: u64,
	ops: &mut dyn WalkOps,
) -> Result<WalkRet, FsckError> {
	log_debug!("Checking EA leaf block 0x{:x}.", block);

	match ops.check_eattr_leaf(ctx, ip, block, parent)? {
		WalkRet::Good => {}
		other => return Ok(other),
	}
	let bh = ctx.sdp.bcache.read(block)?;
	check_eattr_entries(ctx, ip, &bh, ops)
}

/// Iterates the attribute entries tiling a leaf block.
fn check_eattr_entries(
	ctx: &mut FsckCtx,
	ip: &Inode,
	bh: &BufHandle,
	ops: &mut dyn WalkOps,
) -> Result<WalkRet, FsckError> {
	let bsize = ctx.sdp.bcache.bsize() as usize;
	let mut off = SIZEOF_MH;
	let mut prev: Option<usize> = None;

	loop {
		if off + SIZEOF_EA_HEADER > bsize {
			break;
		}
		let hdr = {
			let buf = bh.borrow();
			EaHeader::read(&buf.data, off)
		};

		match ops.check_eattr_entry(ctx, ip, bh, off, &hdr, prev)? {
			WalkRet::Error => return Ok(WalkRet::Error),
			WalkRet::Good if hdr.num_ptrs > 0 => {
				let ptr_base = off + hdr.ptrs_offset();
				for i in 0..hdr.num_ptrs as usize {
					let p_off = ptr_base + i * 8;
					if p_off + 8 > bsize {
						break;
					}
					let ptr = {
						let buf = bh.borrow();
						get_u64(&buf.data, p_off)
					};
					match ops.check_eattr_extentry(ctx, ip, i, ptr, bh, off, &hdr)? {
						WalkRet::Error => return Ok(WalkRet::Error),
						_ => {}
					}
				}
			}
			_ => {}
		}

		if hdr.is_last() || hdr.rec_len == 0 {
			break;
		}
		let next = off + hdr.rec_len as usize;
		if next >= bsize {
			break;
		}
		prev = Some(off);
		off = next;
	}
	Ok(WalkRet::Good)
}

/// Walks the indirect extended attribute block and its leaf pointers.
fn check_indirect_eattr(
	ctx: &mut FsckCtx,
	ip: &Inode,
	indirect: u64,
	ops: &mut dyn WalkOps,
) -> Result<WalkRet, FsckError> {
	log_debug!("Checking EA indirect block 0x{:x}.", indirect);

	match ops.check_eattr_indir(ctx, ip, indirect, ip.addr)? {
		WalkRet::Good => {}
		other => return Ok(other),
	}

	let bh = ctx.sdp.bcache.read(indirect)?;
	let ptrs: Vec<u64> = {
		let buf = bh.borrow();
		let mut v = Vec::new();
		let mut off = SIZEOF_MH;
		while off + 8 <= buf.data.len() {
			let p = get_u64(&buf.data, off);
			if p == 0 {
				break;
			}
			v.push(p);
			off += 8;
		}
		v
	};

	let mut errors = 0;
	for ptr in &ptrs {
		match check_leaf_eattr(ctx, ip, *ptr, indirect, ops)? {
			WalkRet::Good => {}
			_ => errors += 1,
		}
	}
	ops.finish_eattr_indir(ctx, ip, ptrs.len(), errors)?;
	Ok(WalkRet::Good)
}

/// Frees a block unless other inodes still claim it, in which case only
/// this inode's claim is withdrawn.
///
/// Returns true when the block was actually freed.
pub fn delete_block_if_notdup(
	ctx: &mut FsckCtx,
	ip_addr: u64,
	block: u64,
	btype: &str,
) -> Result<bool, FsckError> {
	if !ctx.sdp.check_range(block) {
		return Ok(false);
	}

	if let Some(dt) = ctx.dup_blocks.get_mut(&block) {
		// Withdraw this inode's references and leave the block alone
		for list in [&mut dt.ref_inode_list, &mut dt.ref_invinode_list] {
			if let Some(pos) = list.iter().position(|id| id.block_no == ip_addr) {
				let id = list.remove(pos);
				dt.refs = dt.refs.saturating_sub(id.dup_count);
			}
		}
		log_debug!(
			"Not freeing duplicate-referenced {} block 0x{:x}",
			btype,
			block
		);
		return Ok(false);
	}

	ctx.blockmap_set(block, BlockTag::Free);
	ctx.check_n_fix_bitmap(block, BlockTag::Free)?;
	log_debug!("Freed {} block 0x{:x}", btype, block);
	Ok(true)
}

/// The walk hooks that dismantle an inode's tree, used when a corrupt
/// inode is deleted. Blocks still claimed elsewhere survive.
pub struct DeleteOps;

impl WalkOps for DeleteOps {
	fn check_metalist(
		&mut self,
		ctx: &mut FsckCtx,
		ip: &Inode,
		block: u64,
		_height: u16,
		is_valid: &mut bool,
		was_duplicate: &mut bool,
	) -> Result<WalkRet, FsckError> {
		*was_duplicate = ctx.dup_blocks.contains_key(&block);
		*is_valid = ctx.sdp.check_range(block)
			&& check_meta(&ctx.sdp.bcache.read(block)?.borrow().data, METATYPE_IN);
		delete_block_if_notdup(ctx, ip.addr, block, "metadata")?;
		if !*is_valid || *was_duplicate {
			return Ok(WalkRet::SkipSubtree);
		}
		Ok(WalkRet::Good)
	}

	fn check_data(
		&mut self,
		ctx: &mut FsckCtx,
		ip: &Inode,
		_metablock: u64,
		block: u64,
	) -> Result<WalkRet, FsckError> {
		delete_block_if_notdup(ctx, ip.addr, block, "data")?;
		Ok(WalkRet::Good)
	}

	fn check_leaf(
		&mut self,
		ctx: &mut FsckCtx,
		ip: &Inode,
		block: u64,
	) -> Result<WalkRet, FsckError> {
		delete_block_if_notdup(ctx, ip.addr, block, "leaf")?;
		Ok(WalkRet::Good)
	}

	fn check_eattr_indir(
		&mut self,
		ctx: &mut FsckCtx,
		ip: &Inode,
		block: u64,
		_parent: u64,
	) -> Result<WalkRet, FsckError> {
		delete_block_if_notdup(ctx, ip.addr, block, "EA indirect")?;
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
			return Ok(WalkRet::SkipOne);
		}
		delete_block_if_notdup(ctx, ip.addr, block, "EA leaf")?;
		Ok(WalkRet::Good)
	}

	fn check_eattr_extentry(
		&mut self,
		ctx: &mut FsckCtx,
		ip: &Inode,
		_index: usize,
		ptr: u64,
		_bh: &BufHandle,
		_entry_off: usize,
		_hdr: &EaHeader,
	) -> Result<WalkRet, FsckError> {
		delete_block_if_notdup(ctx, ip.addr, ptr, "EA data")?;
		Ok(WalkRet::Good)
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn dirent_del_merges_into_prev() {
		use std::cell::RefCell;
		use std::rc::Rc;

		let mut data = vec![0u8; 512];
		let first = Dirent {
			inum: Inum {
				formal_ino: 1,
				addr: 100,
			},
			hash: 0,
			rec_len: 32,
			name_len: 1,
			de_type: DT_REG,
		};
		first.write(&mut data, 0);
		let second = Dirent {
			inum: Inum {
				formal_ino: 2,
				addr: 101,
			},
			hash: 0,
			rec_len: 480,
			name_len: 1,
			de_type: DT_REG,
		};
		second.write(&mut data, 32);

		let bh = Rc::new(RefCell::new(crate::buf::Buf {
			addr: 0,
			data,
			modified: false,
		}));
		dirent_del(&bh, Some(0), 32);

		let buf = bh.borrow();
		let merged = Dirent::read(&buf.data, 0);
		assert_eq!(merged.rec_len, 512);
		assert!(buf.modified);
	}

	#[test]
	fn dirent_del_first_becomes_sentinel() {
		use std::cell::RefCell;
		use std::rc::Rc;

		let mut data = vec![0u8; 128];
		let first = Dirent {
			inum: Inum {
				formal_ino: 9,
				addr: 900,
			},
			hash: 77,
			rec_len: 128,
			name_len: 3,
			de_type: DT_DIR,
		};
		first.write(&mut data, 0);

		let bh = Rc::new(RefCell::new(crate::buf::Buf {
			addr: 0,
			data,
			modified: false,
		}));
		dirent_del(&bh, None, 0);

		let buf = bh.borrow();
		let sent = Dirent::read(&buf.data, 0);
		assert!(sent.is_sentinel());
		assert_eq!(sent.inum.addr, 0);
		assert_eq!(sent.rec_len, 128);
	}
}
