//! Pass 1b: resolve blocks claimed by more than one inode.
//!
//! Pass 1 only discovers the *second* and later references to a block;
//! this pass re-scans the inodes to find the original claimant of every
//! duplicated block, then eliminates claimants until at most one remains.

use crate::blockmap::BlockTag;
use crate::buf::BufHandle;
use crate::fsck::DupRefType;
use crate::fsck::FsckCtx;
use crate::inode::Inode;
use crate::log_debug;
use crate::log_err;
use crate::log_info;
use crate::log_notice;
use crate::metawalk;
use crate::metawalk::DeleteOps;
use crate::metawalk::WalkOps;
use crate::metawalk::WalkRet;
use crate::ondisk::*;
use crate::FsckError;
use std::collections::HashSet;

/// Walk hooks recording every reference an inode makes, looking for the
/// original claimants of known duplicates.
struct FindRefs {
	valid: bool,
}

impl WalkOps for FindRefs {
	fn check_metalist(
		&mut self,
		ctx: &mut FsckCtx,
		ip: &Inode,
		block: u64,
		_height: u16,
		is_valid: &mut bool,
		was_duplicate: &mut bool,
	) -> Result<WalkRet, FsckError> {
		*was_duplicate = false;
		*is_valid = ctx.sdp.check_range(block)
			&& check_meta(&ctx.sdp.bcache.read(block)?.borrow().data, METATYPE_IN);
		ctx.add_duplicate_ref(ip.addr, block, DupRefType::AsMeta, true, self.valid);
		Ok(WalkRet::Good)
	}

	fn check_data(
		&mut self,
		ctx: &mut FsckCtx,
		ip: &Inode,
		_metablock: u64,
		block: u64,
	) -> Result<WalkRet, FsckError> {
		ctx.add_duplicate_ref(ip.addr, block, DupRefType::AsData, true, self.valid);
		Ok(WalkRet::Good)
	}

	fn check_leaf(
		&mut self,
		ctx: &mut FsckCtx,
		ip: &Inode,
		block: u64,
	) -> Result<WalkRet, FsckError> {
		ctx.add_duplicate_ref(ip.addr, block, DupRefType::AsMeta, true, self.valid);
		Ok(WalkRet::Good)
	}

	fn check_eattr_indir(
		&mut self,
		ctx: &mut FsckCtx,
		ip: &Inode,
		block: u64,
		_parent: u64,
	) -> Result<WalkRet, FsckError> {
		ctx.add_duplicate_ref(ip.addr, block, DupRefType::AsEa, true, self.valid);
		if !ctx.sdp.check_range(block) {
			return Ok(WalkRet::SkipSubtree);
		}
		Ok(WalkRet::Good)
	}

	fn check_eattr_leaf(
		&mut self,
		ctx: &mut FsckCtx,
		ip: &Inode,
		block: u64,
		_parent: u64,
	) -> Result<WalkRet, FsckError> {
		ctx.add_duplicate_ref(ip.addr, block, DupRefType::AsEa, true, self.valid);
		if !ctx.sdp.check_range(block) {
			return Ok(WalkRet::SkipOne);
		}
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
		if ptr != 0 {
			ctx.add_duplicate_ref(ip.addr, ptr, DupRefType::AsEa, true, self.valid);
		}
		Ok(WalkRet::Good)
	}
}

/// Re-walks one inode looking for references to known duplicates.
fn find_block_ref(ctx: &mut FsckCtx, inode: u64) -> Result<(), FsckError> {
	let ip = Inode::load(&ctx.sdp, inode)?;
	if !check_meta(&ip.bh.borrow().data, METATYPE_DI) {
		log_debug!("Block 0x{:x} is not a dinode.", inode);
		return Ok(());
	}
	let valid = ctx.block_type(inode) != BlockTag::InvalidInode;

	// The inode's own block may be the duplicate
	ctx.add_duplicate_ref(inode, inode, DupRefType::IsInode, true, valid);

	let mut refs = FindRefs { valid };
	metawalk::check_metatree(ctx, &ip, &mut refs)?;
	metawalk::check_inode_eattr(ctx, &ip, &mut refs)?;
	Ok(())
}

/// Classifies what kind of reference the duplicated block deserves, from
/// its content on disk.
fn acceptable_ref_type(ctx: &FsckCtx, block: u64) -> Result<DupRefType, FsckError> {
	let bh = ctx.sdp.bcache.read(block)?;
	let mh = MetaHeader::read(&bh.borrow().data);

	if mh.magic != FS_MAGIC {
		return Ok(DupRefType::AsData);
	}
	Ok(match mh.mh_type {
		METATYPE_DI => DupRefType::IsInode,
		METATYPE_EA | METATYPE_ED => DupRefType::AsEa,
		t if t <= METATYPE_QC => DupRefType::AsMeta,
		_ => DupRefType::AsData,
	})
}

/// Counts the claimants of a duplicated block: (inodes, references).
fn dup_counts(ctx: &FsckCtx, block: u64) -> (usize, u32) {
	match ctx.dup_blocks.get(&block) {
		Some(dt) => {
			let inodes = dt.ref_inode_list.len() + dt.ref_invinode_list.len();
			let refs: u32 = dt
				.ref_inode_list
				.iter()
				.chain(dt.ref_invinode_list.iter())
				.map(|id| id.dup_count)
				.sum();
			(inodes, refs)
		}
		None => (0, 0),
	}
}

/// Deletes one claimant inode: its extended attributes and tree are
/// dismantled (duplicates withdrawn, sole-owned blocks freed) and the
/// inode block invalidated.
fn delete_claimant(ctx: &mut FsckCtx, id_addr: u64, ea_only: bool) -> Result<(), FsckError> {
	let q = ctx.block_type(id_addr);
	if q == BlockTag::Free {
		log_notice!("Inode 0x{:x} was previously deleted.", id_addr);
		return Ok(());
	}
	log_notice!("Deleting inode 0x{:x}.", id_addr);

	let ip = Inode::load(&ctx.sdp, id_addr)?;
	let mut del = DeleteOps;
	metawalk::check_inode_eattr(ctx, &ip, &mut del)?;

	if ea_only {
		// Only the attribute references were wrong; the dinode survives
		// without them
		let mut fixed = Inode::load(&ctx.sdp, id_addr)?;
		fixed.di.eattr = 0;
		fixed.di.flags &= !DIF_EA_INDIRECT;
		fixed.save();
		return Ok(());
	}

	ctx.inodetree.remove(&id_addr);
	ctx.dirtree.remove(&id_addr);
	metawalk::check_metatree(ctx, &ip, &mut del)?;
	ctx.blockmap_set(id_addr, BlockTag::InvalidInode);
	ctx.check_n_fix_bitmap(id_addr, BlockTag::Free)?;
	Ok(())
}

/// Walks one claimant list, deleting claimants until at most one
/// reference to the block remains.
///
/// `acceptable` protects the first claimant referencing the block as the
/// kind its content suggests; system inodes are always protected.
fn resolve_dup_references(
	ctx: &mut FsckCtx,
	block: u64,
	invalid_list: bool,
	acceptable: Option<DupRefType>,
) -> Result<(), FsckError> {
	let mut found_good = false;
	let mut processed: HashSet<u64> = HashSet::new();

	loop {
		if ctx.stop_or_skip()? {
			return Ok(());
		}
		let (inodes, _refs) = dup_counts(ctx, block);
		if inodes <= 1 {
			return Ok(());
		}

		let Some(dt) = ctx.dup_blocks.get(&block) else {
			return Ok(());
		};
		let list = if invalid_list {
			&dt.ref_invinode_list
		} else {
			&dt.ref_inode_list
		};
		let Some(id) = list
			.iter()
			.find(|id| !processed.contains(&id.block_no))
			.cloned()
		else {
			return Ok(());
		};
		processed.insert(id.block_no);
		let this_ref = id.ref_type();

		if let Some(acc) = acceptable {
			if this_ref == acc
				&& !found_good
				&& ctx.block_type(id.block_no).is_inode()
			{
				log_notice!(
					"Inode 0x{:x}'s reference to block 0x{:x} as {} is acceptable.",
					id.block_no,
					block,
					this_ref.name()
				);
				found_good = true;
				continue;
			}
		}
		// References from system inodes (journal content, index files)
		// outrank user dinodes
		if !found_good && ctx.is_system_inode(id.block_no) {
			found_good = true;
			continue;
		}

		log_err!(
			"Inode 0x{:x} references block 0x{:x} as '{}'{}.",
			id.block_no,
			block,
			this_ref.name(),
			match acceptable {
				Some(acc) if acc != this_ref =>
					format!(", but the block is really {}", acc.name()),
				_ => String::new(),
			}
		);
		if !ctx.query(&format!(
			"Okay to delete {}inode 0x{:x}? ",
			if invalid_list { "invalidated " } else { "" },
			id.block_no
		)) {
			log_err!("The bad inode was not cleared.");
			// Withdraw the claim from the list so resolution terminates,
			// but leave the inode alone
			if let Some(dt) = ctx.dup_blocks.get_mut(&block) {
				let list = if invalid_list {
					&mut dt.ref_invinode_list
				} else {
					&mut dt.ref_inode_list
				};
				list.retain(|i| i.block_no != id.block_no);
			}
			continue;
		}

		let ea_only = !invalid_list
			&& id.reftypecount[DupRefType::AsData as usize] == 0
			&& id.reftypecount[DupRefType::AsMeta as usize] == 0
			&& id.reftypecount[DupRefType::IsInode as usize] == 0;
		delete_claimant(ctx, id.block_no, ea_only)?;

		// Whatever claim the walk did not withdraw goes now
		if let Some(dt) = ctx.dup_blocks.get_mut(&block) {
			for list in [&mut dt.ref_inode_list, &mut dt.ref_invinode_list] {
				if let Some(pos) =
					list.iter().position(|i| i.block_no == id.block_no)
				{
					let removed = list.remove(pos);
					dt.refs = dt.refs.saturating_sub(removed.dup_count);
				}
			}
		}
	}
}

/// Resolves one duplicated block.
fn handle_dup_blk(ctx: &mut FsckCtx, block: u64) -> Result<(), FsckError> {
	let (inodes, refs) = dup_counts(ctx, block);
	log_notice!(
		"Block 0x{:x} has {} inodes referencing it, {} references in total:",
		block,
		inodes,
		refs
	);
	if let Some(dt) = ctx.dup_blocks.get(&block) {
		for id in &dt.ref_invinode_list {
			log_notice!(
				"  invalid inode 0x{:x}: {} reference(s) as {}",
				id.block_no,
				id.dup_count,
				id.ref_type().name()
			);
		}
		for id in &dt.ref_inode_list {
			log_notice!(
				"  inode 0x{:x}: {} reference(s) as {}",
				id.block_no,
				id.dup_count,
				id.ref_type().name()
			);
		}
	}

	let acceptable = acceptable_ref_type(ctx, block)?;

	// Step 1: references from inodes that were already invalidated
	resolve_dup_references(ctx, block, true, None)?;
	// Step 2: references of the wrong kind
	resolve_dup_references(ctx, block, false, Some(acceptable))?;
	// Step 3: more than one acceptable reference; keep the last claimant
	resolve_dup_references(ctx, block, false, None)?;

	let Some(dt) = ctx.dup_blocks.remove(&block) else {
		return Ok(());
	};
	let remaining = dt.ref_inode_list.len() + dt.ref_invinode_list.len();

	if remaining == 1 && dt.ref_inode_list.len() == 1 {
		let id = &dt.ref_inode_list[0];
		log_notice!(
			"Block 0x{:x} has one remaining reference, from inode 0x{:x}.",
			block,
			id.block_no
		);
		let owner_tag = ctx.block_type(id.block_no);
		if owner_tag == BlockTag::InvalidInode {
			ctx.blockmap_set(block, BlockTag::Free);
			ctx.check_n_fix_bitmap(block, BlockTag::Free)?;
			return Ok(());
		}
		let tag = match id.ref_type() {
			DupRefType::IsInode => owner_tag,
			DupRefType::AsData => BlockTag::Data,
			DupRefType::AsEa => BlockTag::Eattr,
			DupRefType::AsMeta => {
				let ip = Inode::load(&ctx.sdp, id.block_no)?;
				if ip.di.is_dir() {
					BlockTag::DirLeaf
				} else {
					BlockTag::Indir
				}
			}
		};
		ctx.blockmap_set(block, tag);
	} else if remaining == 0 {
		log_notice!(
			"Block 0x{:x} has no more references; marking it free.",
			block
		);
		ctx.blockmap_set(block, BlockTag::Free);
		ctx.check_n_fix_bitmap(block, BlockTag::Free)?;
	} else {
		log_debug!(
			"Block 0x{:x} still has {} unresolved references.",
			block,
			remaining
		);
	}
	Ok(())
}

/// Runs pass 1b.
pub fn pass1b(ctx: &mut FsckCtx) -> Result<(), FsckError> {
	ctx.skip_this_pass = false;

	if ctx.dup_blocks.is_empty() {
		log_info!("No duplicate blocks found.");
		return Ok(());
	}

	// Find the original claimants the first scan could not attribute
	log_info!("Scanning filesystem for inodes containing duplicate blocks...");
	for block in 0..ctx.sdp.fssize {
		if ctx.stop_or_skip()? {
			break;
		}
		if ctx.dups_found_first == ctx.dups_found {
			log_debug!(
				"Found all {} original references to duplicates.",
				ctx.dups_found
			);
			break;
		}
		let q = ctx.block_type(block);
		if !(q.is_inode() || q == BlockTag::InvalidInode || q == BlockTag::FreeMeta) {
			continue;
		}
		find_block_ref(ctx, block)?;
	}

	log_info!("Handling duplicate blocks...");
	let blocks: Vec<u64> = ctx.dup_blocks.keys().copied().collect();
	for block in blocks {
		if ctx.stop_or_skip()? {
			break;
		}
		handle_dup_blk(ctx, block)?;
	}
	Ok(())
}

#[cfg(test)]
mod test {
	use crate::ondisk::*;
	use crate::testfs;
	use crate::testfs::TestFs;

	#[test]
	fn duplicate_data_block_is_resolved() {
		let mut fs = TestFs::new(4, 1);
		let a = fs.make_file(fs.root, b"filea", &[1u8; 512]);
		let b = fs.make_file(fs.root, b"fileb", &[2u8; 512]);
		let shared = fs.di_pointer(a, 0);
		let orphaned = fs.di_pointer(b, 0);

		// Both files now claim the same sole data block
		fs.set_di_pointer(b, 0, shared);
		fs.release_block(orphaned);
		let root = fs.root;
		let path = fs.write_image();

		let ctx = testfs::check_image(&path).unwrap();
		assert!(ctx.errors_found > 0);
		assert_eq!(ctx.errors_found, ctx.errors_corrected);
		assert!(ctx.dup_blocks.is_empty());

		// Exactly one claimant survived with its data intact
		let data = testfs::read_block(&path, root);
		let a_left = testfs::find_dirent_in(&data, b"filea").is_some();
		let b_left = testfs::find_dirent_in(&data, b"fileb").is_some();
		assert!(a_left != b_left);
		let survivor = if a_left { a } else { b };
		let di = Dinode::read(&testfs::read_block(&path, survivor));
		assert_eq!(get_u64(&testfs::read_block(&path, survivor), SIZEOF_DINODE), shared);
		assert_eq!(di.num.addr, survivor);

		// The second run must be clean
		let ctx = testfs::check_image(&path).unwrap();
		assert_eq!(ctx.errors_found, 0);

		std::fs::remove_file(&path).unwrap();
	}
}
