//! Pass 4: reconcile link counts.
//!
//! The references counted during the directory walk are compared against
//! each inode's own link count. Unreferenced inodes go to lost+found or,
//! when empty, away.

use crate::blockmap::BlockTag;
use crate::fsck::FsckCtx;
use crate::inode::Inode;
use crate::log_err;
use crate::log_info;
use crate::log_notice;
use crate::lost_found;
use crate::FsckError;

/// Rewrites an inode's link count to what the checker observed.
fn fix_inode_count(ctx: &mut FsckCtx, addr: u64, counted: u32) -> Result<(), FsckError> {
	let mut ip = Inode::load(&ctx.sdp, addr)?;
	if ip.di.nlink == counted {
		return Ok(());
	}
	log_info!(
		"Changing inode 0x{:x} to have {} links.",
		addr,
		counted
	);
	ip.di.nlink = counted;
	ip.save();
	if let Some(ii) = ctx.inodetree.get_mut(&addr) {
		ii.nlink = counted;
	}
	Ok(())
}

/// Handles an inode nothing references.
fn handle_unlinked(ctx: &mut FsckCtx, addr: u64) -> Result<(), FsckError> {
	log_err!("Found unlinked inode at 0x{:x}.", addr);

	let q = ctx.block_type(addr);
	if !q.is_inode() {
		log_err!("Unlinked block marked as inode is not an inode; cleared.");
		ctx.blockmap_set(addr, BlockTag::Free);
		ctx.check_n_fix_bitmap(addr, BlockTag::Free)?;
		ctx.inodetree.remove(&addr);
		return Ok(());
	}

	let ip = Inode::load(&ctx.sdp, addr)?;

	// Zero-size inodes carrying extended attributes keep them; the
	// attributes may be the only copy of something valuable
	if ip.di.size == 0 && ip.di.eattr == 0 {
		log_err!("Unlinked inode has zero size.");
		if ctx.query("Clear the zero-size unlinked inode? ") {
			ctx.blockmap_set(addr, BlockTag::Free);
			ctx.check_n_fix_bitmap(addr, BlockTag::Free)?;
			ctx.inodetree.remove(&addr);
			return Ok(());
		}
	}
	if ctx.query("Add the unlinked inode to lost+found? ") {
		lost_found::add_inode_to_lf(ctx, &ip)?;
		let counted = ctx
			.inodetree
			.get(&addr)
			.map(|ii| ii.counted_links)
			.unwrap_or(1);
		fix_inode_count(ctx, addr, counted)?;
		log_notice!("Inode relinked to lost+found.");
	} else {
		log_err!("Unlinked inode left unlinked.");
	}
	Ok(())
}

/// Runs pass 4.
pub fn pass4(ctx: &mut FsckCtx) -> Result<(), FsckError> {
	ctx.skip_this_pass = false;
	log_info!("Checking inode reference counts.");

	let addrs: Vec<u64> = ctx.inodetree.keys().copied().collect();
	for addr in addrs {
		if ctx.stop_or_skip()? {
			return Ok(());
		}
		let Some(ii) = ctx.inodetree.get(&addr).copied() else {
			continue;
		};
		// Bitmap-unlinked inodes belong to the reclaim offer in pass 5
		if ctx.block_type(addr) == BlockTag::FreeMeta {
			continue;
		}
		log_info!(
			"Checking reference count on inode at block 0x{:x}",
			addr
		);

		if ii.counted_links == 0 {
			handle_unlinked(ctx, addr)?;
			continue;
		}
		if ii.nlink != ii.counted_links {
			log_err!(
				"Link count inconsistent for inode 0x{:x}: has {} but found {}.",
				addr,
				ii.nlink,
				ii.counted_links
			);
			if ctx.query("Update the link count? ") {
				fix_inode_count(ctx, addr, ii.counted_links)?;
				log_notice!("Link count updated for inode 0x{:x}.", addr);
			} else {
				log_err!(
					"Link count for inode 0x{:x} still incorrect.",
					addr
				);
			}
		}
	}

	// lost+found may have grown while the list was walked
	if let Some(lf) = ctx.lf_dip {
		if let Some(ii) = ctx.inodetree.get(&lf).copied() {
			if ii.nlink != ii.counted_links {
				fix_inode_count(ctx, lf, ii.counted_links)?;
			}
		}
	}
	Ok(())
}

#[cfg(test)]
mod test {
	use crate::ondisk::Dinode;
	use crate::testfs;
	use crate::testfs::TestFs;

	#[test]
	fn orphan_file_moves_to_lost_and_found() {
		let mut fs = TestFs::new(4, 2);
		let victim = fs.make_file(fs.root, b"stray", b"precious data");
		fs.remove_dirent(fs.root, b"stray");
		let root = fs.root;
		let path = fs.write_image();

		let ctx = testfs::check_image(&path).unwrap();
		assert!(ctx.errors_found > 0);
		assert_eq!(ctx.errors_found, ctx.errors_corrected);
		assert_eq!(ctx.exit_code(), crate::fsck::FSCK_NONDESTRUCT);

		// The root gained lost+found, which holds the stray inode
		let root_data = testfs::read_block(&path, root);
		let lf = testfs::find_dirent_in(&root_data, b"lost+found").unwrap();
		let lf_data = testfs::read_block(&path, lf.inum.addr);
		let name = format!("lost_file_{}", victim);
		let entry = testfs::find_dirent_in(&lf_data, name.as_bytes()).unwrap();
		assert_eq!(entry.inum.addr, victim);

		// The reattached inode carries one link
		let di = Dinode::read(&testfs::read_block(&path, victim));
		assert_eq!(di.nlink, 1);

		let ctx = testfs::check_image(&path).unwrap();
		assert_eq!(ctx.errors_found, 0);

		std::fs::remove_file(&path).unwrap();
	}
}
