//! Pass 5: make the on-disk bitmaps agree with the block map.
//!
//! Every resource group's bitmap is compared, block by block, against
//! what the walk inferred; mismatching bit-pairs are rewritten and the
//! group's free and dinode counters recomputed.

use crate::blockmap::BlockTag;
use crate::fsck::FsckCtx;
use crate::inode::Inode;
use crate::log_err;
use crate::log_info;
use crate::metawalk;
use crate::metawalk::DeleteOps;
use crate::ondisk::*;
use crate::rgrp;
use crate::FsckError;

/// Offers to reclaim the unlinked inodes of one group before the counts
/// are settled: the whole inode tree is freed, not just its own block.
fn reclaim_unlinked(ctx: &mut FsckCtx, rg_addr: u64) -> Result<(), FsckError> {
	let (data0, data) = {
		let rg = ctx.sdp.rgtree.get(&rg_addr).unwrap();
		(rg.data0, rg.data)
	};

	for block in data0..data0 + data as u64 {
		if ctx.block_type(block) != BlockTag::FreeMeta {
			continue;
		}
		log_err!("Unlinked inode found at block 0x{:x}.", block);
		if !ctx.query("Do you want to reclaim the block? ") {
			log_info!(
				"Unlinked block found at 0x{:x}, left unchanged.",
				block
			);
			continue;
		}
		let ip = Inode::load(&ctx.sdp, block)?;
		if check_meta(&ip.bh.borrow().data, METATYPE_DI) {
			let mut del = DeleteOps;
			metawalk::check_metatree(ctx, &ip, &mut del)?;
			metawalk::check_inode_eattr(ctx, &ip, &mut del)?;
		}
		ctx.blockmap_set(block, BlockTag::Free);
		ctx.check_n_fix_bitmap(block, BlockTag::Free)?;
		ctx.inodetree.remove(&block);
		log_err!("Unlinked block 0x{:x} reclaimed.", block);
	}
	Ok(())
}

/// Reconciles one group: bitmap states first, then the header counters.
fn update_rgrp(ctx: &mut FsckCtx, rg_addr: u64) -> Result<(), FsckError> {
	let rg = ctx.sdp.rgtree.get(&rg_addr).unwrap().clone();
	let mut count = [0u32; 4];

	for block in rg.data0..rg.data0 + rg.data as u64 {
		if ctx.skip_this_pass {
			return Ok(());
		}
		let wanted = ctx.block_type(block).to_blkst();
		count[wanted as usize] += 1;

		let state = rgrp::bitmap_get(&ctx.sdp, &rg, block)?;
		if state != wanted {
			log_err!(
				"Block 0x{:x} bitmap says {} but the checker saw {} ({}).",
				block,
				blkst_name(state),
				blkst_name(wanted),
				ctx.block_type(block).name()
			);
			if ctx.query(&format!("Fix bitmap for block 0x{:x}? ", block)) {
				rgrp::bitmap_set(&ctx.sdp, &rg, block, wanted)?;
				log_err!("Fixed.");
			} else {
				log_err!(
					"Bitmap at block 0x{:x} left inconsistent.",
					block
				);
			}
		}
	}

	let free = count[BLKST_FREE as usize];
	let dinodes = count[BLKST_DINODE as usize];
	let mut update = false;
	if rg.free != free {
		log_err!(
			"Resource group 0x{:x} free count inconsistent: is {} should be {}.",
			rg.addr,
			rg.free,
			free
		);
		update = true;
	}
	if rg.dinodes != dinodes {
		log_err!(
			"Resource group 0x{:x} inode count inconsistent: is {} should be {}.",
			rg.addr,
			rg.dinodes,
			dinodes
		);
		update = true;
	}
	if update {
		if ctx.query("Update resource group counts? ") {
			let rg = ctx.sdp.rgtree.get_mut(&rg_addr).unwrap();
			rg.free = free;
			rg.dinodes = dinodes;
			let rg = rg.clone();
			rg.write_header(&ctx.sdp)?;
			log_err!("Resource group counts updated.");
		} else {
			log_err!("Resource group counts left inconsistent.");
		}
	}
	Ok(())
}

/// Runs pass 5.
pub fn pass5(ctx: &mut FsckCtx) -> Result<(), FsckError> {
	ctx.skip_this_pass = false;

	let rg_addrs: Vec<u64> = ctx.sdp.rgtree.keys().copied().collect();
	for (n, rg_addr) in rg_addrs.iter().enumerate() {
		if ctx.stop_or_skip()? {
			return Ok(());
		}
		log_info!("Verifying resource group {}", n);
		reclaim_unlinked(ctx, *rg_addr)?;
		update_rgrp(ctx, *rg_addr)?;
	}
	Ok(())
}

#[cfg(test)]
mod test {
	use crate::testfs;
	use crate::testfs::TestFs;

	#[test]
	fn bitmap_drift_is_fixed() {
		let mut fs = TestFs::new(4, 1);
		let f = fs.make_file(fs.root, b"data", &[9u8; 512]);
		let dblock = fs.di_pointer(f, 0);
		// The allocated data block reads as free on disk
		fs.drift_free(dblock);
		let path = fs.write_image();

		let ctx = testfs::check_image(&path).unwrap();
		// One fix for the bitmap nibble, one for the group counters
		assert_eq!(ctx.errors_found, 2);
		assert_eq!(ctx.errors_corrected, 2);
		assert_eq!(ctx.exit_code(), crate::fsck::FSCK_NONDESTRUCT);

		let ctx = testfs::check_image(&path).unwrap();
		assert_eq!(ctx.errors_found, 0);

		std::fs::remove_file(&path).unwrap();
	}
}
