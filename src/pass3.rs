//! Pass 3: directory connectivity.
//!
//! Every directory must reach the root (or the master directory) by
//! following its ".." parents. Directories whose parents disagree are
//! rewired; directories with no parent at all move to lost+found.

use crate::blockmap::BlockTag;
use crate::fsck::FsckCtx;
use crate::fsops;
use crate::inode::Inode;
use crate::log_err;
use crate::log_info;
use crate::log_notice;
use crate::lost_found;
use crate::FsckError;

/// Marks a directory checked and returns the parent to climb to, or
/// `None` when the directory is orphaned.
fn mark_and_return_parent(ctx: &mut FsckCtx, addr: u64) -> Result<Option<u64>, FsckError> {
	let di = {
		let di = ctx.dirtree_insert(addr);
		di.checked = true;
		*di
	};

	if di.treewalk_parent == 0 {
		return Ok(None);
	}

	if di.dotdot_parent == di.treewalk_parent {
		if ctx.block_type(di.dotdot_parent) != BlockTag::DirInode {
			log_err!(
				"Directory 0x{:x} has a parent that is not a directory.",
				addr
			);
			return Ok(None);
		}
		return Ok(Some(di.dotdot_parent));
	}

	log_notice!(
		"Directory \"..\" and treewalk connections disagree for inode 0x{:x}:",
		addr
	);
	log_notice!(
		"\"..\" has 0x{:x}, treewalk has 0x{:x}",
		di.dotdot_parent,
		di.treewalk_parent
	);

	let dotdot_is_dir = ctx.block_type(di.dotdot_parent) == BlockTag::DirInode
		&& ctx.dirtree.contains_key(&di.dotdot_parent);
	let treewalk_is_dir = ctx.block_type(di.treewalk_parent) == BlockTag::DirInode;

	if !dotdot_is_dir {
		if !treewalk_is_dir {
			log_err!("Orphaned directory, move to lost+found.");
			return Ok(None);
		}
		// The dentry holder wins; rewrite ".."
		log_notice!(
			"Treewalk parent is correct, fixing \"..\" -> 0x{:x}",
			di.treewalk_parent
		);
		lost_found::attach_dotdot_to(ctx, di.treewalk_parent, di.dotdot_parent, addr)?;
		let entry = ctx.dirtree_insert(addr);
		entry.dotdot_parent = di.treewalk_parent;
		return Ok(Some(di.treewalk_parent));
	}

	if ctx.dirtree.contains_key(&di.treewalk_parent) && treewalk_is_dir {
		log_err!("Both \"..\" and treewalk parents are directories, going with treewalk.");
		lost_found::attach_dotdot_to(ctx, di.treewalk_parent, di.dotdot_parent, addr)?;
		let entry = ctx.dirtree_insert(addr);
		entry.dotdot_parent = di.treewalk_parent;
		return Ok(Some(di.treewalk_parent));
	}

	// ".." is fine but the dentry lives in something that is not a
	// directory anymore
	log_notice!("\"..\" parent is valid, but treewalk is bad.");
	if !ctx.query(&format!(
		"Remove the directory entry for 0x{:x} from 0x{:x}? ",
		addr, di.treewalk_parent
	)) {
		log_err!("Directory entry to invalid inode remains.");
		return Ok(None);
	}
	fsops::remove_dentry_from_dir(ctx, di.treewalk_parent, addr)?;
	ctx.decr_link_count(addr, "bad treewalk dentry");
	Ok(None)
}

/// Handles a directory with no connected ancestor.
fn handle_orphan(ctx: &mut FsckCtx, addr: u64) -> Result<(), FsckError> {
	let q = ctx.block_type(addr);
	if q != BlockTag::DirInode {
		log_err!(
			"Unlinked block 0x{:x} marked as a directory is not one.",
			addr
		);
		if ctx.query("Clear the unlinked block? ") {
			ctx.blockmap_set(addr, BlockTag::Free);
			ctx.check_n_fix_bitmap(addr, BlockTag::Free)?;
		}
		return Ok(());
	}

	let ip = Inode::load(&ctx.sdp, addr)?;
	log_err!("Found unlinked directory at block 0x{:x}.", addr);

	if ip.di.entries <= 2 && ip.di.eattr == 0 {
		// Nothing but "." and ".." inside
		log_err!("The unlinked directory is empty.");
		if ctx.query("Remove the empty unlinked directory? ") {
			ctx.blockmap_set(addr, BlockTag::Free);
			ctx.check_n_fix_bitmap(addr, BlockTag::Free)?;
			ctx.inodetree.remove(&addr);
			ctx.dirtree.remove(&addr);
			return Ok(());
		}
		log_err!("Empty unlinked directory remains.");
	}

	if ctx.query("Add the unlinked directory to lost+found? ") {
		lost_found::add_inode_to_lf(ctx, &ip)?;
		log_notice!("Directory relinked to lost+found.");
	} else {
		log_err!("Unlinked directory remains unlinked.");
	}
	Ok(())
}

/// Runs pass 3.
pub fn pass3(ctx: &mut FsckCtx) -> Result<(), FsckError> {
	ctx.skip_this_pass = false;

	let root = ctx.sdp.sb.root_dir.addr;
	let master = ctx.sdp.sb.master_dir.addr;
	if let Some(di) = ctx.dirtree.get_mut(&root) {
		log_info!("Marking root inode connected.");
		di.checked = true;
	}
	if let Some(di) = ctx.dirtree.get_mut(&master) {
		log_info!("Marking master directory inode connected.");
		di.checked = true;
	}

	log_info!("Checking directory linkage.");
	let dirs: Vec<u64> = ctx.dirtree.keys().copied().collect();
	for dir in dirs {
		let mut cur = dir;
		loop {
			if ctx.stop_or_skip()? {
				return Ok(());
			}
			let checked = ctx
				.dirtree
				.get(&cur)
				.map(|di| di.checked)
				.unwrap_or(true);
			if checked {
				break;
			}
			match mark_and_return_parent(ctx, cur)? {
				Some(parent) => {
					log_info!("Directory at block 0x{:x} connected.", cur);
					cur = parent;
				}
				None => {
					handle_orphan(ctx, cur)?;
					break;
				}
			}
		}
	}
	Ok(())
}
