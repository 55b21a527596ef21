//! The lost+found directory and orphan reattachment.

use crate::blockmap::BlockTag;
use crate::buf::BufHandle;
use crate::fsck::FsckCtx;
use crate::fsops;
use crate::inode::mode_to_de_type;
use crate::inode::Inode;
use crate::log_notice;
use crate::metawalk;
use crate::metawalk::WalkOps;
use crate::metawalk::WalkRet;
use crate::ondisk::*;
use crate::FsckError;

/// Returns the lost+found directory, creating it under the root directory
/// on first use.
pub fn make_sure_lf_exists(ctx: &mut FsckCtx) -> Result<u64, FsckError> {
	if let Some(lf) = ctx.lf_dip {
		return Ok(lf);
	}

	let root = ctx.sdp.sb.root_dir.addr;
	let root_ip = Inode::load(&ctx.sdp, root)?;

	// An earlier run may have created it already
	if let Some(inum) = fsops::lookupi(&ctx.sdp, &root_ip, b"lost+found")? {
		ctx.lf_dip = Some(inum.addr);
		let di = ctx.dirtree_insert(inum.addr);
		di.dotdot_parent = root;
		di.treewalk_parent = root;
		return Ok(inum.addr);
	}

	log_notice!("Creating the lost+found directory.");
	let lf_ip = fsops::createi(ctx, root, b"lost+found", 0o040700, 0)?;
	let lf = lf_ip.addr;
	ctx.lf_dip = Some(lf);

	ctx.blockmap_set(lf, BlockTag::DirInode);
	ctx.check_n_fix_bitmap(lf, BlockTag::DirInode)?;

	// Bookkeeping for the new links: the root dentry and "." point at
	// lost+found, its ".." points at the root
	ctx.set_di_nlink(lf_ip.di.num, lf_ip.di.nlink);
	ctx.incr_link_count(lf_ip.di.num, "root dentry");
	ctx.incr_link_count(lf_ip.di.num, "\".\"");
	ctx.incr_link_count(ctx.sdp.sb.root_dir, "lost+found \"..\"");

	// The root gained a link on disk; refresh its recorded count
	let root_ip = Inode::load(&ctx.sdp, root)?;
	ctx.set_di_nlink(root_ip.di.num, root_ip.di.nlink);

	let di = ctx.dirtree_insert(lf);
	di.dotdot_parent = root;
	di.treewalk_parent = root;
	di.checked = true;

	Ok(lf)
}

/// Dentry hook rewriting the target of a ".." entry.
struct PatchDotdot {
	new_parent: Inum,
	patched: bool,
}

impl WalkOps for PatchDotdot {
	fn wants_dentries(&self) -> bool {
		true
	}

	fn check_dentry(
		&mut self,
		_ctx: &mut FsckCtx,
		_ip: &Inode,
		dent: &Dirent,
		name: &[u8],
		bh: &BufHandle,
		_prev_off: Option<usize>,
		off: usize,
		_lindex: u32,
		count: &mut u32,
	) -> Result<WalkRet, FsckError> {
		*count += 1;
		if name == b".." && !self.patched {
			let mut de = dent.clone();
			de.inum = self.new_parent;
			let mut buf = bh.borrow_mut();
			de.write(&mut buf.data, off);
			buf.modify();
			self.patched = true;
		}
		Ok(WalkRet::Good)
	}
}

/// Repoints a directory's ".." entry at a new parent, keeping the link
/// counts in step.
pub fn attach_dotdot_to(
	ctx: &mut FsckCtx,
	new_parent: u64,
	old_parent: u64,
	child: u64,
) -> Result<(), FsckError> {
	let pip = Inode::load(&ctx.sdp, new_parent)?;
	let no = pip.di.num;

	let mut ops = PatchDotdot {
		new_parent: no,
		patched: false,
	};
	metawalk::check_dir(ctx, child, &mut ops)?;

	if ops.patched {
		ctx.decr_link_count(old_parent, "old \"..\"");
		ctx.incr_link_count(no, "new \"..\"");
	}
	Ok(())
}

/// Attaches an unreferenced inode under lost+found with a synthetic name.
pub fn add_inode_to_lf(ctx: &mut FsckCtx, ip: &Inode) -> Result<(), FsckError> {
	let lf = make_sure_lf_exists(ctx)?;
	if ip.addr == lf {
		log_notice!("lost+found cannot add itself.");
		return Ok(());
	}

	let (name, de_type) = if ip.di.is_dir() {
		(format!("lost_dir_{}", ip.addr), DT_DIR)
	} else {
		(
			format!("lost_file_{}", ip.addr),
			mode_to_de_type(ip.di.mode).unwrap_or(DT_REG),
		)
	};

	let mut lf_ip = Inode::load(&ctx.sdp, lf)?;
	fsops::dir_add(ctx, &mut lf_ip, name.as_bytes(), ip.di.num, de_type)?;
	ctx.incr_link_count(ip.di.num, "from lost+found");
	ctx.set_di_nlink(lf_ip.di.num, lf_ip.di.nlink);

	if ip.di.is_dir() {
		// The directory's ".." must follow it into lost+found
		let old_parent = ctx
			.dirtree
			.get(&ip.addr)
			.map(|di| di.dotdot_parent)
			.unwrap_or(0);
		attach_dotdot_to(ctx, lf, old_parent, ip.addr)?;
		let di = ctx.dirtree_insert(ip.addr);
		di.dotdot_parent = lf;
		di.treewalk_parent = lf;
	}
	log_notice!("Inode 0x{:x} relinked as \"{}\"", ip.addr, name);
	Ok(())
}
