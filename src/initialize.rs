//! Run setup and teardown: opening the device, validating the superblock,
//! locating the resource groups and system inodes, and replaying the
//! journals.

use crate::fsck::ask_opts;
use crate::fsck::FsckCtx;
use crate::fsck::Options;
use crate::fsops;
use crate::inode::writei;
use crate::inode::Inode;
use crate::log_err;
use crate::log_info;
use crate::log_notice;
use crate::ondisk::*;
use crate::recovery;
use crate::rgrp;
use crate::rgrp::TrustLevel;
use crate::sbd;
use crate::sbd::Sbd;
use crate::FsckError;
use std::fs::OpenOptions;
use std::fs;
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

/// How the device shows up in the mount table.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum MountState {
	NotMounted,
	ReadOnly,
	ReadWrite,
}

/// Scans /proc/mounts for the device.
fn mount_state(path: &Path) -> io::Result<MountState> {
	let canonical = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
	let mounts = match fs::read_to_string("/proc/mounts") {
		Ok(m) => m,
		Err(_) => return Ok(MountState::NotMounted),
	};

	for line in mounts.lines() {
		let mut fields = line.split_whitespace();
		let (Some(dev), Some(_mnt), Some(_fstype), Some(opts)) =
			(fields.next(), fields.next(), fields.next(), fields.next())
		else {
			continue;
		};
		if Path::new(dev) != canonical {
			continue;
		}
		let readonly = opts.split(',').any(|o| o == "ro");
		return Ok(if readonly {
			MountState::ReadOnly
		} else {
			MountState::ReadWrite
		});
	}
	Ok(MountState::NotMounted)
}

/// Opens the device, denying concurrent mounts with an exclusive open.
/// A filesystem mounted read-only elsewhere is tolerated.
fn open_device(path: &Path) -> Result<(fs::File, bool), FsckError> {
	let state = mount_state(path)?;
	if state == MountState::ReadWrite {
		log_err!(
			"Device {} is mounted read-write; cannot check it.",
			path.display()
		);
		return Err(FsckError::Io(io::Error::new(
			io::ErrorKind::AddrInUse,
			"device is mounted",
		)));
	}

	let mut options = OpenOptions::new();
	options.read(true).write(true);
	if state == MountState::NotMounted {
		options.custom_flags(libc::O_EXCL);
	}
	let file = options.open(path)?;
	Ok((file, state == MountState::ReadOnly))
}

/// Reads the superblock, repairing it with operator consent when it does
/// not parse.
fn init_sb(sdp: &mut Sbd, opts: &Options) -> Result<(), FsckError> {
	match sdp.read_sb() {
		Ok(()) => return Ok(()),
		Err(FsckError::Unsupported { format }) => {
			return Err(FsckError::Unsupported { format });
		}
		Err(e) => {
			log_err!("The superblock is damaged: {}", e);
		}
	}

	if opts.no {
		return Err(FsckError::BadMeta {
			block: sdp.sb_addr,
			expected: "superblock",
		});
	}
	let sb = sbd::sb_repair(sdp)?;
	if !ask_opts(opts, "Okay to rewrite the superblock? ") {
		return Err(FsckError::BadMeta {
			block: sdp.sb_addr,
			expected: "superblock",
		});
	}
	sdp.sb = sb;
	sdp.compute_constants()?;
	sdp.write_sb()?;
	sdp.bcache.flush()?;
	log_notice!("Superblock rewritten; uuid is now {}.", sdp.uuid_string());
	Ok(())
}

/// Looks a system inode up in the master directory, validating the target.
fn lookup_system_inode(
	sdp: &Sbd,
	master: &Inode,
	name: &[u8],
) -> Result<Option<u64>, FsckError> {
	let Some(inum) = fsops::lookupi(sdp, master, name)? else {
		return Ok(None);
	};
	if !sdp.check_range(inum.addr) {
		return Ok(None);
	}
	let bh = sdp.bcache.read(inum.addr)?;
	if !check_meta(&bh.borrow().data, METATYPE_DI) {
		return Ok(None);
	}
	Ok(Some(inum.addr))
}

/// Finds the system inodes hanging off the master directory.
fn init_system_inodes(ctx: &mut FsckCtx) -> Result<(), FsckError> {
	let master_addr = ctx.sdp.sb.master_dir.addr;
	let master = Inode::load(&ctx.sdp, master_addr)?;
	if !check_meta(&master.bh.borrow().data, METATYPE_DI) || !master.di.is_dir() {
		log_err!("The master directory is damaged.");
		return Err(FsckError::BadMeta {
			block: master_addr,
			expected: "dinode",
		});
	}

	ctx.sdp.md.jiinode = lookup_system_inode(&ctx.sdp, &master, b"jindex")?;
	ctx.sdp.md.pinode = lookup_system_inode(&ctx.sdp, &master, b"per_node")?;
	ctx.sdp.md.inum = lookup_system_inode(&ctx.sdp, &master, b"inum")?;
	ctx.sdp.md.statfs = lookup_system_inode(&ctx.sdp, &master, b"statfs")?;
	ctx.sdp.md.riinode = lookup_system_inode(&ctx.sdp, &master, b"rindex")?;
	ctx.sdp.md.qinode = lookup_system_inode(&ctx.sdp, &master, b"quota")?;
	Ok(())
}

/// Builds the resource group tree, escalating through the trust levels
/// until one produces a usable picture.
fn init_rgrps(ctx: &mut FsckCtx) -> Result<(), FsckError> {
	let mut level = TrustLevel::BlindFaith;

	let tree = loop {
		log_info!("Validating the resource group index (trust level {:?})", level);
		let candidate = match level {
			TrustLevel::BlindFaith | TrustLevel::LittleFaith => {
				match ctx.sdp.md.riinode {
					Some(ri_addr) => {
						let rip = Inode::load(&ctx.sdp, ri_addr)?;
						// A completely unreadable index is just another
						// reason to climb down the ladder
						match rgrp::rindex_read(&ctx.sdp, &rip) {
							Ok((tree, ok))
								if (ok || level == TrustLevel::LittleFaith)
									&& !tree.is_empty() =>
							{
								Some(tree)
							}
							_ => None,
						}
					}
					None => None,
				}
			}
			TrustLevel::OpenMinded => {
				let tree = rgrp::rg_grid(&ctx.sdp)?;
				(!tree.is_empty()).then_some(tree)
			}
			TrustLevel::Distrust => {
				let tree = rgrp::rg_scan(&ctx.sdp, false)?;
				(!tree.is_empty()).then_some(tree)
			}
			TrustLevel::Indignation => {
				let tree = rgrp::rg_scan(&ctx.sdp, true)?;
				(!tree.is_empty()).then_some(tree)
			}
		};

		match candidate {
			Some(tree) => break tree,
			None => match level.next() {
				Some(next) => {
					log_err!(
						"Resource group index not usable at trust level {:?}; escalating.",
						level
					);
					level = next;
				}
				None => {
					log_err!("Unable to locate any resource group.");
					return Err(FsckError::BadMeta {
						block: 0,
						expected: "resource group",
					});
				}
			},
		}
	};

	ctx.sdp.rgtree = tree;

	// Read (or repair) each group's header
	let addrs: Vec<u64> = ctx.sdp.rgtree.keys().copied().collect();
	for addr in addrs {
		let mut rg = ctx.sdp.rgtree.get(&addr).unwrap().clone();
		if rg.read_header(&ctx.sdp).is_err() {
			log_err!("Resource group header at 0x{:x} is damaged.", addr);
			if ctx.query("Rewrite the resource group header? ") {
				// Counters start at zero; the bitmap pass recounts them
				rg.write_header(&ctx.sdp)?;
			}
		}
		ctx.sdp.rgtree.insert(addr, rg);
	}

	// A reconstructed index is offered back to the index file
	if level != TrustLevel::BlindFaith {
		if let Some(ri_addr) = ctx.sdp.md.riinode {
			let rip = Inode::load(&ctx.sdp, ri_addr)?;
			let wanted = ctx.sdp.rgtree.len() as u64 * SIZEOF_RINDEX as u64;
			if rip.di.size >= wanted
				&& ctx.query("Rewrite the resource group index? ")
			{
				let entries: Vec<RIndex> = ctx
					.sdp
					.rgtree
					.values()
					.map(|rg| rg.to_rindex())
					.collect();
				for (i, ri) in entries.iter().enumerate() {
					let mut raw = [0u8; SIZEOF_RINDEX];
					ri.write(&mut raw);
					writei(&ctx.sdp, &rip, (i * SIZEOF_RINDEX) as u64, &raw)?;
				}
				let mut rip = Inode::load(&ctx.sdp, ri_addr)?;
				rip.di.size = wanted;
				rip.save();
			}
		}
	}

	log_notice!("{} resource groups found.", ctx.sdp.rgtree.len());
	Ok(())
}

/// Finds the journal inodes through the journal index directory.
fn init_jindex(ctx: &mut FsckCtx) -> Result<(), FsckError> {
	let Some(ji_addr) = ctx.sdp.md.jiinode else {
		log_err!("The journal index is missing; no journals will be replayed.");
		return Ok(());
	};
	let jiinode = Inode::load(&ctx.sdp, ji_addr)?;
	let journals = jiinode.di.entries.saturating_sub(2);

	for j in 0..journals {
		let name = format!("journal{}", j);
		match fsops::lookupi(&ctx.sdp, &jiinode, name.as_bytes())? {
			Some(inum) if ctx.sdp.check_range(inum.addr) => {
				ctx.sdp.md.journals.push(inum.addr);
			}
			_ => {
				log_err!("Journal \"{}\" is missing from the index.", name);
			}
		}
	}
	log_info!("{} journals found.", ctx.sdp.md.journals.len());
	Ok(())
}

/// Creates a stuffed file under the master directory with fixed content.
fn build_stuffed_file(
	ctx: &mut FsckCtx,
	name: &[u8],
	content: &[u8],
) -> Result<u64, FsckError> {
	let master = ctx.sdp.sb.master_dir.addr;
	let mut ip = fsops::createi(ctx, master, name, 0o100600, DIF_SYSTEM)?;
	if !content.is_empty() {
		writei(&ctx.sdp, &ip, 0, content)?;
	}
	ip.di.size = content.len() as u64;
	ip.save();

	// Account for the new object so the later passes agree with the disk
	ctx.set_di_nlink(ip.di.num, 1);
	ctx.incr_link_count(ip.di.num, "master dentry");
	let master_ip = Inode::load(&ctx.sdp, master)?;
	ctx.set_di_nlink(master_ip.di.num, master_ip.di.nlink);
	Ok(ip.addr)
}

/// Creates an empty system directory under the master directory.
fn build_system_dir(ctx: &mut FsckCtx, name: &[u8]) -> Result<u64, FsckError> {
	let master = ctx.sdp.sb.master_dir.addr;
	let ip = fsops::createi(ctx, master, name, 0o040700, DIF_SYSTEM)?;

	ctx.set_di_nlink(ip.di.num, ip.di.nlink);
	ctx.incr_link_count(ip.di.num, "master dentry");
	ctx.incr_link_count(ip.di.num, "\".\"");
	ctx.incr_link_count(ctx.sdp.sb.master_dir, "system \"..\"");
	let di = ctx.dirtree_insert(ip.addr);
	di.dotdot_parent = master;
	di.treewalk_parent = master;
	let master_ip = Inode::load(&ctx.sdp, master)?;
	ctx.set_di_nlink(master_ip.di.num, master_ip.di.nlink);
	Ok(ip.addr)
}

/// Offers to rebuild the system inodes the master directory lost.
fn rebuild_missing_system_inodes(ctx: &mut FsckCtx) -> Result<(), FsckError> {
	if ctx.sdp.md.inum.is_none() {
		log_err!("The inum system inode is missing.");
		if ctx.query("Okay to rebuild it? ") {
			// Restart numbering past anything the filesystem can hold
			let next = ctx.sdp.fssize;
			let addr = build_stuffed_file(ctx, b"inum", &next.to_be_bytes())?;
			ctx.sdp.md.inum = Some(addr);
		}
	}
	if ctx.sdp.md.statfs.is_none() {
		log_err!("The statfs system inode is missing.");
		if ctx.query("Okay to rebuild it? ") {
			let addr = build_stuffed_file(ctx, b"statfs", &[0u8; 24])?;
			ctx.sdp.md.statfs = Some(addr);
		}
	}
	if ctx.sdp.md.qinode.is_none() {
		log_err!("The quota system inode is missing.");
		if ctx.query("Okay to rebuild it? ") {
			let addr = build_stuffed_file(ctx, b"quota", &[])?;
			ctx.sdp.md.qinode = Some(addr);
		}
	}
	if ctx.sdp.md.pinode.is_none() {
		log_err!("The per_node system directory is missing.");
		if ctx.query("Okay to rebuild it? ") {
			let addr = build_system_dir(ctx, b"per_node")?;
			ctx.sdp.md.pinode = Some(addr);
		}
	}
	if ctx.sdp.md.jiinode.is_none() {
		log_err!("The journal index directory is missing.");
		if ctx.query("Okay to rebuild it (empty)? ") {
			let addr = build_system_dir(ctx, b"jindex")?;
			ctx.sdp.md.jiinode = Some(addr);
		}
	}
	Ok(())
}

/// Opens the device and prepares everything the passes need. The journals
/// are replayed here, before the first pass looks at the metadata.
pub fn initialize(path: &Path, opts: Options) -> Result<FsckCtx, FsckError> {
	let (file, readonly_mount) = open_device(path)?;
	let mut sdp = Sbd::new(file);
	init_sb(&mut sdp, &opts)?;
	sdp.readonly_mount = readonly_mount;

	log_info!(
		"Filesystem format {}, block size {}, {} blocks, uuid {}",
		sdp.sb.fs_format,
		sdp.sb.bsize,
		sdp.fssize,
		sdp.uuid_string()
	);

	let mut ctx = FsckCtx::new(sdp, opts);
	if !ctx.opts.no {
		// Fence off cluster mounts for the duration of the check
		ctx.sdp.fence_lockproto()?;
	}

	let root = ctx.sdp.sb.root_dir.addr;
	if !ctx.sdp.check_range(root)
		|| !check_meta(&ctx.sdp.bcache.read(root)?.borrow().data, METATYPE_DI)
	{
		log_err!("The root directory is damaged.");
		return Err(FsckError::BadMeta {
			block: root,
			expected: "dinode",
		});
	}

	init_system_inodes(&mut ctx)?;
	init_rgrps(&mut ctx)?;
	init_jindex(&mut ctx)?;
	recovery::replay_journals(&mut ctx)?;
	rebuild_missing_system_inodes(&mut ctx)?;

	Ok(ctx)
}

/// Restores the lock protocol and flushes everything back to disk.
pub fn destroy(ctx: &mut FsckCtx) -> Result<(), FsckError> {
	ctx.sdp.unfence_lockproto()?;
	ctx.sdp.bcache.flush()?;
	if ctx.sdp.readonly_mount {
		log_notice!(
			"The device is mounted read-only elsewhere; its caches must be dropped."
		);
	}
	Ok(())
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn mount_state_of_unmounted_file() {
		// A temporary file is certainly not in /proc/mounts
		let path = std::env::temp_dir().join(format!(
			"gfs2fsck-mounts-{}",
			std::process::id()
		));
		std::fs::write(&path, b"x").unwrap();
		assert_eq!(mount_state(&path).unwrap(), MountState::NotMounted);
		std::fs::remove_file(&path).unwrap();
	}
}
