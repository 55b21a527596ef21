//! Pass 2: check the content of every directory.
//!
//! Every entry's record, hash, target and type are verified; "." and ".."
//! get their special treatment and the observed references feed the link
//! counts reconciled by pass 4.

use crate::blockmap::BlockTag;
use crate::buf::BufHandle;
use crate::fsck::FsckCtx;
use crate::hash::disk_hash;
use crate::inode::Inode;
use crate::log_debug;
use crate::log_err;
use crate::log_info;
use crate::metawalk;
use crate::metawalk::WalkOps;
use crate::metawalk::WalkRet;
use crate::ondisk::*;
use crate::FsckError;

/// Per-directory bookkeeping while its entries stream past.
#[derive(Default)]
struct DirStatus {
	dotdir: bool,
	dotdotdir: bool,
	entry_count: u32,
}

struct Pass2Checker {
	ds: DirStatus,
}

/// The block map tag a directory entry type promises.
fn de_type_to_tag(de_type: u8) -> Option<BlockTag> {
	match de_type {
		DT_DIR => Some(BlockTag::DirInode),
		DT_REG => Some(BlockTag::FileInode),
		DT_LNK => Some(BlockTag::LnkInode),
		DT_BLK => Some(BlockTag::BlkInode),
		DT_CHR => Some(BlockTag::ChrInode),
		DT_FIFO => Some(BlockTag::FifoInode),
		DT_SOCK => Some(BlockTag::SockInode),
		_ => None,
	}
}

impl WalkOps for Pass2Checker {
	fn wants_dentries(&self) -> bool {
		true
	}

	fn check_dentry(
		&mut self,
		ctx: &mut FsckCtx,
		ip: &Inode,
		dent: &Dirent,
		name: &[u8],
		bh: &BufHandle,
		prev_off: Option<usize>,
		off: usize,
		_lindex: u32,
		count: &mut u32,
	) -> Result<WalkRet, FsckError> {
		let entry = dent.inum;

		if !ctx.sdp.check_range(entry.addr) {
			log_err!(
				"Entry \"{}\" in directory 0x{:x} points out of range (0x{:x}).",
				String::from_utf8_lossy(name),
				ip.addr,
				entry.addr
			);
			if ctx.query("Delete the directory entry? ") {
				metawalk::dirent_del(bh, prev_off, off);
				return Ok(WalkRet::SkipOne);
			}
			self.ds.entry_count += 1;
			*count += 1;
			return Ok(WalkRet::Good);
		}

		// The name hash places the entry in the directory's hash table
		let calculated = disk_hash(name);
		if dent.hash != calculated {
			log_err!(
				"Entry \"{}\" in directory 0x{:x} has hash 0x{:08x}, expected 0x{:08x}.",
				String::from_utf8_lossy(name),
				ip.addr,
				dent.hash,
				calculated
			);
			if ctx.query("Fix the hash value? ") {
				let mut de = dent.clone();
				de.hash = calculated;
				let mut buf = bh.borrow_mut();
				de.write(&mut buf.data, off);
				buf.modify();
			}
		}

		if name == b"." {
			if self.ds.dotdir {
				log_err!(
					"Directory 0x{:x} has more than one \".\" entry.",
					ip.addr
				);
				if ctx.query("Clear the duplicate \".\" entry? ") {
					metawalk::dirent_del(bh, prev_off, off);
					return Ok(WalkRet::SkipOne);
				}
			} else if entry.addr != ip.addr {
				log_err!(
					"\".\" entry of directory 0x{:x} points to 0x{:x} instead of itself.",
					ip.addr,
					entry.addr
				);
				if ctx.query("Clear the bad \".\" entry? ") {
					metawalk::dirent_del(bh, prev_off, off);
					return Ok(WalkRet::SkipOne);
				}
			} else {
				self.ds.dotdir = true;
				ctx.incr_link_count(entry, "\".\"");
			}
			self.ds.entry_count += 1;
			*count += 1;
			return Ok(WalkRet::Good);
		}

		if name == b".." {
			if self.ds.dotdotdir {
				log_err!(
					"Directory 0x{:x} has more than one \"..\" entry.",
					ip.addr
				);
				if ctx.query("Clear the duplicate \"..\" entry? ") {
					metawalk::dirent_del(bh, prev_off, off);
					return Ok(WalkRet::SkipOne);
				}
			} else if ctx.block_type(entry.addr) != BlockTag::DirInode {
				log_err!(
					"\"..\" entry of directory 0x{:x} points to a non-directory.",
					ip.addr
				);
				if ctx.query("Clear the bad \"..\" entry? ") {
					metawalk::dirent_del(bh, prev_off, off);
					return Ok(WalkRet::SkipOne);
				}
			} else {
				self.ds.dotdotdir = true;
				let di = ctx.dirtree_insert(ip.addr);
				di.dotdot_parent = entry.addr;
				ctx.incr_link_count(entry, "\"..\"");
			}
			self.ds.entry_count += 1;
			*count += 1;
			return Ok(WalkRet::Good);
		}

		// An ordinary entry must point at something the scan saw as an
		// inode of the advertised type
		let q = ctx.block_type(entry.addr);
		if !q.is_inode() {
			log_err!(
				"Entry \"{}\" in directory 0x{:x} points to 0x{:x}, which is {}.",
				String::from_utf8_lossy(name),
				ip.addr,
				entry.addr,
				q.name()
			);
			if ctx.query("Delete the directory entry? ") {
				metawalk::dirent_del(bh, prev_off, off);
				return Ok(WalkRet::SkipOne);
			}
			self.ds.entry_count += 1;
			*count += 1;
			return Ok(WalkRet::Good);
		}

		match de_type_to_tag(dent.de_type) {
			Some(expected) if expected == q => {}
			_ => {
				log_err!(
					"Entry \"{}\" in directory 0x{:x} has type {} but its target is {}.",
					String::from_utf8_lossy(name),
					ip.addr,
					dent.de_type,
					q.name()
				);
				if ctx.query("Delete the directory entry? ") {
					metawalk::dirent_del(bh, prev_off, off);
					return Ok(WalkRet::SkipOne);
				}
				self.ds.entry_count += 1;
				*count += 1;
				return Ok(WalkRet::Good);
			}
		}

		if q == BlockTag::DirInode {
			// Remember who holds the dentry for the connectivity pass
			let di = ctx.dirtree_insert(entry.addr);
			di.treewalk_parent = ip.addr;
		}
		ctx.incr_link_count(entry, "dentry");
		self.ds.entry_count += 1;
		*count += 1;
		Ok(WalkRet::Good)
	}
}

/// Runs pass 2.
pub fn pass2(ctx: &mut FsckCtx) -> Result<(), FsckError> {
	ctx.skip_this_pass = false;
	log_info!("Checking directory entries.");

	let dirs: Vec<u64> = ctx.dirtree.keys().copied().collect();
	for dir in dirs {
		if ctx.stop_or_skip()? {
			return Ok(());
		}
		if ctx.block_type(dir) != BlockTag::DirInode {
			log_debug!(
				"Skipping directory 0x{:x}; it did not survive the scan.",
				dir
			);
			continue;
		}

		let mut chk = Pass2Checker {
			ds: DirStatus::default(),
		};
		if metawalk::check_dir(ctx, dir, &mut chk)? == WalkRet::Error {
			continue;
		}

		let ip = Inode::load(&ctx.sdp, dir)?;
		if !chk.ds.dotdir {
			log_err!("Directory 0x{:x} has no \".\" entry.", dir);
		}
		if chk.ds.entry_count != ip.di.entries {
			log_err!(
				"Directory 0x{:x} entry count is {}, found {}.",
				dir,
				ip.di.entries,
				chk.ds.entry_count
			);
			if ctx.query("Fix the entry count? ") {
				let mut fixed = Inode::load(&ctx.sdp, dir)?;
				fixed.di.entries = chk.ds.entry_count;
				fixed.save();
			}
		}
	}
	Ok(())
}

#[cfg(test)]
mod test {
	use crate::hash::disk_hash;
	use crate::testfs;
	use crate::testfs::TestFs;

	#[test]
	fn corrupt_dirent_hash_is_rewritten() {
		let mut fs = TestFs::new(4, 1);
		fs.make_file(fs.root, b"victim", b"abc");
		fs.set_dirent_hash(fs.root, b"victim", 0);
		let root = fs.root;
		let path = fs.write_image();

		let ctx = testfs::check_image(&path).unwrap();
		assert_eq!(ctx.errors_found, 1);
		assert_eq!(ctx.errors_corrected, 1);
		assert_eq!(ctx.exit_code(), crate::fsck::FSCK_NONDESTRUCT);

		// Only the hash changed; the entry itself survives
		let data = testfs::read_block(&path, root);
		let de = testfs::find_dirent_in(&data, b"victim").unwrap();
		assert_eq!(de.hash, disk_hash(b"victim"));

		let ctx = testfs::check_image(&path).unwrap();
		assert_eq!(ctx.errors_found, 0);

		std::fs::remove_file(&path).unwrap();
	}

	#[test]
	fn dangling_dirent_is_deleted() {
		let mut fs = TestFs::new(4, 1);
		fs.make_file(fs.root, b"ghost", b"abc");
		let root = fs.root;
		// Point the entry into free space
		let (off, _) = fs.find_dirent(root, b"ghost").unwrap();
		{
			use crate::ondisk::Dirent;
			let data = fs.block_mut(root);
			let mut de = Dirent::read(data, off);
			de.inum.addr += 1000;
			de.write(data, off);
		}
		let path = fs.write_image();

		let ctx = testfs::check_image(&path).unwrap();
		assert!(ctx.errors_found > 0);
		assert_eq!(ctx.errors_found, ctx.errors_corrected);

		// The second run must be clean
		let ctx = testfs::check_image(&path).unwrap();
		assert_eq!(ctx.errors_found, 0);

		std::fs::remove_file(&path).unwrap();
	}
}
