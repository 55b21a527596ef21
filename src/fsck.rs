//! The per-run checker state: options, counters, the in-RAM trees and the
//! operator query layer.

use crate::blockmap::BlockMap;
use crate::blockmap::BlockTag;
use crate::log_debug;
use crate::log_err;
use crate::ondisk::Inum;
use crate::rgrp;
use crate::sbd::Sbd;
use crate::FsckError;
use std::collections::BTreeMap;
use std::io::BufRead;
use std::io::Write;
use std::io;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

// Exit codes shared by fsck-type programs.
pub const FSCK_OK: i32 = 0;
pub const FSCK_NONDESTRUCT: i32 = 1;
pub const FSCK_REBOOT: i32 = 2;
pub const FSCK_UNCORRECTED: i32 = 4;
pub const FSCK_ERROR: i32 = 8;
pub const FSCK_USAGE: i32 = 16;
pub const FSCK_CANCELED: i32 = 32;
pub const FSCK_LIBRARY: i32 = 128;

/// How many out-of-range pointers a single inode may accumulate before the
/// checker gives up on its tree.
pub const BAD_POINTER_TOLERANCE: u32 = 10;

static ABORT: AtomicBool = AtomicBool::new(false);

extern "C" fn interrupt(_sig: libc::c_int) {
	ABORT.store(true, Ordering::Relaxed);
}

/// Installs the SIGINT handler setting the abort flag. The flag is polled
/// between inodes and between passes.
pub fn install_interrupt_handler() {
	let handler = interrupt as extern "C" fn(libc::c_int);
	unsafe {
		libc::signal(libc::SIGINT, handler as libc::sighandler_t);
	}
}

/// Tells whether an interrupt is pending.
pub fn interrupted() -> bool {
	ABORT.load(Ordering::Relaxed)
}

/// Command line options relevant to the core.
#[derive(Clone, Default)]
pub struct Options {
	/// Answer yes to every question.
	pub yes: bool,
	/// Answer no to every question (read-only check).
	pub no: bool,
}

/// How a reference to a duplicated block was made.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DupRefType {
	AsData = 0,
	AsMeta = 1,
	AsEa = 2,
	IsInode = 3,
}

impl DupRefType {
	pub fn name(self) -> &'static str {
		match self {
			Self::AsData => "data",
			Self::AsMeta => "metadata",
			Self::AsEa => "extended attribute",
			Self::IsInode => "itself",
		}
	}
}

/// One inode holding references to a duplicated block.
#[derive(Clone, Debug)]
pub struct InodeWithDups {
	/// Address of the referencing inode.
	pub block_no: u64,
	/// Total references from this inode.
	pub dup_count: u32,
	/// References broken down by kind.
	pub reftypecount: [u32; 4],
}

impl InodeWithDups {
	pub fn ref_type(&self) -> DupRefType {
		// The dominant reference kind, inode-itself taking priority
		if self.reftypecount[DupRefType::IsInode as usize] > 0 {
			DupRefType::IsInode
		} else if self.reftypecount[DupRefType::AsEa as usize] > 0 {
			DupRefType::AsEa
		} else if self.reftypecount[DupRefType::AsMeta as usize] > 0 {
			DupRefType::AsMeta
		} else {
			DupRefType::AsData
		}
	}
}

/// One block referenced by more than one inode.
#[derive(Clone, Debug, Default)]
pub struct DupBlock {
	pub block: u64,
	/// Total reference count, the original included.
	pub refs: u32,
	/// The original (first-visited) reference has been identified.
	pub first_ref_found: bool,
	/// Claimants believed valid.
	pub ref_inode_list: Vec<InodeWithDups>,
	/// Claimants already invalidated by earlier checks.
	pub ref_invinode_list: Vec<InodeWithDups>,
}

/// Connectivity bookkeeping for one directory.
#[derive(Clone, Copy, Debug, Default)]
pub struct DirInfo {
	pub dinode: u64,
	/// The parent that holds a dentry naming this directory.
	pub treewalk_parent: u64,
	/// The parent named by this directory's own ".." entry.
	pub dotdot_parent: u64,
	pub checked: bool,
}

/// Link-count bookkeeping for one inode.
#[derive(Clone, Copy, Debug, Default)]
pub struct InodeInfo {
	pub inum: Inum,
	/// The link count the inode itself claims.
	pub nlink: u32,
	/// The references the checker actually saw.
	pub counted_links: u32,
}

/// Everything a run of the checker carries between passes.
pub struct FsckCtx {
	pub sdp: Sbd,
	pub opts: Options,
	pub bmap: BlockMap,
	pub dirtree: BTreeMap<u64, DirInfo>,
	pub inodetree: BTreeMap<u64, InodeInfo>,
	pub dup_blocks: BTreeMap<u64, DupBlock>,
	/// Inodes carrying extended attributes, for the re-check pass.
	pub eattr_inodes: Vec<u64>,
	/// Address of the lost+found directory, once it exists.
	pub lf_dip: Option<u64>,
	pub errors_found: u64,
	pub errors_corrected: u64,
	pub dups_found: u32,
	pub dups_found_first: u32,
	/// Set when the operator asked to skip the rest of the current pass.
	pub skip_this_pass: bool,
}

impl FsckCtx {
	pub fn new(sdp: Sbd, opts: Options) -> Self {
		let bmap = BlockMap::new(sdp.fssize);
		Self {
			sdp,
			opts,
			bmap,
			dirtree: BTreeMap::new(),
			inodetree: BTreeMap::new(),
			dup_blocks: BTreeMap::new(),
			eattr_inodes: Vec::new(),
			lf_dip: None,
			errors_found: 0,
			errors_corrected: 0,
			dups_found: 0,
			dups_found_first: 0,
			skip_this_pass: false,
		}
	}

	/// Asks the operator to confirm a repair. Every call counts one found
	/// error; a yes answer counts one corrected error.
	pub fn query(&mut self, msg: &str) -> bool {
		self.errors_found += 1;
		let answer = self.ask(msg);
		if answer {
			self.errors_corrected += 1;
		}
		answer
	}

	/// Asks the operator a question that is not an error report (journal
	/// replay consent, for example). Counters are untouched.
	pub fn ask(&self, msg: &str) -> bool {
		ask_opts(&self.opts, msg)
	}

	/// Polls the interrupt flag. On an interrupt, offers to abort the run,
	/// skip the rest of the current pass, or continue.
	pub fn poll_interrupt(&mut self) -> Result<(), FsckError> {
		if !ABORT.swap(false, Ordering::Relaxed) {
			return Ok(());
		}
		if self.opts.yes || self.opts.no {
			return Err(FsckError::Canceled);
		}
		loop {
			match prompt_char("Interrupted: (a)bort, (s)kip this pass, (c)ontinue? ") {
				Some('a') => return Err(FsckError::Canceled),
				Some('s') => {
					self.skip_this_pass = true;
					return Ok(());
				}
				Some('c') => return Ok(()),
				Some(_) => continue,
				None => return Err(FsckError::Canceled),
			}
		}
	}

	/// Combined between-inodes check used by the passes.
	pub fn stop_or_skip(&mut self) -> Result<bool, FsckError> {
		self.poll_interrupt()?;
		Ok(self.skip_this_pass)
	}

	/// Tells whether the given block holds one of the system inodes.
	pub fn is_system_inode(&self, block: u64) -> bool {
		let md = &self.sdp.md;
		if block == self.sdp.sb.master_dir.addr || block == self.sdp.sb.root_dir.addr {
			return true;
		}
		if let Some(lf) = self.lf_dip {
			if block == lf {
				return true;
			}
		}
		[md.jiinode, md.pinode, md.inum, md.statfs, md.riinode, md.qinode]
			.iter()
			.any(|a| *a == Some(block))
			|| md.journals.contains(&block)
	}

	/// Records the inferred kind of a block in the block map.
	pub fn blockmap_set(&mut self, block: u64, tag: BlockTag) {
		if self.bmap.set(block, tag).is_err() {
			log_err!(
				"Block 0x{:x} is beyond the end of the filesystem",
				block
			);
		}
	}

	/// Returns the inferred kind of a block, free when out of range.
	pub fn block_type(&self, block: u64) -> BlockTag {
		self.bmap.get(block).unwrap_or(BlockTag::Free)
	}

	/// Makes the on-disk bitmap agree with a block state the checker has
	/// already been authorized to change. No prompting happens here.
	pub fn check_n_fix_bitmap(&mut self, block: u64, tag: BlockTag) -> Result<(), FsckError> {
		let Some(rg_addr) = rgrp::blk2rg_addr(&self.sdp, block) else {
			return Ok(());
		};
		let rg = self.sdp.rgtree.get(&rg_addr).unwrap();
		if !rg.contains(block) {
			return Ok(());
		}
		let cur = rgrp::bitmap_get(&self.sdp, rg, block)?;
		let wanted = tag.to_blkst();
		if cur != wanted {
			log_debug!(
				"Fixing bitmap for block 0x{:x}: {} -> {}",
				block,
				crate::ondisk::blkst_name(cur),
				crate::ondisk::blkst_name(wanted)
			);
			rgrp::bitmap_set(&self.sdp, rg, block, wanted)?;
		}
		Ok(())
	}

	/// Records the on-disk link count of an inode.
	pub fn set_di_nlink(&mut self, inum: Inum, nlink: u32) {
		let ii = self
			.inodetree
			.entry(inum.addr)
			.or_insert_with(|| InodeInfo {
				inum,
				..Default::default()
			});
		ii.nlink = nlink;
	}

	/// Counts one observed reference to an inode.
	pub fn incr_link_count(&mut self, inum: Inum, why: &str) {
		let ii = self
			.inodetree
			.entry(inum.addr)
			.or_insert_with(|| InodeInfo {
				inum,
				..Default::default()
			});
		ii.counted_links += 1;
		log_debug!(
			"Incremented counted links to {} for 0x{:x} ({})",
			ii.counted_links,
			inum.addr,
			why
		);
	}

	/// Discounts one observed reference to an inode.
	pub fn decr_link_count(&mut self, addr: u64, why: &str) {
		if let Some(ii) = self.inodetree.get_mut(&addr) {
			if ii.counted_links > 0 {
				ii.counted_links -= 1;
				log_debug!(
					"Decremented counted links to {} for 0x{:x} ({})",
					ii.counted_links,
					addr,
					why
				);
			}
		}
	}

	/// Records a directory in the connectivity tree.
	pub fn dirtree_insert(&mut self, dinode: u64) -> &mut DirInfo {
		self.dirtree.entry(dinode).or_insert_with(|| DirInfo {
			dinode,
			..Default::default()
		})
	}

	/// Records one reference to a block that turned out to be claimed more
	/// than once.
	///
	/// Arguments:
	/// - `ip_addr` is the referencing inode.
	/// - `block` is the block claimed.
	/// - `reftype` is the way the inode references it.
	/// - `first` is set during the re-scan that looks for the original
	///   reference; the original does not bump the total count.
	/// - `inode_valid` is false when the referencing inode was already
	///   invalidated.
	pub fn add_duplicate_ref(
		&mut self,
		ip_addr: u64,
		block: u64,
		reftype: DupRefType,
		first: bool,
		inode_valid: bool,
	) {
		if !self.sdp.check_range(block) {
			return;
		}
		let system = self.is_system_inode(ip_addr);
		let invalid =
			!inode_valid || self.block_type(ip_addr) == BlockTag::InvalidInode;

		if !self.dup_blocks.contains_key(&block) {
			// The re-scan only cares about known duplicates
			if first {
				return;
			}
			self.dups_found += 1;
			self.dup_blocks.insert(
				block,
				DupBlock {
					block,
					refs: 1,
					..Default::default()
				},
			);
		}
		if first {
			if self.dup_blocks[&block].first_ref_found {
				return;
			}
			self.dups_found_first += 1;
		}

		let dt = self.dup_blocks.get_mut(&block).unwrap();
		if first {
			dt.first_ref_found = true;
		} else {
			dt.refs += 1;
		}

		let list = if invalid {
			&mut dt.ref_invinode_list
		} else {
			&mut dt.ref_inode_list
		};
		let index = match list.iter().position(|id| id.block_no == ip_addr) {
			Some(i) => i,
			None => {
				let id = InodeWithDups {
					block_no: ip_addr,
					dup_count: 0,
					reftypecount: [0; 4],
				};
				// System inodes go first so journal references win over
				// user dinodes when one of the two must be deleted
				if system && !invalid {
					list.insert(0, id);
					0
				} else {
					list.push(id);
					list.len() - 1
				}
			}
		};
		let id = &mut list[index];
		id.reftypecount[reftype as usize] += 1;
		id.dup_count += 1;
		log_debug!(
			"Inode 0x{:x} references block 0x{:x} as {} ({} refs)",
			ip_addr,
			block,
			reftype.name(),
			id.dup_count
		);
	}

	/// Computes the final exit code from the error counters.
	pub fn exit_code(&self) -> i32 {
		exit_code(self.errors_found, self.errors_corrected)
	}
}

/// Derives the exit code from the error counters.
pub fn exit_code(errors_found: u64, errors_corrected: u64) -> i32 {
	if errors_found == 0 {
		FSCK_OK
	} else if errors_corrected == errors_found {
		FSCK_NONDESTRUCT
	} else {
		FSCK_UNCORRECTED
	}
}

/// Asks a yes/no question honoring the -y and -n options. Usable before
/// the full checker context exists.
pub fn ask_opts(opts: &Options, msg: &str) -> bool {
	if opts.no {
		return false;
	}
	if opts.yes {
		return true;
	}
	prompt_yn(msg)
}

/// Shows a yes/no prompt and reads the answer from standard input.
fn prompt_yn(msg: &str) -> bool {
	loop {
		match prompt_char(&format!("{}(y/n) ", msg)) {
			Some('y') => return true,
			Some('n') => return false,
			Some(_) => continue,
			None => return false,
		}
	}
}

/// Shows a prompt and returns the first character of the answer.
fn prompt_char(msg: &str) -> Option<char> {
	print!("{}", msg);
	let _ = io::stdout().flush();

	let input = io::stdin().lock().lines().next()?.ok()?;
	input.trim().chars().next().map(|c| c.to_ascii_lowercase())
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn exit_code_derivation() {
		assert_eq!(exit_code(0, 0), FSCK_OK);
		assert_eq!(exit_code(3, 3), FSCK_NONDESTRUCT);
		assert_eq!(exit_code(3, 1), FSCK_UNCORRECTED);
		assert_eq!(exit_code(3, 0), FSCK_UNCORRECTED);
	}

	#[test]
	fn dup_ref_type_priority() {
		let mut id = InodeWithDups {
			block_no: 1,
			dup_count: 2,
			reftypecount: [1, 0, 0, 1],
		};
		assert_eq!(id.ref_type(), DupRefType::IsInode);
		id.reftypecount[DupRefType::IsInode as usize] = 0;
		assert_eq!(id.ref_type(), DupRefType::AsData);
	}
}
