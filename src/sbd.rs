//! The in-core superblock and filesystem geometry.

use crate::buf::BufCache;
use crate::log_err;
use crate::log_notice;
use crate::ondisk::*;
use crate::rgrp::Rgrp;
use crate::FsckError;
use libc::ioctl;
use std::collections::BTreeMap;
use std::fs::File;
use std::fs;
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileTypeExt;
use std::path::Path;

/// ioctl macro: Command.
macro_rules! ioc {
	($a:expr, $b:expr, $c:expr, $d:expr) => {
		(($a) << 30) | (($b) << 8) | ($c) | (($d) << 16)
	};
}

/// ioctl macro: Read command.
macro_rules! ior {
	($a:expr, $b:expr, $c:ty) => {
		ioc!(2, $a, $b, std::mem::size_of::<$c>() as u64)
	};
}

/// ioctl command: Get size of disk in bytes.
const BLKGETSIZE64: u64 = ior!(0x12, 114, u64);

/// Returns the size in bytes of the device at the given path.
pub fn device_size(path: &Path) -> io::Result<u64> {
	let metadata = fs::metadata(path)?;
	let file_type = metadata.file_type();

	if file_type.is_block_device() || file_type.is_char_device() {
		let dev = File::open(path)?;
		let mut size: u64 = 0;

		let ret = unsafe { ioctl(dev.as_raw_fd(), BLKGETSIZE64 as _, &mut size) };
		if ret < 0 {
			return Err(io::Error::last_os_error());
		}

		Ok(size)
	} else if file_type.is_file() {
		Ok(metadata.len())
	} else {
		Ok(0)
	}
}

/// Addresses of the system inodes hanging off the master directory.
#[derive(Default)]
pub struct MasterDir {
	/// The journal index directory.
	pub jiinode: Option<u64>,
	/// The per-node directory.
	pub pinode: Option<u64>,
	/// The next-inode-number file.
	pub inum: Option<u64>,
	/// The statfs file.
	pub statfs: Option<u64>,
	/// The resource group index file.
	pub riinode: Option<u64>,
	/// The quota file.
	pub qinode: Option<u64>,
	/// The journal inodes, in journal-index order.
	pub journals: Vec<u64>,
}

/// The in-core superblock: the open device, the cache, the parsed
/// superblock fields and every derived geometry constant.
pub struct Sbd {
	pub bcache: BufCache,
	pub sb: Superblock,
	/// Block address of the superblock.
	pub sb_addr: u64,
	/// Number of blocks on the device.
	pub fssize: u64,
	/// Pointers per dinode block.
	pub diptrs: u32,
	/// Pointers per indirect block.
	pub inptrs: u32,
	/// Usable bytes per journal block.
	pub jbsize: u32,
	/// Pointers in a full directory hash table.
	pub hash_ptrs: u32,
	/// Bytes of file data addressable at each tree height.
	pub heightsize: [u64; MAX_META_HEIGHT],
	pub max_height: u16,
	/// Resource groups, keyed by header address.
	pub rgtree: BTreeMap<u64, Rgrp>,
	pub md: MasterDir,
	/// The device is mounted read-only somewhere; drop caches on exit.
	pub readonly_mount: bool,
	/// The lock protocol was fenced and must be restored on exit.
	pub proto_fenced: bool,
}

impl Sbd {
	/// Wraps an open device. The superblock is not read yet.
	pub fn new(file: File) -> Self {
		Self {
			bcache: BufCache::new(file, DEFAULT_BSIZE),
			sb: Superblock::default(),
			sb_addr: SUPERBLOCK_OFFSET / DEFAULT_BSIZE as u64,
			fssize: 0,
			diptrs: 0,
			inptrs: 0,
			jbsize: 0,
			hash_ptrs: 0,
			heightsize: [0; MAX_META_HEIGHT],
			max_height: 0,
			rgtree: BTreeMap::new(),
			md: MasterDir::default(),
			readonly_mount: false,
			proto_fenced: false,
		}
	}

	/// Reads and validates the superblock, then computes the geometry
	/// constants.
	pub fn read_sb(&mut self) -> Result<(), FsckError> {
		let mut raw = vec![0; SIZEOF_SB];
		self.bcache.read_raw(SUPERBLOCK_OFFSET, &mut raw)?;

		check_sb(&raw)?;
		self.sb = Superblock::read(&raw);

		if self.sb.bsize < MIN_BSIZE
			|| !self.sb.bsize.is_power_of_two()
			|| self.sb.bsize != 1 << self.sb.bsize_shift
		{
			return Err(FsckError::BadMeta {
				block: SUPERBLOCK_OFFSET / DEFAULT_BSIZE as u64,
				expected: "superblock",
			});
		}

		if self.bcache.bsize() != self.sb.bsize {
			self.bcache.set_bsize(self.sb.bsize)?;
		}
		self.compute_constants()
	}

	/// Fills in every constant derived from the block size.
	pub fn compute_constants(&mut self) -> Result<(), FsckError> {
		let bsize = self.sb.bsize as u64;

		self.sb_addr = SUPERBLOCK_OFFSET / bsize;
		self.diptrs = ((bsize as usize - SIZEOF_DINODE) / 8) as u32;
		self.inptrs = ((bsize as usize - SIZEOF_MH) / 8) as u32;
		self.jbsize = (bsize as usize - SIZEOF_MH) as u32;
		self.hash_ptrs = (bsize / 2 / 8) as u32;

		self.heightsize[0] = bsize - SIZEOF_DINODE as u64;
		let mut h = 1;
		while h < MAX_META_HEIGHT {
			let space = self.heightsize[h - 1].checked_mul(self.inptrs as u64);
			match space {
				Some(space) => self.heightsize[h] = space,
				None => break,
			}
			h += 1;
		}
		self.max_height = h as u16;

		self.fssize = self.bcache.device_size()? / bsize;
		Ok(())
	}

	/// Writes the in-core superblock back to disk.
	pub fn write_sb(&self) -> Result<(), FsckError> {
		let bh = self.bcache.read(self.sb_addr)?;
		let mut buf = bh.borrow_mut();
		self.sb.write(&mut buf.data);
		buf.modify();
		Ok(())
	}

	/// Tells whether a block pointer is inside the filesystem.
	pub fn check_range(&self, block: u64) -> bool {
		block > self.sb_addr && block < self.fssize
	}

	/// Rewrites the lock protocol from `lock_*` to `fsck_*` so that
	/// cluster nodes cannot mount the filesystem during the check.
	pub fn fence_lockproto(&mut self) -> Result<(), FsckError> {
		if self.sb.lockproto.starts_with(b"lock_") {
			self.sb.lockproto[..5].copy_from_slice(b"fsck_");
			self.write_sb()?;
			self.bcache.flush()?;
			self.proto_fenced = true;
		}
		Ok(())
	}

	/// Restores the lock protocol changed by `fence_lockproto`.
	pub fn unfence_lockproto(&mut self) -> Result<(), FsckError> {
		if self.proto_fenced && self.sb.lockproto.starts_with(b"fsck_") {
			self.sb.lockproto[..5].copy_from_slice(b"lock_");
			self.write_sb()?;
			self.bcache.flush()?;
			self.proto_fenced = false;
		}
		Ok(())
	}

	/// Formats the superblock UUID for display.
	pub fn uuid_string(&self) -> String {
		uuid::Uuid::from_bytes(self.sb.uuid).to_string()
	}
}

/// Validates a raw superblock: magic, type and format range.
pub fn check_sb(raw: &[u8]) -> Result<(), FsckError> {
	if !check_meta(raw, METATYPE_SB) {
		return Err(FsckError::BadMeta {
			block: 0,
			expected: "superblock",
		});
	}
	let format = get_u32(raw, 24);
	if !(FS_FORMAT_MIN..=FS_FORMAT_MAX).contains(&format) {
		return Err(FsckError::Unsupported { format });
	}
	Ok(())
}

/// How far the superblock search scans, in bytes.
const SB_SEARCH_LIMIT: u64 = 2 << 30;

/// Candidate system inodes discovered while scanning for a lost
/// superblock.
#[derive(Default)]
struct SbScan {
	master: Option<Inum>,
	root: Option<Inum>,
}

/// Attempts to reconstruct a destroyed superblock: the device carries no
/// readable superblock, or its format field is out of range.
///
/// The first two gigabytes are scanned for a metadata magic at every
/// 512-byte offset; each hit is tried at every power-of-two block size up
/// to the default by checking that the following block at that scale is a
/// bitmap continuation or resource group block. Once the geometry is
/// known, the device is scanned for dinodes: the master directory is the
/// directory with formal number 2, the root the directory with formal
/// number 1.
///
/// Returns the reconstructed superblock; the caller decides whether to
/// write it.
pub fn sb_repair(sdp: &mut Sbd) -> Result<Superblock, FsckError> {
	let dev_len = sdp.bcache.device_size()?;
	let limit = dev_len.min(SB_SEARCH_LIMIT);

	log_notice!("Searching the device for a lost superblock...");

	let bsize = find_block_size(sdp, limit)?.unwrap_or(DEFAULT_BSIZE);
	log_notice!("Assuming a block size of {} bytes.", bsize);

	sdp.sb.bsize = bsize;
	sdp.sb.bsize_shift = bsize.trailing_zeros();
	if sdp.bcache.bsize() != bsize {
		sdp.bcache.set_bsize(bsize)?;
	}
	sdp.compute_constants()?;

	let scan = scan_for_system_inodes(sdp)?;
	let (master, root) = match (scan.master, scan.root) {
		(Some(m), Some(r)) => (m, r),
		_ => {
			log_err!("Unable to locate the master and root directories.");
			return Err(FsckError::BadMeta {
				block: sdp.sb_addr,
				expected: "superblock",
			});
		}
	};

	let mut sb = Superblock {
		fs_format: FS_FORMAT_MAX,
		multihost_format: MULTIHOST_FORMAT,
		bsize,
		bsize_shift: bsize.trailing_zeros(),
		master_dir: master,
		root_dir: root,
		..Default::default()
	};
	sb.lockproto[..11].copy_from_slice(b"lock_nolock");
	sb.uuid = *uuid::Uuid::new_v4().as_bytes();
	Ok(sb)
}

/// Looks for a (superblock offset, block size) pair that produces
/// consistent metadata magics.
fn find_block_size(sdp: &Sbd, limit: u64) -> Result<Option<u32>, FsckError> {
	let mut sector = [0u8; 512];
	let mut off = 0;

	while off < limit {
		let mut probe = off;
		let chunk_end = off + DEFAULT_BSIZE as u64;
		while probe < chunk_end && probe + 512 <= limit {
			sdp.bcache.read_raw(probe, &mut sector)?;
			if get_u32(&sector, 0) == FS_MAGIC {
				let mut bsize = MIN_BSIZE;
				while bsize <= DEFAULT_BSIZE {
					if probe % bsize as u64 == 0
						&& neighbour_is_meta(sdp, probe, bsize)?
					{
						return Ok(Some(bsize));
					}
					bsize <<= 1;
				}
			}
			probe += 512;
		}
		off = chunk_end;
	}
	Ok(None)
}

/// Checks that the block after `off` at the candidate block size carries a
/// bitmap or resource group magic, confirming the scale guess.
fn neighbour_is_meta(sdp: &Sbd, off: u64, bsize: u32) -> Result<bool, FsckError> {
	let mut hdr = [0u8; SIZEOF_MH];
	let next = off + bsize as u64;
	if next + SIZEOF_MH as u64 > sdp.bcache.device_size()? {
		return Ok(false);
	}
	sdp.bcache.read_raw(next, &mut hdr)?;
	let mh = MetaHeader::read(&hdr);
	Ok(mh.magic == FS_MAGIC
		&& matches!(mh.mh_type, METATYPE_RB | METATYPE_RG | METATYPE_DI))
}

/// Scans every block for dinodes and picks out the system roots.
fn scan_for_system_inodes(sdp: &Sbd) -> Result<SbScan, FsckError> {
	let mut scan = SbScan::default();
	let mut hdr = vec![0u8; SIZEOF_DINODE];
	let bsize = sdp.sb.bsize as u64;

	for block in (sdp.sb_addr + 1)..sdp.fssize {
		sdp.bcache.read_raw(block * bsize, &mut hdr)?;
		if !check_meta(&hdr, METATYPE_DI) {
			continue;
		}
		let di = Dinode::read(&hdr);
		if di.num.addr != block || !di.is_dir() {
			continue;
		}
		match di.num.formal_ino {
			2 if scan.master.is_none() => scan.master = Some(di.num),
			1 if scan.root.is_none() => scan.root = Some(di.num),
			_ => {}
		}
		if scan.master.is_some() && scan.root.is_some() {
			break;
		}
	}
	Ok(scan)
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn check_sb_rejects_garbage() {
		let raw = vec![0; SIZEOF_SB];
		assert!(check_sb(&raw).is_err());
	}

	#[test]
	fn check_sb_rejects_bad_format() {
		let mut raw = vec![0; SIZEOF_SB];
		let sb = Superblock {
			fs_format: FS_FORMAT_MAX + 100,
			bsize: 4096,
			bsize_shift: 12,
			..Default::default()
		};
		sb.write(&mut raw);
		assert!(matches!(
			check_sb(&raw),
			Err(FsckError::Unsupported { .. })
		));
	}

	#[test]
	fn check_sb_accepts_valid() {
		let mut raw = vec![0; SIZEOF_SB];
		let sb = Superblock {
			fs_format: FS_FORMAT_MIN,
			bsize: 4096,
			bsize_shift: 12,
			..Default::default()
		};
		sb.write(&mut raw);
		assert!(check_sb(&raw).is_ok());
	}
}
