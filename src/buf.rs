//! The buffer cache.
//!
//! Disk blocks are read and written through fixed-size pages indexed by
//! block address. A page handle is reference-counted; dropping the last
//! handle leaves the page in the cache until it is evicted or flushed.
//! Dirty pages are written back on eviction and on `flush`.

use crate::FsckError;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::rc::Rc;

/// Soft ceiling on the number of cached pages. Above it, clean unreferenced
/// pages are dropped and dirty unreferenced pages are written back.
const DEFAULT_MAX_CACHED: usize = 4096;

/// One cached disk block.
pub struct Buf {
	/// The block address of the page.
	pub addr: u64,
	/// The page contents.
	pub data: Vec<u8>,
	/// Tells whether the page must be written back.
	pub modified: bool,
}

impl Buf {
	/// Marks the page dirty.
	pub fn modify(&mut self) {
		self.modified = true;
	}
}

/// A reference-counted handle on a cached page.
pub type BufHandle = Rc<RefCell<Buf>>;

/// The cache itself.
pub struct BufCache {
	file: RefCell<File>,
	bsize: u32,
	bufs: RefCell<HashMap<u64, BufHandle>>,
	max_cached: usize,
}

impl BufCache {
	/// Creates a cache on the open device `file` with the given block size.
	pub fn new(file: File, bsize: u32) -> Self {
		Self {
			file: RefCell::new(file),
			bsize,
			bufs: RefCell::new(HashMap::new()),
			max_cached: DEFAULT_MAX_CACHED,
		}
	}

	/// Changes the block size. Any cached page is flushed first.
	pub fn set_bsize(&mut self, bsize: u32) -> Result<(), FsckError> {
		self.flush()?;
		self.bufs.borrow_mut().clear();
		self.bsize = bsize;
		Ok(())
	}

	pub fn bsize(&self) -> u32 {
		self.bsize
	}

	/// Returns a zeroed page for the given block, without reading the disk.
	/// Fails only when making room required a write-back that failed.
	pub fn get(&self, addr: u64) -> Result<BufHandle, FsckError> {
		if let Some(bh) = self.bufs.borrow().get(&addr) {
			return Ok(bh.clone());
		}
		let bh = Rc::new(RefCell::new(Buf {
			addr,
			data: vec![0; self.bsize as usize],
			modified: false,
		}));
		self.insert(addr, bh.clone())?;
		Ok(bh)
	}

	/// Returns the page for the given block, reading it from disk if it is
	/// not cached yet.
	pub fn read(&self, addr: u64) -> Result<BufHandle, FsckError> {
		if let Some(bh) = self.bufs.borrow().get(&addr) {
			return Ok(bh.clone());
		}

		let mut data = vec![0; self.bsize as usize];
		{
			let mut file = self.file.borrow_mut();
			file.seek(SeekFrom::Start(addr * self.bsize as u64))?;
			file.read_exact(&mut data)?;
		}

		let bh = Rc::new(RefCell::new(Buf {
			addr,
			data,
			modified: false,
		}));
		self.insert(addr, bh.clone())?;
		Ok(bh)
	}

	fn insert(&self, addr: u64, bh: BufHandle) -> Result<(), FsckError> {
		let mut bufs = self.bufs.borrow_mut();
		if bufs.len() >= self.max_cached {
			// Drop pages nothing references anymore. A dirty page must
			// reach the disk before it leaves the cache; if the write
			// fails it stays resident and the error surfaces here.
			let mut evict = Vec::new();
			for (a, b) in bufs.iter() {
				if Rc::strong_count(b) == 1 {
					evict.push(*a);
				}
			}
			for a in evict {
				{
					let b = bufs[&a].clone();
					let mut buf = b.borrow_mut();
					if buf.modified {
						self.write_page(&buf)?;
						buf.modified = false;
					}
				}
				bufs.remove(&a);
			}
		}
		bufs.insert(addr, bh);
		Ok(())
	}

	fn write_page(&self, buf: &Buf) -> Result<(), FsckError> {
		let mut file = self.file.borrow_mut();
		file.seek(SeekFrom::Start(buf.addr * self.bsize as u64))?;
		file.write_all(&buf.data)?;
		Ok(())
	}

	/// Writes every dirty page back to disk and syncs the device.
	pub fn flush(&self) -> Result<(), FsckError> {
		let bufs = self.bufs.borrow();
		for bh in bufs.values() {
			let mut buf = bh.borrow_mut();
			if buf.modified {
				self.write_page(&buf)?;
				buf.modified = false;
			}
		}
		drop(bufs);

		self.file.borrow_mut().sync_all()?;
		Ok(())
	}

	/// Reads raw bytes from the device, bypassing the page cache. Used by
	/// the superblock search which runs before the block size is known.
	pub fn read_raw(&self, off: u64, buf: &mut [u8]) -> Result<(), FsckError> {
		let mut file = self.file.borrow_mut();
		file.seek(SeekFrom::Start(off))?;
		file.read_exact(buf)?;
		Ok(())
	}

	/// Returns the size of the device in bytes.
	pub fn device_size(&self) -> Result<u64, FsckError> {
		let size = self.file.borrow_mut().seek(SeekFrom::End(0))?;
		Ok(size)
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use std::fs::OpenOptions;

	fn temp_device(len: usize) -> (std::path::PathBuf, File) {
		use std::sync::atomic::AtomicUsize;
		use std::sync::atomic::Ordering;
		static SEQ: AtomicUsize = AtomicUsize::new(0);

		let path = std::env::temp_dir().join(format!(
			"gfs2fsck-buf-{}-{}",
			std::process::id(),
			SEQ.fetch_add(1, Ordering::Relaxed)
		));
		let file = OpenOptions::new()
			.read(true)
			.write(true)
			.create(true)
			.truncate(true)
			.open(&path)
			.unwrap();
		file.set_len(len as u64).unwrap();
		(path, file)
	}

	#[test]
	fn read_write_cycle() {
		let (path, file) = temp_device(512 * 64);
		let cache = BufCache::new(file, 512);

		{
			let bh = cache.get(3).unwrap();
			let mut buf = bh.borrow_mut();
			buf.data[0] = 0xab;
			buf.data[511] = 0xcd;
			buf.modify();
		}
		cache.flush().unwrap();

		// Re-open to defeat the cache
		let file = OpenOptions::new()
			.read(true)
			.write(true)
			.open(&path)
			.unwrap();
		let cache = BufCache::new(file, 512);
		let bh = cache.read(3).unwrap();
		assert_eq!(bh.borrow().data[0], 0xab);
		assert_eq!(bh.borrow().data[511], 0xcd);

		std::fs::remove_file(path).unwrap();
	}

	#[test]
	fn same_handle_for_same_block() {
		let (path, file) = temp_device(512 * 8);
		let cache = BufCache::new(file, 512);

		let a = cache.read(1).unwrap();
		let b = cache.read(1).unwrap();
		assert!(Rc::ptr_eq(&a, &b));

		std::fs::remove_file(path).unwrap();
	}

	#[test]
	fn clean_pages_not_written() {
		let (path, file) = temp_device(512 * 8);
		let cache = BufCache::new(file, 512);

		let _ = cache.read(0).unwrap();
		cache.flush().unwrap();

		let bh = cache.read(0).unwrap();
		assert!(!bh.borrow().modified);

		std::fs::remove_file(path).unwrap();
	}
}
