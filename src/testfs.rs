//! Builds miniature filesystem images for the test suite.
//!
//! The builder lays out a complete small filesystem in memory the same
//! way a format tool would: superblock, evenly spaced resource groups,
//! the master and root directory trees, the system inodes and initialized
//! journals. Tests then corrupt the image in controlled ways and run the
//! passes over it.

use crate::buf::Buf;
use crate::buf::BufHandle;
use crate::fsck::FsckCtx;
use crate::fsck::Options;
use crate::fsops;
use crate::hash::disk_hash;
use crate::initialize;
use crate::ondisk::*;
use crate::rgrp::rgblocks2bitblocks;
use crate::rgrp::Rgrp;
use crate::FsckError;
use std::cell::RefCell;
use std::path::Path;
use std::path::PathBuf;
use std::rc::Rc;

/// Block size used by the test images; small enough to keep them tiny.
pub const TEST_BSIZE: u32 = 512;
/// Total image size in blocks.
const TEST_BLOCKS: u64 = 8192;
/// Log blocks per journal.
const JOURNAL_BLOCKS: u32 = 16;

/// A filesystem image under construction.
pub struct TestFs {
	img: Vec<u8>,
	rgs: Vec<Rgrp>,
	next_formal: u64,

	pub master: u64,
	pub root: u64,
	pub jindex: u64,
	pub per_node: u64,
	pub inum: u64,
	pub statfs: u64,
	pub rindex: u64,
	pub quota: u64,
	pub journals: Vec<u64>,
	/// Physical data blocks of each journal.
	pub journal_blocks: Vec<Vec<u64>>,
}

impl TestFs {
	/// Builds a clean filesystem with the given number of resource groups
	/// and journals.
	pub fn new(nrg: u32, njournals: u32) -> Self {
		let mut fs = Self {
			img: vec![0; (TEST_BLOCKS * TEST_BSIZE as u64) as usize],
			rgs: Vec::new(),
			next_formal: 1,
			master: 0,
			root: 0,
			jindex: 0,
			per_node: 0,
			inum: 0,
			statfs: 0,
			rindex: 0,
			quota: 0,
			journals: Vec::new(),
			journal_blocks: Vec::new(),
		};

		fs.build_rgs(nrg);

		// The root comes first so its formal number is 1, the master's 2
		let root = fs.alloc_dinode();
		let master = fs.alloc_dinode();
		fs.root = root;
		fs.master = master;
		let root_inum = Inum {
			formal_ino: fs.take_formal(),
			addr: root,
		};
		let master_inum = Inum {
			formal_ino: fs.take_formal(),
			addr: master,
		};
		fs.write_dir_dinode(root, root_inum, root_inum);
		fs.write_dir_dinode(master, master_inum, master_inum);

		fs.jindex = fs.make_dir(master, b"jindex");
		fs.per_node = fs.make_dir(master, b"per_node");
		fs.inum = fs.make_file(master, b"inum", &[0u8; 8]);
		fs.statfs = fs.make_file(master, b"statfs", &[0u8; 24]);
		let rindex_content = vec![0u8; fs.rgs.len() * SIZEOF_RINDEX];
		fs.rindex = fs.make_file(master, b"rindex", &rindex_content);
		fs.quota = fs.make_file(master, b"quota", &[]);

		for j in 0..njournals {
			fs.make_journal(j);
		}
		fs
	}

	fn build_rgs(&mut self, nrg: u32) {
		let first = SUPERBLOCK_OFFSET / TEST_BSIZE as u64 + 1;
		let spacing = (TEST_BLOCKS - first) / nrg as u64;
		// Keep length + data exactly equal to the spacing
		let spacing = spacing - (spacing % NBBY as u64) + 2;

		let mut addr = first;
		for _ in 0..nrg {
			if addr + spacing > TEST_BLOCKS {
				break;
			}
			let (length, data) = rgblocks2bitblocks(TEST_BSIZE, spacing as u32);
			let mut rg = Rgrp {
				addr,
				length,
				data0: addr + length as u64,
				data,
				bitbytes: data / NBBY,
				free: data,
				..Default::default()
			};
			rg.compute_bitstructs(TEST_BSIZE).unwrap();

			// Continuation bitmap blocks carry their own header
			for i in 1..length {
				let blk = (addr + i as u64) as usize * TEST_BSIZE as usize;
				MetaHeader::new(METATYPE_RB, FORMAT_RB)
					.write(&mut self.img[blk..blk + SIZEOF_MH]);
			}
			self.rgs.push(rg);
			addr += spacing;
		}
	}

	fn take_formal(&mut self) -> u64 {
		let n = self.next_formal;
		self.next_formal += 1;
		n
	}

	/// Returns one block of the image.
	pub fn block_mut(&mut self, block: u64) -> &mut [u8] {
		let off = block as usize * TEST_BSIZE as usize;
		&mut self.img[off..off + TEST_BSIZE as usize]
	}

	pub fn block(&self, block: u64) -> &[u8] {
		let off = block as usize * TEST_BSIZE as usize;
		&self.img[off..off + TEST_BSIZE as usize]
	}

	/// Rewrites the allocation state of a block in its group's bitmap.
	pub fn set_bitmap(&mut self, block: u64, state: u8) {
		let rg = self
			.rgs
			.iter()
			.position(|rg| rg.contains(block))
			.expect("block outside every resource group");
		let rel = (block - self.rgs[rg].data0) as u32;
		let mut index = 0;
		for (i, bi) in self.rgs[rg].bits.iter().enumerate() {
			if rel < (bi.start + bi.len) * NBBY {
				index = i;
				break;
			}
		}
		let bi = self.rgs[rg].bits[index];
		let blk = self.rgs[rg].addr + index as u64;
		let byte = (bi.offset + (rel / NBBY - bi.start)) as usize;
		let bit = (rel % NBBY) * BIT_SIZE;

		let data = self.block_mut(blk);
		let cur = (data[byte] >> bit) & BIT_MASK;
		data[byte] ^= cur << bit;
		data[byte] |= (state & BIT_MASK) << bit;
	}

	/// Allocates the next free block and marks it in the bitmap.
	fn alloc(&mut self, state: u8) -> u64 {
		for i in 0..self.rgs.len() {
			let rg = &self.rgs[i];
			let used = rg.data - rg.free;
			if rg.free == 0 {
				continue;
			}
			let block = rg.data0 + used as u64;
			self.rgs[i].free -= 1;
			if state == BLKST_DINODE {
				self.rgs[i].dinodes += 1;
			}
			self.set_bitmap(block, state);
			return block;
		}
		panic!("test image out of space");
	}

	fn alloc_dinode(&mut self) -> u64 {
		self.alloc(BLKST_DINODE)
	}

	fn alloc_data(&mut self) -> u64 {
		self.alloc(BLKST_USED)
	}

	/// Writes a stuffed directory dinode with "." and ".." entries.
	fn write_dir_dinode(&mut self, block: u64, inum: Inum, parent: Inum) {
		let bsize = TEST_BSIZE as usize;
		let data = self.block_mut(block);

		Dinode {
			header: MetaHeader::new(METATYPE_DI, FORMAT_DI),
			num: inum,
			mode: 0o040755,
			nlink: 2,
			size: (bsize - SIZEOF_DINODE) as u64,
			blocks: 1,
			payload_format: FORMAT_DE,
			entries: 2,
			..Default::default()
		}
		.write(data);

		let dot = Dirent {
			inum,
			hash: disk_hash(b"."),
			rec_len: dirent_size(1) as u16,
			name_len: 1,
			de_type: DT_DIR,
		};
		let mut off = SIZEOF_DINODE;
		dot.write(data, off);
		data[off + SIZEOF_DIRENT] = b'.';
		off += dot.rec_len as usize;

		let dotdot = Dirent {
			inum: parent,
			hash: disk_hash(b".."),
			rec_len: (bsize - off) as u16,
			name_len: 2,
			de_type: DT_DIR,
		};
		dotdot.write(data, off);
		data[off + SIZEOF_DIRENT..off + SIZEOF_DIRENT + 2].copy_from_slice(b"..");
	}

	/// Wraps one image block in a buffer handle so the crate's directory
	/// code can operate on it.
	fn block_handle(&self, block: u64) -> BufHandle {
		Rc::new(RefCell::new(Buf {
			addr: block,
			data: self.block(block).to_vec(),
			modified: false,
		}))
	}

	fn store_handle(&mut self, bh: &BufHandle) {
		let buf = bh.borrow();
		let block = buf.addr;
		self.block_mut(block).copy_from_slice(&buf.data);
	}

	/// Adds a directory entry to a stuffed directory.
	pub fn add_dirent(&mut self, dir: u64, name: &[u8], inum: Inum, de_type: u8) {
		let bh = self.block_handle(dir);
		let ok = fsops::insert_in_block(
			TEST_BSIZE as usize,
			&bh,
			SIZEOF_DINODE,
			name,
			inum,
			disk_hash(name),
			de_type,
		);
		assert!(ok, "no room in test directory");
		self.store_handle(&bh);

		let data = self.block_mut(dir);
		let mut di = Dinode::read(data);
		di.entries += 1;
		if de_type == DT_DIR {
			di.nlink += 1;
		}
		di.write(data);
	}

	/// Finds a named entry in a stuffed directory: (offset, previous
	/// record offset).
	pub fn find_dirent(&self, dir: u64, name: &[u8]) -> Option<(usize, Option<usize>)> {
		let data = self.block(dir);
		let mut off = SIZEOF_DINODE;
		let mut prev = None;
		loop {
			let de = Dirent::read(data, off);
			let name_end = off + SIZEOF_DIRENT + de.name_len as usize;
			if !de.is_sentinel()
				&& &data[off + SIZEOF_DIRENT..name_end] == name
			{
				return Some((off, prev));
			}
			if off + de.rec_len as usize >= TEST_BSIZE as usize || de.rec_len == 0 {
				return None;
			}
			prev = Some(off);
			off += de.rec_len as usize;
		}
	}

	/// Removes a named entry from a stuffed directory, leaving the record
	/// chain intact (the previous record absorbs the space).
	pub fn remove_dirent(&mut self, dir: u64, name: &[u8]) {
		let (off, prev) = self.find_dirent(dir, name).expect("entry not found");
		let data = self.block_mut(dir);
		let cur = Dirent::read(data, off);
		match prev {
			Some(p) => {
				let mut pde = Dirent::read(data, p);
				pde.rec_len += cur.rec_len;
				pde.write(data, p);
			}
			None => {
				let mut sent = cur;
				sent.inum = Inum::default();
				sent.name_len = 0;
				sent.write(data, off);
			}
		}
		let mut di = Dinode::read(data);
		di.entries -= 1;
		di.write(data);
	}

	/// Overwrites the stored hash of a named directory entry.
	pub fn set_dirent_hash(&mut self, dir: u64, name: &[u8], hash: u32) {
		let (off, _) = self.find_dirent(dir, name).expect("entry not found");
		let data = self.block_mut(dir);
		let mut de = Dirent::read(data, off);
		de.hash = hash;
		de.write(data, off);
	}

	/// Creates a subdirectory.
	pub fn make_dir(&mut self, parent: u64, name: &[u8]) -> u64 {
		let block = self.alloc_dinode();
		let inum = Inum {
			formal_ino: self.take_formal(),
			addr: block,
		};
		let parent_inum = Dinode::read(self.block(parent)).num;
		self.write_dir_dinode(block, inum, parent_inum);
		self.add_dirent(parent, name, inum, DT_DIR);
		block
	}

	/// Creates a regular file. Content beyond the stuffed capacity goes
	/// into allocated data blocks behind a height-one tree.
	pub fn make_file(&mut self, parent: u64, name: &[u8], content: &[u8]) -> u64 {
		let bsize = TEST_BSIZE as usize;
		let block = self.alloc_dinode();
		let inum = Inum {
			formal_ino: self.take_formal(),
			addr: block,
		};

		let stuffed = content.len() <= bsize - SIZEOF_DINODE;
		let mut di = Dinode {
			header: MetaHeader::new(METATYPE_DI, FORMAT_DI),
			num: inum,
			mode: 0o100644,
			nlink: 1,
			size: content.len() as u64,
			blocks: 1,
			..Default::default()
		};

		if stuffed {
			let data = self.block_mut(block);
			di.write(data);
			data[SIZEOF_DINODE..SIZEOF_DINODE + content.len()].copy_from_slice(content);
		} else {
			let nblocks = content.len().div_ceil(bsize);
			let mut ptrs = Vec::new();
			for i in 0..nblocks {
				let dblock = self.alloc_data();
				let chunk = &content[i * bsize..(content.len()).min((i + 1) * bsize)];
				self.block_mut(dblock)[..chunk.len()].copy_from_slice(chunk);
				ptrs.push(dblock);
			}
			di.height = 1;
			di.blocks = 1 + nblocks as u64;
			let data = self.block_mut(block);
			di.write(data);
			for (i, ptr) in ptrs.iter().enumerate() {
				put_u64(data, SIZEOF_DINODE + i * 8, *ptr);
			}
		}

		self.add_dirent(parent, name, inum, DT_REG);
		block
	}

	/// Creates one journal: a height-one file whose data blocks all carry
	/// clean log headers.
	fn make_journal(&mut self, j: u32) {
		let jnl = self.alloc_dinode();
		let inum = Inum {
			formal_ino: self.take_formal(),
			addr: jnl,
		};

		let mut blocks = Vec::new();
		for lblk in 0..JOURNAL_BLOCKS {
			let dblock = self.alloc_data();
			let data = self.block_mut(dblock);
			LogHeader {
				sequence: lblk as u64 + 1,
				flags: LOG_HEAD_UNMOUNT,
				tail: lblk,
				blkno: lblk,
				hash: 0,
			}
			.write(data);
			blocks.push(dblock);
		}

		let di = Dinode {
			header: MetaHeader::new(METATYPE_DI, FORMAT_DI),
			num: inum,
			mode: 0o100600,
			nlink: 1,
			size: JOURNAL_BLOCKS as u64 * TEST_BSIZE as u64,
			blocks: 1 + JOURNAL_BLOCKS as u64,
			height: 1,
			flags: DIF_SYSTEM,
			..Default::default()
		};
		let data = self.block_mut(jnl);
		di.write(data);
		for (i, ptr) in blocks.iter().enumerate() {
			put_u64(data, SIZEOF_DINODE + i * 8, *ptr);
		}

		let name = format!("journal{}", j);
		self.add_dirent(self.jindex, name.as_bytes(), inum, DT_REG);
		self.journals.push(jnl);
		self.journal_blocks.push(blocks);
	}

	/// Replaces one journal's content with a dirty log: a head without the
	/// unmount flag, one metadata descriptor and its payload.
	pub fn make_journal_dirty(&mut self, j: usize, target: u64, payload: &[u8]) {
		let blocks = self.journal_blocks[j].clone();

		// Log block 0: the head, dirty, tail pointing at the descriptor.
		// The sequence is far past every header left from initialization.
		{
			let data = self.block_mut(blocks[0]);
			data.fill(0);
			LogHeader {
				sequence: 100,
				flags: 0,
				tail: 1,
				blkno: 0,
				hash: 0,
			}
			.write(data);
		}
		// Log block 1: a metadata descriptor replaying one block
		{
			let data = self.block_mut(blocks[1]);
			data.fill(0);
			LogDescriptor {
				ld_type: LOG_DESC_METADATA,
				length: 2,
				data1: 1,
				data2: 0,
			}
			.write(data);
			put_u64(data, SIZEOF_LOG_DESC, target);
		}
		// Log block 2: the journaled copy of the target block
		{
			let data = self.block_mut(blocks[2]);
			data.copy_from_slice(payload);
		}
	}

	/// Writes the superblock, the group headers and the bookkeeping files,
	/// completing the image.
	fn finalize(&mut self) {
		// Superblock
		let master_inum = Dinode::read(self.block(self.master)).num;
		let root_inum = Dinode::read(self.block(self.root)).num;
		let mut sb = Superblock {
			fs_format: FS_FORMAT_MAX,
			multihost_format: MULTIHOST_FORMAT,
			bsize: TEST_BSIZE,
			bsize_shift: TEST_BSIZE.trailing_zeros(),
			master_dir: master_inum,
			root_dir: root_inum,
			..Default::default()
		};
		sb.lockproto[..11].copy_from_slice(b"lock_nolock");
		sb.locktable[..6].copy_from_slice(b"testfs");
		sb.uuid = [0x42; 16];
		let sb_addr = SUPERBLOCK_OFFSET / TEST_BSIZE as u64;
		sb.write(self.block_mut(sb_addr));

		// Resource group headers
		for i in 0..self.rgs.len() {
			let rg = self.rgs[i].clone();
			let hdr = RgHeader {
				flags: 0,
				free: rg.free,
				dinodes: rg.dinodes,
				used_meta: 0,
				free_meta: 0,
				data0: rg.data0,
				length: rg.length,
				data: rg.data,
				bitbytes: rg.bitbytes,
			};
			hdr.write(self.block_mut(rg.addr));
		}

		// The resource group index content
		let entries: Vec<RIndex> = self.rgs.iter().map(|rg| rg.to_rindex()).collect();
		let mut content = vec![0u8; entries.len() * SIZEOF_RINDEX];
		for (i, ri) in entries.iter().enumerate() {
			ri.write(&mut content[i * SIZEOF_RINDEX..]);
		}
		self.write_file_content(self.rindex, &content);

		// The next formal inode number
		let next = self.next_formal;
		self.write_file_content(self.inum, &next.to_be_bytes());
	}

	/// Overwrites a file's existing content in the image.
	fn write_file_content(&mut self, file: u64, content: &[u8]) {
		let bsize = TEST_BSIZE as usize;
		let di = Dinode::read(self.block(file));
		assert!(content.len() as u64 <= di.size.max(1) || di.height == 0);

		if di.height == 0 {
			let data = self.block_mut(file);
			data[SIZEOF_DINODE..SIZEOF_DINODE + content.len()].copy_from_slice(content);
		} else {
			let ptrs: Vec<u64> = (0..content.len().div_ceil(bsize))
				.map(|i| get_u64(self.block(file), SIZEOF_DINODE + i * 8))
				.collect();
			for (i, ptr) in ptrs.iter().enumerate() {
				let chunk =
					&content[i * bsize..content.len().min((i + 1) * bsize)];
				self.block_mut(*ptr)[..chunk.len()].copy_from_slice(chunk);
			}
		}
	}

	/// Returns pointer slot `index` of a height-one inode.
	pub fn di_pointer(&self, dinode: u64, index: usize) -> u64 {
		get_u64(self.block(dinode), SIZEOF_DINODE + index * 8)
	}

	/// Overwrites pointer slot `index` of a height-one inode.
	pub fn set_di_pointer(&mut self, dinode: u64, index: usize, target: u64) {
		put_u64(self.block_mut(dinode), SIZEOF_DINODE + index * 8, target);
	}

	/// Marks an allocated block free again, bitmap and counters both.
	pub fn release_block(&mut self, block: u64) {
		self.set_bitmap(block, BLKST_FREE);
		if let Some(rg) = self.rgs.iter_mut().find(|rg| rg.contains(block)) {
			rg.free += 1;
		}
	}

	/// Drifts the bitmap: the block reads as free while its group counter
	/// agrees with the drifted bitmap.
	pub fn drift_free(&mut self, block: u64) {
		self.release_block(block);
	}

	/// Writes the image to a fresh temporary file.
	pub fn write_image(&mut self) -> PathBuf {
		self.finalize();
		use std::sync::atomic::AtomicUsize;
		use std::sync::atomic::Ordering;
		static SEQ: AtomicUsize = AtomicUsize::new(0);

		let path = std::env::temp_dir().join(format!(
			"gfs2fsck-img-{}-{}",
			std::process::id(),
			SEQ.fetch_add(1, Ordering::Relaxed)
		));
		std::fs::write(&path, &self.img).unwrap();
		path
	}
}

/// Reads one block out of a written image.
pub fn read_block(path: &Path, block: u64) -> Vec<u8> {
	let img = std::fs::read(path).unwrap();
	let off = block as usize * TEST_BSIZE as usize;
	img[off..off + TEST_BSIZE as usize].to_vec()
}

/// Finds a named entry in a directory block read from a written image.
pub fn find_dirent_in(data: &[u8], name: &[u8]) -> Option<Dirent> {
	let mut off = SIZEOF_DINODE;
	loop {
		let de = Dirent::read(data, off);
		let name_end = off + SIZEOF_DIRENT + de.name_len as usize;
		if !de.is_sentinel() && &data[off + SIZEOF_DIRENT..name_end] == name {
			return Some(de);
		}
		if off + de.rec_len as usize >= data.len() || de.rec_len == 0 {
			return None;
		}
		off += de.rec_len as usize;
	}
}

/// Runs every pass over an image with the -y option.
///
/// Returns the context after the run so tests can inspect the counters.
pub fn check_image(path: &Path) -> Result<FsckCtx, FsckError> {
	let opts = Options {
		yes: true,
		no: false,
	};
	let mut ctx = initialize::initialize(path, opts)?;
	crate::pass1::pass1(&mut ctx)?;
	crate::pass1b::pass1b(&mut ctx)?;
	crate::pass1c::pass1c(&mut ctx)?;
	crate::pass2::pass2(&mut ctx)?;
	crate::pass3::pass3(&mut ctx)?;
	crate::pass4::pass4(&mut ctx)?;
	crate::pass5::pass5(&mut ctx)?;
	initialize::destroy(&mut ctx)?;
	Ok(ctx)
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn clean_filesystem_checks_clean() {
		let mut fs = TestFs::new(4, 2);
		let path = fs.write_image();
		let before = std::fs::read(&path).unwrap();

		let ctx = check_image(&path).unwrap();
		assert_eq!(ctx.errors_found, 0);
		assert_eq!(ctx.errors_corrected, 0);
		assert_eq!(ctx.exit_code(), crate::fsck::FSCK_OK);

		// A clean filesystem must come out byte-identical
		let after = std::fs::read(&path).unwrap();
		assert_eq!(before, after);

		std::fs::remove_file(&path).unwrap();
	}

	#[test]
	fn clean_filesystem_with_files_checks_clean() {
		let mut fs = TestFs::new(4, 2);
		let sub = fs.make_dir(fs.root, b"sub");
		fs.make_file(fs.root, b"small", b"hello world");
		fs.make_file(sub, b"big", &vec![7u8; 3 * TEST_BSIZE as usize]);
		let path = fs.write_image();

		let ctx = check_image(&path).unwrap();
		assert_eq!(ctx.errors_found, 0);
		assert_eq!(ctx.exit_code(), crate::fsck::FSCK_OK);

		std::fs::remove_file(&path).unwrap();
	}

	#[test]
	fn check_is_idempotent_after_repair() {
		let mut fs = TestFs::new(4, 2);
		let file = fs.make_file(fs.root, b"doomed", b"data");
		// Orphan the file
		fs.remove_dirent(fs.root, b"doomed");
		let path = fs.write_image();

		let ctx = check_image(&path).unwrap();
		assert!(ctx.errors_found > 0);
		assert_eq!(ctx.errors_found, ctx.errors_corrected);
		assert_eq!(ctx.exit_code(), crate::fsck::FSCK_NONDESTRUCT);
		let _ = file;

		// The second run must find nothing
		let ctx = check_image(&path).unwrap();
		assert_eq!(ctx.errors_found, 0);
		assert_eq!(ctx.exit_code(), crate::fsck::FSCK_OK);

		std::fs::remove_file(&path).unwrap();
	}
}
