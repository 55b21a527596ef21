//! The in-RAM block map.
//!
//! During the check, the inferred state of every filesystem block is kept
//! in a dense table of 4-bit tags, two blocks per byte. Disagreement
//! between this map and the on-disk bitmaps is what the final pass
//! reconciles.

use crate::ondisk::BLKST_DINODE;
use crate::ondisk::BLKST_FREE;
use crate::ondisk::BLKST_UNLINKED;
use crate::ondisk::BLKST_USED;

/// The inferred kind of a block.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum BlockTag {
	Free = 0,
	Data = 1,
	Indir = 2,
	DirInode = 3,
	FileInode = 4,
	LnkInode = 5,
	BlkInode = 6,
	ChrInode = 7,
	FifoInode = 8,
	SockInode = 9,
	InvalidInode = 10,
	Jdata = 11,
	InvalidMeta = 12,
	DirLeaf = 13,
	FreeMeta = 14,
	Eattr = 15,
}

impl BlockTag {
	pub fn from_nibble(n: u8) -> Self {
		match n & 0xf {
			0 => Self::Free,
			1 => Self::Data,
			2 => Self::Indir,
			3 => Self::DirInode,
			4 => Self::FileInode,
			5 => Self::LnkInode,
			6 => Self::BlkInode,
			7 => Self::ChrInode,
			8 => Self::FifoInode,
			9 => Self::SockInode,
			10 => Self::InvalidInode,
			11 => Self::Jdata,
			12 => Self::InvalidMeta,
			13 => Self::DirLeaf,
			14 => Self::FreeMeta,
			_ => Self::Eattr,
		}
	}

	/// Tells whether the tag is one of the dinode kinds.
	pub fn is_inode(self) -> bool {
		matches!(
			self,
			Self::DirInode
				| Self::FileInode
				| Self::LnkInode
				| Self::BlkInode
				| Self::ChrInode
				| Self::FifoInode
				| Self::SockInode
		)
	}

	/// Maps the tag to the bitmap state it must be recorded as on disk.
	pub fn to_blkst(self) -> u8 {
		match self {
			Self::Free => BLKST_FREE,
			Self::Data
			| Self::Indir
			| Self::Jdata
			| Self::DirLeaf
			| Self::Eattr => BLKST_USED,
			Self::DirInode
			| Self::FileInode
			| Self::LnkInode
			| Self::BlkInode
			| Self::ChrInode
			| Self::FifoInode
			| Self::SockInode => BLKST_DINODE,
			Self::InvalidInode | Self::InvalidMeta => BLKST_FREE,
			Self::FreeMeta => BLKST_UNLINKED,
		}
	}

	pub fn name(self) -> &'static str {
		match self {
			Self::Free => "free",
			Self::Data => "data",
			Self::Indir => "indirect",
			Self::DirInode => "directory",
			Self::FileInode => "file",
			Self::LnkInode => "symlink",
			Self::BlkInode => "block device",
			Self::ChrInode => "char device",
			Self::FifoInode => "fifo",
			Self::SockInode => "socket",
			Self::InvalidInode => "invalid inode",
			Self::Jdata => "journal data",
			Self::InvalidMeta => "invalid metadata",
			Self::DirLeaf => "directory leaf",
			Self::FreeMeta => "unlinked",
			Self::Eattr => "extended attribute",
		}
	}
}

/// The dense map itself, 4 bits per block.
pub struct BlockMap {
	map: Vec<u8>,
	size: u64,
}

impl BlockMap {
	/// Creates a map covering blocks `0..size`, all tagged free.
	pub fn new(size: u64) -> Self {
		Self {
			map: vec![0; (size as usize + 1) / 2 + 1],
			size,
		}
	}

	pub fn size(&self) -> u64 {
		self.size
	}

	/// Sets the tag for the given block. Out-of-range addresses are
	/// rejected.
	pub fn set(&mut self, block: u64, tag: BlockTag) -> Result<(), ()> {
		if block >= self.size {
			return Err(());
		}
		let byte = &mut self.map[(block >> 1) as usize];
		let shift = ((block & 1) << 2) as u8;
		*byte &= !(0xf << shift);
		*byte |= (tag as u8) << shift;
		Ok(())
	}

	/// Returns the tag of the given block, or `None` when out of range.
	pub fn get(&self, block: u64) -> Option<BlockTag> {
		if block >= self.size {
			return None;
		}
		let byte = self.map[(block >> 1) as usize];
		let shift = ((block & 1) << 2) as u8;
		Some(BlockTag::from_nibble(byte >> shift))
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn set_get() {
		let mut bm = BlockMap::new(100);
		assert_eq!(bm.get(0), Some(BlockTag::Free));

		bm.set(0, BlockTag::DirInode).unwrap();
		bm.set(1, BlockTag::Data).unwrap();
		bm.set(99, BlockTag::Eattr).unwrap();

		assert_eq!(bm.get(0), Some(BlockTag::DirInode));
		assert_eq!(bm.get(1), Some(BlockTag::Data));
		assert_eq!(bm.get(2), Some(BlockTag::Free));
		assert_eq!(bm.get(99), Some(BlockTag::Eattr));
		assert_eq!(bm.get(100), None);
		assert!(bm.set(100, BlockTag::Data).is_err());
	}

	#[test]
	fn set_overwrites() {
		let mut bm = BlockMap::new(8);
		bm.set(3, BlockTag::Eattr).unwrap();
		bm.set(3, BlockTag::Free).unwrap();
		assert_eq!(bm.get(3), Some(BlockTag::Free));
		// The neighbour nibble is untouched
		bm.set(2, BlockTag::Indir).unwrap();
		bm.set(3, BlockTag::Jdata).unwrap();
		assert_eq!(bm.get(2), Some(BlockTag::Indir));
		assert_eq!(bm.get(3), Some(BlockTag::Jdata));
	}

	#[test]
	fn bitmap_state_mapping() {
		assert_eq!(BlockTag::Free.to_blkst(), BLKST_FREE);
		assert_eq!(BlockTag::Data.to_blkst(), BLKST_USED);
		assert_eq!(BlockTag::DirLeaf.to_blkst(), BLKST_USED);
		assert_eq!(BlockTag::Jdata.to_blkst(), BLKST_USED);
		assert_eq!(BlockTag::Eattr.to_blkst(), BLKST_USED);
		assert_eq!(BlockTag::DirInode.to_blkst(), BLKST_DINODE);
		assert_eq!(BlockTag::SockInode.to_blkst(), BLKST_DINODE);
		assert_eq!(BlockTag::InvalidInode.to_blkst(), BLKST_FREE);
		assert_eq!(BlockTag::FreeMeta.to_blkst(), BLKST_UNLINKED);
	}

	#[test]
	fn nibble_roundtrip() {
		for n in 0u8..16 {
			assert_eq!(BlockTag::from_nibble(n) as u8, n);
		}
	}
}
