//! Consistency checker and repair engine for a clustered, journaled
//! filesystem.
//!
//! The filesystem organizes space into fixed resource groups, stores files
//! as tree-structured metadata and keeps one journal per cluster node. The
//! checker replays dirty journals, then walks the whole metadata tree in
//! ordered passes, prompting the operator before every repair:
//!
//! - pass 1 scans every allocated dinode and builds the in-RAM block map;
//! - pass 1b resolves blocks claimed by more than one inode;
//! - pass 1c re-checks extended attributes;
//! - pass 2 verifies directory entries;
//! - pass 3 checks directory connectivity and reattaches orphans;
//! - pass 4 reconciles link counts;
//! - pass 5 rewrites the resource group bitmaps to match what was observed.

pub mod blockmap;
pub mod buf;
pub mod fsck;
pub mod fsops;
pub mod hash;
pub mod initialize;
pub mod inode;
pub mod log;
pub mod lost_found;
pub mod metawalk;
pub mod ondisk;
pub mod pass1;
pub mod pass1b;
pub mod pass1c;
pub mod pass2;
pub mod pass3;
pub mod pass4;
pub mod pass5;
pub mod recovery;
pub mod rgrp;
pub mod sbd;

#[cfg(test)]
pub(crate) mod testfs;

use thiserror::Error;

/// Errors that abort the run. Inconsistencies found on disk are not errors:
/// they are reported, counted and offered for repair by the passes.
#[derive(Debug, Error)]
pub enum FsckError {
	#[error("i/o error: {0}")]
	Io(#[from] std::io::Error),
	#[error("block {block} is out of bounds")]
	BadRange { block: u64 },
	#[error("block {block} is not a valid {expected} block")]
	BadMeta { block: u64, expected: &'static str },
	#[error("unable to allocate {what}")]
	Alloc { what: &'static str },
	#[error("unsupported filesystem format {format}")]
	Unsupported { format: u32 },
	#[error("the check was canceled")]
	Canceled,
}
