//! Pass 1c: re-check extended attributes.
//!
//! Pass 1 marked the attribute blocks; this pass validates the entries
//! inside them and offers to strip whatever cannot be parsed.

use crate::buf::BufHandle;
use crate::fsck::FsckCtx;
use crate::inode::Inode;
use crate::log_err;
use crate::log_info;
use crate::metawalk;
use crate::metawalk::DeleteOps;
use crate::metawalk::WalkOps;
use crate::metawalk::WalkRet;
use crate::ondisk::*;
use crate::FsckError;

/// The highest attribute namespace number in use.
const EATYPE_MAX: u8 = 4;

struct Pass1cChecker;

impl Pass1cChecker {
	/// Strips the whole attribute chain off an inode: the blocks pass 1
	/// claimed are freed again and the dinode forgets them.
	fn clear_eattrs(&self, ctx: &mut FsckCtx, ip_addr: u64) -> Result<(), FsckError> {
		let ip = Inode::load(&ctx.sdp, ip_addr)?;
		let mut del = DeleteOps;
		metawalk::check_inode_eattr(ctx, &ip, &mut del)?;

		let mut fixed = Inode::load(&ctx.sdp, ip_addr)?;
		fixed.di.eattr = 0;
		fixed.di.flags &= !DIF_EA_INDIRECT;
		fixed.save();
		Ok(())
	}
}

impl WalkOps for Pass1cChecker {
	fn check_eattr_indir(
		&mut self,
		ctx: &mut FsckCtx,
		ip: &Inode,
		block: u64,
		_parent: u64,
	) -> Result<WalkRet, FsckError> {
		let good = ctx.sdp.check_range(block)
			&& check_meta(&ctx.sdp.bcache.read(block)?.borrow().data, METATYPE_IN);
		if good {
			return Ok(WalkRet::Good);
		}
		log_err!(
			"Inode 0x{:x} has a bad indirect extended attribute block 0x{:x}.",
			ip.addr,
			block
		);
		if ctx.query("Clear the inode's extended attributes? ") {
			self.clear_eattrs(ctx, ip.addr)?;
		}
		Ok(WalkRet::SkipSubtree)
	}

	fn check_eattr_leaf(
		&mut self,
		ctx: &mut FsckCtx,
		ip: &Inode,
		block: u64,
		parent: u64,
	) -> Result<WalkRet, FsckError> {
		let good = ctx.sdp.check_range(block)
			&& check_meta(&ctx.sdp.bcache.read(block)?.borrow().data, METATYPE_EA);
		if good {
			return Ok(WalkRet::Good);
		}
		log_err!(
			"Inode 0x{:x} has a bad extended attribute leaf 0x{:x}.",
			ip.addr,
			block
		);
		if parent == ip.addr && ctx.query("Clear the inode's extended attributes? ") {
			self.clear_eattrs(ctx, ip.addr)?;
		}
		Ok(WalkRet::SkipOne)
	}

	fn check_eattr_entry(
		&mut self,
		ctx: &mut FsckCtx,
		ip: &Inode,
		bh: &BufHandle,
		off: usize,
		hdr: &EaHeader,
		prev_off: Option<usize>,
	) -> Result<WalkRet, FsckError> {
		let bsize = ctx.sdp.bcache.bsize() as usize;

		let unused = hdr.ea_type == 0 && hdr.name_len == 0;
		let bad = hdr.ea_type > EATYPE_MAX
			|| (!unused && hdr.name_len == 0)
			|| (hdr.rec_len as usize) < hdr.ptrs_offset()
			|| off + hdr.rec_len as usize > bsize && !hdr.is_last();
		if !bad {
			return Ok(WalkRet::Good);
		}

		log_err!(
			"Inode 0x{:x} has a corrupt extended attribute entry (type {}, name length {}).",
			ip.addr,
			hdr.ea_type,
			hdr.name_len
		);
		if !ctx.query("Clear the bad extended attribute? ") {
			log_err!("The bad extended attribute was not fixed.");
			return Ok(WalkRet::SkipOne);
		}

		let mut buf = bh.borrow_mut();
		match prev_off {
			Some(p) => {
				// The previous record absorbs this one
				let mut prev = EaHeader::read(&buf.data, p);
				prev.rec_len = prev.rec_len.saturating_add(hdr.rec_len);
				prev.flags |= hdr.flags & EAFLAG_LAST;
				prev.write(&mut buf.data, p);
			}
			None => {
				// Degrade the first record to an unused entry
				let mut cleared = *hdr;
				cleared.ea_type = 0;
				cleared.name_len = 0;
				cleared.data_len = 0;
				cleared.num_ptrs = 0;
				cleared.write(&mut buf.data, off);
			}
		}
		buf.modify();
		Ok(WalkRet::SkipOne)
	}

	fn check_eattr_extentry(
		&mut self,
		ctx: &mut FsckCtx,
		ip: &Inode,
		index: usize,
		ptr: u64,
		bh: &BufHandle,
		entry_off: usize,
		hdr: &EaHeader,
	) -> Result<WalkRet, FsckError> {
		if ptr == 0 || ctx.sdp.check_range(ptr) {
			return Ok(WalkRet::Good);
		}
		log_err!(
			"Inode 0x{:x} has an extended attribute value pointer 0x{:x} out of range.",
			ip.addr,
			ptr
		);
		if !ctx.query("Repair the bad extended attribute? ") {
			log_err!("The bad extended attribute was not fixed.");
			return Ok(WalkRet::SkipOne);
		}

		// Truncate the value at the bad pointer
		let mut buf = bh.borrow_mut();
		let mut fixed = *hdr;
		fixed.num_ptrs = index as u8;
		fixed.data_len = (index * ctx.sdp.jbsize as usize) as u32;
		fixed.write(&mut buf.data, entry_off);
		put_u64(&mut buf.data, entry_off + hdr.ptrs_offset() + index * 8, 0);
		buf.modify();
		Ok(WalkRet::Error)
	}
}

/// Runs pass 1c.
pub fn pass1c(ctx: &mut FsckCtx) -> Result<(), FsckError> {
	ctx.skip_this_pass = false;
	log_info!("Re-checking extended attributes.");

	for addr in ctx.eattr_inodes.clone() {
		if ctx.stop_or_skip()? {
			return Ok(());
		}
		if !ctx.block_type(addr).is_inode() {
			continue;
		}
		let ip = Inode::load(&ctx.sdp, addr)?;
		if ip.di.eattr == 0 {
			continue;
		}
		let mut chk = Pass1cChecker;
		metawalk::check_inode_eattr(ctx, &ip, &mut chk)?;
	}
	Ok(())
}
