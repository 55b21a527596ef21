//! Journal recovery.
//!
//! Each journal is a regular file holding a circular log of headers and
//! descriptors. Recovery finds the newest log head, verifies the sequence
//! numbering, then replays the active region in two passes: revokes first,
//! then metadata and journaled data.

use crate::buf::BufHandle;
use crate::fsck::FsckCtx;
use crate::inode::block_map;
use crate::inode::Inode;
use crate::log_err;
use crate::log_info;
use crate::log_notice;
use crate::metawalk;
use crate::metawalk::WalkOps;
use crate::metawalk::WalkRet;
use crate::ondisk::*;
use crate::FsckError;

/// How many sequencing errors a journal may show before it is declared
/// unrecoverable.
const JOURNAL_SEQ_TOLERANCE: u32 = 10;

/// One recorded revoke: the revoked block and the journal position where
/// the revoke was logged.
struct RevokeReplay {
	blkno: u64,
	position: u32,
}

#[derive(Default)]
struct ReplayState {
	revokes: Vec<RevokeReplay>,
	tail: u32,
	found_blocks: u32,
	replayed_blocks: u32,
	found_revokes: u32,
}

impl ReplayState {
	fn revoke_add(&mut self, blkno: u64, position: u32) {
		match self.revokes.iter_mut().find(|rr| rr.blkno == blkno) {
			Some(rr) => rr.position = position,
			None => {
				self.revokes.push(RevokeReplay { blkno, position });
				self.found_revokes += 1;
			}
		}
	}

	/// Tells whether a block's replay at `position` is revoked: the revoke
	/// must sit strictly between the tail and the replay position,
	/// accounting for log wrap-around.
	fn revoke_check(&self, blkno: u64, position: u32) -> bool {
		let Some(rr) = self.revokes.iter().find(|rr| rr.blkno == blkno) else {
			return false;
		};
		let wrap = rr.position < self.tail;
		let a = self.tail < position;
		let b = position < rr.position;
		if wrap {
			a || b
		} else {
			a && b
		}
	}
}

/// The number of log blocks in a journal file.
fn jblocks(ctx: &FsckCtx, ip: &Inode) -> u32 {
	(ip.di.size / ctx.sdp.bcache.bsize() as u64) as u32
}

/// Advances a journal block position, wrapping at the end of the log.
fn replay_incr_blk(nblocks: u32, blk: &mut u32) {
	*blk += 1;
	if *blk >= nblocks {
		*blk = 0;
	}
}

/// Reads the physical block backing a journal position.
fn replay_read_block(
	ctx: &FsckCtx,
	ip: &Inode,
	blk: u32,
) -> Result<BufHandle, FsckError> {
	let dblock = block_map(&ctx.sdp, ip, blk as u64)?.ok_or(FsckError::BadRange {
		block: ip.addr,
	})?;
	ctx.sdp.bcache.read(dblock)
}

/// Reads and validates the log header at a journal position. Returns
/// `None` when the block is not a log header.
pub fn get_log_header(
	ctx: &FsckCtx,
	ip: &Inode,
	blk: u32,
) -> Result<Option<LogHeader>, FsckError> {
	let bh = replay_read_block(ctx, ip, blk)?;
	let buf = bh.borrow();
	if !check_meta(&buf.data, METATYPE_LH) {
		return Ok(None);
	}
	let lh = LogHeader::read(&buf.data);
	if lh.blkno != blk || lh.hash != crate::hash::disk_hash(&buf.data[..44]) {
		return Ok(None);
	}
	Ok(Some(lh))
}

/// Finds the log head: the header with the highest sequence number.
pub fn find_jhead(
	ctx: &FsckCtx,
	ip: &Inode,
) -> Result<Option<(LogHeader, u32)>, FsckError> {
	let nblocks = jblocks(ctx, ip);
	let mut head: Option<(LogHeader, u32)> = None;

	for blk in 0..nblocks {
		if let Some(lh) = get_log_header(ctx, ip, blk)? {
			match &head {
				Some((best, _)) if best.sequence >= lh.sequence => {}
				_ => head = Some((lh, blk)),
			}
		}
	}
	Ok(head)
}

/// Scans the whole journal for sequencing problems: the sequence numbers
/// must rise monotonically with at most one wrap-around.
///
/// With `fix`, out-of-order headers are renumbered past the highest
/// sequence seen. Returns the number of (unfixed) sequencing errors.
fn check_journal_seq_no(ctx: &mut FsckCtx, ip: &Inode, fix: bool) -> Result<u32, FsckError> {
	let nblocks = jblocks(ctx, ip);
	let mut lowest_seq = 0u64;
	let mut highest_seq = 0u64;
	let mut prev_seq = 0u64;
	let mut wrapped = false;
	let mut seq_errors = 0u32;

	for blk in 0..nblocks {
		let Some(lh) = get_log_header(ctx, ip, blk)? else {
			continue;
		};
		if lowest_seq == 0 || lh.sequence < lowest_seq {
			lowest_seq = lh.sequence;
		}
		if lh.sequence > highest_seq {
			highest_seq = lh.sequence;
		}
		if lh.sequence > prev_seq {
			prev_seq = lh.sequence;
			continue;
		}
		if !wrapped && lh.sequence == lowest_seq {
			wrapped = true;
			prev_seq = lh.sequence;
			continue;
		}
		log_err!(
			"Journal block {} has sequence 0x{:x} out of order.",
			blk,
			lh.sequence
		);
		seq_errors += 1;
		if !fix {
			continue;
		}
		highest_seq += 1;
		prev_seq = highest_seq;
		let bh = replay_read_block(ctx, ip, blk)?;
		let mut buf = bh.borrow_mut();
		let mut fixed = lh;
		fixed.sequence = highest_seq;
		fixed.write(&mut buf.data);
		buf.modify();
	}
	if seq_errors > 0 && fix {
		log_err!("{} sequence errors fixed.", seq_errors);
		seq_errors = 0;
	}
	Ok(seq_errors)
}

/// Re-reads a resource group's counters after journal replay overwrote
/// one of its header blocks.
fn refresh_rgrp(ctx: &mut FsckCtx, blkno: u64) -> Result<(), FsckError> {
	let Some(addr) = ctx
		.sdp
		.rgtree
		.range(..=blkno)
		.next_back()
		.map(|(a, _)| *a)
	else {
		return Ok(());
	};
	let rg = ctx.sdp.rgtree.get(&addr).unwrap();
	if !rg.contains_meta(blkno) || blkno != rg.addr {
		return Ok(());
	}
	log_info!(
		"Replayed block 0x{:x} is a resource group header; refreshing it.",
		blkno
	);
	let mut rg = rg.clone();
	rg.read_header(&ctx.sdp)?;
	ctx.sdp.rgtree.insert(addr, rg);
	Ok(())
}

/// Replays one block from the log into the main filesystem. Returns false
/// on a corrupt result.
fn replay_one(
	ctx: &mut FsckCtx,
	ip: &Inode,
	source: u32,
	target: u64,
	escaped: bool,
	expect_meta: bool,
) -> Result<bool, FsckError> {
	let bh_log = replay_read_block(ctx, ip, source)?;
	log_info!(
		"Journal replay writing block 0x{:x} from journal+0x{:x}",
		target,
		source
	);

	let bh_ip = ctx.sdp.bcache.get(target)?;
	{
		let src = bh_log.borrow();
		let mut dst = bh_ip.borrow_mut();
		dst.data.copy_from_slice(&src.data);
		if escaped {
			// Escaped data blocks had their leading magic zeroed
			put_u32(&mut dst.data, 0, FS_MAGIC);
		}
		if expect_meta && get_u32(&dst.data, 0) != FS_MAGIC {
			log_err!(
				"Journal corruption detected at block 0x{:x} for journal+0x{:x}.",
				target,
				source
			);
			return Ok(false);
		}
		dst.modify();
	}
	refresh_rgrp(ctx, target)?;
	Ok(true)
}

/// Walks the active region of the log, calling the per-type handlers.
///
/// A descriptor occupies `ld_length` journal blocks, itself included;
/// `ld_data1` counts its logical entries.
fn foreach_descriptor(
	ctx: &mut FsckCtx,
	ip: &Inode,
	start: u32,
	end: u32,
	pass: u32,
	state: &mut ReplayState,
) -> Result<bool, FsckError> {
	let nblocks = jblocks(ctx, ip);
	let bsize = ctx.sdp.bcache.bsize() as usize;
	let mut pos = start;

	while pos != end {
		let bh = replay_read_block(ctx, ip, pos)?;
		let (mh, ld) = {
			let buf = bh.borrow();
			(MetaHeader::read(&buf.data), LogDescriptor::read(&buf.data))
		};
		if mh.magic != FS_MAGIC {
			return Ok(false);
		}

		if mh.mh_type == METATYPE_LH {
			if get_log_header(ctx, ip, pos)?.is_none() {
				log_err!("Journal corruption detected at journal+0x{:x}.", pos);
				return Ok(false);
			}
			replay_incr_blk(nblocks, &mut pos);
			continue;
		}
		if mh.mh_type != METATYPE_LD {
			return Ok(false);
		}

		match (pass, ld.ld_type) {
			(0, LOG_DESC_REVOKE) => {
				// Revokes start in the descriptor block and continue in
				// log buffer blocks
				let mut remaining = ld.data1;
				let mut offset = SIZEOF_LOG_DESC;
				let mut rpos = pos;
				let mut blks = ld.length;
				while blks > 0 && remaining > 0 {
					let rbh = replay_read_block(ctx, ip, rpos)?;
					let rbuf = rbh.borrow();
					if offset == SIZEOF_MH && !check_meta(&rbuf.data, METATYPE_LB) {
						break;
					}
					while offset + 8 <= bsize && remaining > 0 {
						let blkno = get_u64(&rbuf.data, offset);
						log_info!(
							"Journal replay processing revoke for block 0x{:x} at journal+0x{:x}",
							blkno,
							rpos
						);
						state.revoke_add(blkno, rpos);
						remaining -= 1;
						offset += 8;
					}
					drop(rbuf);
					offset = SIZEOF_MH;
					blks -= 1;
					replay_incr_blk(nblocks, &mut rpos);
				}
			}
			(1, LOG_DESC_METADATA) => {
				let targets: Vec<u64> = {
					let buf = bh.borrow();
					(0..ld.data1 as usize)
						.map_while(|i| {
							let off = SIZEOF_LOG_DESC + i * 8;
							(off + 8 <= bsize).then(|| get_u64(&buf.data, off))
						})
						.collect()
				};
				let mut source = pos;
				for target in targets {
					replay_incr_blk(nblocks, &mut source);
					state.found_blocks += 1;
					if state.revoke_check(target, source) {
						continue;
					}
					if !replay_one(ctx, ip, source, target, false, true)? {
						return Ok(false);
					}
					state.replayed_blocks += 1;
				}
			}
			(1, LOG_DESC_JDATA) => {
				let pairs: Vec<(u64, u64)> = {
					let buf = bh.borrow();
					(0..ld.data1 as usize)
						.map_while(|i| {
							let off = SIZEOF_LOG_DESC + i * 16;
							(off + 16 <= bsize).then(|| {
								(get_u64(&buf.data, off), get_u64(&buf.data, off + 8))
							})
						})
						.collect()
				};
				let mut source = pos;
				for (target, esc) in pairs {
					replay_incr_blk(nblocks, &mut source);
					state.found_blocks += 1;
					if state.revoke_check(target, source) {
						continue;
					}
					if !replay_one(ctx, ip, source, target, esc != 0, false)? {
						return Ok(false);
					}
					state.replayed_blocks += 1;
				}
			}
			_ => {}
		}

		// Step over the descriptor and its payload
		let span = ld.length.max(1);
		for _ in 0..span {
			replay_incr_blk(nblocks, &mut pos);
		}
	}
	Ok(true)
}

/// Writes a fresh unmount header right after the replayed head, marking
/// the journal clean.
fn clean_journal(
	ctx: &mut FsckCtx,
	ip: &Inode,
	head: &LogHeader,
	head_pos: u32,
) -> Result<(), FsckError> {
	let nblocks = jblocks(ctx, ip);
	let mut pos = head_pos;
	replay_incr_blk(nblocks, &mut pos);

	let dblock = block_map(&ctx.sdp, ip, pos as u64)?.ok_or(FsckError::BadRange {
		block: ip.addr,
	})?;
	let bh = ctx.sdp.bcache.get(dblock)?;
	let mut buf = bh.borrow_mut();
	buf.data.fill(0);
	LogHeader {
		sequence: head.sequence + 1,
		flags: LOG_HEAD_UNMOUNT,
		tail: pos,
		blkno: pos,
		hash: 0,
	}
	.write(&mut buf.data);
	buf.modify();
	Ok(())
}

/// Reinitializes a journal: every block gets a log header carrying the
/// unmount flag, sequence numbers counting up from zero.
pub fn write_journal(ctx: &mut FsckCtx, ip: &Inode) -> Result<(), FsckError> {
	let nblocks = jblocks(ctx, ip);

	for blk in 0..nblocks {
		let Some(dblock) = block_map(&ctx.sdp, ip, blk as u64)? else {
			continue;
		};
		let bh = ctx.sdp.bcache.get(dblock)?;
		let mut buf = bh.borrow_mut();
		buf.data.fill(0);
		LogHeader {
			sequence: blk as u64,
			flags: LOG_HEAD_UNMOUNT,
			tail: blk,
			blkno: blk,
			hash: 0,
		}
		.write(&mut buf.data);
		buf.modify();
	}
	Ok(())
}

/// Walk hooks that only range-check a journal's metadata tree before it is
/// trusted for replay.
struct RangecheckJournal;

impl WalkOps for RangecheckJournal {
	fn check_metalist(
		&mut self,
		ctx: &mut FsckCtx,
		ip: &Inode,
		block: u64,
		_height: u16,
		is_valid: &mut bool,
		was_duplicate: &mut bool,
	) -> Result<WalkRet, FsckError> {
		*was_duplicate = false;
		*is_valid = false;
		if !ctx.sdp.check_range(block) {
			log_err!(
				"Bad block pointer (out of range) found in journal inode 0x{:x}.",
				ip.addr
			);
			return Ok(WalkRet::Error);
		}
		let bh = ctx.sdp.bcache.read(block)?;
		*is_valid = check_meta(&bh.borrow().data, METATYPE_IN);
		if !*is_valid {
			log_err!(
				"Journal 0x{:x} has a bad indirect block pointer 0x{:x}.",
				ip.addr,
				block
			);
			return Ok(WalkRet::SkipSubtree);
		}
		Ok(WalkRet::Good)
	}

	fn check_data(
		&mut self,
		ctx: &mut FsckCtx,
		ip: &Inode,
		_metablock: u64,
		block: u64,
	) -> Result<WalkRet, FsckError> {
		if !ctx.sdp.check_range(block) {
			log_err!(
				"Bad block pointer (out of range) found in journal inode 0x{:x}.",
				ip.addr
			);
			return Ok(WalkRet::Error);
		}
		Ok(WalkRet::Good)
	}
}

/// Recovers one journal. Returns true when the journal was already clean.
fn recover_journal(ctx: &mut FsckCtx, j: usize, jnl_addr: u64) -> Result<bool, FsckError> {
	log_info!("jid={}: Looking at journal...", j);
	let ip = Inode::load(&ctx.sdp, jnl_addr)?;

	let mut head = find_jhead(ctx, &ip)?;
	if head.is_some() {
		let errors = check_journal_seq_no(ctx, &ip, false)?;
		if errors > JOURNAL_SEQ_TOLERANCE {
			log_err!(
				"Journal \"journal{}\" has {} sequencing errors; tolerance is {}.",
				j,
				errors,
				JOURNAL_SEQ_TOLERANCE
			);
			head = None;
		}
	}

	if head.is_none() {
		if ctx.opts.no {
			log_err!("Journal \"journal{}\" is corrupt;", j);
			log_err!("not fixing it due to the -n option.");
			return Ok(false);
		}
		if !ctx.ask(&format!(
			"Journal \"journal{}\" is corrupt. Okay to repair it? ",
			j
		)) {
			log_err!("jid={}: The journal was not repaired.", j);
			return Ok(false);
		}
		log_info!("jid={}: Repairing journal...", j);
		check_journal_seq_no(ctx, &ip, true)?;
		head = find_jhead(ctx, &ip)?;
		if head.is_none() {
			log_err!("jid={}: Unable to fix the bad journal.", j);
			if ctx.ask("Do you want to clear the journal instead? ") {
				write_journal(ctx, &ip)?;
				log_err!("jid={}: journal was cleared.", j);
			} else {
				log_err!("jid={}: journal not cleared.", j);
			}
			return Ok(false);
		}
		log_err!("jid={}: The journal was successfully fixed.", j);
	}
	let (head, head_pos) = head.unwrap();

	if head.flags & LOG_HEAD_UNMOUNT != 0 {
		log_info!("jid={}: Journal is clean.", j);
		return Ok(true);
	}
	if ctx.opts.no {
		log_err!("Journal \"journal{}\" is dirty;", j);
		log_err!("not replaying due to the -n option.");
		return Ok(false);
	}
	if !ctx.ask(&format!(
		"Journal \"journal{}\" is dirty. Okay to replay it? ",
		j
	)) {
		if ctx.ask("Do you want to clear the journal instead? ") {
			write_journal(ctx, &ip)?;
			log_err!("jid={}: journal was cleared.", j);
		}
		return Ok(false);
	}

	log_info!("jid={}: Replaying journal...", j);
	let mut state = ReplayState {
		tail: head.tail,
		..Default::default()
	};
	for pass in 0..2 {
		if !foreach_descriptor(ctx, &ip, head.tail, head.blkno, pass, &mut state)? {
			log_err!("Error found during journal replay.");
			if ctx.ask("Do you want to clear the journal instead? ") {
				write_journal(ctx, &ip)?;
				log_err!("jid={}: journal was cleared.", j);
			}
			return Ok(false);
		}
	}
	log_info!("jid={}: Found {} revoke tags", j, state.found_revokes);
	clean_journal(ctx, &ip, &head, head_pos)?;
	log_err!(
		"jid={}: Replayed {} of {} blocks",
		j,
		state.replayed_blocks,
		state.found_blocks
	);
	log_info!("jid={}: Done", j);
	Ok(false)
}

/// Recovers every journal found in the journal index. Returns the number
/// of journals that were already clean.
pub fn replay_journals(ctx: &mut FsckCtx) -> Result<u32, FsckError> {
	let journals = ctx.sdp.md.journals.clone();
	let mut clean = 0;
	let mut gave_msg = false;

	for (j, jnl_addr) in journals.iter().enumerate() {
		let ip = Inode::load(&ctx.sdp, *jnl_addr)?;
		if !check_meta(&ip.bh.borrow().data, METATYPE_DI) {
			log_err!(
				"Filesystem journal \"journal{}\" is missing or corrupt.",
				j
			);
			continue;
		}
		let mut rc = RangecheckJournal;
		if metawalk::check_metatree(ctx, &ip, &mut rc)? == WalkRet::Error {
			log_err!(
				"Filesystem journal \"journal{}\" has damaged metadata.",
				j
			);
			continue;
		}
		if !gave_msg {
			gave_msg = true;
			log_notice!("Recovering journals (this may take a while)");
		}
		if recover_journal(ctx, j, *jnl_addr)? {
			clean += 1;
		}
	}
	ctx.sdp.bcache.flush()?;
	Ok(clean)
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn revoke_ordering_without_wrap() {
		let mut state = ReplayState {
			tail: 10,
			..Default::default()
		};
		state.revoke_add(0x500, 20);

		// Replay position between tail and revoke: revoked
		assert!(state.revoke_check(0x500, 15));
		// Replay position after the revoke: not revoked
		assert!(!state.revoke_check(0x500, 25));
		// Unknown block: not revoked
		assert!(!state.revoke_check(0x501, 15));
	}

	#[test]
	fn revoke_ordering_with_wrap() {
		let mut state = ReplayState {
			tail: 30,
			..Default::default()
		};
		// The revoke sits before the tail: the log wrapped
		state.revoke_add(0x500, 5);

		assert!(state.revoke_check(0x500, 35));
		assert!(state.revoke_check(0x500, 2));
		assert!(!state.revoke_check(0x500, 7));
	}

	#[test]
	fn revoke_add_replaces_position() {
		let mut state = ReplayState::default();
		state.revoke_add(0x42, 3);
		state.revoke_add(0x42, 9);
		assert_eq!(state.found_revokes, 1);
		assert_eq!(state.revokes[0].position, 9);
	}

	#[test]
	fn incr_blk_wraps() {
		let mut blk = 6;
		replay_incr_blk(8, &mut blk);
		assert_eq!(blk, 7);
		replay_incr_blk(8, &mut blk);
		assert_eq!(blk, 0);
	}
}

#[cfg(test)]
mod replay_test {
	use crate::ondisk::*;
	use crate::testfs;
	use crate::testfs::TestFs;

	#[test]
	fn dirty_journal_is_replayed() {
		let mut fs = TestFs::new(4, 2);
		let target = fs.make_file(fs.root, b"target", b"x");

		// A newer copy of the target's dinode sits in journal 0
		let mut newer = fs.block(target).to_vec();
		put_u64(&mut newer, 80, 12345); // mtime
		fs.make_journal_dirty(0, target, &newer);
		let path = fs.write_image();

		let ctx = testfs::check_image(&path).unwrap();
		// Replay is recovery, not repair; no errors are counted
		assert_eq!(ctx.errors_found, 0);
		assert_eq!(ctx.exit_code(), crate::fsck::FSCK_OK);

		// The journaled copy reached the main filesystem
		let di = Dinode::read(&testfs::read_block(&path, target));
		assert_eq!(di.mtime, 12345);

		// The journal is clean now
		let ctx = testfs::check_image(&path).unwrap();
		assert_eq!(ctx.errors_found, 0);

		std::fs::remove_file(&path).unwrap();
	}
}
