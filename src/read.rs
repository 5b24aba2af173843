// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The sequential read path.
//!
//! A read cursor walks the sectors of a file in write order and
//! crosses block boundaries through the tail-sector link.  End of
//! file is wherever the committed data stops: an untouched sector
//! spare, an unsealed tail, or a successor that was never headed for
//! this file.  A short read means EOF.

use crate::chain;
use crate::flash::Flash;
use crate::fs::OpCtx;
use crate::geom::{BLOCK_IDX_INVALID, FILE_TAIL_SECTOR, increment_sector};
use crate::layout::{
    FileBlockHeader, FileSpare, SECTOR0_HEADER_LEN, sector_header_len,
};
use crate::result::Result;
use core::cmp;

/// Cursor state of one open read handle.
pub(crate) struct ReadState {
    pub handle: u32,
    pub file_id: u32,
    pub block: u32,
    pub sector: u32,
    /// Byte offset of the next unread byte within the sector.
    pub offset: usize,
    /// Unread payload bytes left in the current sector.
    pub remaining: usize,
    /// Total bytes consumed since open.
    pub read_head: u32,
}

/// Positions a fresh cursor at the head of a file.
pub(crate) fn open<F: Flash>(
    ctx: &mut OpCtx<'_, F>,
    file_id: u32,
    first_block: u32,
) -> Result<ReadState> {
    let spare =
        FileSpare::from_word(ctx.cache.read_spare_word(first_block, 0)?);
    let remaining =
        if spare.is_written() { spare.nbytes() as usize } else { 0 };
    Ok(ReadState {
        handle: 0,
        file_id,
        block: first_block,
        sector: 0,
        offset: SECTOR0_HEADER_LEN,
        remaining,
        read_head: 0,
    })
}

/// Reads up to `buf.len()` bytes at the cursor.
pub(crate) fn read<F: Flash>(
    ctx: &mut OpCtx<'_, F>,
    ridx: usize,
    buf: &mut [u8],
) -> Result<usize> {
    let mut nread = 0;
    while nread < buf.len() {
        if ctx.dir.readers[ridx].remaining == 0 {
            if !advance(ctx, ridx)? {
                break;
            }
            continue;
        }
        let r = &ctx.dir.readers[ridx];
        let n = cmp::min(buf.len() - nread, r.remaining);
        ctx.cache.read(r.block, r.sector, r.offset, &mut buf[nread..nread + n])?;
        let r = &mut ctx.dir.readers[ridx];
        r.offset += n;
        r.remaining -= n;
        r.read_head += n as u32;
        nread += n;
    }
    Ok(nread)
}

/// Moves the cursor to the next committed sector.  Returns false at
/// end of file, leaving the cursor in place.
fn advance<F: Flash>(ctx: &mut OpCtx<'_, F>, ridx: usize) -> Result<bool> {
    let r = &ctx.dir.readers[ridx];
    let (block, sector, file_id) = (r.block, r.sector, r.file_id);
    if sector == FILE_TAIL_SECTOR {
        let next_block = chain::next_block_of(ctx.cache, block)?;
        if next_block == BLOCK_IDX_INVALID {
            return Ok(false);
        }
        let header: FileBlockHeader = ctx.cache.read_pod(next_block, 0, 0)?;
        if header.file_id != file_id {
            // The claimed successor was never headed for this file.
            return Ok(false);
        }
        let spare =
            FileSpare::from_word(ctx.cache.read_spare_word(next_block, 0)?);
        let r = &mut ctx.dir.readers[ridx];
        r.block = next_block;
        r.sector = 0;
        r.offset = SECTOR0_HEADER_LEN;
        r.remaining =
            if spare.is_written() { spare.nbytes() as usize } else { 0 };
        return Ok(true);
    }
    let next = increment_sector(sector);
    let spare = FileSpare::from_word(ctx.cache.read_spare_word(block, next)?);
    if !spare.is_written() {
        return Ok(false);
    }
    let r = &mut ctx.dir.readers[ridx];
    r.sector = next;
    r.offset = sector_header_len(next);
    r.remaining = spare.nbytes() as usize;
    Ok(true)
}
