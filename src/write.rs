// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The append-only write path.
//!
//! A write cursor buffers one sector in RAM and commits it when it
//! fills (or at flush).  Committing the tail sector is special: the
//! block's successor must be claimed first, so the tail can name it.
//! The claimed block is the dirty block until its own sector-0 commit
//! erases and heads it; until then it is not a legitimate part of any
//! file, and the allocator flushes it before producing another block.

use crate::allocator::{AllocState, DirtyBlock, allocate};
use crate::flash::Flash;
use crate::fs::OpCtx;
use crate::geom::{
    BLOCK_IDX_INVALID, FILE_TAIL_SECTOR, MAX_FNAME_LEN, NUM_BLOCKS,
    SECTOR_SIZE, TIMESTAMP_INVALID, increment_sector,
};
use crate::inode::{self, InodeIter};
use crate::layout::{
    BlockType, FileBlockHeader, FileSpare, InodeAllocSector, SECTOR0_HEADER_LEN,
    TAIL_HEADER_LEN, TailHeader, sector_header_len,
};
use crate::result::{Error, Result};
use bytemuck::bytes_of;
use log::warn;
use spin::Mutex;

/// Cursor state of one open write handle.
pub(crate) struct WriteState {
    pub handle: u32,
    pub file_id: u32,
    pub block: u32,
    pub block_age: u32,
    pub sector: u32,
    /// Fill level of the sector buffer, header region included.
    pub offset: usize,
    /// Payload bytes committed into the current block so far.
    pub bytes_in_block: u32,
    /// Total bytes this file holds.
    pub write_head: u32,
    pub buffer: [u8; SECTOR_SIZE],
}

/// Takes the dirty block if the given writer owns it.
fn take_dirty_if_owned(
    alloc: &Mutex<AllocState>,
    handle: u32,
) -> Option<DirtyBlock> {
    let mut alc = alloc.lock();
    let owned = matches!(alc.dirty, Some(d) if d.writer == handle);
    if owned { alc.dirty.take() } else { None }
}

/// Commits the dirty block's pending sector-0 so the block becomes a
/// legitimate part of its file.  Called by the allocator before it
/// hands out another block.
pub(crate) fn head_dirty<F: Flash>(
    ctx: &mut OpCtx<'_, F>,
    dirty: DirtyBlock,
) -> Result<()> {
    let Some(widx) =
        ctx.dir.writers.iter().position(|w| w.handle == dirty.writer)
    else {
        warn!("dirty block {} has no owning writer", dirty.block);
        return Err(Error::BadHandle);
    };
    commit_data_sector(ctx, widx, &[], Some(dirty))
}

/// Commits the cursor's sector with `extra` appended to the buffered
/// bytes, then steps the cursor.  Not for tail sectors.
pub(crate) fn commit_data_sector<F: Flash>(
    ctx: &mut OpCtx<'_, F>,
    widx: usize,
    extra: &[u8],
    dirty: Option<DirtyBlock>,
) -> Result<()> {
    let (block, sector, offset, block_age, file_id) = {
        let w = &ctx.dir.writers[widx];
        (w.block, w.sector, w.offset, w.block_age, w.file_id)
    };
    debug_assert_ne!(sector, FILE_TAIL_SECTOR);
    let header_len = sector_header_len(sector);
    let nbytes = offset + extra.len() - header_len;
    if let Some(d) = dirty {
        debug_assert_eq!(d.block, block);
        if !d.erased {
            ctx.cache.erase_block(block)?;
        }
    }
    if sector == 0 {
        let header = FileBlockHeader { age: block_age, file_id };
        ctx.dir.writers[widx].buffer[..SECTOR0_HEADER_LEN]
            .copy_from_slice(bytes_of(&header));
    }
    let w = &ctx.dir.writers[widx];
    if offset > 0 {
        ctx.cache.write(block, sector, 0, &w.buffer[..offset])?;
    }
    if !extra.is_empty() {
        ctx.cache.write(block, sector, offset, extra)?;
    }
    let spare = FileSpare::erased()
        .with_type_id(BlockType::File)
        .with_nbytes(nbytes as u16);
    ctx.cache.write_spare_word(block, sector, spare.word())?;
    ctx.cache.commit()?;
    let w = &mut ctx.dir.writers[widx];
    w.bytes_in_block += nbytes as u32;
    let next = increment_sector(sector);
    w.sector = next;
    w.offset = sector_header_len(next);
    Ok(())
}

/// Seals the current block: claims a successor, writes the tail
/// naming it, and reseats the cursor on the successor's sector 0.
/// On allocation failure the cursor does not move and the handle
/// stays usable for a later retry.
pub(crate) fn commit_tail_sector<F: Flash>(
    ctx: &mut OpCtx<'_, F>,
    widx: usize,
    extra: &[u8],
) -> Result<()> {
    let (handle, block, offset, bytes_in_block) = {
        let w = &ctx.dir.writers[widx];
        debug_assert_eq!(w.sector, FILE_TAIL_SECTOR);
        (w.handle, w.block, w.offset, w.bytes_in_block)
    };
    let (next_block, next_age) = allocate(ctx, Some(handle))?;
    let nbytes = offset + extra.len() - TAIL_HEADER_LEN;
    let tail = TailHeader {
        next_block,
        next_age: next_age + 1,
        timestamp: ctx.stamp(),
        bytes_in_block: bytes_in_block + nbytes as u32,
    };
    ctx.dir.writers[widx].buffer[..TAIL_HEADER_LEN]
        .copy_from_slice(bytes_of(&tail));
    if let Err(e) = write_tail(ctx, widx, block, offset, extra, nbytes) {
        // Unclaim the successor so the handle can retry.
        let mut alc = ctx.alloc.lock();
        if alc.dirty.as_ref().map_or(false, |d| d.block == next_block) {
            alc.dirty = None;
        }
        alc.free_blocks += 1;
        return Err(e);
    }
    let w = &mut ctx.dir.writers[widx];
    w.block = next_block;
    w.block_age = next_age + 1;
    w.sector = 0;
    w.offset = SECTOR0_HEADER_LEN;
    w.bytes_in_block = 0;
    Ok(())
}

fn write_tail<F: Flash>(
    ctx: &mut OpCtx<'_, F>,
    widx: usize,
    block: u32,
    offset: usize,
    extra: &[u8],
    nbytes: usize,
) -> Result<()> {
    let w = &ctx.dir.writers[widx];
    ctx.cache.write(block, FILE_TAIL_SECTOR, 0, &w.buffer[..offset])?;
    if !extra.is_empty() {
        ctx.cache.write(block, FILE_TAIL_SECTOR, offset, extra)?;
    }
    let spare = FileSpare::erased()
        .with_type_id(BlockType::File)
        .with_nbytes(nbytes as u16);
    ctx.cache.write_spare_word(block, FILE_TAIL_SECTOR, spare.word())?;
    ctx.cache.commit()
}

/// Appends bytes at the cursor.  Returns the count accepted, which is
/// short only when the device runs out of blocks (or the driver
/// fails) partway through.
pub(crate) fn write<F: Flash>(
    ctx: &mut OpCtx<'_, F>,
    widx: usize,
    data: &[u8],
) -> Result<usize> {
    let mut written = 0;
    while written < data.len() {
        let (handle, sector, offset) = {
            let w = &ctx.dir.writers[widx];
            (w.handle, w.sector, w.offset)
        };
        let room = SECTOR_SIZE - offset;
        let left = data.len() - written;
        if left >= room {
            let chunk = &data[written..written + room];
            let res = if sector == FILE_TAIL_SECTOR {
                commit_tail_sector(ctx, widx, chunk)
            } else {
                let dirty = take_dirty_if_owned(ctx.alloc, handle);
                commit_data_sector(ctx, widx, chunk, dirty)
            };
            match res {
                Ok(()) => {
                    ctx.dir.writers[widx].write_head += room as u32;
                    written += room;
                }
                Err(_) if written > 0 => return Ok(written),
                Err(e) => return Err(e),
            }
        } else {
            let w = &mut ctx.dir.writers[widx];
            w.buffer[offset..offset + left]
                .copy_from_slice(&data[written..written + left]);
            w.offset += left;
            w.write_head += left as u32;
            written += left;
        }
    }
    Ok(written)
}

/// Commits the cursor's partial sector, if it holds any payload.
pub(crate) fn flush<F: Flash>(
    ctx: &mut OpCtx<'_, F>,
    widx: usize,
) -> Result<()> {
    let (handle, sector, offset) = {
        let w = &ctx.dir.writers[widx];
        (w.handle, w.sector, w.offset)
    };
    if offset <= sector_header_len(sector) {
        return Ok(());
    }
    if sector == FILE_TAIL_SECTOR {
        commit_tail_sector(ctx, widx, &[])
    } else {
        let dirty = take_dirty_if_owned(ctx.alloc, handle);
        commit_data_sector(ctx, widx, &[], dirty)
    }
}

/// Flushes the writer and, if the dirty block still belongs to it,
/// heads that block so the dirty reference does not outlive its
/// owner.  The caller unlinks the handle afterwards.
pub(crate) fn close<F: Flash>(
    ctx: &mut OpCtx<'_, F>,
    widx: usize,
) -> Result<()> {
    flush(ctx, widx)?;
    let handle = ctx.dir.writers[widx].handle;
    if let Some(dirty) = take_dirty_if_owned(ctx.alloc, handle) {
        commit_data_sector(ctx, widx, &[], Some(dirty))?;
    }
    Ok(())
}

/// Builds a cursor positioned after the last committed byte of an
/// existing file: skip the sealed blocks by their tails, then scan
/// the unsealed block for the first untouched sector.
pub(crate) fn open_existing<F: Flash>(
    ctx: &mut OpCtx<'_, F>,
    file_id: u32,
    first_block: u32,
) -> Result<WriteState> {
    let mut block = first_block;
    let mut write_head: u32 = 0;
    let mut hops = 0;
    loop {
        let tail: TailHeader = ctx.cache.read_pod(block, FILE_TAIL_SECTOR, 0)?;
        if tail.timestamp == TIMESTAMP_INVALID {
            break;
        }
        write_head += tail.bytes_in_block;
        block = tail.next_block;
        hops += 1;
        if hops > NUM_BLOCKS {
            return Err(Error::Corrupt);
        }
    }
    let header: FileBlockHeader = ctx.cache.read_pod(block, 0, 0)?;
    if header.file_id != file_id {
        return Err(Error::Corrupt);
    }
    let mut sector = 0;
    let mut bytes_in_block: u32 = 0;
    loop {
        let spare = FileSpare::from_word(ctx.cache.read_spare_word(block, sector)?);
        if !spare.is_written() {
            break;
        }
        if sector == FILE_TAIL_SECTOR {
            return Err(Error::Corrupt);
        }
        bytes_in_block += spare.nbytes() as u32;
        sector = increment_sector(sector);
    }
    write_head += bytes_in_block;
    Ok(WriteState {
        handle: 0,
        file_id,
        block,
        block_age: header.age,
        sector,
        offset: sector_header_len(sector),
        bytes_in_block,
        write_head,
        buffer: [0; SECTOR_SIZE],
    })
}

/// Creates a file: claim an inode slot, claim and erase its first
/// data block, and commit the allocation record.  The data block
/// stays dirty until its sector-0 commit heads it.
pub(crate) fn create<F: Flash>(
    ctx: &mut OpCtx<'_, F>,
    iter: &mut InodeIter,
    filename: [u8; MAX_FNAME_LEN],
) -> Result<u32> {
    inode::prepare_new(ctx, iter)?;
    let handle = ctx.dir.alloc_handle();
    let file_id = ctx.dir.max_file_id + 1;
    ctx.dir.writers.push(WriteState {
        handle,
        file_id,
        block: BLOCK_IDX_INVALID,
        block_age: 0,
        sector: 0,
        offset: SECTOR0_HEADER_LEN,
        bytes_in_block: 0,
        write_head: 0,
        buffer: [0; SECTOR_SIZE],
    });
    let (block, age) = match allocate(ctx, Some(handle)) {
        Ok(claim) => claim,
        Err(e) => {
            ctx.dir.writers.pop();
            return Err(e);
        }
    };
    let timestamp = ctx.stamp();
    let entry = InodeAllocSector {
        file_id,
        first_block: block,
        first_block_age: age + 1,
        timestamp,
        filename,
    };
    let installed = (|| -> Result<()> {
        ctx.cache.erase_block(block)?;
        {
            let mut alc = ctx.alloc.lock();
            if let Some(d) = alc.dirty.as_mut() {
                if d.block == block {
                    d.erased = true;
                }
            }
        }
        ctx.cache.write_pod(iter.block, iter.sector, 0, &entry)?;
        ctx.cache.commit()
    })();
    if let Err(e) = installed {
        // Nothing durable names the block yet; unclaim it.
        let _ = take_dirty_if_owned(ctx.alloc, handle);
        ctx.alloc.lock().free_blocks += 1;
        ctx.dir.writers.pop();
        return Err(e);
    }
    ctx.dir.max_file_id = file_id;
    ctx.dir.num_files += 1;
    let w = ctx.dir.writers.last_mut().ok_or(Error::Corrupt)?;
    w.block = block;
    w.block_age = age + 1;
    Ok(handle)
}
