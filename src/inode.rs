// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The inode chain.
//!
//! The directory is a chain of inode blocks rooted at block zero of
//! the chain (`inode0`).  Each block carries a fixed number of entry
//! slots; an entry is a pair of sectors, the allocation record and
//! the invalidation record.  Entries are only ever appended; a free
//! slot (all-1s allocation) marks the end of the directory.
//!
//! Growing the chain is a three-step dance: seal the current block's
//! tail to name the successor, erase the successor, head it.  A crash
//! between the first and last step leaves a linked but unheaded
//! block, which `prepare_new` finishes the next time a slot is
//! claimed there.

use crate::allocator::allocate;
use crate::flash::{Flash, PageCache};
use crate::fs::OpCtx;
use crate::geom::{
    BLOCK_AGE_INVALID, BLOCK_IDX_INVALID, FILE_TAIL_SECTOR, INODE_FIRST_SLOT,
    INODE_LAST_SLOT,
};
use crate::layout::{
    BlockType, InodeAllocSector, InodeBlockHeader, InodeInvalidateHeader,
    InodeSpare, TailHeader,
};
use crate::result::Result;
use log::warn;

/// Cursor over the entry slots of the inode chain.
pub(crate) struct InodeIter {
    /// Block under the cursor.
    pub block: u32,
    /// Age of `block`, carried for lazy successor completion.
    pub block_age: u32,
    /// Position of `block` in the chain.
    pub block_index: u32,
    /// Successor named by `block`'s tail, if sealed.
    pub next_block: u32,
    /// Age the successor was assigned when it was claimed.
    pub next_age: u32,
    /// Allocation sector of the slot under the cursor.
    pub sector: u32,
    parked: bool,
}

impl InodeIter {
    /// Positions a cursor on the first slot of the chain.
    pub(crate) fn new<F: Flash>(
        cache: &mut PageCache<F>,
        inode0: u32,
    ) -> Result<InodeIter> {
        let header: InodeBlockHeader = cache.read_pod(inode0, 0, 0)?;
        let spare = InodeSpare::from_word(cache.read_spare_word(inode0, 0)?);
        let tail: TailHeader = cache.read_pod(inode0, FILE_TAIL_SECTOR, 0)?;
        Ok(InodeIter {
            block: inode0,
            block_age: header.age,
            block_index: spare.index(),
            next_block: tail.next_block,
            next_age: tail.next_age,
            sector: INODE_FIRST_SLOT,
            parked: false,
        })
    }

    /// True when the cursor has run off the end of the last block.
    /// Writing another entry first requires [`prepare_new`].
    pub(crate) fn parked(&self) -> bool {
        self.parked
    }

    /// Steps to the next slot, crossing into the successor block
    /// when the current one is out of slots.  With no successor the
    /// cursor parks in place.
    pub(crate) fn advance<F: Flash>(
        &mut self,
        cache: &mut PageCache<F>,
    ) -> Result<()> {
        if self.parked {
            return Ok(());
        }
        self.sector += 2;
        if self.sector > INODE_LAST_SLOT {
            if self.next_block == BLOCK_IDX_INVALID {
                self.sector -= 2;
                self.parked = true;
                return Ok(());
            }
            self.block = self.next_block;
            self.block_age = self.next_age;
            self.block_index += 1;
            self.sector = INODE_FIRST_SLOT;
            let tail: TailHeader =
                cache.read_pod(self.block, FILE_TAIL_SECTOR, 0)?;
            self.next_block = tail.next_block;
            self.next_age = tail.next_age;
        }
        Ok(())
    }

    /// Reads the allocation record of the slot under the cursor.
    pub(crate) fn read_alloc<F: Flash>(
        &self,
        cache: &mut PageCache<F>,
    ) -> Result<InodeAllocSector> {
        cache.read_pod(self.block, self.sector, 0)
    }

    /// Reads the invalidation record of the slot under the cursor.
    pub(crate) fn read_invalidate<F: Flash>(
        &self,
        cache: &mut PageCache<F>,
    ) -> Result<InodeInvalidateHeader> {
        cache.read_pod(self.block, self.sector + 1, 0)
    }
}

/// Makes the slot under the cursor writable.
///
/// A parked cursor grows the chain: allocate a successor, seal the
/// current block's tail to name it, then erase and head it.  An
/// unparked cursor may still sit in a linked-but-unheaded successor
/// left by a crash mid-growth; that block is finished here before any
/// entry lands in it.
pub(crate) fn prepare_new<F: Flash>(
    ctx: &mut OpCtx<'_, F>,
    iter: &mut InodeIter,
) -> Result<()> {
    if iter.parked {
        let (block, age) = allocate(ctx, None)?;
        let tail = TailHeader {
            next_block: block,
            next_age: age + 1,
            timestamp: ctx.stamp(),
            bytes_in_block: !0,
        };
        ctx.cache.write_pod(iter.block, FILE_TAIL_SECTOR, 0, &tail)?;
        ctx.cache.commit()?;
        install_block(ctx, block, age + 1, iter.block_index + 1)?;
        iter.block = block;
        iter.block_age = age + 1;
        iter.block_index += 1;
        iter.next_block = BLOCK_IDX_INVALID;
        iter.next_age = BLOCK_AGE_INVALID;
        iter.sector = INODE_FIRST_SLOT;
        iter.parked = false;
        return Ok(());
    }
    complete_unheaded(ctx, iter)?;
    Ok(())
}

/// Finishes a linked-but-unheaded block under the cursor, left behind
/// when chain growth was cut short between sealing the predecessor's
/// tail and heading the successor.  Returns true if the block needed
/// finishing.  The caller owns any free-count correction: mount's
/// census counted such a block as free, an in-session claim did not.
pub(crate) fn complete_unheaded<F: Flash>(
    ctx: &mut OpCtx<'_, F>,
    iter: &InodeIter,
) -> Result<bool> {
    if iter.parked {
        return Ok(false);
    }
    let spare = InodeSpare::from_word(ctx.cache.read_spare_word(iter.block, 0)?);
    if spare.type_id() == BlockType::Inode {
        return Ok(false);
    }
    warn!("finishing interrupted inode block {}", iter.block);
    install_block(ctx, iter.block, iter.block_age, iter.block_index)?;
    Ok(true)
}

/// Erases a claimed block and heads it as an inode block.
fn install_block<F: Flash>(
    ctx: &mut OpCtx<'_, F>,
    block: u32,
    age: u32,
    index: u32,
) -> Result<()> {
    ctx.cache.erase_block(block)?;
    let header = InodeBlockHeader { age, timestamp: ctx.stamp() };
    ctx.cache.write_pod(block, 0, 0, &header)?;
    let spare =
        InodeSpare::erased().with_type_id(BlockType::Inode).with_index(index);
    ctx.cache.write_spare_word(block, 0, spare.word())?;
    ctx.cache.commit()
}
