// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Block-chain primitives.
//!
//! Every file (and the inode directory itself) is a singly linked
//! chain of blocks, each link recorded in the tail sector of its
//! predecessor.  A chain is torn down block-by-block by writing
//! invalidation records; the walk tolerates re-running over a
//! partially invalidated chain, which is exactly what mount does
//! after an interrupted delete.

use crate::allocator::AllocState;
use crate::flash::{Flash, PageCache};
use crate::fs::next_t;
use crate::geom::{
    BLOCK_AGE_INVALID, BLOCK_IDX_INVALID, FILE_INVALIDATION_SECTOR,
    FILE_TAIL_SECTOR, NUM_BLOCKS, TIMESTAMP_INVALID,
};
use crate::layout::{FileBlockHeader, InvalidationHeader, TailHeader};
use crate::result::{Error, Result};
use core::sync::atomic::AtomicU32;

/// Reads the successor named by the given block's tail sector.
pub(crate) fn next_block_of<F: Flash>(
    cache: &mut PageCache<F>,
    block: u32,
) -> Result<u32> {
    let tail: TailHeader = cache.read_pod(block, FILE_TAIL_SECTOR, 0)?;
    Ok(tail.next_block)
}

/// Walks a chain to its last block: the first block whose tail has
/// not been sealed.
pub(crate) fn last_block_of<F: Flash>(
    cache: &mut PageCache<F>,
    first: u32,
) -> Result<u32> {
    let mut block = first;
    for _ in 0..NUM_BLOCKS {
        let tail: TailHeader = cache.read_pod(block, FILE_TAIL_SECTOR, 0)?;
        if tail.timestamp == TIMESTAMP_INVALID
            || tail.next_block == BLOCK_IDX_INVALID
        {
            return Ok(block);
        }
        block = tail.next_block;
    }
    Err(Error::Corrupt)
}

/// Invalidates every block of the chain rooted at `base`, skipping
/// blocks already invalidated.  Each freed block bumps the free count
/// and is offered to the preallocation list with the age its header
/// still carries.
pub(crate) fn invalidate_chain<F: Flash>(
    cache: &mut PageCache<F>,
    alc: &mut AllocState,
    t: &AtomicU32,
    base: u32,
) -> Result<()> {
    let mut block = base;
    for _ in 0..NUM_BLOCKS {
        if block == BLOCK_IDX_INVALID {
            return Ok(());
        }
        let tail: TailHeader = cache.read_pod(block, FILE_TAIL_SECTOR, 0)?;
        let inv: InvalidationHeader =
            cache.read_pod(block, FILE_INVALIDATION_SECTOR, 0)?;
        if inv.timestamp == TIMESTAMP_INVALID {
            let age = cache.read_pod::<FileBlockHeader>(block, 0, 0)?.age;
            let record = InvalidationHeader {
                timestamp: next_t(t),
                next_age: tail.next_age,
            };
            cache.write_pod(block, FILE_INVALIDATION_SECTOR, 0, &record)?;
            cache.commit()?;
            alc.free_blocks += 1;
            alc.prealloc.push(block, age);
        } else if inv.next_age == BLOCK_AGE_INVALID {
            // A previously recorded end of chain.
            return Ok(());
        }
        block = tail.next_block;
    }
    Err(Error::Corrupt)
}
