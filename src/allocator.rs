// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Block allocation.
//!
//! Free blocks come in two flavors: erased blocks (sector-0 age reads
//! all-1s) and invalidated blocks awaiting erase (invalidation
//! timestamp present).  A bounded preallocation list keeps the
//! youngest known candidates sorted by age; when it runs dry, a
//! round-robin cursor scans the device for the next candidate.  The
//! caller erases the block it is handed.
//!
//! At most one allocated block may exist whose contents do not yet
//! name a filesystem entity (the dirty block).  `allocate` flushes
//! any outstanding dirty block before producing a new one, so a crash
//! can strand at most one claim, which mount repairs.

use crate::fs::OpCtx;
use crate::geom::{
    BLOCK_AGE_INVALID, BLOCK_IDX_INVALID, FILE_INVALIDATION_SECTOR, NUM_BLOCKS,
    PREALLOC_SIZE, TIMESTAMP_INVALID,
};
use crate::layout::{FileBlockHeader, InvalidationHeader};
use crate::flash::{Flash, PageCache};
use crate::result::{Error, Result};
use crate::write;
use log::debug;

/// One preallocation candidate.
#[derive(Clone, Copy)]
struct Candidate {
    block: u32,
    age: u32,
}

/// Bounded list of free blocks ordered by ascending age.
pub(crate) struct Prealloc {
    entries: [Candidate; PREALLOC_SIZE],
    len: usize,
    age_sum: u64,
}

impl Prealloc {
    pub(crate) fn new() -> Prealloc {
        Prealloc {
            entries: [Candidate { block: BLOCK_IDX_INVALID, age: 0 };
                PREALLOC_SIZE],
            len: 0,
            age_sum: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Offers a candidate.  A block already listed is left alone; a
    /// candidate no younger than the oldest retained entry of a full
    /// list is dropped; anything else is insertion-sorted into place,
    /// evicting the oldest entry if the list is full.
    pub(crate) fn push(&mut self, block: u32, age: u32) {
        if self.entries[..self.len].iter().any(|c| c.block == block) {
            return;
        }
        if self.len == PREALLOC_SIZE {
            if age >= self.entries[self.len - 1].age {
                return;
            }
            self.age_sum -= u64::from(self.entries[self.len - 1].age);
            self.len -= 1;
        }
        let pos = self.entries[..self.len]
            .iter()
            .position(|c| c.age > age)
            .unwrap_or(self.len);
        self.entries.copy_within(pos..self.len, pos + 1);
        self.entries[pos] = Candidate { block, age };
        self.len += 1;
        self.age_sum += u64::from(age);
    }

    /// Takes the youngest candidate.
    pub(crate) fn pop(&mut self) -> Option<(u32, u32)> {
        if self.len == 0 {
            return None;
        }
        let head = self.entries[0];
        self.entries.copy_within(1..self.len, 0);
        self.len -= 1;
        self.age_sum -= u64::from(head.age);
        Some((head.block, head.age))
    }

    /// Drops a block from the list, wherever it sits.  Used when
    /// mount-time repair turns a censused free block into a live one.
    pub(crate) fn remove_block(&mut self, block: u32) {
        if let Some(pos) =
            self.entries[..self.len].iter().position(|c| c.block == block)
        {
            self.age_sum -= u64::from(self.entries[pos].age);
            self.entries.copy_within(pos + 1..self.len, pos);
            self.len -= 1;
        }
    }
}

/// The block that has been allocated but whose contents do not yet
/// name a filesystem entity.
#[derive(Clone, Copy)]
pub(crate) struct DirtyBlock {
    pub block: u32,
    /// Handle id of the writer that owns the pending sector-0 commit.
    pub writer: u32,
    /// Whether the block has been erased since its last life.
    pub erased: bool,
}

/// Allocator state, guarded by the allocate lock.
pub(crate) struct AllocState {
    pub prealloc: Prealloc,
    /// Round-robin scan cursor.
    pub head: u32,
    pub free_blocks: u32,
    pub dirty: Option<DirtyBlock>,
    /// Advisory mean age of allocated blocks, refreshed at mount.
    pub mean_age: u32,
}

impl AllocState {
    pub(crate) fn new() -> AllocState {
        AllocState {
            prealloc: Prealloc::new(),
            head: 0,
            free_blocks: 0,
            dirty: None,
            mean_age: 0,
        }
    }
}

/// Examines the block under the scan cursor and advances the cursor.
/// Returns the block and its current age if it is allocatable.
pub(crate) fn scan_candidate<F: Flash>(
    cache: &mut PageCache<F>,
    alc: &mut AllocState,
) -> Result<Option<(u32, u32)>> {
    let block = alc.head;
    alc.head = (alc.head + 1) % NUM_BLOCKS;
    if cache.page_is_bad(block)? {
        return Ok(None);
    }
    let age = cache.read_pod::<FileBlockHeader>(block, 0, 0)?.age;
    if age == BLOCK_AGE_INVALID {
        // Never allocated (or erased); its wear history is gone.
        return Ok(Some((block, 0)));
    }
    let inv: InvalidationHeader =
        cache.read_pod(block, FILE_INVALIDATION_SECTOR, 0)?;
    if inv.timestamp != TIMESTAMP_INVALID {
        return Ok(Some((block, age)));
    }
    Ok(None)
}

/// Produces a free block and its current age.  The caller is
/// responsible for erasing it; when `owner` is given, the block is
/// recorded as the dirty block of that write handle and will be
/// erased at its first sector-0 commit.
pub(crate) fn allocate<F: Flash>(
    ctx: &mut OpCtx<'_, F>,
    owner: Option<u32>,
) -> Result<(u32, u32)> {
    {
        let alc = ctx.alloc.lock();
        if alc.free_blocks == 0 {
            return Err(Error::NoSpace);
        }
    }
    let pending = { ctx.alloc.lock().dirty.take() };
    if let Some(dirty) = pending {
        write::head_dirty(ctx, dirty)?;
    }
    let mut alc = ctx.alloc.lock();
    let mut found = alc.prealloc.pop();
    if found.is_none() {
        for _ in 0..NUM_BLOCKS {
            if let Some(cand) = scan_candidate(ctx.cache, &mut alc)? {
                found = Some(cand);
                break;
            }
        }
    }
    let Some((block, age)) = found else {
        debug!("allocate: no candidate despite free count");
        return Err(Error::NoSpace);
    };
    alc.free_blocks -= 1;
    if let Some(writer) = owner {
        alc.dirty = Some(DirtyBlock { block, writer, erased: false });
    }
    Ok((block, age))
}
