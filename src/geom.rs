// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device geometry.
//!
//! The filesystem is compiled against one fixed NAND geometry: a
//! device is `NUM_BLOCKS` erase blocks, a block is `PAGES_PER_BLOCK`
//! pages, a page is `SECTORS_PER_PAGE` sectors, and a sector is
//! `SECTOR_SIZE` bytes of main area plus `SPARE_SIZE` out-of-band
//! bytes.  Erasing a block sets every bit in it to 1; programming can
//! only clear bits.  "Unwritten" is therefore encoded as the all-1s
//! sentinel of each field's width.

use static_assertions::const_assert;

/// Number of erase blocks on the device.
pub const NUM_BLOCKS: u32 = 256;

/// Number of program/read pages per erase block.
pub const PAGES_PER_BLOCK: u32 = 16;

/// Number of sectors per page.
pub const SECTORS_PER_PAGE: u32 = 4;

/// Number of sectors per erase block.
pub const SECTORS_PER_BLOCK: u32 = PAGES_PER_BLOCK * SECTORS_PER_PAGE;

/// Main-area bytes per sector.
pub const SECTOR_SIZE: usize = 512;

/// Out-of-band bytes per sector.
pub const SPARE_SIZE: usize = 16;

/// Bytes of the spare this filesystem actually programs.
pub const SPARE_WORD_LEN: usize = 4;

/// Capacity of the young-block preallocation list.
pub const PREALLOC_SIZE: usize = 10;

/// Maximum file name length, in bytes.
pub const MAX_FNAME_LEN: usize = 32;

/// The tail sector of every block: the last sector.  Its main area
/// begins with the link to the block's successor, and writing it
/// seals the block.
pub const FILE_TAIL_SECTOR: u32 = SECTORS_PER_BLOCK - 1;

/// The invalidation sector of every block.  It sits next to the tail
/// sector, in the same page, so that the usual read-tail then
/// write-invalidation sequence stays within one cached page.
pub const FILE_INVALIDATION_SECTOR: u32 = SECTORS_PER_BLOCK - 2;

/// The last sector that carries file data before the tail.
pub const LAST_DATA_SECTOR: u32 = FILE_INVALIDATION_SECTOR - 1;

/// First inode entry slot.  Entries are (allocation, invalidation)
/// sector pairs packed from the second page onward.
pub const INODE_FIRST_SLOT: u32 = SECTORS_PER_PAGE;

/// Inode entries per inode block.
pub const INODE_ENTRIES_PER_BLOCK: u32 =
    (FILE_INVALIDATION_SECTOR - INODE_FIRST_SLOT) / 2;

/// The final entry slot of an inode block.
pub const INODE_LAST_SLOT: u32 =
    INODE_FIRST_SLOT + 2 * (INODE_ENTRIES_PER_BLOCK - 1);

/// Sentinel block index: "no such block".
pub const BLOCK_IDX_INVALID: u32 = !0;

/// Sentinel block age: "never allocated".
pub const BLOCK_AGE_INVALID: u32 = !0;

/// Sentinel file id: "no file" / "free inode slot".
pub const FILE_ID_INVALID: u32 = !0;

/// Sentinel timestamp: "never written".
pub const TIMESTAMP_INVALID: u32 = !0;

/// Sentinel sector byte count: "sector untouched".
pub const SECTOR_NBYTES_INVALID: u16 = !0;

const_assert!(NUM_BLOCKS >= 2);
const_assert!(SECTORS_PER_PAGE >= 2);
const_assert!(FILE_INVALIDATION_SECTOR > INODE_FIRST_SLOT + 1);
const_assert!(INODE_ENTRIES_PER_BLOCK >= 1);
const_assert!(SPARE_WORD_LEN <= SPARE_SIZE);
const_assert!((NUM_BLOCKS as u64) < (BLOCK_IDX_INVALID as u64));
const_assert!(SECTOR_SIZE - 1 < SECTOR_NBYTES_INVALID as usize);

/// Returns the page containing the given block-relative sector.
pub const fn page_of_sector(sector: u32) -> u32 {
    sector / SECTORS_PER_PAGE
}

/// Returns the page-relative index of the given block-relative sector.
pub const fn sector_in_page(sector: u32) -> u32 {
    sector % SECTORS_PER_PAGE
}

/// Returns the sector that carries file data after the given one.
///
/// Data fills sector 0 first, then ascends through the plain data
/// sectors, skips the invalidation sector, and finishes at the tail
/// sector, which is always written last.
pub const fn increment_sector(sector: u32) -> u32 {
    if sector == LAST_DATA_SECTOR { FILE_TAIL_SECTOR } else { sector + 1 }
}
