// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! On-flash layout.
//!
//! Every allocated block begins with a sector-0 header naming its age
//! (and, for file blocks, the owning file), ends with a tail sector
//! that links it to its successor, and reserves one sector for the
//! invalidation record that marks it reclaimable.  Per-sector
//! metadata lives in a single spare word in the out-of-band area;
//! its low byte is a type tag and the rest is type-specific.
//!
//! Headers are plain `repr(C)` structures of `u32` fields programmed
//! in the device's native byte order; a field that has never been
//! programmed reads back as the all-1s sentinel of its width.

use crate::geom::{
    FILE_TAIL_SECTOR, LAST_DATA_SECTOR, MAX_FNAME_LEN, SECTOR_NBYTES_INVALID,
    SECTOR_SIZE,
};
use bitstruct::bitstruct;
use bytemuck::{Pod, Zeroable};
use core::mem;
use static_assertions::const_assert;

/// Raw spare-word tag of an inode block.
const TYPE_ID_INODE: u8 = 0x01;

/// Raw spare-word tag of a file block.
const TYPE_ID_FILE: u8 = 0x02;

/// Raw spare-word tag of an erased sector.
const TYPE_ID_ERASED: u8 = 0xFF;

/// What a block (or sector) is, according to its spare-word tag.
///
/// `Unknown` is never written; reading it back means the device holds
/// something this filesystem did not put there.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BlockType {
    Unallocated,
    Inode,
    File,
    Unknown,
}

bitstruct! {
    /// Spare word accompanying every file data sector.
    ///
    /// `nbytes` is the payload length of the sector, excluding the
    /// sector-0 or tail header if the sector carries one.  The all-1s
    /// sentinel means the sector was never programmed.
    #[derive(Clone, Copy)]
    pub struct FileSpare(u32) {
        pub type_id: BlockType = 0..=7;
        pub nbytes: u16 = 8..=23;
    }
}

bitstruct! {
    /// Spare word of sector 0 of an inode block.  `index` is the
    /// block's position in the inode chain; the chain root has
    /// index 0.
    #[derive(Clone, Copy)]
    pub struct InodeSpare(u32) {
        pub type_id: BlockType = 0..=7;
        pub index: u32 = 8..=31;
    }
}

impl bitstruct::FromRaw<u8, BlockType> for FileSpare {
    fn from_raw(raw: u8) -> BlockType {
        decode_type_id(raw)
    }
}

impl bitstruct::IntoRaw<u8, BlockType> for FileSpare {
    fn into_raw(bits: BlockType) -> u8 {
        encode_type_id(bits)
    }
}

impl bitstruct::FromRaw<u8, BlockType> for InodeSpare {
    fn from_raw(raw: u8) -> BlockType {
        decode_type_id(raw)
    }
}

impl bitstruct::IntoRaw<u8, BlockType> for InodeSpare {
    fn into_raw(bits: BlockType) -> u8 {
        encode_type_id(bits)
    }
}

fn decode_type_id(raw: u8) -> BlockType {
    match raw {
        TYPE_ID_ERASED => BlockType::Unallocated,
        TYPE_ID_INODE => BlockType::Inode,
        TYPE_ID_FILE => BlockType::File,
        _ => BlockType::Unknown,
    }
}

fn encode_type_id(bits: BlockType) -> u8 {
    match bits {
        BlockType::Unallocated => TYPE_ID_ERASED,
        BlockType::Inode => TYPE_ID_INODE,
        BlockType::File => TYPE_ID_FILE,
        BlockType::Unknown => 0,
    }
}

impl FileSpare {
    /// Decodes a spare word read from flash.
    pub fn from_word(word: u32) -> FileSpare {
        FileSpare(word)
    }

    /// Returns a fresh all-1s spare; unprogrammed bits stay erased.
    pub fn erased() -> FileSpare {
        FileSpare(!0)
    }

    /// Returns the raw word to program.
    pub fn word(self) -> u32 {
        self.0
    }

    /// Returns true IFF the sector was ever programmed.
    pub fn is_written(self) -> bool {
        self.nbytes() != SECTOR_NBYTES_INVALID
    }
}

impl InodeSpare {
    pub fn from_word(word: u32) -> InodeSpare {
        InodeSpare(word)
    }

    pub fn erased() -> InodeSpare {
        InodeSpare(!0)
    }

    pub fn word(self) -> u32 {
        self.0
    }
}

/// Sector-0 main-area header of a file block.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct FileBlockHeader {
    pub age: u32,
    pub file_id: u32,
}

/// Sector-0 main-area header of an inode block.
///
/// `age` is deliberately the first field of both sector-0 header
/// shapes so the allocator's scan can read one word at one offset
/// without knowing the block type.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct InodeBlockHeader {
    pub age: u32,
    pub timestamp: u32,
}

/// Tail-sector header.  Writing it seals the block and names its
/// successor; `bytes_in_block` is the total payload the sealed block
/// carries (all-1s in inode-chain tails).
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct TailHeader {
    pub next_block: u32,
    pub next_age: u32,
    pub timestamp: u32,
    pub bytes_in_block: u32,
}

/// Invalidation-sector header.  A non-sentinel timestamp marks the
/// block reclaimable; `next_age` mirrors the tail's successor age and
/// its sentinel doubles as the end-of-chain mark.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct InvalidationHeader {
    pub timestamp: u32,
    pub next_age: u32,
}

/// The allocation sector of an inode entry.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct InodeAllocSector {
    pub file_id: u32,
    pub first_block: u32,
    pub first_block_age: u32,
    pub timestamp: u32,
    pub filename: [u8; MAX_FNAME_LEN],
}

/// The invalidation sector of an inode entry.  Absence (all-1s) means
/// the file is live.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct InodeInvalidateHeader {
    pub timestamp: u32,
    pub last_block: u32,
}

/// Reserved header bytes at the start of sector 0 of a file block.
pub const SECTOR0_HEADER_LEN: usize = mem::size_of::<FileBlockHeader>();

/// Reserved header bytes at the start of a tail sector.
pub const TAIL_HEADER_LEN: usize = mem::size_of::<TailHeader>();

/// Payload capacity of sector 0.
pub const SECTOR0_CAPACITY: usize = SECTOR_SIZE - SECTOR0_HEADER_LEN;

/// Payload capacity of the tail sector.
pub const TAIL_CAPACITY: usize = SECTOR_SIZE - TAIL_HEADER_LEN;

/// Total payload capacity of one file block.
pub const BLOCK_CAPACITY: usize =
    SECTOR0_CAPACITY + LAST_DATA_SECTOR as usize * SECTOR_SIZE + TAIL_CAPACITY;

/// Upper bound on any typed header read; sized for the largest.
pub const MAX_HEADER_LEN: usize = 64;

const_assert!(mem::size_of::<InodeAllocSector>() <= MAX_HEADER_LEN);
const_assert!(mem::size_of::<InodeAllocSector>() <= SECTOR_SIZE);
const_assert!(TAIL_HEADER_LEN <= MAX_HEADER_LEN);
const_assert!(SECTOR0_HEADER_LEN <= MAX_HEADER_LEN);

/// Returns the reserved header length of the given file data sector.
pub const fn sector_header_len(sector: u32) -> usize {
    match sector {
        0 => SECTOR0_HEADER_LEN,
        FILE_TAIL_SECTOR => TAIL_HEADER_LEN,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn erased_spare_reads_unallocated() {
        let spare = FileSpare::from_word(!0);
        assert_eq!(spare.type_id(), BlockType::Unallocated);
        assert!(!spare.is_written());
        let spare = InodeSpare::from_word(!0);
        assert_eq!(spare.type_id(), BlockType::Unallocated);
    }

    #[test]
    fn file_spare_roundtrip() {
        let spare = FileSpare::erased()
            .with_type_id(BlockType::File)
            .with_nbytes(504);
        let back = FileSpare::from_word(spare.word());
        assert_eq!(back.type_id(), BlockType::File);
        assert_eq!(back.nbytes(), 504);
        assert!(back.is_written());
    }

    #[test]
    fn inode_spare_roundtrip() {
        let spare =
            InodeSpare::erased().with_type_id(BlockType::Inode).with_index(3);
        let back = InodeSpare::from_word(spare.word());
        assert_eq!(back.type_id(), BlockType::Inode);
        assert_eq!(back.index(), 3);
    }

    #[test]
    fn unknown_tag_is_not_a_valid_type() {
        let spare = FileSpare::from_word(0x5A);
        assert_eq!(spare.type_id(), BlockType::Unknown);
    }

    #[test]
    fn header_sizes() {
        assert_eq!(SECTOR0_HEADER_LEN, 8);
        assert_eq!(TAIL_HEADER_LEN, 16);
        assert_eq!(mem::size_of::<InodeAllocSector>(), 16 + MAX_FNAME_LEN);
    }
}
