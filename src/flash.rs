// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The flash driver contract and the page cache over it.
//!
//! The device exposes a single page register: a page must be loaded
//! into it before its sectors can be read, and writes are staged in
//! it until `commit` programs them.  The cache memoizes which page is
//! resident (and the result of loading it) so that back-to-back
//! accesses to one page cost one load.  There is no write-back; every
//! mutation is committed synchronously by the driver.

use crate::geom::{
    BLOCK_IDX_INVALID, SPARE_WORD_LEN, page_of_sector, sector_in_page,
};
use crate::layout::MAX_HEADER_LEN;
use crate::result::Result;
use bytemuck::Pod;
use core::mem;

/// The raw NAND driver consumed by the filesystem.
///
/// `sector` arguments are page-relative.  `erase_block` sets every
/// bit of the block to 1; programming can only clear bits.  Drivers
/// report failure as any [`crate::result::Error`]; `Error::Driver` is
/// the conventional choice.
pub trait Flash {
    /// One-time device bring-up.
    fn init(&mut self) -> Result<()>;

    /// Loads the given page into the device page register.
    fn open_page(&mut self, block: u32, page: u32) -> Result<()>;

    /// Returns the bad-block mark of the currently open page.
    fn page_is_bad(&mut self) -> Result<bool>;

    /// Erases the given block back to all-1s.
    fn erase_block(&mut self, block: u32) -> Result<()>;

    /// Reads from the main area of the currently open page.
    fn read_sector(
        &mut self,
        dst: &mut [u8],
        sector: u32,
        offset: usize,
    ) -> Result<()>;

    /// Stages a write to the main area of the currently open page.
    fn write_sector(
        &mut self,
        src: &[u8],
        sector: u32,
        offset: usize,
    ) -> Result<()>;

    /// Reads the leading bytes of a sector's out-of-band area.
    fn read_spare(&mut self, dst: &mut [u8], sector: u32) -> Result<()>;

    /// Stages a write to the leading bytes of a sector's out-of-band
    /// area.
    fn write_spare(&mut self, src: &[u8], sector: u32) -> Result<()>;

    /// Programs all staged writes into the array.
    fn commit(&mut self) -> Result<()>;
}

/// Single-slot cache over the driver's page register.
pub(crate) struct PageCache<F> {
    drv: F,
    block: u32,
    page: u32,
    page_open: bool,
    open_result: Result<()>,
}

impl<F: Flash> PageCache<F> {
    pub(crate) fn new(drv: F) -> PageCache<F> {
        PageCache {
            drv,
            block: BLOCK_IDX_INVALID,
            page: 0,
            page_open: false,
            open_result: Ok(()),
        }
    }

    pub(crate) fn init(&mut self) -> Result<()> {
        self.page_open = false;
        self.drv.init()
    }

    /// Hands the driver back, discarding the cache.
    pub(crate) fn into_driver(self) -> F {
        self.drv
    }

    /// Drops the cached page; the next access reloads it.
    pub(crate) fn close(&mut self) {
        self.page_open = false;
    }

    /// Loads the given page unless it is already resident.  A
    /// repeated open of the resident page returns the memoized
    /// result without touching the driver.
    pub(crate) fn open_page(&mut self, block: u32, page: u32) -> Result<()> {
        if self.page_open && self.block == block && self.page == page {
            return self.open_result;
        }
        self.block = block;
        self.page = page;
        self.open_result = self.drv.open_page(block, page);
        self.page_open = true;
        self.open_result
    }

    /// Loads the page holding the given block-relative sector.
    pub(crate) fn open_sector(&mut self, block: u32, sector: u32) -> Result<()> {
        self.open_page(block, page_of_sector(sector))
    }

    /// Returns the bad-block mark of the given block.
    pub(crate) fn page_is_bad(&mut self, block: u32) -> Result<bool> {
        self.open_page(block, 0)?;
        self.drv.page_is_bad()
    }

    pub(crate) fn erase_block(&mut self, block: u32) -> Result<()> {
        self.close();
        self.drv.erase_block(block)
    }

    pub(crate) fn read(
        &mut self,
        block: u32,
        sector: u32,
        offset: usize,
        dst: &mut [u8],
    ) -> Result<()> {
        self.open_sector(block, sector)?;
        self.drv.read_sector(dst, sector_in_page(sector), offset)
    }

    pub(crate) fn write(
        &mut self,
        block: u32,
        sector: u32,
        offset: usize,
        src: &[u8],
    ) -> Result<()> {
        self.open_sector(block, sector)?;
        self.drv.write_sector(src, sector_in_page(sector), offset)
    }

    /// Reads the spare word of the given sector.
    pub(crate) fn read_spare_word(
        &mut self,
        block: u32,
        sector: u32,
    ) -> Result<u32> {
        self.open_sector(block, sector)?;
        let mut word = [0u8; SPARE_WORD_LEN];
        self.drv.read_spare(&mut word, sector_in_page(sector))?;
        Ok(u32::from_le_bytes(word))
    }

    /// Stages the spare word of the given sector.
    pub(crate) fn write_spare_word(
        &mut self,
        block: u32,
        sector: u32,
        word: u32,
    ) -> Result<()> {
        self.open_sector(block, sector)?;
        self.drv.write_spare(&word.to_le_bytes(), sector_in_page(sector))
    }

    /// Programs staged writes.  The register contents are stale after
    /// a program, so the cached page is dropped.
    pub(crate) fn commit(&mut self) -> Result<()> {
        self.close();
        self.drv.commit()
    }

    /// Reads a typed header from the main area.
    pub(crate) fn read_pod<T: Pod>(
        &mut self,
        block: u32,
        sector: u32,
        offset: usize,
    ) -> Result<T> {
        debug_assert!(mem::size_of::<T>() <= MAX_HEADER_LEN);
        let mut buf = [0u8; MAX_HEADER_LEN];
        let buf = &mut buf[..mem::size_of::<T>()];
        self.read(block, sector, offset, buf)?;
        Ok(bytemuck::pod_read_unaligned(buf))
    }

    /// Stages a typed header write to the main area.
    pub(crate) fn write_pod<T: Pod>(
        &mut self,
        block: u32,
        sector: u32,
        offset: usize,
        value: &T,
    ) -> Result<()> {
        self.write(block, sector, offset, bytemuck::bytes_of(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::Error;

    /// Counts page loads; storage-free.
    struct Counter {
        opens: usize,
        fail_open: bool,
    }

    impl Flash for Counter {
        fn init(&mut self) -> Result<()> {
            Ok(())
        }
        fn open_page(&mut self, _block: u32, _page: u32) -> Result<()> {
            self.opens += 1;
            if self.fail_open { Err(Error::Driver) } else { Ok(()) }
        }
        fn page_is_bad(&mut self) -> Result<bool> {
            Ok(false)
        }
        fn erase_block(&mut self, _block: u32) -> Result<()> {
            Ok(())
        }
        fn read_sector(
            &mut self,
            _dst: &mut [u8],
            _sector: u32,
            _offset: usize,
        ) -> Result<()> {
            Ok(())
        }
        fn write_sector(
            &mut self,
            _src: &[u8],
            _sector: u32,
            _offset: usize,
        ) -> Result<()> {
            Ok(())
        }
        fn read_spare(&mut self, _dst: &mut [u8], _sector: u32) -> Result<()> {
            Ok(())
        }
        fn write_spare(&mut self, _src: &[u8], _sector: u32) -> Result<()> {
            Ok(())
        }
        fn commit(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn repeated_open_hits_cache() {
        let mut cache = PageCache::new(Counter { opens: 0, fail_open: false });
        cache.open_page(3, 1).unwrap();
        cache.open_page(3, 1).unwrap();
        cache.open_sector(3, crate::geom::SECTORS_PER_PAGE + 1).unwrap();
        assert_eq!(cache.drv.opens, 1);
        cache.open_page(3, 2).unwrap();
        assert_eq!(cache.drv.opens, 2);
    }

    #[test]
    fn failed_open_is_memoized() {
        let mut cache = PageCache::new(Counter { opens: 0, fail_open: true });
        assert_eq!(cache.open_page(0, 0), Err(Error::Driver));
        assert_eq!(cache.open_page(0, 0), Err(Error::Driver));
        assert_eq!(cache.drv.opens, 1);
    }

    #[test]
    fn commit_drops_cached_page() {
        let mut cache = PageCache::new(Counter { opens: 0, fail_open: false });
        cache.open_page(1, 0).unwrap();
        cache.commit().unwrap();
        cache.open_page(1, 0).unwrap();
        assert_eq!(cache.drv.opens, 2);
    }
}
