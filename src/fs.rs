// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The filesystem proper.
//!
//! This is a log-structured filesystem for raw NAND flash.  Files are
//! append-only byte streams named by short opaque strings; the
//! directory is a chain of inode blocks whose entries are written
//! once and invalidated in place, and every file is a chain of data
//! blocks linked through their tail sectors.  Nothing is ever
//! rewritten: state advances by programming erased sectors, and a
//! block returns to service only after its invalidation record is
//! written and it is erased for its next life.
//!
//! All durable state is reconstructible from flash alone.  Mount
//! scans every block once, replays the inode chain, and finishes
//! whichever single allocation or deletion was in flight when power
//! was lost.  Timestamps stamped on every mutation define the
//! happens-after order that recovery relies on.
//!
//! Locking: `fs` guards the directory and the open-handle tables,
//! `flash` guards the driver and its one-page cache, `alloc` guards
//! the allocator.  Acquisition order is `fs`, then `flash`, then
//! `alloc`; every public operation takes the first two up front and
//! the allocator takes the third for its own critical sections.

use crate::allocator::AllocState;
use crate::chain;
use crate::flash::{Flash, PageCache};
use crate::geom::{
    BLOCK_IDX_INVALID, FILE_ID_INVALID, FILE_INVALIDATION_SECTOR,
    FILE_TAIL_SECTOR, MAX_FNAME_LEN, NUM_BLOCKS, TIMESTAMP_INVALID,
};
use crate::inode::{self, InodeIter};
use crate::layout::{
    BlockType, FileBlockHeader, FileSpare, InodeBlockHeader,
    InodeInvalidateHeader, InodeSpare, InvalidationHeader, TailHeader,
};
use crate::read::{self, ReadState};
use crate::result::{Error, Result};
use crate::write::{self, WriteState};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};
use log::{debug, info, warn};
use spin::Mutex;

/// Lifecycle state of the in-RAM singleton.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum State {
    Reset,
    Mounted,
}

/// Directory state and open-handle tables, guarded by the `fs` lock.
pub(crate) struct DirState {
    pub state: State,
    pub inode0: u32,
    pub num_files: u32,
    pub max_file_id: u32,
    pub readers: Vec<ReadState>,
    pub writers: Vec<WriteState>,
    next_handle: u32,
}

impl DirState {
    fn new() -> DirState {
        DirState {
            state: State::Reset,
            inode0: BLOCK_IDX_INVALID,
            num_files: 0,
            max_file_id: 0,
            readers: Vec::new(),
            writers: Vec::new(),
            next_handle: 0,
        }
    }

    pub(crate) fn alloc_handle(&mut self) -> u32 {
        self.next_handle += 1;
        self.next_handle
    }

    fn file_is_open(&self, file_id: u32) -> bool {
        self.readers.iter().any(|r| r.file_id == file_id)
            || self.writers.iter().any(|w| w.file_id == file_id)
    }
}

/// Borrowed context of one public operation: the `fs` and `flash`
/// guards, plus the allocator lock for the paths that need it.
pub(crate) struct OpCtx<'a, F: Flash> {
    pub dir: &'a mut DirState,
    pub cache: &'a mut PageCache<F>,
    pub alloc: &'a Mutex<AllocState>,
    pub t: &'a AtomicU32,
}

impl<F: Flash> OpCtx<'_, F> {
    /// Stamps a new mutation.
    pub(crate) fn stamp(&self) -> u32 {
        next_t(self.t)
    }
}

/// Pre-incrementing monotone timestamp.
pub(crate) fn next_t(t: &AtomicU32) -> u32 {
    t.fetch_add(1, Ordering::Relaxed) + 1
}

/// Sequential-read handle.  Dropping a handle without closing it
/// leaks its cursor slot until the filesystem is reinitialized.
pub struct ReadHandle {
    id: u32,
}

/// Sequential-write handle.
pub struct WriteHandle {
    id: u32,
}

/// Directory-listing cursor.
pub struct LsHandle {
    iter: InodeIter,
    done: bool,
}

/// The filesystem over one flash device.
pub struct FileSystem<F: Flash> {
    fs: Mutex<DirState>,
    flash: Mutex<PageCache<F>>,
    alloc: Mutex<AllocState>,
    t: AtomicU32,
}

impl<F: Flash> FileSystem<F> {
    /// Wraps a driver.  The device is not touched until [`init`].
    ///
    /// [`init`]: FileSystem::init
    pub fn new(driver: F) -> FileSystem<F> {
        FileSystem {
            fs: Mutex::new(DirState::new()),
            flash: Mutex::new(PageCache::new(driver)),
            alloc: Mutex::new(AllocState::new()),
            t: AtomicU32::new(0),
        }
    }

    /// Initializes the driver and resets all in-RAM state.
    pub fn init(&self) -> Result<()> {
        let mut dir = self.fs.lock();
        let mut cache = self.flash.lock();
        let mut alc = self.alloc.lock();
        *dir = DirState::new();
        *alc = AllocState::new();
        self.t.store(0, Ordering::Relaxed);
        cache.init()
    }

    /// Tears the filesystem down and hands the driver back.
    pub fn release(self) -> F {
        self.flash.into_inner().into_driver()
    }

    /// Erases every good block and installs inode block zero.  The
    /// filesystem must not be mounted.
    pub fn format(&self) -> Result<()> {
        self.locked(|ctx| {
            if ctx.dir.state == State::Mounted {
                return Err(Error::Mounted);
            }
            format_device(ctx)
        })
    }

    /// Rebuilds in-RAM state from flash and repairs whatever single
    /// allocation or deletion was cut short by power loss.  Mounting
    /// a mounted filesystem is a no-op.
    pub fn mount(&self) -> Result<()> {
        self.locked(mount_device)
    }

    /// Opens a file for sequential reading.
    pub fn open_read(&self, name: &str) -> Result<ReadHandle> {
        let fname = encode_name(name)?;
        self.locked(|ctx| {
            ensure_mounted(ctx.dir)?;
            let Find::Found(found) = find_file(ctx, &fname)? else {
                return Err(Error::NotFound);
            };
            if ctx.dir.writers.iter().any(|w| w.file_id == found.file_id) {
                return Err(Error::FileOpen);
            }
            let mut state = read::open(ctx, found.file_id, found.first_block)?;
            state.handle = ctx.dir.alloc_handle();
            let id = state.handle;
            ctx.dir.readers.push(state);
            Ok(ReadHandle { id })
        })
    }

    /// Reads up to `buf.len()` bytes.  A short count means end of
    /// file.
    pub fn read(&self, handle: &mut ReadHandle, buf: &mut [u8]) -> Result<usize> {
        self.locked(|ctx| {
            ensure_mounted(ctx.dir)?;
            let ridx = ctx
                .dir
                .readers
                .iter()
                .position(|r| r.handle == handle.id)
                .ok_or(Error::BadHandle)?;
            read::read(ctx, ridx, buf)
        })
    }

    /// Accepted for API symmetry; this filesystem does not support
    /// random access.
    pub fn seek(&self, _handle: &ReadHandle, _pos: u32) -> Result<()> {
        Err(Error::Unsupported)
    }

    /// Closes a read handle.  Closing a handle the filesystem no
    /// longer knows succeeds.
    pub fn close_read(&self, handle: ReadHandle) -> Result<()> {
        let mut dir = self.fs.lock();
        if let Some(i) = dir.readers.iter().position(|r| r.handle == handle.id)
        {
            dir.readers.remove(i);
        }
        Ok(())
    }

    /// Opens a file for appending, creating it if it does not exist.
    /// A file can have at most one writer and cannot be written while
    /// it is being read.
    pub fn open_write(&self, name: &str) -> Result<WriteHandle> {
        let fname = encode_name(name)?;
        self.locked(|ctx| {
            ensure_mounted(ctx.dir)?;
            match find_file(ctx, &fname)? {
                Find::Found(found) => {
                    if ctx.dir.file_is_open(found.file_id) {
                        return Err(Error::FileOpen);
                    }
                    let mut state = write::open_existing(
                        ctx,
                        found.file_id,
                        found.first_block,
                    )?;
                    state.handle = ctx.dir.alloc_handle();
                    let id = state.handle;
                    ctx.dir.writers.push(state);
                    Ok(WriteHandle { id })
                }
                Find::Free(mut iter) => {
                    let id = write::create(ctx, &mut iter, fname)?;
                    debug!("created {name:?}");
                    Ok(WriteHandle { id })
                }
            }
        })
    }

    /// Appends bytes to an open file.  The count returned is short
    /// only when the device filled up (or the driver failed) partway
    /// through; retrying after space is freed continues the file.
    pub fn write(&self, handle: &mut WriteHandle, data: &[u8]) -> Result<usize> {
        self.locked(|ctx| {
            ensure_mounted(ctx.dir)?;
            let widx = ctx
                .dir
                .writers
                .iter()
                .position(|w| w.handle == handle.id)
                .ok_or(Error::BadHandle)?;
            write::write(ctx, widx, data)
        })
    }

    /// Flushes and closes a write handle.  Closing a handle the
    /// filesystem no longer knows succeeds.
    pub fn close_write(&self, handle: WriteHandle) -> Result<()> {
        self.locked(|ctx| {
            let Some(widx) = ctx
                .dir
                .writers
                .iter()
                .position(|w| w.handle == handle.id)
            else {
                return Ok(());
            };
            let flushed = write::close(ctx, widx);
            ctx.dir.writers.remove(widx);
            flushed
        })
    }

    /// Removes a file.  Removing a name that does not exist
    /// succeeds; removing an open file fails.
    pub fn rm(&self, name: &str) -> Result<()> {
        let fname = encode_name(name)?;
        self.locked(|ctx| {
            ensure_mounted(ctx.dir)?;
            let Find::Found(found) = find_file(ctx, &fname)? else {
                return Ok(());
            };
            if ctx.dir.file_is_open(found.file_id) {
                return Err(Error::FileOpen);
            }
            let last_block = chain::last_block_of(ctx.cache, found.first_block)?;
            let record =
                InodeInvalidateHeader { timestamp: ctx.stamp(), last_block };
            ctx.cache.write_pod(found.iter.block, found.iter.sector + 1, 0, &record)?;
            ctx.cache.commit()?;
            {
                let mut alc = ctx.alloc.lock();
                chain::invalidate_chain(
                    ctx.cache,
                    &mut alc,
                    ctx.t,
                    found.first_block,
                )?;
            }
            ctx.dir.num_files -= 1;
            debug!("removed {name:?} (file {})", found.file_id);
            Ok(())
        })
    }

    /// Starts a directory listing.
    pub fn start_ls(&self) -> Result<LsHandle> {
        self.locked(|ctx| {
            ensure_mounted(ctx.dir)?;
            let iter = InodeIter::new(ctx.cache, ctx.dir.inode0)?;
            Ok(LsHandle { iter, done: false })
        })
    }

    /// Copies the next live file name, zero-terminated, into `out`
    /// and returns its length including the terminator.  Returns 0
    /// when the listing is exhausted.  A too-small buffer fails
    /// without consuming the entry.
    pub fn ls_iterate(&self, ls: &mut LsHandle, out: &mut [u8]) -> Result<usize> {
        self.locked(|ctx| {
            ensure_mounted(ctx.dir)?;
            if ls.done {
                return Ok(0);
            }
            loop {
                if ls.iter.parked() {
                    ls.done = true;
                    return Ok(0);
                }
                let entry = ls.iter.read_alloc(ctx.cache)?;
                if entry.file_id == FILE_ID_INVALID {
                    ls.done = true;
                    return Ok(0);
                }
                let inv = ls.iter.read_invalidate(ctx.cache)?;
                if inv.timestamp == TIMESTAMP_INVALID {
                    let n = name_len(&entry.filename);
                    if out.len() < n + 1 {
                        return Err(Error::ShortBuffer);
                    }
                    out[..n].copy_from_slice(&entry.filename[..n]);
                    out[n] = 0;
                    ls.iter.advance(ctx.cache)?;
                    return Ok(n + 1);
                }
                ls.iter.advance(ctx.cache)?;
            }
        })
    }

    /// Ends a directory listing.
    pub fn stop_ls(&self, _ls: LsHandle) -> Result<()> {
        Ok(())
    }

    /// Number of live files.
    pub fn num_files(&self) -> u32 {
        self.fs.lock().num_files
    }

    /// Number of blocks available for allocation, counting
    /// invalidated blocks that still await erase.
    pub fn free_blocks(&self) -> u32 {
        self.alloc.lock().free_blocks
    }

    /// Takes the `fs` and `flash` locks, in that order, and runs the
    /// operation body.
    fn locked<T>(
        &self,
        f: impl FnOnce(&mut OpCtx<'_, F>) -> Result<T>,
    ) -> Result<T> {
        let mut dir = self.fs.lock();
        let mut cache = self.flash.lock();
        let mut ctx = OpCtx {
            dir: &mut dir,
            cache: &mut cache,
            alloc: &self.alloc,
            t: &self.t,
        };
        f(&mut ctx)
    }
}

fn ensure_mounted(dir: &DirState) -> Result<()> {
    if dir.state == State::Mounted { Ok(()) } else { Err(Error::NotMounted) }
}

/// A file name padded to its on-flash width.
fn encode_name(name: &str) -> Result<[u8; MAX_FNAME_LEN]> {
    let name = name.as_bytes();
    if name.len() > MAX_FNAME_LEN {
        return Err(Error::NameTooLong);
    }
    let mut out = [0u8; MAX_FNAME_LEN];
    out[..name.len()].copy_from_slice(name);
    Ok(out)
}

fn name_len(stored: &[u8; MAX_FNAME_LEN]) -> usize {
    stored.iter().position(|&b| b == 0).unwrap_or(MAX_FNAME_LEN)
}

/// Outcome of a directory search: the file, or the free slot a
/// create would claim.
pub(crate) enum Find {
    Found(FoundFile),
    Free(InodeIter),
}

pub(crate) struct FoundFile {
    pub file_id: u32,
    pub first_block: u32,
    pub iter: InodeIter,
}

/// Walks the inode chain for a live entry with the given name.  The
/// iterator stops on the first free slot, which is where a create
/// writes its entry.
pub(crate) fn find_file<F: Flash>(
    ctx: &mut OpCtx<'_, F>,
    fname: &[u8; MAX_FNAME_LEN],
) -> Result<Find> {
    let mut iter = InodeIter::new(ctx.cache, ctx.dir.inode0)?;
    loop {
        if iter.parked() {
            return Ok(Find::Free(iter));
        }
        let entry = iter.read_alloc(ctx.cache)?;
        if entry.file_id == FILE_ID_INVALID {
            return Ok(Find::Free(iter));
        }
        if entry.filename == *fname {
            let inv = iter.read_invalidate(ctx.cache)?;
            if inv.timestamp == TIMESTAMP_INVALID {
                return Ok(Find::Found(FoundFile {
                    file_id: entry.file_id,
                    first_block: entry.first_block,
                    iter,
                }));
            }
        }
        iter.advance(ctx.cache)?;
    }
}

fn format_device<F: Flash>(ctx: &mut OpCtx<'_, F>) -> Result<()> {
    let mut first_valid = BLOCK_IDX_INVALID;
    for block in 0..NUM_BLOCKS {
        if ctx.cache.page_is_bad(block)? {
            continue;
        }
        ctx.cache.erase_block(block)?;
        if first_valid == BLOCK_IDX_INVALID {
            first_valid = block;
        }
    }
    if first_valid == BLOCK_IDX_INVALID {
        return Err(Error::NoSpace);
    }
    let header = InodeBlockHeader { age: 0, timestamp: 0 };
    ctx.cache.write_pod(first_valid, 0, 0, &header)?;
    let spare =
        InodeSpare::erased().with_type_id(BlockType::Inode).with_index(0);
    ctx.cache.write_spare_word(first_valid, 0, spare.word())?;
    ctx.cache.commit()?;
    info!("formatted: inode block zero at {first_valid}");
    Ok(())
}

/// The newest block claim seen on flash: a tail naming a successor,
/// or an inode entry naming a first block.
struct Claim {
    block: u32,
    age: u32,
    file_id: u32,
    timestamp: u32,
}

/// The newest deletion recorded in the inode chain.
struct Deletion {
    first_block: u32,
    last_block: u32,
    file_id: u32,
    timestamp: u32,
}

fn mount_device<F: Flash>(ctx: &mut OpCtx<'_, F>) -> Result<()> {
    if ctx.dir.state == State::Mounted {
        return Ok(());
    }
    *ctx.dir = DirState::new();
    let mut alc = ctx.alloc.lock();
    *alc = AllocState::new();

    // Pass 1: block census.
    let mut inode0 = BLOCK_IDX_INVALID;
    let mut last_alloc: Option<Claim> = None;
    let mut t_max: u32 = 0;
    let mut age_sum: u64 = 0;
    let mut aged: u32 = 0;
    for block in 0..NUM_BLOCKS {
        if ctx.cache.page_is_bad(block)? {
            continue;
        }
        let word = ctx.cache.read_spare_word(block, 0)?;
        match FileSpare::from_word(word).type_id() {
            BlockType::Unallocated => {
                alc.free_blocks += 1;
                alc.prealloc.push(block, 0);
            }
            BlockType::Inode => {
                let header: InodeBlockHeader = ctx.cache.read_pod(block, 0, 0)?;
                let inv: InvalidationHeader =
                    ctx.cache.read_pod(block, FILE_INVALIDATION_SECTOR, 0)?;
                if inv.timestamp == TIMESTAMP_INVALID {
                    if InodeSpare::from_word(word).index() == 0 {
                        inode0 = block;
                    }
                } else {
                    alc.free_blocks += 1;
                    alc.prealloc.push(block, header.age);
                    t_max = t_max.max(inv.timestamp);
                }
                if header.timestamp != TIMESTAMP_INVALID {
                    t_max = t_max.max(header.timestamp);
                }
                age_sum += u64::from(header.age);
                aged += 1;
            }
            BlockType::File => {
                let header: FileBlockHeader = ctx.cache.read_pod(block, 0, 0)?;
                let tail: TailHeader =
                    ctx.cache.read_pod(block, FILE_TAIL_SECTOR, 0)?;
                let inv: InvalidationHeader =
                    ctx.cache.read_pod(block, FILE_INVALIDATION_SECTOR, 0)?;
                if tail.timestamp != TIMESTAMP_INVALID {
                    t_max = t_max.max(tail.timestamp);
                    let newest = last_alloc
                        .as_ref()
                        .map_or(true, |c| tail.timestamp > c.timestamp);
                    if newest {
                        last_alloc = Some(Claim {
                            block: tail.next_block,
                            age: tail.next_age,
                            file_id: header.file_id,
                            timestamp: tail.timestamp,
                        });
                    }
                }
                if inv.timestamp != TIMESTAMP_INVALID {
                    alc.free_blocks += 1;
                    alc.prealloc.push(block, header.age);
                    t_max = t_max.max(inv.timestamp);
                }
                age_sum += u64::from(header.age);
                aged += 1;
            }
            BlockType::Unknown => return Err(Error::Corrupt),
        }
    }
    if inode0 == BLOCK_IDX_INVALID {
        return Err(Error::NoFilesystem);
    }

    // Pass 2: inode chain replay.
    let mut iter = InodeIter::new(ctx.cache, inode0)?;
    let mut last_del: Option<Deletion> = None;
    let mut num_files: u32 = 0;
    let mut max_file_id: u32 = 0;
    loop {
        if iter.parked() {
            break;
        }
        let entry = iter.read_alloc(ctx.cache)?;
        if entry.file_id == FILE_ID_INVALID {
            break;
        }
        max_file_id = max_file_id.max(entry.file_id);
        t_max = t_max.max(entry.timestamp);
        let inv = iter.read_invalidate(ctx.cache)?;
        if inv.timestamp == TIMESTAMP_INVALID {
            num_files += 1;
            let newest = last_alloc
                .as_ref()
                .map_or(true, |c| entry.timestamp > c.timestamp);
            if newest {
                last_alloc = Some(Claim {
                    block: entry.first_block,
                    age: entry.first_block_age,
                    file_id: entry.file_id,
                    timestamp: entry.timestamp,
                });
            }
        } else {
            t_max = t_max.max(inv.timestamp);
            let newest = last_del
                .as_ref()
                .map_or(true, |d| inv.timestamp > d.timestamp);
            if newest {
                last_del = Some(Deletion {
                    first_block: entry.first_block,
                    last_block: inv.last_block,
                    file_id: entry.file_id,
                    timestamp: inv.timestamp,
                });
            }
        }
        iter.advance(ctx.cache)?;
    }
    ctx.t.store(t_max, Ordering::Relaxed);

    // An interrupted inode-chain growth leaves a linked but unheaded
    // block that the census counted free; finish it before anything
    // can reallocate it.
    if inode::complete_unheaded(ctx, &iter)? {
        alc.free_blocks -= 1;
        alc.prealloc.remove_block(iter.block);
    }

    // Recovery: at most one allocation was in flight.
    if let Some(claim) = last_alloc {
        if claim.block != BLOCK_IDX_INVALID {
            let header: FileBlockHeader =
                ctx.cache.read_pod(claim.block, 0, 0)?;
            if header.file_id != claim.file_id {
                warn!(
                    "reheading block {} claimed by file {}",
                    claim.block, claim.file_id
                );
                ctx.cache.erase_block(claim.block)?;
                let header =
                    FileBlockHeader { age: claim.age, file_id: claim.file_id };
                ctx.cache.write_pod(claim.block, 0, 0, &header)?;
                let spare = FileSpare::erased()
                    .with_type_id(BlockType::File)
                    .with_nbytes(0);
                ctx.cache.write_spare_word(claim.block, 0, spare.word())?;
                ctx.cache.commit()?;
                alc.free_blocks -= 1;
                alc.prealloc.remove_block(claim.block);
            }
        }
    }

    // ... and at most one deletion.
    if let Some(deletion) = last_del {
        let header: FileBlockHeader =
            ctx.cache.read_pod(deletion.last_block, 0, 0)?;
        if header.file_id == deletion.file_id {
            let inv: InvalidationHeader = ctx
                .cache
                .read_pod(deletion.last_block, FILE_INVALIDATION_SECTOR, 0)?;
            if inv.timestamp == TIMESTAMP_INVALID {
                warn!(
                    "resuming interrupted delete of file {}",
                    deletion.file_id
                );
                chain::invalidate_chain(
                    ctx.cache,
                    &mut alc,
                    ctx.t,
                    deletion.first_block,
                )?;
            }
        }
    }

    alc.mean_age =
        if aged > 0 { (age_sum / u64::from(aged)) as u32 } else { 0 };
    ctx.dir.inode0 = inode0;
    ctx.dir.num_files = num_files;
    ctx.dir.max_file_id = max_file_id;
    ctx.dir.state = State::Mounted;
    info!(
        "mounted: {num_files} files, {} free of {NUM_BLOCKS} blocks, mean age {}",
        alc.free_blocks, alc.mean_age
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::SharedNand;
    use crate::geom::{INODE_ENTRIES_PER_BLOCK, SECTOR_SIZE, SECTORS_PER_BLOCK};
    use crate::layout::{BLOCK_CAPACITY, SECTOR0_CAPACITY};
    use rand::{Rng, SeedableRng};

    fn fresh() -> (SharedNand, FileSystem<SharedNand>) {
        let nand = SharedNand::new();
        let fs = FileSystem::new(nand.clone());
        fs.init().unwrap();
        fs.format().unwrap();
        fs.mount().unwrap();
        (nand, fs)
    }

    /// Power loss: the in-RAM state dies with the value, the flash
    /// array survives in `nand`.
    fn remount(
        nand: &SharedNand,
        fs: FileSystem<SharedNand>,
    ) -> FileSystem<SharedNand> {
        drop(fs);
        let fs = FileSystem::new(nand.clone());
        fs.init().unwrap();
        fs.mount().unwrap();
        fs
    }

    fn payload(len: usize, seed: u64) -> Vec<u8> {
        let mut data = vec![0u8; len];
        rand::rngs::StdRng::seed_from_u64(seed).fill_bytes(&mut data);
        data
    }

    fn write_file(fs: &FileSystem<SharedNand>, name: &str, data: &[u8]) {
        let mut h = fs.open_write(name).unwrap();
        assert_eq!(fs.write(&mut h, data).unwrap(), data.len());
        fs.close_write(h).unwrap();
    }

    fn read_file(fs: &FileSystem<SharedNand>, name: &str) -> Vec<u8> {
        let mut h = fs.open_read(name).unwrap();
        let mut out = Vec::new();
        // An odd chunk size walks the cursor across sector and block
        // boundaries at uneven offsets.
        let mut buf = [0u8; 97];
        loop {
            let n = fs.read(&mut h, &mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        fs.close_read(h).unwrap();
        out
    }

    fn count_ls(fs: &FileSystem<SharedNand>) -> usize {
        let mut ls = fs.start_ls().unwrap();
        let mut buf = [0u8; MAX_FNAME_LEN + 1];
        let mut count = 0;
        while fs.ls_iterate(&mut ls, &mut buf).unwrap() != 0 {
            count += 1;
        }
        fs.stop_ls(ls).unwrap();
        count
    }

    #[test]
    fn format_mount_empty_ls() {
        let (_nand, fs) = fresh();
        assert_eq!(count_ls(&fs), 0);
        assert_eq!(fs.free_blocks(), NUM_BLOCKS - 1);
        assert_eq!(fs.num_files(), 0);
    }

    #[test]
    fn mount_is_idempotent() {
        let (_nand, fs) = fresh();
        write_file(&fs, "a", &payload(10, 0));
        fs.mount().unwrap();
        assert_eq!(fs.num_files(), 1);
    }

    #[test]
    fn format_requires_unmounted() {
        let (_nand, fs) = fresh();
        assert_eq!(fs.format(), Err(Error::Mounted));
    }

    #[test]
    fn mount_without_format_fails() {
        let nand = SharedNand::new();
        let fs = FileSystem::new(nand);
        fs.init().unwrap();
        assert_eq!(fs.mount(), Err(Error::NoFilesystem));
    }

    #[test]
    fn create_and_read_back() {
        let (_nand, fs) = fresh();
        let data = payload(100, 1);
        write_file(&fs, "a.log", &data);
        let mut h = fs.open_read("a.log").unwrap();
        let mut buf = [0u8; 100];
        assert_eq!(fs.read(&mut h, &mut buf).unwrap(), 100);
        assert_eq!(&buf[..], &data[..]);
        assert_eq!(fs.fs.lock().readers[0].read_head, 100);
        assert_eq!(fs.read(&mut h, &mut buf).unwrap(), 0);
        fs.close_read(h).unwrap();
    }

    #[test]
    fn empty_file_roundtrip() {
        let (nand, fs) = fresh();
        let h = fs.open_write("empty").unwrap();
        fs.close_write(h).unwrap();
        assert_eq!(read_file(&fs, "empty"), Vec::<u8>::new());
        let fs = remount(&nand, fs);
        assert_eq!(count_ls(&fs), 1);
        assert_eq!(read_file(&fs, "empty"), Vec::<u8>::new());
    }

    #[test]
    fn sector_zero_boundary() {
        let (_nand, fs) = fresh();
        let exact = payload(SECTOR0_CAPACITY, 2);
        write_file(&fs, "exact", &exact);
        assert_eq!(read_file(&fs, "exact"), exact);
        let spill = payload(SECTOR0_CAPACITY + 1, 3);
        write_file(&fs, "spill", &spill);
        assert_eq!(read_file(&fs, "spill"), spill);
    }

    #[test]
    fn cross_block_write_survives_remount() {
        let (nand, fs) = fresh();
        let total = 2 * SECTORS_PER_BLOCK as usize * SECTOR_SIZE;
        assert!(total > BLOCK_CAPACITY);
        let data = payload(total, 4);
        write_file(&fs, "big", &data);
        let fs = remount(&nand, fs);
        assert_eq!(read_file(&fs, "big"), data);
    }

    #[test]
    fn append_after_close() {
        let (nand, fs) = fresh();
        let first = payload(600, 5);
        let second = payload(900, 6);
        write_file(&fs, "app", &first);
        let mut h = fs.open_write("app").unwrap();
        // The reopened cursor picks up the file size from the sealed
        // tails and the unsealed block's sector spares.
        assert_eq!(fs.fs.lock().writers[0].write_head, 600);
        assert_eq!(fs.write(&mut h, &second).unwrap(), second.len());
        fs.close_write(h).unwrap();
        let mut all = first.clone();
        all.extend_from_slice(&second);
        assert_eq!(read_file(&fs, "app"), all);
        let fs = remount(&nand, fs);
        assert_eq!(read_file(&fs, "app"), all);
    }

    #[test]
    fn delete_is_idempotent() {
        let (_nand, fs) = fresh();
        write_file(&fs, "a.log", &payload(100, 7));
        fs.rm("a.log").unwrap();
        fs.rm("a.log").unwrap();
        assert_eq!(fs.open_read("a.log").err(), Some(Error::NotFound));
        assert_eq!(fs.rm("never-existed"), Ok(()));
    }

    #[test]
    fn delete_reclaims_blocks() {
        let (_nand, fs) = fresh();
        let before = fs.free_blocks();
        write_file(&fs, "a", &payload(2 * BLOCK_CAPACITY, 8));
        assert!(fs.free_blocks() < before);
        fs.rm("a").unwrap();
        assert_eq!(fs.free_blocks(), before);
    }

    #[test]
    fn name_reuse_after_delete() {
        let (_nand, fs) = fresh();
        write_file(&fs, "a", b"old contents");
        fs.rm("a").unwrap();
        write_file(&fs, "a", b"new");
        assert_eq!(read_file(&fs, "a"), b"new");
        assert_eq!(fs.num_files(), 1);
    }

    #[test]
    fn ls_lists_live_files() {
        let (_nand, fs) = fresh();
        write_file(&fs, "one", b"1");
        write_file(&fs, "two", b"2");
        write_file(&fs, "three", b"3");
        fs.rm("two").unwrap();
        let mut ls = fs.start_ls().unwrap();
        let mut buf = [0u8; MAX_FNAME_LEN + 1];
        let n = fs.ls_iterate(&mut ls, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"one\0");
        let n = fs.ls_iterate(&mut ls, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"three\0");
        assert_eq!(fs.ls_iterate(&mut ls, &mut buf).unwrap(), 0);
        fs.stop_ls(ls).unwrap();
    }

    #[test]
    fn ls_short_buffer_does_not_lose_entry() {
        let (_nand, fs) = fresh();
        write_file(&fs, "longish-name", b"x");
        let mut ls = fs.start_ls().unwrap();
        let mut tiny = [0u8; 4];
        assert_eq!(
            fs.ls_iterate(&mut ls, &mut tiny),
            Err(Error::ShortBuffer)
        );
        let mut buf = [0u8; MAX_FNAME_LEN + 1];
        let n = fs.ls_iterate(&mut ls, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"longish-name\0");
        fs.stop_ls(ls).unwrap();
    }

    #[test]
    fn seek_always_fails() {
        let (_nand, fs) = fresh();
        write_file(&fs, "a", b"abc");
        let h = fs.open_read("a").unwrap();
        assert_eq!(fs.seek(&h, 1), Err(Error::Unsupported));
        fs.close_read(h).unwrap();
    }

    #[test]
    fn close_of_unknown_handle_succeeds() {
        let (_nand, fs) = fresh();
        write_file(&fs, "a", b"abc");
        let h = fs.open_read("a").unwrap();
        // A reinit wipes the handle tables; closing afterwards is
        // still success.
        fs.init().unwrap();
        fs.mount().unwrap();
        fs.close_read(h).unwrap();
    }

    #[test]
    fn open_write_excludes_other_opens() {
        let (_nand, fs) = fresh();
        let h = fs.open_write("a").unwrap();
        assert_eq!(fs.open_write("a").err(), Some(Error::FileOpen));
        assert_eq!(fs.open_read("a").err(), Some(Error::FileOpen));
        assert_eq!(fs.rm("a"), Err(Error::FileOpen));
        fs.close_write(h).unwrap();
        fs.rm("a").unwrap();
    }

    #[test]
    fn readers_share_a_file_but_exclude_writers() {
        let (_nand, fs) = fresh();
        write_file(&fs, "a", b"abc");
        let r1 = fs.open_read("a").unwrap();
        let r2 = fs.open_read("a").unwrap();
        assert_eq!(fs.open_write("a").err(), Some(Error::FileOpen));
        assert_eq!(fs.rm("a"), Err(Error::FileOpen));
        fs.close_read(r1).unwrap();
        fs.close_read(r2).unwrap();
    }

    #[test]
    fn name_too_long_is_rejected() {
        let (_nand, fs) = fresh();
        let long = [b'x'; MAX_FNAME_LEN + 1];
        let name = core::str::from_utf8(&long).unwrap();
        assert_eq!(fs.open_write(name).err(), Some(Error::NameTooLong));
    }

    #[test]
    fn crash_mid_create_leaves_live_empty_file() {
        let (nand, fs) = fresh();
        // Power loss after the inode entry committed but before the
        // data block was headed: the handle is simply never flushed.
        let h = fs.open_write("a.log").unwrap();
        drop(h);
        let fs = remount(&nand, fs);
        assert_eq!(fs.num_files(), 1);
        assert_eq!(read_file(&fs, "a.log"), Vec::<u8>::new());
        let data = payload(300, 9);
        write_file(&fs, "a.log", &data);
        assert_eq!(read_file(&fs, "a.log"), data);
    }

    #[test]
    fn failed_create_commit_reclaims_erased_block() {
        let (nand, fs) = fresh();
        // Let the data block's erase through, then fail the commit
        // of the inode allocation record behind it.
        nand.set_commit_budget(Some(1));
        assert!(fs.open_write("a.log").is_err());
        nand.set_commit_budget(None);
        assert_eq!(fs.num_files(), 0);
        assert_eq!(fs.free_blocks(), NUM_BLOCKS - 1);
        // Nothing durable names the file or the block, so the erased
        // block is simply free again after a power cycle too.
        let fs = remount(&nand, fs);
        assert_eq!(count_ls(&fs), 0);
        assert_eq!(fs.num_files(), 0);
        assert_eq!(fs.free_blocks(), NUM_BLOCKS - 1);
        let data = payload(400, 16);
        write_file(&fs, "a.log", &data);
        assert_eq!(read_file(&fs, "a.log"), data);
    }

    #[test]
    fn crash_mid_write_loses_only_the_buffered_tail() {
        let (nand, fs) = fresh();
        let data = payload(3 * SECTOR_SIZE, 10);
        let mut h = fs.open_write("w").unwrap();
        assert_eq!(fs.write(&mut h, &data).unwrap(), data.len());
        // Committed sectors survive; the partial sector buffered in
        // RAM does not.
        drop(h);
        let fs = remount(&nand, fs);
        let kept = read_file(&fs, "w");
        assert!(kept.len() >= 2 * SECTOR_SIZE);
        assert_eq!(&kept[..], &data[..kept.len()]);
    }

    #[test]
    fn crash_mid_delete_is_finished_by_mount() {
        let (nand, fs) = fresh();
        let free0 = fs.free_blocks();
        write_file(&fs, "doomed", &payload(BLOCK_CAPACITY + 10, 11));
        // Let the inode invalidation commit, then fail the chain
        // invalidation behind it.
        nand.set_commit_budget(Some(1));
        assert!(fs.rm("doomed").is_err());
        nand.set_commit_budget(None);
        let fs = remount(&nand, fs);
        assert_eq!(fs.num_files(), 0);
        assert_eq!(count_ls(&fs), 0);
        assert_eq!(fs.open_read("doomed").err(), Some(Error::NotFound));
        assert_eq!(fs.free_blocks(), free0);
    }

    #[test]
    fn inode_chain_grows_past_one_block() {
        let (nand, fs) = fresh();
        let count = INODE_ENTRIES_PER_BLOCK as usize + 3;
        for i in 0..count {
            write_file(&fs, &format!("f{i}"), format!("data{i}").as_bytes());
        }
        assert_eq!(count_ls(&fs), count);
        let fs = remount(&nand, fs);
        assert_eq!(count_ls(&fs), count);
        for i in 0..count {
            assert_eq!(
                read_file(&fs, &format!("f{i}")),
                format!("data{i}").as_bytes()
            );
        }
        // One data block per file plus the second inode block.
        assert_eq!(fs.free_blocks(), NUM_BLOCKS - 2 - count as u32);
    }

    #[test]
    fn crash_mid_inode_growth_is_finished_lazily() {
        let (nand, fs) = fresh();
        for i in 0..INODE_ENTRIES_PER_BLOCK {
            write_file(&fs, &format!("f{i}"), b"x");
        }
        // The next create grows the inode chain: let the tail seal
        // commit, then fail the erase of the successor.
        nand.set_commit_budget(Some(1));
        assert!(fs.open_write("straggler").is_err());
        nand.set_commit_budget(None);
        let fs = remount(&nand, fs);
        assert_eq!(fs.num_files(), INODE_ENTRIES_PER_BLOCK);
        write_file(&fs, "straggler", b"made it");
        assert_eq!(read_file(&fs, "straggler"), b"made it");
        assert_eq!(fs.num_files(), INODE_ENTRIES_PER_BLOCK + 1);
    }

    #[test]
    fn out_of_space_then_reclaim() {
        let (_nand, fs) = fresh();
        let chunk = payload(BLOCK_CAPACITY, 12);
        let mut h = fs.open_write("hog").unwrap();
        let mut total = 0usize;
        loop {
            match fs.write(&mut h, &chunk) {
                Ok(n) => {
                    total += n;
                    if n < chunk.len() {
                        // Accepted what fit; the next call must fail
                        // outright.
                        assert_eq!(
                            fs.write(&mut h, &chunk),
                            Err(Error::NoSpace)
                        );
                        break;
                    }
                }
                Err(e) => {
                    assert_eq!(e, Error::NoSpace);
                    break;
                }
            }
        }
        assert_eq!(fs.free_blocks(), 0);
        assert!(total > 0);
        let _ = fs.close_write(h);
        assert_eq!(fs.open_write("no-room").err(), Some(Error::NoSpace));
        fs.rm("hog").unwrap();
        assert!(fs.free_blocks() > 0);
        let data = payload(2000, 13);
        write_file(&fs, "after", &data);
        assert_eq!(read_file(&fs, "after"), data);
    }

    #[test]
    fn two_writers_interleave() {
        let (nand, fs) = fresh();
        let mut a = fs.open_write("a").unwrap();
        // Opening "b" must flush "a"'s still-dirty first block, so
        // "a" begins with a headed, empty sector 0.
        let mut b = fs.open_write("b").unwrap();
        // From sector 1, this count ends exactly on a block seal,
        // leaving the sealed writer's fresh claim dirty.
        let seal = BLOCK_CAPACITY - SECTOR0_CAPACITY;
        let da = payload(seal + 700, 20);
        let db = payload(seal + 900, 21);
        assert_eq!(fs.write(&mut a, &da[..seal]).unwrap(), seal);
        // Sealing "b"'s block makes the allocator head "a"'s dirty
        // successor, and vice versa.
        assert_eq!(fs.write(&mut b, &db[..seal]).unwrap(), seal);
        assert_eq!(fs.write(&mut a, &da[seal..]).unwrap(), 700);
        assert_eq!(fs.write(&mut b, &db[seal..]).unwrap(), 900);
        fs.close_write(a).unwrap();
        fs.close_write(b).unwrap();
        assert_eq!(read_file(&fs, "a"), da);
        assert_eq!(read_file(&fs, "b"), db);
        let fs = remount(&nand, fs);
        assert_eq!(read_file(&fs, "a"), da);
        assert_eq!(read_file(&fs, "b"), db);
    }

    #[test]
    fn bad_blocks_are_skipped() {
        let nand = SharedNand::new();
        nand.mark_bad(0);
        nand.mark_bad(5);
        let fs = FileSystem::new(nand.clone());
        fs.init().unwrap();
        fs.format().unwrap();
        fs.mount().unwrap();
        // Two bad blocks, and inode block zero landed on block 1.
        assert_eq!(fs.free_blocks(), NUM_BLOCKS - 3);
        let data = payload(5000, 15);
        write_file(&fs, "a", &data);
        let fs = remount(&nand, fs);
        assert_eq!(read_file(&fs, "a"), data);
    }

    #[test]
    fn release_returns_the_driver() {
        let (_nand, fs) = fresh();
        let data = payload(50, 14);
        write_file(&fs, "kept", &data);
        let driver = fs.release();
        let fs = FileSystem::new(driver);
        fs.init().unwrap();
        fs.mount().unwrap();
        assert_eq!(read_file(&fs, "kept"), data);
    }

    #[test]
    fn file_ids_are_never_reused() {
        let (nand, fs) = fresh();
        write_file(&fs, "a", b"1");
        fs.rm("a").unwrap();
        let fs = remount(&nand, fs);
        // max_file_id was replayed from the deleted entry, so the
        // next id must move past it.
        write_file(&fs, "b", b"2");
        let dir = fs.fs.lock();
        assert_eq!(dir.max_file_id, 2);
    }
}
