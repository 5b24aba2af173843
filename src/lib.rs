// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `flog` is a log-structured filesystem for raw NAND flash, aimed at
//! small embedded systems with a few kilobytes to spare for
//! filesystem state and a single flash chip behind a thin driver.
//!
//! NAND offers two mutations: programming, which can only clear bits
//! within a page, and erasing, which sets a whole block back to
//! all-1s.  Everything here is built on that asymmetry.  Files are
//! append-only streams laid out as chains of blocks; directory
//! entries, block links, and deletions are all records programmed
//! into previously erased sectors, with "not yet written" encoded as
//! the all-1s sentinel.  Monotone timestamps stamped on every
//! mutation give mount an unambiguous happens-after order, so a scan
//! of the device plus a replay of the inode chain reconstructs the
//! whole state after any power loss, finishing the one allocation or
//! deletion that may have been in flight.
//!
//! The flash driver is consumed through the [`Flash`] trait; see
//! [`FileSystem`] for the operations.  Geometry is fixed per build in
//! [`geom`], and the bit-exact on-flash record shapes live in
//! [`layout`].

#![cfg_attr(not(any(test, clippy)), no_std)]
#![forbid(unsafe_op_in_unsafe_fn)]

extern crate alloc;

mod allocator;
mod chain;
mod flash;
mod fs;
pub mod geom;
mod inode;
pub mod layout;
mod read;
mod result;
mod write;

#[cfg(test)]
mod fakes;

pub use flash::Flash;
pub use fs::{FileSystem, LsHandle, ReadHandle, WriteHandle};
pub use result::{Error, Result};
