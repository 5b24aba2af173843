// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use core::fmt;

/// Various errors
#[derive(Clone, Copy, Eq, Ord, PartialEq, PartialOrd)]
pub enum Error {
    Driver,
    NoSpace,
    NotFound,
    NotMounted,
    Mounted,
    NoFilesystem,
    Corrupt,
    NameTooLong,
    FileOpen,
    BadHandle,
    ShortBuffer,
    Unsupported,
}

impl Error {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Driver => "Flash driver failure",
            Self::NoSpace => "No free blocks left on device",
            Self::NotFound => "No such file",
            Self::NotMounted => "Filesystem is not mounted",
            Self::Mounted => "Filesystem is already mounted",
            Self::NoFilesystem => "No inode block zero found on device",
            Self::Corrupt => "Unrecognized block type on device",
            Self::NameTooLong => "File name exceeds maximum length",
            Self::FileOpen => "File is open",
            Self::BadHandle => "Stale or unknown file handle",
            Self::ShortBuffer => "Caller buffer is too small",
            Self::Unsupported => "Operation is not supported",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> core::result::Result<(), fmt::Error> {
        write!(f, "{}", self.as_str())
    }
}

pub type Result<T> = core::result::Result<T, Error>;
