// Copyright 2020 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Errors that can happen while capturing and releasing memory.

use std::error;
use std::fmt::{self, Display};
use std::io;

pub type Result<T> = std::result::Result<T, Error>;

#[remain::sorted]
#[derive(Debug)]
pub enum Error {
    DropCaches(io::Error),
    Map(io::Error),
    MissingFreePages,
    PageOutOfRange { page: usize, pages: usize },
    ParseStats(String),
    ReadStats(io::Error),
    Release(io::Error),
    TooManyRounds { rounds: usize, max: usize },
    WriteRecord(io::Error),
}

impl Error {
    /// Returns the process exit code for this error.  Each failure class has
    /// its own code so that it can be told apart from captured logs alone.
    pub fn exit_code(&self) -> i32 {
        use self::Error::*;

        match self {
            MissingFreePages | ParseStats(_) | ReadStats(_) => libc::ENOKEY,
            Map(_) => libc::ENOMEM,
            PageOutOfRange { .. } | Release(_) | TooManyRounds { .. } => libc::EINVAL,
            DropCaches(_) | WriteRecord(_) => libc::EIO,
        }
    }
}

impl Display for Error {
    #[remain::check]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use self::Error::*;

        #[sorted]
        match self {
            DropCaches(e) => write!(f, "failure in drop_caches: {}", e),
            Map(e) => write!(f, "failure in mmap: {}", e),
            MissingFreePages => write!(f, "missing 'nr_free_pages' from vmstat"),
            PageOutOfRange { page, pages } => {
                write!(f, "page {} outside of mapping of {} pages", page, pages)
            }
            ParseStats(s) => write!(f, "unexpected vmstat value: {}", s),
            ReadStats(e) => write!(f, "cannot read vmstat: {}", e),
            Release(e) => write!(f, "failure in madvise: {}", e),
            TooManyRounds { rounds, max } => {
                write!(f, "{} timing rounds requested, room for {}", rounds, max)
            }
            WriteRecord(e) => write!(f, "cannot write timing record: {}", e),
        }
    }
}

impl error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    fn os_error(errno: i32) -> io::Error {
        io::Error::from_raw_os_error(errno)
    }

    #[test]
    fn exit_codes_are_distinguished() {
        assert_eq!(Error::MissingFreePages.exit_code(), libc::ENOKEY);
        assert_eq!(Error::ReadStats(os_error(libc::ENOENT)).exit_code(), libc::ENOKEY);
        assert_eq!(Error::ParseStats("x".into()).exit_code(), libc::ENOKEY);
        assert_eq!(Error::Map(os_error(libc::ENOMEM)).exit_code(), libc::ENOMEM);
        assert_eq!(Error::Release(os_error(libc::EINVAL)).exit_code(), libc::EINVAL);
        assert_eq!(
            Error::PageOutOfRange { page: 4, pages: 4 }.exit_code(),
            libc::EINVAL
        );
        assert_eq!(
            Error::TooManyRounds { rounds: 65, max: 64 }.exit_code(),
            libc::EINVAL
        );
        assert_ne!(Error::MissingFreePages.exit_code(), Error::Map(os_error(0)).exit_code());
    }

    #[test]
    fn display_carries_os_error_text() {
        let message = Error::Map(os_error(libc::ENOMEM)).to_string();
        assert!(message.starts_with("failure in mmap: "), "{}", message);
        assert!(message.contains(&os_error(libc::ENOMEM).to_string()), "{}", message);
    }
}
