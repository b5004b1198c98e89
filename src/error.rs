// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 Nathaniel Bennett <me[at]nathanielbennett[dotcom]>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::io;

/// Errors returned by Wintun operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The underlying Wintun call or OS facility failed.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// The loaded library does not export a required Wintun function.
    #[error("wintun library is missing the `{0}` export")]
    MissingSymbol(&'static str),

    /// A process-wide Wintun library has already been loaded.
    #[error("wintun already loaded")]
    AlreadyLoaded,

    /// No process-wide Wintun library has been loaded.
    #[error("wintun not loaded")]
    NotLoaded,

    /// The adapter has been closed.
    #[error("adapter closed")]
    AdapterClosed,

    /// The adapter has no running session.
    #[error("adapter session stopped")]
    SessionStopped,

    /// A stopped session is still referenced by outstanding packets, so no new session can be
    /// started yet.
    #[error("previous session still has outstanding packets")]
    SessionBusy,

    /// The requested ring capacity is out of range or not a power of two.
    #[error("invalid ring capacity {0:#x}")]
    InvalidRingCapacity(u32),

    /// The requested packet size is zero or exceeds the maximum IP packet size.
    #[error("invalid packet size {0}")]
    InvalidPacketSize(usize),

    /// The adapter name or tunnel type cannot be passed to Wintun.
    #[error("invalid name {0:?}")]
    InvalidName(String),

    /// The operation was cancelled through its [`CancelToken`](crate::CancelToken).
    #[error("operation cancelled")]
    Cancelled,

    /// The deadline of the operation's [`CancelToken`](crate::CancelToken) passed.
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

impl Error {
    /// Returns the raw Win32 error code carried by this error, if any.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }

    /// Returns the [`io::ErrorKind`] closest to this error.
    pub fn kind(&self) -> io::ErrorKind {
        match self {
            Error::Io(e) => e.kind(),
            Error::MissingSymbol(_) | Error::NotLoaded => io::ErrorKind::NotFound,
            Error::AlreadyLoaded => io::ErrorKind::AlreadyExists,
            Error::AdapterClosed | Error::SessionStopped => io::ErrorKind::NotConnected,
            Error::SessionBusy => io::ErrorKind::Other,
            Error::InvalidRingCapacity(_) | Error::InvalidPacketSize(_) | Error::InvalidName(_) => {
                io::ErrorKind::InvalidInput
            }
            Error::Cancelled => io::ErrorKind::Interrupted,
            Error::DeadlineExceeded => io::ErrorKind::TimedOut,
        }
    }
}

impl From<Error> for io::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::Io(e) => e,
            other => io::Error::new(other.kind(), other),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_errors_pass_through() {
        let err = Error::from(io::Error::from_raw_os_error(259));
        assert_eq!(err.raw_os_error(), Some(259));

        let io_err: io::Error = err.into();
        assert_eq!(io_err.raw_os_error(), Some(259));
    }

    #[test]
    fn lifecycle_errors_map_to_kinds() {
        let io_err: io::Error = Error::AdapterClosed.into();
        assert_eq!(io_err.kind(), io::ErrorKind::NotConnected);
        assert_eq!(io_err.to_string(), "adapter closed");

        let io_err: io::Error = Error::DeadlineExceeded.into();
        assert_eq!(io_err.kind(), io::ErrorKind::TimedOut);

        let io_err: io::Error = Error::InvalidRingCapacity(3).into();
        assert_eq!(io_err.kind(), io::ErrorKind::InvalidInput);
    }
}
