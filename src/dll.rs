// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 Nathaniel Bennett <me[at]nathanielbennett[dotcom]>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Raw Wintun ABI: handle types, constants and the table of driver entry points.

#[cfg(windows)]
mod api;
#[cfg(windows)]
mod dlopen;
#[cfg(all(windows, feature = "link"))]
mod link;

use std::borrow::Cow;
use std::io;
use std::path::PathBuf;
use std::ptr::NonNull;
use std::time::Duration;

#[cfg(windows)]
pub(crate) use api::NativeDriver;

use crate::config::Guid;

/// The minimum ring capacity of a Wintun session.
pub const MIN_RING_CAPACITY: u32 = 0x20000; // 128 KiB
/// The maximum ring capacity of a Wintun session.
pub const MAX_RING_CAPACITY: u32 = 0x4000000; // 64 MiB
/// The ring capacity used when none is configured.
pub const DEFAULT_RING_CAPACITY: u32 = 0x200000; // 2 MiB
/// The maximum IP packet size that can be moved through a Wintun session.
pub const MAX_IP_PACKET_SIZE: usize = 0xFFFF;
/// The maximum length of an adapter name or tunnel type, including the null terminator.
pub const MAX_ADAPTER_NAME: usize = 128;

/// The session ring has no packets available.
pub(crate) const ERROR_NO_MORE_ITEMS: i32 = 259;
/// The adapter is terminating.
pub(crate) const ERROR_HANDLE_EOF: i32 = 38;
/// The session ring has no room for another send packet.
pub(crate) const ERROR_BUFFER_OVERFLOW: i32 = 111;
/// A session is already running on the adapter.
pub(crate) const ERROR_ALREADY_INITIALIZED: i32 = 1247;

/// An opaque Wintun adapter type that WINTUN_ADAPTER_HANDLE would point to.
pub type WintunAdapter = libc::c_void;

/// An opaque Wintun session type that WINTUN_SESSION_HANDLE would point to.
pub type WintunSession = libc::c_void;

pub type WintunPacket = NonNull<u8>;

/// The severity passed to a [`WintunLoggerCallback`] (0 = info, 1 = warning, 2 = error).
pub type WintunLoggerLevel = i32;

/// Called by internal logger to report diagnostic messages.
///
/// #Arguments
/// * `level` The log level of the message
/// * `timestamp` The time at which the message was logged, measured in 100ns intervals since
/// 1601-01-01 UTC
/// * `message` The null-terminated UTF-16 text of the log message
pub type WintunLoggerCallback =
    unsafe extern "system" fn(level: WintunLoggerLevel, timestamp: u64, message: *const u16);

pub(crate) type RawAdapter = NonNull<WintunAdapter>;
pub(crate) type RawSession = NonNull<WintunSession>;

/// Where the Wintun library is loaded from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DllSource {
    /// A path to `wintun.dll`. A bare file name is resolved from the application directory and
    /// then `System32`.
    Path(PathBuf),
    /// The image of `wintun.dll`, such as one embedded with `include_bytes!`.
    ///
    /// The image is written to a private temporary directory and loaded from there. The file is
    /// removed once the library is unloaded.
    Memory(Cow<'static, [u8]>),
}

impl Default for DllSource {
    fn default() -> Self {
        DllSource::Path(PathBuf::from("wintun.dll"))
    }
}

impl From<PathBuf> for DllSource {
    fn from(value: PathBuf) -> Self {
        DllSource::Path(value)
    }
}

impl From<&std::path::Path> for DllSource {
    fn from(value: &std::path::Path) -> Self {
        DllSource::Path(value.to_path_buf())
    }
}

impl From<&str> for DllSource {
    fn from(value: &str) -> Self {
        DllSource::Path(PathBuf::from(value))
    }
}

impl From<&'static [u8]> for DllSource {
    fn from(value: &'static [u8]) -> Self {
        DllSource::Memory(Cow::Borrowed(value))
    }
}

impl From<Vec<u8>> for DllSource {
    fn from(value: Vec<u8>) -> Self {
        DllSource::Memory(Cow::Owned(value))
    }
}

/// The Wintun entry points used by adapters and sessions.
///
/// Every method maps onto one exported Wintun function, except [`wait_readable`] which waits on
/// the session's read-wait event. Raw handles passed to the `unsafe` methods must have been
/// returned by the same driver and must not have been closed or ended.
///
/// [`wait_readable`]: Driver::wait_readable
pub(crate) trait Driver: Send + Sync {
    /// `name` and `tunnel_type` must be null-terminated.
    fn create_adapter(
        &self,
        name: &[u16],
        tunnel_type: &[u16],
        requested_guid: Option<&Guid>,
    ) -> io::Result<RawAdapter>;

    /// `name` must be null-terminated.
    fn open_adapter(&self, name: &[u16]) -> io::Result<RawAdapter>;

    unsafe fn close_adapter(&self, adapter: RawAdapter);

    fn delete_driver(&self) -> io::Result<()>;

    unsafe fn adapter_luid(&self, adapter: RawAdapter) -> u64;

    fn driver_version(&self) -> io::Result<u32>;

    /// Passing `None` disables driver logging.
    unsafe fn set_logger(&self, callback: Option<WintunLoggerCallback>);

    unsafe fn start_session(&self, adapter: RawAdapter, capacity: u32) -> io::Result<RawSession>;

    unsafe fn end_session(&self, session: RawSession);

    /// Returns the packet and its length. Fails with `ERROR_NO_MORE_ITEMS` when the ring is empty.
    unsafe fn receive_packet(&self, session: RawSession) -> io::Result<(WintunPacket, u32)>;

    unsafe fn release_receive_packet(&self, session: RawSession, packet: WintunPacket);

    /// Fails with `ERROR_BUFFER_OVERFLOW` when the ring is full.
    unsafe fn allocate_send_packet(
        &self,
        session: RawSession,
        packet_size: u32,
    ) -> io::Result<WintunPacket>;

    unsafe fn send_packet(&self, session: RawSession, packet: WintunPacket);

    /// Blocks until the session signals readable data or `timeout` elapses.
    ///
    /// Returns `true` if the read-wait event was signalled.
    unsafe fn wait_readable(&self, session: RawSession, timeout: Duration) -> io::Result<bool>;
}
