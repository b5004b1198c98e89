// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 Nathaniel Bennett <me[at]nathanielbennett[dotcom]>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

#![allow(non_snake_case)]

use std::ptr::NonNull;
use std::time::Duration;
use std::{io, ptr};

use windows_sys::core::PCWSTR;
use windows_sys::Win32::Foundation::{BOOL, HANDLE, WAIT_FAILED, WAIT_OBJECT_0, WAIT_TIMEOUT};
use windows_sys::Win32::NetworkManagement::Ndis::NET_LUID_LH;
use windows_sys::Win32::System::Threading::{WaitForSingleObject, INFINITE};

use super::dlopen::Module;
use super::{
    Driver, RawAdapter, RawSession, WintunAdapter, WintunLoggerCallback, WintunPacket,
    WintunSession,
};
use crate::config::Guid;

pub(super) struct WintunApi {
    /// Creates a new Wintun adapter.
    ///
    /// # Arguments
    ///
    /// * `name` - The name of the adapter. Must be null-terminated and less than `MAX_ADAPTER_NAME`
    /// characters.
    /// * `tunnel_type` - The name of the adapter tunnel type. Must be null-terminated and less than
    /// `MAX_ADAPTER_NAME` characters.
    /// * `requested_guid` - The GUID of the created network adapter, or NULL to have one generated.
    pub WintunCreateAdapter: unsafe extern "system" fn(
        name: PCWSTR,
        tunnel_type: PCWSTR,
        requested_guid: *const Guid,
    ) -> *mut WintunAdapter,

    /// Opens an existing Wintun adapter.
    pub WintunOpenAdapter: unsafe extern "system" fn(name: PCWSTR) -> *mut WintunAdapter,

    /// Releases resources for the specified adapter. If `adapter` was created with
    /// `WintunCreateAdapter`, removes the adapter from the system.
    pub WintunCloseAdapter: unsafe extern "system" fn(adapter: *mut WintunAdapter),

    /// Deletes the Wintun driver. If any adapters are currently in use, this call will fail.
    pub WintunDeleteDriver: unsafe extern "system" fn() -> BOOL,

    /// Returns the LUID of the adapter.
    pub WintunGetAdapterLUID:
        unsafe extern "system" fn(adapter: *mut WintunAdapter, luid: *mut NET_LUID_LH),

    /// Returns the version number for the loaded Wintun driver.
    ///
    /// # Errors
    ///
    /// If Wintun is not loaded at the time this method is called, a value of 0 will be returned
    /// and `ERROR_FILE_NOT_FOUND` will be set as the last error.
    pub WintunGetRunningDriverVersion: unsafe extern "system" fn() -> u32,

    /// Sets the callback function to be called at each log event, or NULL to disable logging.
    pub WintunSetLogger: unsafe extern "system" fn(log_callback: Option<WintunLoggerCallback>),

    /// Starts a Wintun session. `capacity` must be a power of two between `MIN_RING_CAPACITY`
    /// and `MAX_RING_CAPACITY`.
    pub WintunStartSession: unsafe extern "system" fn(
        adapter: *mut WintunAdapter,
        capacity: u32,
    ) -> *mut WintunSession,

    /// Ends the given Wintun session.
    pub WintunEndSession: unsafe extern "system" fn(session: *mut WintunSession),

    /// Gets the Wintun session's read-wait event handle to use for waiting for available reads.
    pub WintunGetReadWaitEvent: unsafe extern "system" fn(session: *mut WintunSession) -> HANDLE,

    /// Retrieves a single packet from the Wintun interface.
    ///
    /// The returned buffer must be released using `WintunReleaseReceivePacket`. This function is
    /// thread-safe.
    ///
    /// # Errors
    ///
    /// * `ERROR_HANDLE_EOF` - The Wintun adapter is terminating.
    /// * `ERROR_NO_MORE_ITEMS` - The Wintun buffer is exhausted.
    /// * `ERROR_INVALID_DATA` - The Wintun buffer is corrupt.
    pub WintunReceivePacket:
        unsafe extern "system" fn(session: *mut WintunSession, packet_size: *mut u32) -> *mut u8,

    /// Releases internal resources for a packet received on the given Wintun session.
    pub WintunReleaseReceivePacket:
        unsafe extern "system" fn(session: *mut WintunSession, packet: *const u8),

    /// Allocates a packet to be sent over the Wintun session.
    ///
    /// The order in which packets are allocated determines the order in which they are sent,
    /// regardless of the order `WintunSendPacket` is called in.
    ///
    /// # Errors
    ///
    /// * `ERROR_HANDLE_EOF` - The Wintun adapter is terminating.
    /// * `ERROR_BUFFER_OVERFLOW` - There is insufficient space in the session's ring.
    pub WintunAllocateSendPacket:
        unsafe extern "system" fn(session: *mut WintunSession, packet_size: u32) -> *mut u8,

    /// Sends the packet and releases its internal buffer. This function is thread-safe.
    pub WintunSendPacket: unsafe extern "system" fn(session: *mut WintunSession, packet: *const u8),
}

/// A resolved Wintun function table together with the module backing it.
pub(crate) struct NativeDriver {
    api: WintunApi,
    // Dropped after `api`; `None` when the table was linked at load time.
    _module: Option<Module>,
}

impl NativeDriver {
    pub(super) fn new(api: WintunApi, module: Option<Module>) -> Self {
        Self {
            api,
            _module: module,
        }
    }

    #[cfg(test)]
    pub(super) fn module(&self) -> Option<&Module> {
        self._module.as_ref()
    }
}

impl Driver for NativeDriver {
    fn create_adapter(
        &self,
        name: &[u16],
        tunnel_type: &[u16],
        requested_guid: Option<&Guid>,
    ) -> io::Result<RawAdapter> {
        if name.last() != Some(&0) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "adapter name not null-terminated",
            ));
        }

        if tunnel_type.last() != Some(&0) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "tunnel type not null-terminated",
            ));
        }

        let guid = requested_guid.map_or(ptr::null(), |g| g as *const Guid);
        let handle =
            unsafe { (self.api.WintunCreateAdapter)(name.as_ptr(), tunnel_type.as_ptr(), guid) };
        NonNull::new(handle).ok_or_else(io::Error::last_os_error)
    }

    fn open_adapter(&self, name: &[u16]) -> io::Result<RawAdapter> {
        if name.last() != Some(&0) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "adapter name not null-terminated",
            ));
        }

        let handle = unsafe { (self.api.WintunOpenAdapter)(name.as_ptr()) };
        NonNull::new(handle).ok_or_else(io::Error::last_os_error)
    }

    unsafe fn close_adapter(&self, adapter: RawAdapter) {
        (self.api.WintunCloseAdapter)(adapter.as_ptr())
    }

    fn delete_driver(&self) -> io::Result<()> {
        if unsafe { (self.api.WintunDeleteDriver)() } == 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    unsafe fn adapter_luid(&self, adapter: RawAdapter) -> u64 {
        let mut luid = NET_LUID_LH { Value: 0 };
        (self.api.WintunGetAdapterLUID)(adapter.as_ptr(), ptr::addr_of_mut!(luid));
        luid.Value
    }

    fn driver_version(&self) -> io::Result<u32> {
        match unsafe { (self.api.WintunGetRunningDriverVersion)() } {
            0 => Err(io::Error::last_os_error()),
            v => Ok(v),
        }
    }

    unsafe fn set_logger(&self, callback: Option<WintunLoggerCallback>) {
        (self.api.WintunSetLogger)(callback)
    }

    unsafe fn start_session(&self, adapter: RawAdapter, capacity: u32) -> io::Result<RawSession> {
        let session = (self.api.WintunStartSession)(adapter.as_ptr(), capacity);
        NonNull::new(session).ok_or_else(io::Error::last_os_error)
    }

    unsafe fn end_session(&self, session: RawSession) {
        (self.api.WintunEndSession)(session.as_ptr())
    }

    unsafe fn receive_packet(&self, session: RawSession) -> io::Result<(WintunPacket, u32)> {
        let mut packet_size = 0u32;
        let pkt = (self.api.WintunReceivePacket)(session.as_ptr(), &mut packet_size);
        NonNull::new(pkt)
            .map(|pkt| (pkt, packet_size))
            .ok_or_else(io::Error::last_os_error)
    }

    unsafe fn release_receive_packet(&self, session: RawSession, packet: WintunPacket) {
        (self.api.WintunReleaseReceivePacket)(session.as_ptr(), packet.as_ptr())
    }

    unsafe fn allocate_send_packet(
        &self,
        session: RawSession,
        packet_size: u32,
    ) -> io::Result<WintunPacket> {
        let pkt = (self.api.WintunAllocateSendPacket)(session.as_ptr(), packet_size);
        NonNull::new(pkt).ok_or_else(io::Error::last_os_error)
    }

    unsafe fn send_packet(&self, session: RawSession, packet: WintunPacket) {
        (self.api.WintunSendPacket)(session.as_ptr(), packet.as_ptr())
    }

    unsafe fn wait_readable(&self, session: RawSession, timeout: Duration) -> io::Result<bool> {
        let event = (self.api.WintunGetReadWaitEvent)(session.as_ptr());
        if event.is_null() {
            return Err(io::Error::last_os_error());
        }

        let millis = u32::try_from(timeout.as_millis()).unwrap_or(INFINITE - 1);
        match WaitForSingleObject(event, millis) {
            WAIT_OBJECT_0 => Ok(true),
            WAIT_TIMEOUT => Ok(false),
            WAIT_FAILED => Err(io::Error::last_os_error()),
            status => Err(io::Error::new(
                io::ErrorKind::Other,
                format!("unexpected wait status {:#x}", status),
            )),
        }
    }
}

// SAFETY: every Wintun export is thread-safe, and the module handle is only freed on drop.
unsafe impl Send for NativeDriver {}

// SAFETY: see above; no method mutates the function table.
unsafe impl Sync for NativeDriver {}
