// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 Nathaniel Bennett <me[at]nathanielbennett[dotcom]>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Load-time dynamic linking of the Wintun library.

#![allow(non_snake_case)]

use windows_sys::core::PCWSTR;
use windows_sys::Win32::Foundation::{BOOL, HANDLE};
use windows_sys::Win32::NetworkManagement::Ndis::NET_LUID_LH;

use super::api::{NativeDriver, WintunApi};
use super::{WintunAdapter, WintunLoggerCallback, WintunSession};
use crate::config::Guid;

#[link(name = "wintun", kind = "raw-dylib")]
extern "system" {
    fn WintunCreateAdapter(
        name: PCWSTR,
        tunnel_type: PCWSTR,
        requested_guid: *const Guid,
    ) -> *mut WintunAdapter;

    fn WintunOpenAdapter(name: PCWSTR) -> *mut WintunAdapter;

    fn WintunCloseAdapter(adapter: *mut WintunAdapter);

    fn WintunDeleteDriver() -> BOOL;

    fn WintunGetAdapterLUID(adapter: *mut WintunAdapter, luid: *mut NET_LUID_LH);

    fn WintunGetRunningDriverVersion() -> u32;

    fn WintunSetLogger(log_callback: Option<WintunLoggerCallback>);

    fn WintunStartSession(adapter: *mut WintunAdapter, capacity: u32) -> *mut WintunSession;

    fn WintunEndSession(session: *mut WintunSession);

    fn WintunGetReadWaitEvent(session: *mut WintunSession) -> HANDLE;

    fn WintunReceivePacket(session: *mut WintunSession, packet_size: *mut u32) -> *mut u8;

    fn WintunReleaseReceivePacket(session: *mut WintunSession, packet: *const u8);

    fn WintunAllocateSendPacket(session: *mut WintunSession, packet_size: u32) -> *mut u8;

    fn WintunSendPacket(session: *mut WintunSession, packet: *const u8);
}

impl NativeDriver {
    /// Uses the Wintun functions imported when the process was loaded.
    pub(crate) fn linked() -> Self {
        let api = WintunApi {
            WintunCreateAdapter,
            WintunOpenAdapter,
            WintunCloseAdapter,
            WintunDeleteDriver,
            WintunGetAdapterLUID,
            WintunGetRunningDriverVersion,
            WintunSetLogger,
            WintunStartSession,
            WintunEndSession,
            WintunGetReadWaitEvent,
            WintunReceivePacket,
            WintunReleaseReceivePacket,
            WintunAllocateSendPacket,
            WintunSendPacket,
        };

        NativeDriver::new(api, None)
    }
}
