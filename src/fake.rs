// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 Nathaniel Bennett <me[at]nathanielbennett[dotcom]>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! An in-memory stand-in for `wintun.dll` used by unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::ptr::NonNull;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use crate::config::Guid;
use crate::dll::{
    Driver, RawAdapter, RawSession, WintunLoggerCallback, WintunPacket, ERROR_ALREADY_INITIALIZED,
    ERROR_BUFFER_OVERFLOW, ERROR_HANDLE_EOF, ERROR_NO_MORE_ITEMS,
};

const ERROR_FILE_NOT_FOUND: i32 = 2;
const ERROR_INVALID_HANDLE: i32 = 6;
const ERROR_GEN_FAILURE: i32 = 31;

#[derive(Default)]
pub(crate) struct FakeState {
    next_handle: usize,
    /// Adapters that exist on the "system", by name.
    pub existing: HashSet<String>,
    /// Open adapter handles and the name each refers to.
    pub adapters: HashMap<usize, String>,
    /// Running sessions and the adapter each belongs to.
    pub sessions: HashMap<usize, usize>,
    pub inbound: VecDeque<Vec<u8>>,
    pub received: HashMap<usize, Box<[u8]>>,
    pub allocated: HashMap<usize, Box<[u8]>>,
    pub sent: Vec<Vec<u8>>,
    /// Remaining send allocations before the ring reports full; `None` is unlimited.
    pub send_capacity: Option<usize>,
    pub last_guid: Option<Guid>,
    pub last_tunnel_type: Option<String>,
    pub logger: Option<WintunLoggerCallback>,
    pub fail_start_session: bool,
    /// Makes session calls report that the adapter is terminating.
    pub terminating: bool,
    pub driver_loaded: bool,
}

pub(crate) struct FakeDriver {
    state: Mutex<FakeState>,
    readable: Condvar,
}

impl FakeDriver {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FakeState {
                next_handle: 0x1000,
                ..Default::default()
            }),
            readable: Condvar::new(),
        })
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub(crate) fn push_inbound(&self, packet: &[u8]) {
        self.state().inbound.push_back(packet.to_vec());
        self.readable.notify_all();
    }

    pub(crate) fn luid_for(handle: RawAdapter) -> u64 {
        (53u64 << 48) | ((handle.as_ptr() as u64 & 0xff_ffff) << 24)
    }

    fn next_handle(state: &mut FakeState) -> NonNull<libc::c_void> {
        state.next_handle += 0x10;
        NonNull::new(state.next_handle as *mut libc::c_void).unwrap()
    }

    fn decode(name: &[u16]) -> String {
        String::from_utf16_lossy(&name[..name.len() - 1])
    }
}

impl Driver for FakeDriver {
    fn create_adapter(
        &self,
        name: &[u16],
        tunnel_type: &[u16],
        requested_guid: Option<&Guid>,
    ) -> io::Result<RawAdapter> {
        let mut state = self.state();
        let name = Self::decode(name);
        let handle = Self::next_handle(&mut state);

        state.existing.insert(name.clone());
        state.adapters.insert(handle.as_ptr() as usize, name);
        state.last_guid = requested_guid.copied();
        state.last_tunnel_type = Some(Self::decode(tunnel_type));
        state.driver_loaded = true;
        Ok(handle)
    }

    fn open_adapter(&self, name: &[u16]) -> io::Result<RawAdapter> {
        let mut state = self.state();
        let name = Self::decode(name);
        if !state.existing.contains(&name) {
            return Err(io::Error::from_raw_os_error(ERROR_FILE_NOT_FOUND));
        }

        let handle = Self::next_handle(&mut state);
        state.adapters.insert(handle.as_ptr() as usize, name);
        Ok(handle)
    }

    unsafe fn close_adapter(&self, adapter: RawAdapter) {
        let mut state = self.state();
        let key = adapter.as_ptr() as usize;
        assert!(
            !state.sessions.values().any(|a| *a == key),
            "adapter closed while a session is still running"
        );
        state.adapters.remove(&key).expect("adapter closed twice");
    }

    fn delete_driver(&self) -> io::Result<()> {
        let mut state = self.state();
        if !state.adapters.is_empty() {
            return Err(io::Error::from_raw_os_error(ERROR_GEN_FAILURE));
        }
        state.driver_loaded = false;
        Ok(())
    }

    unsafe fn adapter_luid(&self, adapter: RawAdapter) -> u64 {
        assert!(self.state().adapters.contains_key(&(adapter.as_ptr() as usize)));
        Self::luid_for(adapter)
    }

    fn driver_version(&self) -> io::Result<u32> {
        if self.state().driver_loaded {
            Ok(0x0000_000e)
        } else {
            Err(io::Error::from_raw_os_error(ERROR_FILE_NOT_FOUND))
        }
    }

    unsafe fn set_logger(&self, callback: Option<WintunLoggerCallback>) {
        self.state().logger = callback;
    }

    unsafe fn start_session(&self, adapter: RawAdapter, _capacity: u32) -> io::Result<RawSession> {
        let mut state = self.state();
        let key = adapter.as_ptr() as usize;
        if state.fail_start_session {
            return Err(io::Error::from_raw_os_error(ERROR_GEN_FAILURE));
        }
        if state.sessions.values().any(|a| *a == key) {
            return Err(io::Error::from_raw_os_error(ERROR_ALREADY_INITIALIZED));
        }

        let handle = Self::next_handle(&mut state);
        state.sessions.insert(handle.as_ptr() as usize, key);
        Ok(handle)
    }

    unsafe fn end_session(&self, session: RawSession) {
        let mut state = self.state();
        assert!(
            state.received.is_empty() && state.allocated.is_empty(),
            "session ended with packets outstanding"
        );
        state
            .sessions
            .remove(&(session.as_ptr() as usize))
            .expect("session ended twice");
    }

    unsafe fn receive_packet(&self, session: RawSession) -> io::Result<(WintunPacket, u32)> {
        let mut state = self.state();
        if !state.sessions.contains_key(&(session.as_ptr() as usize)) {
            return Err(io::Error::from_raw_os_error(ERROR_INVALID_HANDLE));
        }
        if state.terminating {
            return Err(io::Error::from_raw_os_error(ERROR_HANDLE_EOF));
        }

        let Some(packet) = state.inbound.pop_front() else {
            return Err(io::Error::from_raw_os_error(ERROR_NO_MORE_ITEMS));
        };

        let mut packet = packet.into_boxed_slice();
        let len = packet.len() as u32;
        let ptr = NonNull::new(packet.as_mut_ptr()).unwrap();
        state.received.insert(ptr.as_ptr() as usize, packet);
        Ok((ptr, len))
    }

    unsafe fn release_receive_packet(&self, session: RawSession, packet: WintunPacket) {
        let mut state = self.state();
        assert!(state.sessions.contains_key(&(session.as_ptr() as usize)));
        state
            .received
            .remove(&(packet.as_ptr() as usize))
            .expect("packet released twice");
    }

    unsafe fn allocate_send_packet(
        &self,
        session: RawSession,
        packet_size: u32,
    ) -> io::Result<WintunPacket> {
        let mut state = self.state();
        if !state.sessions.contains_key(&(session.as_ptr() as usize)) {
            return Err(io::Error::from_raw_os_error(ERROR_INVALID_HANDLE));
        }
        if state.terminating {
            return Err(io::Error::from_raw_os_error(ERROR_HANDLE_EOF));
        }

        match state.send_capacity {
            Some(0) => return Err(io::Error::from_raw_os_error(ERROR_BUFFER_OVERFLOW)),
            Some(ref mut remaining) => *remaining -= 1,
            None => (),
        }

        let mut packet = vec![0xa5u8; packet_size as usize].into_boxed_slice();
        let ptr = NonNull::new(packet.as_mut_ptr()).unwrap();
        state.allocated.insert(ptr.as_ptr() as usize, packet);
        Ok(ptr)
    }

    unsafe fn send_packet(&self, session: RawSession, packet: WintunPacket) {
        let mut state = self.state();
        assert!(state.sessions.contains_key(&(session.as_ptr() as usize)));
        let packet = state
            .allocated
            .remove(&(packet.as_ptr() as usize))
            .expect("packet sent twice");
        state.sent.push(packet.into_vec());
    }

    unsafe fn wait_readable(&self, session: RawSession, timeout: Duration) -> io::Result<bool> {
        let state = self.state();
        if !state.sessions.contains_key(&(session.as_ptr() as usize)) {
            return Err(io::Error::from_raw_os_error(ERROR_INVALID_HANDLE));
        }

        let (state, _) = self
            .readable
            .wait_timeout_while(state, timeout, |s| s.inbound.is_empty())
            .unwrap();
        Ok(!state.inbound.is_empty())
    }
}
