// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 Nathaniel Bennett <me[at]nathanielbennett[dotcom]>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Reference-counted native handles.
//!
//! An [`Adapter`](crate::Adapter) only detaches these handles when it is stopped or closed; the
//! native handle is released once the last in-flight call or packet referencing it is dropped.

use std::io;
use std::mem::ManuallyDrop;
use std::ops::Deref;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use crate::dll::{Driver, RawAdapter, RawSession, ERROR_HANDLE_EOF, ERROR_NO_MORE_ITEMS};
use crate::error::{Error, Result};
use crate::luid::Luid;
use crate::packet::{RecvPacket, SendPacket};

/// An open `WINTUN_ADAPTER_HANDLE`, closed when dropped.
pub(crate) struct AdapterHandle {
    driver: Arc<dyn Driver>,
    raw: RawAdapter,
    name: String,
}

impl AdapterHandle {
    pub(crate) fn new(driver: Arc<dyn Driver>, raw: RawAdapter, name: &str) -> Arc<Self> {
        Arc::new(Self {
            driver,
            raw,
            name: name.into(),
        })
    }

    pub(crate) fn luid(&self) -> Luid {
        Luid::from(unsafe { self.driver.adapter_luid(self.raw) })
    }
}

impl Drop for AdapterHandle {
    fn drop(&mut self) {
        unsafe {
            self.driver.close_adapter(self.raw);
        }
        log::debug!("closed adapter {}", self.name);
    }
}

// SAFETY: Wintun adapter handles may be used and closed from any thread.
unsafe impl Send for AdapterHandle {}

// SAFETY: the handle itself is never mutated through a shared reference.
unsafe impl Sync for AdapterHandle {}

/// A running `WINTUN_SESSION_HANDLE`, ended when dropped.
///
/// Each session has its own ring for sending and receiving packets and keeps its adapter open.
pub(crate) struct Session {
    adapter: Arc<AdapterHandle>,
    raw: RawSession,
    capacity: u32,
    calls: Arc<CallCount>,
}

/// Number of adapter calls currently using a session.
#[derive(Default)]
struct CallCount {
    active: Mutex<usize>,
    idle: Condvar,
}

impl Session {
    pub(crate) fn start(adapter: &Arc<AdapterHandle>, capacity: u32) -> Result<Arc<Self>> {
        let raw = unsafe { adapter.driver.start_session(adapter.raw, capacity)? };
        log::debug!(
            "started session on adapter {} (ring capacity {:#x})",
            adapter.name,
            capacity
        );

        Ok(Arc::new(Self {
            adapter: adapter.clone(),
            raw,
            capacity,
            calls: Arc::default(),
        }))
    }

    /// Registers a call using the session until the returned guard is dropped.
    pub(crate) fn enter(self: &Arc<Self>) -> ActiveSession {
        *self.calls.active.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        ActiveSession {
            calls: self.calls.clone(),
            session: ManuallyDrop::new(self.clone()),
        }
    }

    /// Blocks until every call registered through [`enter()`](Self::enter) has finished.
    pub(crate) fn wait_idle(&self) {
        let active = self.calls.active.lock().unwrap_or_else(PoisonError::into_inner);
        let _active = self
            .calls
            .idle
            .wait_while(active, |n| *n > 0)
            .unwrap_or_else(PoisonError::into_inner);
    }

    #[inline]
    pub(crate) fn capacity(&self) -> u32 {
        self.capacity
    }

    #[inline]
    pub(crate) fn driver(&self) -> &dyn Driver {
        &*self.adapter.driver
    }

    #[inline]
    pub(crate) fn raw(&self) -> RawSession {
        self.raw
    }

    /// Retrieves the next packet from the ring, or `None` if it is empty.
    pub(crate) fn try_receive(self: &Arc<Self>) -> Result<Option<RecvPacket>> {
        // SAFETY: the session stays alive for as long as `self` does.
        match unsafe { self.driver().receive_packet(self.raw) } {
            Ok((packet, len)) => Ok(Some(RecvPacket::new(self.clone(), packet, len as usize))),
            Err(e) if e.raw_os_error() == Some(ERROR_NO_MORE_ITEMS) => Ok(None),
            Err(e) => Err(Self::map_error(e)),
        }
    }

    fn map_error(err: io::Error) -> Error {
        match err.raw_os_error() {
            // The adapter is being torn down underneath the session.
            Some(ERROR_HANDLE_EOF) => Error::AdapterClosed,
            _ => Error::Io(err),
        }
    }

    /// Waits at most `timeout` for the ring to become readable.
    pub(crate) fn wait_readable(&self, timeout: Duration) -> Result<bool> {
        Ok(unsafe { self.driver().wait_readable(self.raw, timeout)? })
    }

    /// Allocates a send packet of `len` bytes, failing with `ERROR_BUFFER_OVERFLOW` if the ring
    /// is full.
    pub(crate) fn try_allocate(self: &Arc<Self>, len: usize) -> Result<SendPacket> {
        let packet = unsafe { self.driver().allocate_send_packet(self.raw, len as u32) }
            .map_err(Self::map_error)?;
        Ok(SendPacket::new(self.clone(), packet, len))
    }
}

/// A session in use by an adapter call.
///
/// The session reference is dropped before the call is unregistered, so once
/// [`Session::wait_idle`] returns only packets can still keep the session alive.
pub(crate) struct ActiveSession {
    calls: Arc<CallCount>,
    session: ManuallyDrop<Arc<Session>>,
}

impl Deref for ActiveSession {
    type Target = Arc<Session>;

    fn deref(&self) -> &Arc<Session> {
        &self.session
    }
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        // SAFETY: `session` is not used again.
        unsafe { ManuallyDrop::drop(&mut self.session) };

        let mut active = self.calls.active.lock().unwrap_or_else(PoisonError::into_inner);
        *active -= 1;
        if *active == 0 {
            self.calls.idle.notify_all();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        unsafe {
            self.adapter.driver.end_session(self.raw);
        }
        log::debug!("ended session on adapter {}", self.adapter.name);
    }
}

// SAFETY: every Wintun session function is thread-safe.
unsafe impl Send for Session {}

// SAFETY: see above.
unsafe impl Sync for Session {}
