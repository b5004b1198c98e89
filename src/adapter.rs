// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 Nathaniel Bennett <me[at]nathanielbennett[dotcom]>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::{Duration, Instant};
use std::{cmp, fmt, io, thread};

use crate::cancel::CancelToken;
use crate::config::validate_ring_capacity;
use crate::dll::{
    Driver, RawAdapter, ERROR_ALREADY_INITIALIZED, ERROR_BUFFER_OVERFLOW, MAX_IP_PACKET_SIZE,
};
use crate::error::{Error, Result};
use crate::luid::Luid;
use crate::packet::{RecvPacket, SendPacket};
use crate::session::{ActiveSession, AdapterHandle, Session};

#[derive(Default)]
struct State {
    handle: Option<Arc<AdapterHandle>>,
    session: Option<Arc<Session>>,
    /// The last stopped session, which may still be referenced by packets.
    retired: Weak<Session>,
}

/// A Wintun adapter and its (at most one) running session.
///
/// An `Adapter` can be shared between threads: packets may be received on one thread while
/// another sends, and [`stop()`](Self::stop) or [`close()`](Self::close) may be called at any
/// time. Once stopped or closed, pending and future calls fail with [`Error::SessionStopped`] or
/// [`Error::AdapterClosed`]. The native session and adapter are released as soon as no call or
/// packet still refers to them.
///
/// The adapter is closed when dropped; adapters created (rather than opened) are then removed
/// from the system.
pub struct Adapter {
    name: String,
    state: RwLock<State>,
}

impl Adapter {
    /// Maximum time a blocking receive waits on the read event before re-checking its state.
    const RECV_WAIT_INTERVAL: Duration = Duration::from_millis(100);
    /// Maximum time a blocking send sleeps between attempts while the ring is full.
    const SEND_MAX_BLOCKING_INTERVAL: u64 = 100;

    pub(crate) fn new(driver: Arc<dyn Driver>, name: &str, raw: RawAdapter) -> Self {
        Self {
            name: name.into(),
            state: RwLock::new(State {
                handle: Some(AdapterHandle::new(driver, raw, name)),
                session: None,
                retired: Weak::new(),
            }),
        }
    }

    fn read_state(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle(&self) -> Result<Arc<AdapterHandle>> {
        self.read_state().handle.clone().ok_or(Error::AdapterClosed)
    }

    /// Returns the running session, registered as in use until the result is dropped.
    fn session(&self) -> Result<ActiveSession> {
        // Entered under the lock so that `stop()` and `close()` wait for this call.
        let state = self.read_state();
        match (&state.handle, &state.session) {
            (None, _) => Err(Error::AdapterClosed),
            (Some(_), None) => Err(Error::SessionStopped),
            (Some(_), Some(session)) => Ok(session.enter()),
        }
    }

    /// The name the adapter was created or opened with.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.read_state().handle.is_none()
    }

    /// Indicates whether a session is running on the adapter.
    #[inline]
    pub fn is_running(&self) -> bool {
        self.read_state().session.is_some()
    }

    /// The ring capacity of the running session, if any.
    pub fn ring_capacity(&self) -> Option<u32> {
        self.read_state().session.as_ref().map(|s| s.capacity())
    }

    /// Starts a session with a ring of `capacity` bytes.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::InvalidRingCapacity`] unless `capacity` is a power of two between
    /// [`MIN_RING_CAPACITY`](crate::MIN_RING_CAPACITY) and
    /// [`MAX_RING_CAPACITY`](crate::MAX_RING_CAPACITY), and with `ERROR_ALREADY_INITIALIZED` if
    /// a session is already running. Fails with [`Error::SessionBusy`] while packets received
    /// or allocated from a stopped session are still alive.
    pub fn start(&self, capacity: u32) -> Result<()> {
        validate_ring_capacity(capacity)?;

        let mut state = self.write_state();
        let handle = state.handle.as_ref().ok_or(Error::AdapterClosed)?;
        if state.session.is_some() {
            return Err(io::Error::from_raw_os_error(ERROR_ALREADY_INITIALIZED).into());
        }
        if state.retired.strong_count() > 0 {
            return Err(Error::SessionBusy);
        }

        state.session = Some(Session::start(handle, capacity)?);
        Ok(())
    }

    /// Stops the running session. Stopping an adapter without a session does nothing.
    ///
    /// Blocks until calls using the session on other threads have returned, which takes at
    /// most one receive wait interval. The session ends right away unless received or
    /// allocated packets still refer to it, in which case it ends once the last one is dropped.
    pub fn stop(&self) {
        let session = {
            let mut state = self.write_state();
            let session = state.session.take();
            if let Some(session) = &session {
                state.retired = Arc::downgrade(session);
            }
            session
        };
        let Some(session) = session else {
            return;
        };

        log::debug!("stopping session on adapter {}", self.name);
        session.wait_idle();
        if Arc::strong_count(&session) > 1 {
            log::debug!("session on adapter {} ends after its packets", self.name);
        }
    }

    /// Stops the running session and closes the adapter. Closing twice does nothing.
    ///
    /// Like [`stop()`](Self::stop), this waits for calls in progress on other threads. The
    /// native adapter is closed once no packet refers to it anymore.
    pub fn close(&self) {
        let (session, handle) = {
            let mut state = self.write_state();
            (state.session.take(), state.handle.take())
        };
        if handle.is_some() {
            log::debug!("closing adapter {}", self.name);
        }
        if let Some(session) = session {
            session.wait_idle();
        }
        drop(handle);
    }

    /// Returns the LUID of the adapter.
    pub fn luid(&self) -> Result<Luid> {
        Ok(self.handle()?.luid())
    }

    /// Returns the interface index of the adapter.
    #[cfg(windows)]
    pub fn index(&self) -> Result<u32> {
        Ok(self.luid()?.interface_index()?)
    }

    /// Retrieves a packet if one is immediately available.
    pub fn try_receive(&self) -> Result<Option<RecvPacket>> {
        self.session()?.try_receive()
    }

    /// Blocks until a packet is received, `cancel` fires, or the adapter is stopped or closed.
    ///
    /// The read event is waited on in intervals of at most 100ms, so cancellation and concurrent
    /// [`stop()`](Self::stop)/[`close()`](Self::close) calls are observed within that time.
    pub fn receive(&self, cancel: &CancelToken) -> Result<RecvPacket> {
        loop {
            let session = self.session()?;
            if let Some(packet) = session.try_receive()? {
                return Ok(packet);
            }

            cancel.check()?;

            let wait = match cancel.deadline() {
                Some(deadline) => deadline
                    .saturating_duration_since(Instant::now())
                    .min(Self::RECV_WAIT_INTERVAL),
                None => Self::RECV_WAIT_INTERVAL,
            };
            session.wait_readable(wait)?;
        }
    }

    /// Allocates a packet of `size` bytes to be filled and then [sent](SendPacket::send).
    ///
    /// Packets are delivered in the order they are allocated. Fails with
    /// `ERROR_BUFFER_OVERFLOW` if the ring is full.
    pub fn allocate_packet(&self, size: usize) -> Result<SendPacket> {
        if size == 0 || size > MAX_IP_PACKET_SIZE {
            return Err(Error::InvalidPacketSize(size));
        }

        self.session()?.try_allocate(size)
    }

    /// Sends a copy of `packet`, failing with `ERROR_BUFFER_OVERFLOW` if the ring is full.
    pub fn try_send(&self, packet: &[u8]) -> Result<()> {
        let mut pkt = self.allocate_packet(packet.len())?;
        pkt.copy_from_slice(packet);
        pkt.send();
        Ok(())
    }

    /// Sends a copy of `packet`, waiting for room in the ring if it is full.
    ///
    /// Wintun does not signal when space frees up in the send ring, so a full ring is retried
    /// after sleeping 1ms, doubling up to 100ms between attempts. `cancel` is checked before
    /// each sleep, and no sleep extends past its deadline.
    pub fn send(&self, packet: &[u8], cancel: &CancelToken) -> Result<()> {
        let mut timeout = 1;
        let mut pkt = loop {
            match self.allocate_packet(packet.len()) {
                Ok(pkt) => break pkt,
                Err(e) if e.raw_os_error() == Some(ERROR_BUFFER_OVERFLOW) => {
                    cancel.check()?;

                    let mut sleep = Duration::from_millis(timeout);
                    if let Some(deadline) = cancel.deadline() {
                        sleep = sleep.min(deadline.saturating_duration_since(Instant::now()));
                    }
                    thread::sleep(sleep);
                    timeout = cmp::min(timeout * 2, Self::SEND_MAX_BLOCKING_INTERVAL);
                }
                Err(e) => return Err(e),
            }
        };

        pkt.copy_from_slice(packet);
        pkt.send();
        Ok(())
    }
}

impl fmt::Debug for Adapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Adapter")
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .field("ring_capacity", &self.ring_capacity())
            .finish_non_exhaustive()
    }
}

impl Drop for Adapter {
    fn drop(&mut self) {
        self.close();
    }
}


#[cfg(windows)]
#[cfg(test)]
mod tests_windows {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;
    use crate::config::AdapterConfig;
    use crate::library::Wintun;

    fn wintun() -> Wintun {
        Wintun::load("wintun.dll").unwrap()
    }

    #[test]
    #[ignore = "requires wintun.dll and administrator privileges"]
    fn create_and_index() {
        let ap = wintun()
            .create_adapter("testadapterindex", &AdapterConfig::new())
            .unwrap();

        let index = ap.index().unwrap();
        assert_ne!(index, 0);
    }

    #[test]
    #[ignore = "requires wintun.dll and administrator privileges"]
    fn receive_deadline() {
        let ap = wintun()
            .create_adapter("testrecvdeadline", &AdapterConfig::new())
            .unwrap();

        loop {
            match ap.receive(&CancelToken::with_timeout(Duration::from_secs(1))) {
                Ok(_) => continue,
                Err(e) => {
                    assert!(matches!(e, Error::DeadlineExceeded));
                    break;
                }
            }
        }
    }

    #[test]
    #[ignore = "requires wintun.dll and administrator privileges"]
    fn restart_with_pending_receive() {
        let ap = std::sync::Arc::new(
            wintun()
                .create_adapter("testrestart", &AdapterConfig::new())
                .unwrap(),
        );
        let token = CancelToken::with_timeout(Duration::from_secs(10));

        let receiver = {
            let ap = ap.clone();
            let token = token.clone();
            std::thread::spawn(move || loop {
                match ap.receive(&token) {
                    Ok(_) => continue,
                    Err(e) => break e,
                }
            })
        };

        std::thread::sleep(Duration::from_millis(30));
        ap.stop();
        ap.start(crate::MIN_RING_CAPACITY).unwrap();

        token.cancel();
        let err = receiver.join().unwrap();
        assert!(matches!(err, Error::SessionStopped | Error::Cancelled));
    }

    #[test]
    #[ignore = "requires wintun.dll and administrator privileges"]
    fn receive_outbound_udp() {
        let ap = wintun()
            .create_adapter("testrecvudp", &AdapterConfig::new())
            .unwrap();

        let local = Ipv4Addr::new(10, 1, 1, 11);
        ap.luid()
            .unwrap()
            .add_ip_address(IpAddr::V4(local), 24)
            .unwrap();

        let sock = std::net::UdpSocket::bind((local, 0)).unwrap();
        let token = CancelToken::with_timeout(Duration::from_secs(10));

        loop {
            sock.send_to(b"fqwfnpina", (Ipv4Addr::new(10, 1, 1, 13), 19986))
                .unwrap();

            let pkt = ap.receive(&token).unwrap();
            // IPv4, UDP, from our local address
            if pkt.len() > 28 && pkt[0] >> 4 == 4 && pkt[9] == 17 && pkt[12..16] == local.octets()
            {
                assert_eq!(&pkt[28..], b"fqwfnpina");
                break;
            }
        }
    }
}
