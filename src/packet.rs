// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 Nathaniel Bennett <me[at]nathanielbennett[dotcom]>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Views into packets owned by a session's ring.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::{fmt, slice};

use crate::dll::WintunPacket;
use crate::session::Session;

/// A packet received from an adapter.
///
/// The packet borrows space in the session's ring, which is released back to Wintun when the
/// `RecvPacket` is dropped. Holding on to received packets eventually stalls the ring.
pub struct RecvPacket {
    session: Arc<Session>,
    packet: WintunPacket,
    len: usize,
}

impl RecvPacket {
    pub(crate) fn new(session: Arc<Session>, packet: WintunPacket, len: usize) -> Self {
        Self {
            session,
            packet,
            len,
        }
    }

    /// Copies the packet out of the ring, releasing it.
    pub fn into_vec(self) -> Vec<u8> {
        self.deref().to_vec()
    }
}

impl Deref for RecvPacket {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: Wintun guarantees `len` readable bytes until the packet is released.
        unsafe { slice::from_raw_parts(self.packet.as_ptr(), self.len) }
    }
}

impl AsRef<[u8]> for RecvPacket {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl fmt::Debug for RecvPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecvPacket").field("len", &self.len).finish()
    }
}

impl Drop for RecvPacket {
    fn drop(&mut self) {
        unsafe {
            self.session
                .driver()
                .release_receive_packet(self.session.raw(), self.packet);
        }
    }
}

// SAFETY: releasing a packet is thread-safe and the buffer is exclusively ours until then.
unsafe impl Send for RecvPacket {}

// SAFETY: shared access only hands out `&[u8]`.
unsafe impl Sync for RecvPacket {}

/// A packet allocated in a session's ring, waiting to be filled and sent.
///
/// Wintun sends packets in allocation order, so every allocated packet must be sent. A
/// `SendPacket` dropped without calling [`send()`](Self::send) is zeroed and sent anyway; the
/// network stack discards it as malformed.
pub struct SendPacket {
    session: Arc<Session>,
    packet: WintunPacket,
    len: usize,
    sent: bool,
}

impl SendPacket {
    pub(crate) fn new(session: Arc<Session>, packet: WintunPacket, len: usize) -> Self {
        Self {
            session,
            packet,
            len,
            sent: false,
        }
    }

    /// Hands the packet over to Wintun for delivery to the network stack.
    pub fn send(mut self) {
        self.sent = true;
        unsafe {
            self.session
                .driver()
                .send_packet(self.session.raw(), self.packet);
        }
    }
}

impl Deref for SendPacket {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: the allocation is `len` bytes long and exclusively ours until sent.
        unsafe { slice::from_raw_parts(self.packet.as_ptr(), self.len) }
    }
}

impl DerefMut for SendPacket {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: see `deref()`.
        unsafe { slice::from_raw_parts_mut(self.packet.as_ptr(), self.len) }
    }
}

impl AsMut<[u8]> for SendPacket {
    fn as_mut(&mut self) -> &mut [u8] {
        self
    }
}

impl fmt::Debug for SendPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendPacket")
            .field("len", &self.len)
            .field("sent", &self.sent)
            .finish()
    }
}

impl Drop for SendPacket {
    fn drop(&mut self) {
        if self.sent {
            return;
        }

        log::warn!(
            "send packet of {} bytes dropped before being sent; sending it zeroed",
            self.len
        );
        self.fill(0);
        unsafe {
            self.session
                .driver()
                .send_packet(self.session.raw(), self.packet);
        }
    }
}

// SAFETY: sending a packet is thread-safe and the buffer is exclusively ours until then.
unsafe impl Send for SendPacket {}

// SAFETY: shared access only hands out `&[u8]`.
unsafe impl Sync for SendPacket {}
