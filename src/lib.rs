// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 Nathaniel Bennett <me[at]nathanielbennett[dotcom]>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Safe bindings to [Wintun](https://www.wintun.net), the layer 3 TUN driver for Windows.
//!
//! `wintun.dll` is loaded at run time through [`Wintun::load`], either from a path or from an
//! image embedded in the executable. With the `link` feature, [`Wintun::linked`] uses an import
//! library instead. Adapters created through a [`Wintun`] carry a session whose ring is used to
//! exchange raw IP packets with the network stack.
//!
//! An [`Adapter`] may be shared across threads and stopped or closed at any time; blocking
//! operations take a [`CancelToken`] and return once it fires or the adapter goes away.
//!
//! ## Examples
//!
//! To create an adapter and echo back every packet it receives:
//!
//! ```no_run
//! # #[cfg(windows)]
//! # fn echo() -> Result<(), wintun_api::Error> {
//! use std::net::{IpAddr, Ipv4Addr};
//! use wintun_api::{AdapterConfig, CancelToken, Wintun};
//!
//! let wintun = Wintun::load("wintun.dll")?;
//! wintun.set_logger(Some(wintun_api::forward_to_log()));
//!
//! let adapter = wintun.create_adapter("Demo", AdapterConfig::new().tunnel_type("Example"))?;
//! adapter.luid()?.add_ip_address(IpAddr::V4(Ipv4Addr::new(10, 100, 0, 1)), 24)?;
//!
//! let cancel = CancelToken::new();
//! loop {
//!     let packet = adapter.receive(&cancel)?;
//!     adapter.send(&packet, &cancel)?;
//! }
//! # }
//! ```
//!
//! Packets can also be built in place, avoiding a copy:
//!
//! ```no_run
//! # #[cfg(windows)]
//! # fn build(adapter: &wintun_api::Adapter) -> Result<(), wintun_api::Error> {
//! let mut packet = adapter.allocate_packet(20)?;
//! packet.fill(0);
//! packet[0] = 0x45; // IPv4, 20-byte header
//! packet.send();
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

mod adapter;
mod cancel;
mod config;
mod dll;
mod error;
mod library;
mod logger;
mod luid;
mod packet;
mod session;

#[cfg(test)]
mod fake;

pub use adapter::Adapter;
pub use cancel::CancelToken;
pub use config::{validate_ring_capacity, AdapterConfig, Guid};
pub use dll::{
    DllSource, WintunLoggerCallback, WintunLoggerLevel, DEFAULT_RING_CAPACITY, MAX_ADAPTER_NAME,
    MAX_IP_PACKET_SIZE, MAX_RING_CAPACITY, MIN_RING_CAPACITY,
};
pub use error::{Error, Result};
#[cfg(windows)]
pub use library::load;
pub use library::{global, release, Wintun};
pub use logger::{filetime_to_system_time, forward_to_log, LogRecord, LogSink};
pub use luid::Luid;
pub use packet::{RecvPacket, SendPacket};
