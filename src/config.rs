// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 Nathaniel Bennett <me[at]nathanielbennett[dotcom]>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::fmt;
use std::hash::Hasher;

use siphasher::sip::SipHasher13;

use crate::dll::{DEFAULT_RING_CAPACITY, MAX_ADAPTER_NAME, MAX_RING_CAPACITY, MIN_RING_CAPACITY};
use crate::error::{Error, Result};

/// A globally unique identifier, laid out like the Win32 `GUID` structure.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Guid {
    pub data1: u32,
    pub data2: u16,
    pub data3: u16,
    pub data4: [u8; 8],
}

impl Guid {
    const MSB_KEYS: (u64, u64) = (0x00, 0x00);
    const LSB_KEYS: (u64, u64) = (0x01, 0x00);

    /// Derives a GUID from an adapter name and tunnel type.
    ///
    /// Windows attaches network profiles (firewall category, DNS settings) to the adapter GUID.
    /// Re-creating an adapter with the same derived GUID keeps that state across restarts. The
    /// GUID is computed with keyed SipHash-1-3 and does not depend on the Rust version.
    pub fn derive(name: &str, tunnel_type: &str) -> Self {
        let hash = |(k0, k1): (u64, u64)| {
            let mut state = SipHasher13::new_with_keys(k0, k1);
            state.write(name.as_bytes());
            state.write(&[0xff]);
            state.write(tunnel_type.as_bytes());
            state.write(&[0xff]);
            state.finish()
        };

        let msb_hash = hash(Self::MSB_KEYS);
        let lsb_hash = hash(Self::LSB_KEYS);

        Guid {
            data1: (msb_hash >> 32) as u32,
            data2: ((msb_hash >> 16) & 0xffff) as u16,
            data3: (msb_hash & 0xffff) as u16,
            data4: lsb_hash.to_be_bytes(),
        }
    }
}

impl fmt::Display for Guid {
    /// Formats the GUID in registry form, e.g. `{6b29fc40-ca47-1067-b31d-00dd010662da}`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d = &self.data4;
        write!(
            f,
            "{{{:08x}-{:04x}-{:04x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}}}",
            self.data1, self.data2, self.data3, d[0], d[1], d[2], d[3], d[4], d[5], d[6], d[7]
        )
    }
}

/// Options used when creating a Wintun adapter.
#[derive(Clone, Debug)]
pub struct AdapterConfig {
    pub(crate) tunnel_type: String,
    pub(crate) guid: Option<Guid>,
    pub(crate) ring_capacity: u32,
    pub(crate) start_session: bool,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            tunnel_type: String::from("Wintun"),
            guid: None,
            ring_capacity: DEFAULT_RING_CAPACITY,
            start_session: true,
        }
    }
}

impl AdapterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the tunnel type shown as the adapter's description.
    pub fn tunnel_type<S: AsRef<str>>(&mut self, tunnel_type: S) -> &mut Self {
        self.tunnel_type = tunnel_type.as_ref().into();
        self
    }

    /// Request a specific adapter GUID. By default Wintun generates one.
    pub fn guid(&mut self, guid: Guid) -> &mut Self {
        self.guid = Some(guid);
        self
    }

    /// Set the ring capacity of the session started on creation.
    pub fn ring_capacity(&mut self, capacity: u32) -> &mut Self {
        self.ring_capacity = capacity;
        self
    }

    /// Set whether a session is started as soon as the adapter is created (the default).
    pub fn start_session(&mut self, start: bool) -> &mut Self {
        self.start_session = start;
        self
    }
}

/// Checks that `capacity` is a power of two within [`MIN_RING_CAPACITY`] and
/// [`MAX_RING_CAPACITY`].
pub fn validate_ring_capacity(capacity: u32) -> Result<()> {
    if (MIN_RING_CAPACITY..=MAX_RING_CAPACITY).contains(&capacity) && capacity.is_power_of_two() {
        Ok(())
    } else {
        Err(Error::InvalidRingCapacity(capacity))
    }
}

/// Encodes an adapter name or tunnel type as a null-terminated UTF-16 string.
pub(crate) fn encode_name(name: &str) -> Result<Vec<u16>> {
    let wide: Vec<u16> = name.encode_utf16().chain(std::iter::once(0)).collect();

    if name.is_empty() || name.contains('\0') || wide.len() > MAX_ADAPTER_NAME {
        return Err(Error::InvalidName(name.into()));
    }

    Ok(wide)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_capacity_bounds() {
        assert!(validate_ring_capacity(MIN_RING_CAPACITY).is_ok());
        assert!(validate_ring_capacity(MAX_RING_CAPACITY).is_ok());
        assert!(validate_ring_capacity(DEFAULT_RING_CAPACITY).is_ok());

        assert!(matches!(
            validate_ring_capacity(MIN_RING_CAPACITY - 1),
            Err(Error::InvalidRingCapacity(_))
        ));
        assert!(matches!(
            validate_ring_capacity(MAX_RING_CAPACITY + 1),
            Err(Error::InvalidRingCapacity(_))
        ));
        assert!(matches!(
            validate_ring_capacity(MIN_RING_CAPACITY * 3),
            Err(Error::InvalidRingCapacity(_))
        ));
        assert!(validate_ring_capacity(MAX_RING_CAPACITY * 2).is_err());
    }

    #[test]
    fn name_encoding() {
        assert_eq!(encode_name("tun0").unwrap(), vec![116, 117, 110, 48, 0]);

        assert!(encode_name("").is_err());
        assert!(encode_name("bad\0name").is_err());

        let longest = "a".repeat(MAX_ADAPTER_NAME - 1);
        assert!(encode_name(&longest).is_ok());
        let too_long = "a".repeat(MAX_ADAPTER_NAME);
        assert!(matches!(encode_name(&too_long), Err(Error::InvalidName(_))));
    }

    #[test]
    fn derived_guid_is_stable() {
        let a = Guid::derive("tun0", "Wintun");
        let b = Guid::derive("tun0", "Wintun");
        let c = Guid::derive("tun1", "Wintun");
        let d = Guid::derive("tun0", "Other");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);

        // Pinned so that adapters keep their GUID across releases.
        assert_eq!(a.to_string(), "{195c0989-be8c-bfd6-87fa-984c8234da61}");
        assert_eq!(
            Guid::derive("Demo", "Example").to_string(),
            "{43b46081-e6ac-2d4e-6eca-663bb1f98c5f}"
        );
    }

    #[test]
    fn guid_display() {
        let guid = Guid {
            data1: 0x6b29fc40,
            data2: 0xca47,
            data3: 0x1067,
            data4: [0xb3, 0x1d, 0x00, 0xdd, 0x01, 0x06, 0x62, 0xda],
        };

        assert_eq!(guid.to_string(), "{6b29fc40-ca47-1067-b31d-00dd010662da}");
    }

    #[test]
    fn config_builder() {
        let guid = Guid::derive("tun0", "Demo");
        let mut config = AdapterConfig::new();
        config
            .tunnel_type("Demo")
            .guid(guid)
            .ring_capacity(MIN_RING_CAPACITY)
            .start_session(false);

        assert_eq!(config.tunnel_type, "Demo");
        assert_eq!(config.guid, Some(guid));
        assert_eq!(config.ring_capacity, MIN_RING_CAPACITY);
        assert!(!config.start_session);

        let default = AdapterConfig::default();
        assert_eq!(default.ring_capacity, DEFAULT_RING_CAPACITY);
        assert!(default.start_session);
        assert!(default.guid.is_none());
    }
}
