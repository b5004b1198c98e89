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

/// The locally unique identifier Windows assigns to a network interface.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Luid(u64);

impl Luid {
    #[inline]
    pub const fn from_value(value: u64) -> Self {
        Self(value)
    }

    #[inline]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// The per-type index Windows uses to tell apart interfaces of the same type.
    #[inline]
    pub const fn net_luid_index(self) -> u32 {
        ((self.0 >> 24) & 0xff_ffff) as u32
    }

    /// The IANA interface type (`IF_TYPE_PROP_VIRTUAL` for Wintun adapters).
    #[inline]
    pub const fn if_type(self) -> u16 {
        (self.0 >> 48) as u16
    }
}

impl From<u64> for Luid {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for Luid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

#[cfg(windows)]
mod windows {
    use std::io;
    use std::mem::MaybeUninit;
    use std::net::IpAddr;

    use windows_sys::Win32::Foundation::{ERROR_OBJECT_ALREADY_EXISTS, NO_ERROR};
    use windows_sys::Win32::NetworkManagement::IpHelper::{
        ConvertInterfaceLuidToIndex, CreateUnicastIpAddressEntry,
        InitializeUnicastIpAddressEntry, MIB_UNICASTIPADDRESS_ROW,
    };
    use windows_sys::Win32::NetworkManagement::Ndis::NET_LUID_LH;
    use windows_sys::Win32::Networking::WinSock::{AF_INET, AF_INET6, IpDadStatePreferred};

    use super::Luid;

    impl Luid {
        #[inline]
        fn as_net_luid(self) -> NET_LUID_LH {
            NET_LUID_LH { Value: self.0 }
        }

        /// Returns the interface index of the interface.
        pub fn interface_index(self) -> io::Result<u32> {
            let luid = self.as_net_luid();
            let mut index = 0u32;

            match unsafe { ConvertInterfaceLuidToIndex(&luid, &mut index) } {
                NO_ERROR => Ok(index),
                e => Err(io::Error::from_raw_os_error(e as i32)),
            }
        }

        /// Assigns a unicast address with the given on-link prefix length to the interface.
        ///
        /// Assigning an address the interface already has is not an error.
        pub fn add_ip_address(self, addr: IpAddr, prefix_len: u8) -> io::Result<()> {
            let max_prefix = if addr.is_ipv4() { 32 } else { 128 };
            if prefix_len > max_prefix {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("prefix length {} too long for {}", prefix_len, addr),
                ));
            }

            let mut row = unsafe {
                let mut row = MaybeUninit::<MIB_UNICASTIPADDRESS_ROW>::zeroed();
                InitializeUnicastIpAddressEntry(row.as_mut_ptr());
                row.assume_init()
            };

            unsafe {
                match addr {
                    IpAddr::V4(v4) => {
                        row.Address.Ipv4.sin_family = AF_INET;
                        row.Address.Ipv4.sin_addr.S_un.S_addr = u32::from_ne_bytes(v4.octets());
                    }
                    IpAddr::V6(v6) => {
                        row.Address.Ipv6.sin6_family = AF_INET6;
                        row.Address.Ipv6.sin6_addr.u.Byte = v6.octets();
                    }
                }
            }

            row.InterfaceLuid = self.as_net_luid();
            row.OnLinkPrefixLength = prefix_len;
            row.DadState = IpDadStatePreferred;

            match unsafe { CreateUnicastIpAddressEntry(&row) } {
                NO_ERROR | ERROR_OBJECT_ALREADY_EXISTS => Ok(()),
                e => Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }
}
