// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::net::IpAddr;

pub mod clock;
pub mod codec;
pub mod config;
pub mod connection;
pub mod connection_tcp;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod log;
pub mod messages;
pub mod neigh;
pub mod olock;
pub mod rib;
pub mod session;

#[cfg(test)]
#[macro_use]
extern crate lazy_static;

#[cfg(test)]
mod test;

#[cfg(test)]
pub mod connection_channel;

/// IANA-assigned TCP port BGP speakers listen and connect on.
pub const BGP_PORT: u16 = 179;

/// Receive buffer requested for BGP sockets. A BGP message is at most 4096
/// octets, so this holds a whole message.
pub const BGP_RX_BUFFER_SIZE: usize = 4096;

/// Transmit buffer requested for BGP sockets.
pub const BGP_TX_BUFFER_SIZE: usize = 4096;

#[macro_export]
macro_rules! lock {
    ($mtx:expr) => {
        $mtx.lock().expect("poisoned lock")
    };
}

/// Fold an IPv4-mapped IPv6 address down to plain IPv4. A dual-stack
/// listener reports v4 peers as `::ffff:a.b.c.d`; peers are configured and
/// looked up by their v4 address, so inbound dispatch canonicalizes first.
pub fn canonical_peer_addr(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}
