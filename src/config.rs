// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::error::Error;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// What to do when building IPv6 next hops and the interface has no
/// link-local address. Consumed by the attribute translation layer; carried
/// here because it is per-peer configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum MissingLladdr {
    /// Substitute the global source address.
    SelfAddr,
    /// Drop the routes.
    Drop,
    /// Send the next hop without a link-local part.
    Ignore,
}

/// Per-peer configuration. Immutable while the peer is running; replaced
/// wholesale through reconfigure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PeerConfig {
    pub name: String,
    pub local_as: u32,
    pub remote_as: u32,
    pub remote_ip: IpAddr,

    /// Router ID used as the local BGP identifier.
    pub router_id: u32,

    /// Bind the session to a named interface.
    pub iface: Option<String>,

    /// Source address for outgoing connections. Defaults to the address of
    /// the interface the neighbor is reached through.
    pub source_addr: Option<IpAddr>,

    /// Proposed hold time, seconds.
    pub hold_time: u16,

    /// Hold time used between connection setup and OPEN negotiation, seconds.
    pub initial_hold_time: u16,

    /// Seconds between outgoing connection attempts.
    pub connect_retry_time: u16,

    /// Keepalive interval, seconds. Zero means hold_time / 3.
    pub keepalive_time: u16,

    /// TTL for multihop sessions. Zero means the peer is directly connected.
    pub multihop: u8,

    /// Address to route through for multihop sessions.
    pub multihop_via: Option<IpAddr>,

    /// Never initiate outgoing connections.
    pub passive: bool,

    /// Advertise capabilities in OPEN.
    pub capabilities: bool,

    /// Use 4-byte AS numbers (requires capabilities).
    pub enable_as4: bool,

    /// Advertise route refresh support (requires capabilities).
    pub enable_refresh: bool,

    pub rr_client: bool,
    pub rr_cluster_id: u32,
    pub rs_client: bool,

    /// TCP MD5 signature password.
    pub password: Option<String>,

    /// Maximum number of imported routes before the session is shut down.
    /// Zero disables the limit.
    pub route_limit: u32,

    /// Seconds to wait before the first connect attempt after startup.
    pub start_delay_time: u16,

    /// Errors older than this many seconds do not contribute to back-off.
    pub error_amnesia_time: u16,

    /// Initial and maximum back-off after a protocol error, seconds.
    pub error_delay_time_min: u16,
    pub error_delay_time_max: u16,

    /// Disable the peer instead of backing off after an error.
    pub disable_after_error: bool,

    /// None means the default: drop for route-server clients, self otherwise.
    pub missing_lladdr: Option<MissingLladdr>,

    // Attribute and policy knobs consumed by the codec and the RIB.
    pub next_hop_self: bool,
    pub compare_path_lengths: bool,
    pub prefer_older: bool,
    pub default_med: u32,
    pub default_local_pref: u32,
    pub advertise_ipv4: bool,
    pub interpret_communities: bool,
}

impl PeerConfig {
    /// A config with the documented defaults for the given neighbor. Callers
    /// adjust from here.
    pub fn new(name: &str, local_as: u32, remote_as: u32, remote_ip: IpAddr) -> Self {
        Self {
            name: name.to_string(),
            local_as,
            remote_as,
            remote_ip,
            router_id: 0,
            iface: None,
            source_addr: None,
            hold_time: 240,
            initial_hold_time: 240,
            connect_retry_time: 120,
            keepalive_time: 0,
            multihop: 0,
            multihop_via: None,
            passive: false,
            capabilities: true,
            enable_as4: true,
            enable_refresh: true,
            rr_client: false,
            rr_cluster_id: 0,
            rs_client: false,
            password: None,
            route_limit: 0,
            start_delay_time: 5,
            error_amnesia_time: 300,
            error_delay_time_min: 60,
            error_delay_time_max: 300,
            disable_after_error: false,
            missing_lladdr: None,
            next_hop_self: false,
            compare_path_lengths: true,
            prefer_older: false,
            default_med: 0,
            default_local_pref: 100,
            advertise_ipv4: true,
            interpret_communities: true,
        }
    }

    pub fn is_internal(&self) -> bool {
        self.local_as == self.remote_as
    }

    /// Keepalive interval with the hold-derived default applied.
    pub fn keepalive_or_default(&self) -> u16 {
        if self.keepalive_time != 0 {
            self.keepalive_time
        } else {
            self.hold_time / 3
        }
    }

    /// The link-local policy with the rs_client-dependent default applied.
    pub fn missing_lladdr_policy(&self) -> MissingLladdr {
        self.missing_lladdr.unwrap_or(if self.rs_client {
            MissingLladdr::Drop
        } else {
            MissingLladdr::SelfAddr
        })
    }

    /// Validate constraints between options.
    pub fn check(&self) -> Result<(), Error> {
        if self.local_as == 0 {
            return Err(Error::LocalAsUnset);
        }
        if self.remote_as == 0 {
            return Err(Error::RemoteAsUnset);
        }
        if !(self.capabilities && self.enable_as4) && self.remote_as > 0xffff {
            return Err(Error::RemoteAsOutOfRange);
        }
        if !self.is_internal() && self.rr_client {
            return Err(Error::RrClientNotInternal);
        }
        if self.is_internal() && self.rs_client {
            return Err(Error::RsClientNotExternal);
        }
        Ok(())
    }

    /// True when `other` describes the same session: every field other than
    /// the password matches, and the passwords compare equal as strings. Used
    /// by reconfigure to decide whether the new config can be absorbed
    /// without a session reset.
    pub fn same(&self, other: &PeerConfig) -> bool {
        let mut a = self.clone();
        let mut b = other.clone();
        a.password = None;
        b.password = None;
        a == b && self.password == other.password
    }
}
