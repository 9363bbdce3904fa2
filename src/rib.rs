// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Upward notifications to the surrounding routing core. The engine posts
//! exactly one `Up` per entry into Established and one `Down` per exit; the
//! daemon wires the receiving end into its RIB and status machinery.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Parameters of an established session, as negotiated by the OPEN exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SessionSummary {
    pub peer: IpAddr,
    pub remote_id: u32,
    pub remote_as: u32,

    /// Negotiated hold time, seconds.
    pub hold_time: u16,

    /// Derived keepalive interval, seconds.
    pub keepalive_time: u16,

    pub as4: bool,
    pub refresh: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionNote {
    Up(SessionSummary),
    Down { peer: IpAddr },
}
