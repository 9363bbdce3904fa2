// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Structured BGP message types. These are the values the session engine
//! schedules, transmits and dispatches on. Translating them to and from the
//! wire is the packet codec's concern and happens behind the seams in
//! [`crate::codec`]; nothing in this module knows about octets.

use num_enum::TryFromPrimitive;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// BGP Message types.
///
/// Ref: RFC 4271 §4.1
#[derive(Debug, Eq, PartialEq, TryFromPrimitive, Copy, Clone)]
#[repr(u8)]
pub enum MessageType {
    Open = 1,
    Update = 2,
    Notification = 3,
    KeepAlive = 4,

    /// Ref: RFC 2918 §3
    RouteRefresh = 5,
}

/// The autonomous system number used in OPEN messages when 4-byte ASNs are in
/// use.
///
/// Ref: RFC 4893 §7
pub const AS_TRANS: u16 = 23456;

/// The version number for BGP-4.
pub const BGP4: u8 = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Open(OpenMessage),
    Update(UpdateMessage),
    Notification(NotificationMessage),
    KeepAlive,
    RouteRefresh(RouteRefreshMessage),
}

impl Message {
    pub fn kind(&self) -> MessageType {
        match self {
            Message::Open(_) => MessageType::Open,
            Message::Update(_) => MessageType::Update,
            Message::Notification(_) => MessageType::Notification,
            Message::KeepAlive => MessageType::KeepAlive,
            Message::RouteRefresh(_) => MessageType::RouteRefresh,
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Message::Open(_) => "open",
            Message::Update(_) => "update",
            Message::Notification(_) => "notification",
            Message::KeepAlive => "keepalive",
            Message::RouteRefresh(_) => "route refresh",
        }
    }
}

impl Display for Message {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.title())
    }
}

/// The first message sent by each side once a TCP connection is established.
///
/// Ref: RFC 4271 §4.2
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenMessage {
    /// BGP protocol version.
    pub version: u8,

    /// Autonomous system number of the sender. When 4-byte ASNs are in use
    /// this value is set to AS_TRANS.
    pub asn: u16,

    /// Number of seconds the sender proposes for the hold timer.
    pub hold_time: u16,

    /// BGP identifier of the sender.
    pub id: u32,

    /// Capabilities advertised by the sender. Empty when the sender suppresses
    /// capability negotiation.
    pub capabilities: Vec<Capability>,
}

impl OpenMessage {
    /// Create an open message for a sender with a 2-byte ASN and no
    /// capabilities.
    pub fn new2(asn: u16, hold_time: u16, id: u32) -> OpenMessage {
        OpenMessage {
            version: BGP4,
            asn,
            hold_time,
            id,
            capabilities: Vec::new(),
        }
    }

    /// Create an open message for a sender with a 4-byte ASN.
    pub fn new4(asn: u32, hold_time: u16, id: u32) -> OpenMessage {
        OpenMessage {
            version: BGP4,
            asn: AS_TRANS,
            hold_time,
            id,
            capabilities: vec![Capability::FourOctetAs { asn }],
        }
    }

    /// The ASN this message advertises: the 4-byte capability value when
    /// present, the header field otherwise.
    pub fn advertised_asn(&self) -> u32 {
        for c in &self.capabilities {
            if let Capability::FourOctetAs { asn } = c {
                return *asn;
            }
        }
        u32::from(self.asn)
    }

    pub fn has_capability(&self, code: CapabilityCode) -> bool {
        self.capabilities.iter().any(|c| c.code() == code)
    }
}

/// Capabilities the engine cares about. Anything else the codec understands is
/// carried opaquely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capability {
    /// RFC 4893
    FourOctetAs { asn: u32 },

    /// RFC 2918
    RouteRefresh,

    /// Opaque capability preserved for the codec.
    Unknown { code: u8, data: Vec<u8> },
}

impl Capability {
    pub fn code(&self) -> CapabilityCode {
        match self {
            Capability::FourOctetAs { .. } => CapabilityCode::FourOctetAs,
            Capability::RouteRefresh => CapabilityCode::RouteRefresh,
            Capability::Unknown { .. } => CapabilityCode::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityCode {
    FourOctetAs,
    RouteRefresh,
    Unknown,
}

/// Route advertisements and withdrawals. The engine treats the body as
/// opaque; only the attribute translation layer looks inside.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateMessage {
    pub body: Vec<u8>,
}

/// Ref: RFC 2918 §3
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteRefreshMessage {
    pub afi: u16,
    pub safi: u8,
}

/// Sent when an error condition is detected, immediately before the
/// connection is torn down.
///
/// Ref: RFC 4271 §4.5
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationMessage {
    pub error_code: u8,
    pub error_subcode: u8,
    pub data: Vec<u8>,
}

/// Notification error codes.
///
/// Ref: RFC 4271 §6
#[derive(
    Debug, Eq, PartialEq, TryFromPrimitive, Copy, Clone, Serialize, Deserialize, JsonSchema,
)]
#[repr(u8)]
pub enum ErrorCode {
    Header = 1,
    Open = 2,
    Update = 3,
    HoldTimerExpired = 4,
    Fsm = 5,
    Cease = 6,
}

/// Cease subcodes.
///
/// Ref: RFC 4486 §3
#[derive(
    Debug, Eq, PartialEq, TryFromPrimitive, Copy, Clone, Serialize, Deserialize, JsonSchema,
)]
#[repr(u8)]
pub enum CeaseSubcode {
    MaximumPrefixesReached = 1,
    AdministrativeShutdown = 2,
    PeerDeconfigured = 3,
    AdministrativeReset = 4,
    ConnectionRejected = 5,
    OtherConfigurationChange = 6,
    ConnectionCollisionResolution = 7,
    OutOfResources = 8,
}

/// Human readable description of a notification (code, subcode) pair, used in
/// peer status reports.
pub fn error_dsc(code: u8, subcode: u8) -> String {
    let name = match ErrorCode::try_from(code) {
        Ok(ErrorCode::Header) => "Invalid message header",
        Ok(ErrorCode::Open) => "Invalid OPEN message",
        Ok(ErrorCode::Update) => "Invalid UPDATE message",
        Ok(ErrorCode::HoldTimerExpired) => "Hold timer expired",
        Ok(ErrorCode::Fsm) => "Finite state machine error",
        Ok(ErrorCode::Cease) => "Cease",
        Err(_) => return format!("Error {}.{}", code, subcode),
    };
    if subcode == 0 {
        name.to_string()
    } else {
        format!("{} (subcode {})", name, subcode)
    }
}
