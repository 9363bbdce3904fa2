// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Seams to the packet codec module. The engine builds and validates nothing
//! on the wire: OPEN construction, OPEN validation, attribute translation and
//! update import all happen behind [`SessionCodec`], and byte framing for the
//! TCP transport behind [`WireCodec`]. This crate ships no implementation of
//! either.

use crate::error::Error;
use crate::messages::{Message, OpenMessage, RouteRefreshMessage, UpdateMessage};
use std::io::{Read, Write};
use std::net::IpAddr;

/// A protocol error to be turned into a Notification by the engine, carrying
/// the RFC (code, subcode) pair and any data considered erroneous.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BgpError {
    pub code: u8,
    pub subcode: u8,
    pub data: Vec<u8>,
}

impl BgpError {
    pub fn new(code: u8, subcode: u8) -> Self {
        Self {
            code,
            subcode,
            data: Vec::new(),
        }
    }

    pub fn with_data(code: u8, subcode: u8, data: Vec<u8>) -> Self {
        Self {
            code,
            subcode,
            data,
        }
    }
}

/// Everything the codec needs to know about the local side when creating or
/// checking an OPEN.
#[derive(Debug, Clone)]
pub struct OpenContext {
    pub local_as: u32,
    pub remote_as: u32,
    pub local_id: u32,
    pub hold_time: u16,

    /// False when the connection snapshot says capability advertisement is
    /// suppressed (the peer rejected our capabilities before).
    pub capabilities: bool,

    /// Whether we want 4-byte AS support on this connection.
    pub as4: bool,

    /// Whether we advertise route refresh support.
    pub refresh: bool,

    pub is_internal: bool,
}

/// Session parameters the codec negotiated from a received OPEN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenParams {
    pub remote_id: u32,
    pub remote_as: u32,

    /// The peer's hold time proposal.
    pub hold_time: u16,

    /// The peer advertised 4-byte AS support.
    pub as4: bool,

    /// The peer advertised route refresh support.
    pub refresh: bool,
}

/// The packet module as the session engine sees it.
pub trait SessionCodec: Send + Sync {
    /// Build the OPEN to advertise on a connection.
    fn create_open(&self, cx: &OpenContext) -> OpenMessage;

    /// Validate a received OPEN and negotiate session parameters, or report
    /// the (code, subcode) to send back.
    fn open_received(&self, cx: &OpenContext, msg: &OpenMessage) -> Result<OpenParams, BgpError>;

    /// Produce the next queued UPDATE for a peer, if any. The engine
    /// reschedules the update packet type until this returns None.
    fn create_update(&self, peer: IpAddr) -> Option<UpdateMessage>;

    /// Import a received UPDATE into the RIB. Returns the resulting imported
    /// route count so the engine can enforce the route limit.
    fn update_received(&self, peer: IpAddr, msg: &UpdateMessage) -> Result<u64, BgpError>;

    /// The peer asked for its routes again.
    fn refresh_received(&self, peer: IpAddr, msg: &RouteRefreshMessage);
}

/// What went wrong while reading from the wire: either the transport itself
/// failed, or the bytes failed BGP framing validation and a Notification with
/// the given (code, subcode) must go back.
#[derive(Debug)]
pub enum WireError {
    Io(std::io::Error),
    Protocol(BgpError),
}

impl From<std::io::Error> for WireError {
    fn from(e: std::io::Error) -> Self {
        WireError::Io(e)
    }
}

/// Byte framing for stream transports. Only the TCP transport uses this; the
/// in-memory transport moves [`Message`] values directly.
pub trait WireCodec: Send + Sync {
    fn read_message(&self, r: &mut dyn Read) -> Result<Message, WireError>;
    fn write_message(&self, w: &mut dyn Write, msg: &Message) -> Result<(), Error>;
}
