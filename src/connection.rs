// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Transport seams. The session engine drives connections exclusively through
//! [`BgpConnection`] and [`BgpListener`]; the TCP implementation lives in
//! [`crate::connection_tcp`] and an in-memory one backs the tests.

use crate::error::Error;
use crate::messages::Message;
use crate::session::FsmEvent;
use crate::{BGP_RX_BUFFER_SIZE, BGP_TX_BUFFER_SIZE};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use slog::Logger;
use std::fmt::{self, Display, Formatter};
use std::net::{IpAddr, SocketAddr};
use std::sync::mpsc::Sender;
use std::time::Duration;

/// TOS/DSCP byte for BGP sockets: IP precedence Internetwork Control.
pub const TOS_INTERNET_CONTROL: u32 = 0xc0;

/// Which slot of the peer a connection occupies.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
pub enum ConnDirection {
    Outgoing,
    Incoming,
}

impl ConnDirection {
    pub fn other(&self) -> ConnDirection {
        match self {
            ConnDirection::Outgoing => ConnDirection::Incoming,
            ConnDirection::Incoming => ConnDirection::Outgoing,
        }
    }
}

impl Display for ConnDirection {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            ConnDirection::Outgoing => write!(f, "outgoing"),
            ConnDirection::Incoming => write!(f, "incoming"),
        }
    }
}

/// Socket options applied when a connection is created.
#[derive(Debug, Clone)]
pub struct SockOpts {
    /// Source address to bind before connecting.
    pub source: Option<SocketAddr>,

    /// TTL for the session: the multihop count, or 1 for directly connected
    /// peers.
    pub ttl: u8,

    /// TOS byte.
    pub tos: u32,

    /// TCP MD5 signature key.
    pub md5_key: Option<String>,

    pub rx_buffer: usize,
    pub tx_buffer: usize,
}

impl Default for SockOpts {
    fn default() -> Self {
        Self {
            source: None,
            ttl: 1,
            tos: TOS_INTERNET_CONTROL,
            md5_key: None,
            rx_buffer: BGP_RX_BUFFER_SIZE,
            tx_buffer: BGP_TX_BUFFER_SIZE,
        }
    }
}

pub trait BgpConnection: Send + Sync + Sized + 'static {
    /// Transport-specific construction context. The TCP transport carries its
    /// wire codec here; the in-memory transport needs nothing.
    type Ctx: Clone + Send + Sync + 'static;

    /// Create the local side of an outgoing connection. No traffic happens
    /// until `connect` is called.
    fn new_outgoing(peer: SocketAddr, opts: SockOpts, ctx: Self::Ctx, log: Logger) -> Self;

    /// Begin the handshake in the background. Completion posts
    /// `FsmEvent::ConnectionConfirmed`; failure posts `FsmEvent::SocketError`
    /// for the outgoing slot.
    fn connect(&self, event_tx: Sender<FsmEvent<Self>>, timeout: Duration);

    fn send(&self, msg: Message) -> Result<(), Error>;

    /// Attach the receive hook: messages and transport errors are posted into
    /// the peer's event channel, tagged with `dir`.
    fn set_rx_hook(&self, dir: ConnDirection, event_tx: Sender<FsmEvent<Self>>);

    /// Detach the receive hook. The socket may linger (to flush a
    /// Notification) but nothing more is delivered upward. Late callbacks in
    /// the transport find the hook cleared and return.
    fn clear_rx_hook(&self);

    /// Whether unread input is sitting in the receive buffer. Used by hold
    /// expiry as a congestion signal.
    fn rx_pending(&self) -> bool;

    fn set_ttl(&self, ttl: u8) -> Result<(), Error>;

    fn peer(&self) -> SocketAddr;

    fn local(&self) -> Option<SocketAddr>;
}

pub trait BgpListener<Cnx: BgpConnection>: Send + Sync + Sized + 'static {
    fn bind(addr: &str, ctx: Cnx::Ctx, log: Logger) -> Result<Self, Error>;

    /// Accept one connection, waiting at most `timeout`. Returns
    /// `Error::Timeout` when nothing arrived, so the dispatcher loop can poll
    /// its shutdown flag.
    fn accept(&self, timeout: Duration) -> Result<Cnx, Error>;

    /// Install or remove a per-peer MD5 signature key on the shared passive
    /// socket.
    fn set_md5_key(&self, peer: IpAddr, key: Option<&str>) -> Result<(), Error>;
}
