// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::net::IpAddr;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("io {0}")]
    Io(#[from] std::io::Error),

    #[error("timeout")]
    Timeout,

    #[error("disconnected")]
    Disconnected,

    #[error("channel recv {0}")]
    ChannelRecv(#[from] std::sync::mpsc::RecvError),

    #[error("channel send {0}")]
    ChannelSend(String),

    #[error("channel connect error")]
    ChannelConnect,

    #[error("invalid address {0}")]
    InvalidAddress(String),

    #[error("connection attempt from unknown peer: {0}")]
    UnknownPeer(IpAddr),

    #[error("attempt to send a message when not connected")]
    NotConnected,

    #[error("md5 authentication setup failed: {0}")]
    Md5Auth(String),

    #[error("listener is not bound")]
    NotListening,

    #[error("message type error")]
    MessageType(#[from] num_enum::TryFromPrimitiveError<crate::messages::MessageType>),

    #[error("local AS number must be set")]
    LocalAsUnset,

    #[error("remote AS number must be set")]
    RemoteAsUnset,

    #[error("remote AS number out of range (AS4 not available)")]
    RemoteAsOutOfRange,

    #[error("only internal neighbors can be route-reflector clients")]
    RrClientNotInternal,

    #[error("only external neighbors can be route-server clients")]
    RsClientNotExternal,
}
