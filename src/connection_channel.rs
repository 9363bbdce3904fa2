// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory transport used by the tests. Connections move [`Message`]
//! values over mpsc channels through a process-global simulated network, so
//! whole peering scenarios run without sockets or a wire format.

use crate::connection::{BgpConnection, BgpListener, ConnDirection, SockOpts};
use crate::error::Error;
use crate::lock;
use crate::messages::Message;
use crate::session::FsmEvent;
use slog::{trace, Logger};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::spawn;
use std::time::Duration;

lazy_static! {
    static ref NET: Network = Network::new();
}

/// What a listener receives for each connection attempt: the initiator's
/// address plus the far ends of the two per-direction message channels (a
/// sender back to the initiator, a receiver of the initiator's messages).
type Accept = (SocketAddr, Sender<Message>, Receiver<Message>);

/// The simulated network: listeners registered by address. Bindings carry an
/// id so a listener only unbinds itself, not a successor on the same address.
pub struct Network {
    endpoints: Mutex<HashMap<SocketAddr, (u64, Sender<Accept>)>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl Network {
    fn new() -> Self {
        Self {
            endpoints: Mutex::new(HashMap::new()),
            next_id: std::sync::atomic::AtomicU64::new(0),
        }
    }

    fn bind(&self, sa: SocketAddr) -> (u64, Receiver<Accept>) {
        let (tx, rx) = mpsc::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock!(self.endpoints).insert(sa, (id, tx));
        (id, rx)
    }

    fn unbind(&self, sa: SocketAddr, id: u64) {
        let mut endpoints = lock!(self.endpoints);
        if endpoints.get(&sa).is_some_and(|(i, _)| *i == id) {
            endpoints.remove(&sa);
        }
    }

    fn connect(
        &self,
        from: SocketAddr,
        to: SocketAddr,
        tx: Sender<Message>,
        rx: Receiver<Message>,
    ) -> Result<(), Error> {
        match lock!(self.endpoints).get(&to) {
            None => Err(Error::ChannelConnect),
            Some((_, sender)) => sender
                .send((from, tx, rx))
                .map_err(|e| Error::ChannelSend(e.to_string())),
        }
    }
}

pub struct BgpConnectionChannel {
    addr: SocketAddr,
    peer: SocketAddr,
    tx: Arc<Mutex<Option<Sender<Message>>>>,
    rx: Arc<Mutex<Option<Receiver<Message>>>>,
    rx_attached: Arc<AtomicBool>,
    rx_pending: Arc<AtomicBool>,
    log: Logger,
}

impl BgpConnection for BgpConnectionChannel {
    type Ctx = ();

    fn new_outgoing(peer: SocketAddr, opts: SockOpts, _ctx: (), log: Logger) -> Self {
        let addr = opts
            .source
            .unwrap_or_else(|| SocketAddr::new(IpAddr::from([0, 0, 0, 0]), 0));
        Self {
            addr,
            peer,
            tx: Arc::new(Mutex::new(None)),
            rx: Arc::new(Mutex::new(None)),
            rx_attached: Arc::new(AtomicBool::new(false)),
            rx_pending: Arc::new(AtomicBool::new(false)),
            log,
        }
    }

    fn connect(&self, event_tx: Sender<FsmEvent<Self>>, _timeout: Duration) {
        // One mpsc pair per direction; the listener side gets the far ends.
        let (to_peer, peer_rx) = mpsc::channel();
        let (to_us, our_rx) = mpsc::channel();
        match NET.connect(self.addr, self.peer, to_us, peer_rx) {
            Ok(()) => {
                trace!(self.log, "[{}] connected to {}", self.addr, self.peer);
                *lock!(self.tx) = Some(to_peer);
                *lock!(self.rx) = Some(our_rx);
                let _ = event_tx.send(FsmEvent::ConnectionConfirmed);
            }
            Err(_) => {
                let _ = event_tx.send(FsmEvent::SocketError {
                    dir: ConnDirection::Outgoing,
                    errno: libc::ECONNREFUSED,
                });
            }
        }
    }

    fn send(&self, msg: Message) -> Result<(), Error> {
        match lock!(self.tx).as_ref() {
            Some(tx) => tx
                .send(msg)
                .map_err(|e| Error::ChannelSend(e.to_string())),
            None => Err(Error::NotConnected),
        }
    }

    fn set_rx_hook(&self, dir: ConnDirection, event_tx: Sender<FsmEvent<Self>>) {
        let rx = match lock!(self.rx).take() {
            Some(rx) => rx,
            None => return,
        };
        self.rx_attached.store(true, Ordering::Release);
        let attached = self.rx_attached.clone();
        let peer = self.peer;
        let log = self.log.clone();
        spawn(move || loop {
            if !attached.load(Ordering::Acquire) {
                // Detached: the connection lingers only to flush its last
                // words, nothing received is delivered anymore.
                return;
            }
            match rx.recv_timeout(Duration::from_millis(20)) {
                Ok(msg) => {
                    trace!(log, "[{peer}] recv: {}", msg.title());
                    if event_tx.send(FsmEvent::Message { dir, msg }).is_err() {
                        return;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    if attached.load(Ordering::Acquire) {
                        let _ = event_tx.send(FsmEvent::SocketError { dir, errno: 0 });
                    }
                    return;
                }
            }
        });
    }

    fn clear_rx_hook(&self) {
        self.rx_attached.store(false, Ordering::Release);
    }

    fn rx_pending(&self) -> bool {
        self.rx_pending.load(Ordering::Relaxed)
    }

    fn set_ttl(&self, _ttl: u8) -> Result<(), Error> {
        Ok(())
    }

    fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn local(&self) -> Option<SocketAddr> {
        Some(self.addr)
    }
}

impl BgpConnectionChannel {
    fn with_conn(
        addr: SocketAddr,
        peer: SocketAddr,
        tx: Sender<Message>,
        rx: Receiver<Message>,
        log: Logger,
    ) -> Self {
        Self {
            addr,
            peer,
            tx: Arc::new(Mutex::new(Some(tx))),
            rx: Arc::new(Mutex::new(Some(rx))),
            rx_attached: Arc::new(AtomicBool::new(false)),
            rx_pending: Arc::new(AtomicBool::new(false)),
            log,
        }
    }

    /// Pretend unread input is queued on the socket; exercises the
    /// congestion relief path of hold expiry.
    pub fn force_rx_pending(&self, v: bool) {
        self.rx_pending.store(v, Ordering::Relaxed);
    }
}

pub struct BgpListenerChannel {
    addr: SocketAddr,
    bind_id: u64,
    accept_rx: Mutex<Receiver<Accept>>,
    log: Logger,
}

impl BgpListener<BgpConnectionChannel> for BgpListenerChannel {
    fn bind(addr: &str, _ctx: (), log: Logger) -> Result<Self, Error> {
        let addr = addr
            .to_socket_addrs()
            .map_err(|e| Error::InvalidAddress(e.to_string()))?
            .next()
            .ok_or(Error::InvalidAddress("at least one address required".into()))?;
        let (bind_id, accept_rx) = NET.bind(addr);
        Ok(Self {
            addr,
            bind_id,
            accept_rx: Mutex::new(accept_rx),
            log,
        })
    }

    fn accept(&self, timeout: Duration) -> Result<BgpConnectionChannel, Error> {
        let (peer, tx, rx) = lock!(self.accept_rx)
            .recv_timeout(timeout)
            .map_err(|e| match e {
                RecvTimeoutError::Timeout => Error::Timeout,
                RecvTimeoutError::Disconnected => Error::Disconnected,
            })?;
        trace!(self.log, "[{}] accepted connection from {peer}", self.addr);
        Ok(BgpConnectionChannel::with_conn(
            self.addr,
            peer,
            tx,
            rx,
            self.log.clone(),
        ))
    }

    fn set_md5_key(&self, _peer: IpAddr, _key: Option<&str>) -> Result<(), Error> {
        Ok(())
    }
}

impl Drop for BgpListenerChannel {
    fn drop(&mut self) {
        NET.unbind(self.addr, self.bind_id);
    }
}
