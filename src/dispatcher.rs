// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The shared listening endpoint. One passive socket on the BGP port serves
//! every peer in the process; peers that progress past their prepare phase
//! hold a reference, the first reference binds the socket and the last one
//! tears it down. Accepted connections are routed to the peer registered for
//! the remote address; anything else is logged and dropped.

use crate::connection::{BgpConnection, BgpListener};
use crate::error::Error;
use crate::lock;
use crate::session::FsmEvent;
use crate::canonical_peer_addr;
use slog::{error, warn, Logger};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread::spawn;
use std::time::Duration;

const ACCEPT_POLL: Duration = Duration::from_millis(100);

struct ListenState<L> {
    count: usize,
    listener: Option<Arc<L>>,
    shutdown: Option<Arc<AtomicBool>>,
}

pub struct Dispatcher<Cnx: BgpConnection, L: BgpListener<Cnx>> {
    listen: String,
    ctx: Cnx::Ctx,
    addr_to_session: Mutex<BTreeMap<IpAddr, Sender<FsmEvent<Cnx>>>>,
    state: Mutex<ListenState<L>>,
    log: Logger,
}

impl<Cnx: BgpConnection, L: BgpListener<Cnx>> Dispatcher<Cnx, L> {
    pub fn new(listen: String, ctx: Cnx::Ctx, log: Logger) -> Arc<Self> {
        Arc::new(Self {
            listen,
            ctx,
            addr_to_session: Mutex::new(BTreeMap::new()),
            state: Mutex::new(ListenState {
                count: 0,
                listener: None,
                shutdown: None,
            }),
            log,
        })
    }

    /// Register the peer responsible for a remote address.
    pub fn add_peer(&self, addr: IpAddr, event_tx: Sender<FsmEvent<Cnx>>) {
        lock!(self.addr_to_session).insert(addr, event_tx);
    }

    pub fn remove_peer(&self, addr: IpAddr) {
        lock!(self.addr_to_session).remove(&addr);
    }

    /// Take a reference on the shared listener, binding it on the first one.
    /// A bind failure is logged and leaves the endpoint unbound; outgoing
    /// connections still work.
    pub fn acquire_ref(self: &Arc<Self>) {
        let mut state = lock!(self.state);
        state.count += 1;
        if state.count > 1 {
            return;
        }
        match L::bind(&self.listen, self.ctx.clone(), self.log.clone()) {
            Ok(listener) => {
                let listener = Arc::new(listener);
                let shutdown = Arc::new(AtomicBool::new(false));
                state.listener = Some(listener.clone());
                state.shutdown = Some(shutdown.clone());
                let this = self.clone();
                spawn(move || this.run(listener, shutdown));
            }
            Err(e) => {
                error!(self.log, "unable to open incoming socket: {e}"; "unit" => "dispatcher");
            }
        }
    }

    /// Drop a reference; the last one closes the listener.
    pub fn release_ref(&self) {
        let mut state = lock!(self.state);
        debug_assert!(state.count > 0);
        state.count = state.count.saturating_sub(1);
        if state.count == 0 {
            if let Some(shutdown) = state.shutdown.take() {
                shutdown.store(true, Ordering::Release);
            }
            state.listener = None;
        }
    }

    /// Install or remove a per-peer MD5 key on the shared socket.
    pub fn set_md5_key(&self, peer: IpAddr, key: Option<&str>) -> Result<(), Error> {
        let listener = lock!(self.state).listener.clone();
        match listener {
            Some(l) => l.set_md5_key(peer, key),
            None => Err(Error::NotListening),
        }
    }

    pub fn listener_bound(&self) -> bool {
        lock!(self.state).listener.is_some()
    }

    pub fn refcount(&self) -> usize {
        lock!(self.state).count
    }

    fn run(&self, listener: Arc<L>, shutdown: Arc<AtomicBool>) {
        loop {
            if shutdown.load(Ordering::Acquire) {
                return;
            }
            let conn = match listener.accept(ACCEPT_POLL) {
                Ok(c) => c,
                Err(Error::Timeout) => continue,
                Err(e) => {
                    error!(self.log, "error on incoming socket: {e}"; "unit" => "dispatcher");
                    continue;
                }
            };
            let addr = canonical_peer_addr(conn.peer().ip());
            match lock!(self.addr_to_session).get(&addr) {
                Some(tx) => {
                    if let Err(e) = tx.send(FsmEvent::Inbound(conn)) {
                        error!(
                            self.log,
                            "failed to hand incoming connection to peer: {e}";
                            "unit" => "dispatcher"
                        );
                    }
                }
                None => {
                    warn!(
                        self.log,
                        "unexpected connect from unknown address {addr}";
                        "unit" => "dispatcher"
                    );
                }
            }
        }
    }
}
