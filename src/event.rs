// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::connection::BgpConnection;
use crate::session::FsmEvent;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;

/// A coalescing scheduled event. Scheduling posts one event into the peer's
/// channel; further schedules before the handler runs are absorbed. The
/// handler calls `take` before doing its work, so a schedule from inside the
/// handler arms the event again.
pub struct Event<Cnx: BgpConnection> {
    armed: AtomicBool,
    tx: Sender<FsmEvent<Cnx>>,
    make: Box<dyn Fn() -> FsmEvent<Cnx> + Send + Sync>,
}

impl<Cnx: BgpConnection> Event<Cnx> {
    pub fn new(
        tx: Sender<FsmEvent<Cnx>>,
        make: Box<dyn Fn() -> FsmEvent<Cnx> + Send + Sync>,
    ) -> Self {
        Self {
            armed: AtomicBool::new(false),
            tx,
            make,
        }
    }

    pub fn schedule(&self) {
        if self
            .armed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            // The receiver only disappears while the peer is being torn down.
            let _ = self.tx.send((self.make)());
        }
    }

    pub fn take(&self) {
        self.armed.store(false, Ordering::Release);
    }

    pub fn armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }
}
