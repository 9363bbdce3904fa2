// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Object locks. Before a peer may touch its neighbor address it must hold
//! the daemon-wide lock on (address, protocol, port); this serializes
//! contention when more than one instance could target the same peer. Grants
//! are asynchronous: the callback runs immediately when the lock is free,
//! otherwise when the current holder releases. Dropping the handle releases
//! the lock and wakes the next waiter.

use crate::lock;
use std::collections::{BTreeMap, VecDeque};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockProto {
    Tcp,
    Udp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct LockKey {
    pub addr: IpAddr,
    pub proto: LockProto,
    pub port: u16,
}

type GrantFn = Box<dyn FnOnce() + Send>;

struct LockQueue {
    holder: u64,
    waiters: VecDeque<(u64, GrantFn)>,
}

#[derive(Default)]
pub struct LockManager {
    inner: Mutex<BTreeMap<LockKey, LockQueue>>,
    next_id: AtomicU64,
}

impl LockManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Request the lock. `on_grant` runs exactly once, possibly before this
    /// call returns. The returned handle keeps the request alive; dropping
    /// it releases the lock or abandons the queued request.
    pub fn acquire(self: &Arc<Self>, key: LockKey, on_grant: GrantFn) -> ObjectLock {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut grant_now = None;
        {
            let mut inner = lock!(self.inner);
            match inner.get_mut(&key) {
                None => {
                    inner.insert(
                        key,
                        LockQueue {
                            holder: id,
                            waiters: VecDeque::new(),
                        },
                    );
                    grant_now = Some(on_grant);
                }
                Some(q) => {
                    q.waiters.push_back((id, on_grant));
                }
            }
        }
        if let Some(grant) = grant_now {
            grant();
        }
        ObjectLock {
            mgr: self.clone(),
            key,
            id,
        }
    }

    fn release(&self, key: LockKey, id: u64) {
        let next = {
            let mut inner = lock!(self.inner);
            let Some(q) = inner.get_mut(&key) else {
                return;
            };
            if q.holder != id {
                q.waiters.retain(|(wid, _)| *wid != id);
                return;
            }
            match q.waiters.pop_front() {
                Some((wid, grant)) => {
                    q.holder = wid;
                    Some(grant)
                }
                None => {
                    inner.remove(&key);
                    None
                }
            }
        };
        // Run the grant outside the table lock; it is free to acquire again.
        if let Some(grant) = next {
            grant();
        }
    }
}

/// Handle to a held or queued object lock.
pub struct ObjectLock {
    mgr: Arc<LockManager>,
    key: LockKey,
    id: u64,
}

impl Drop for ObjectLock {
    fn drop(&mut self) {
        self.mgr.release(self.key, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn key() -> LockKey {
        LockKey {
            addr: "10.0.0.2".parse().unwrap(),
            proto: LockProto::Tcp,
            port: 179,
        }
    }

    #[test]
    fn first_acquire_grants_immediately() {
        let mgr = LockManager::new();
        let granted = Arc::new(AtomicUsize::new(0));
        let g = granted.clone();
        let _l = mgr.acquire(key(), Box::new(move || {
            g.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(granted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn contended_acquire_waits_for_release() {
        let mgr = LockManager::new();
        let l1 = mgr.acquire(key(), Box::new(|| {}));

        let granted = Arc::new(AtomicUsize::new(0));
        let g = granted.clone();
        let _l2 = mgr.acquire(key(), Box::new(move || {
            g.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(granted.load(Ordering::SeqCst), 0);

        drop(l1);
        assert_eq!(granted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn abandoned_waiter_is_skipped() {
        let mgr = LockManager::new();
        let l1 = mgr.acquire(key(), Box::new(|| {}));

        let l2 = mgr.acquire(key(), Box::new(|| panic!("abandoned waiter ran")));
        drop(l2);

        let granted = Arc::new(AtomicUsize::new(0));
        let g = granted.clone();
        let _l3 = mgr.acquire(key(), Box::new(move || {
            g.fetch_add(1, Ordering::SeqCst);
        }));

        drop(l1);
        assert_eq!(granted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn different_keys_do_not_contend() {
        let mgr = LockManager::new();
        let _l1 = mgr.acquire(key(), Box::new(|| {}));
        let other = LockKey {
            port: 180,
            ..key()
        };
        let granted = Arc::new(AtomicUsize::new(0));
        let g = granted.clone();
        let _l2 = mgr.acquire(other, Box::new(move || {
            g.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(granted.load(Ordering::SeqCst), 1);
    }
}
