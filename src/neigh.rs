// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The daemon-wide neighbor cache as the session engine consumes it. The
//! daemon's interface layer feeds reachability transitions in through
//! `set_iface`; peers look neighbors up with `find` and subscribe for
//! notifications. A sticky find returns a handle even while the neighbor is
//! unreachable, so the peer can wait for the interface to appear.

use crate::lock;
use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, Ipv6Addr};
use std::sync::{Arc, Mutex};

/// Interface information a neighbor resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfaceInfo {
    pub name: String,

    /// Primary address of the interface, used as the default source address.
    pub addr: IpAddr,

    /// Link-local address, when the interface has one.
    pub link_local: Option<Ipv6Addr>,
}

type Watcher = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Entry {
    iface: Option<IfaceInfo>,
    watchers: Vec<Watcher>,
}

#[derive(Default)]
pub struct NeighborCache {
    inner: Mutex<BTreeMap<IpAddr, Entry>>,

    /// Addresses that can never resolve to a neighbor (not on any connected
    /// network and not routed). `find` fails for these even when sticky.
    unresolvable: Mutex<BTreeSet<IpAddr>>,
}

impl NeighborCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Look up a neighbor. A non-sticky find succeeds only while the
    /// neighbor is reachable; a sticky find creates the cache entry and
    /// returns a handle that waits for reachability.
    pub fn find(self: &Arc<Self>, addr: IpAddr, sticky: bool) -> Option<Neighbor> {
        if lock!(self.unresolvable).contains(&addr) {
            return None;
        }
        let mut inner = lock!(self.inner);
        let reachable = inner.get(&addr).is_some_and(|e| e.iface.is_some());
        if sticky {
            inner.entry(addr).or_default();
        } else if !reachable {
            return None;
        }
        Some(Neighbor {
            cache: self.clone(),
            addr,
        })
    }

    /// Declare an address unresolvable. Used by the daemon when the address
    /// is outside every connected network and no multihop route exists.
    pub fn mark_unresolvable(&self, addr: IpAddr) {
        lock!(self.unresolvable).insert(addr);
    }

    /// Record a reachability transition and wake every watcher of the
    /// address.
    pub fn set_iface(&self, addr: IpAddr, iface: Option<IfaceInfo>) {
        let mut inner = lock!(self.inner);
        let entry = inner.entry(addr).or_default();
        entry.iface = iface;
        for w in &entry.watchers {
            w();
        }
    }

    fn iface_of(&self, addr: IpAddr) -> Option<IfaceInfo> {
        lock!(self.inner).get(&addr).and_then(|e| e.iface.clone())
    }

    fn subscribe(&self, addr: IpAddr, watcher: Watcher) {
        lock!(self.inner).entry(addr).or_default().watchers.push(watcher);
    }
}

/// Handle to a neighbor cache entry.
pub struct Neighbor {
    cache: Arc<NeighborCache>,
    pub addr: IpAddr,
}

impl Neighbor {
    /// The interface the neighbor is currently reachable through, or None.
    pub fn iface(&self) -> Option<IfaceInfo> {
        self.cache.iface_of(self.addr)
    }

    /// Register a callback fired on every reachability transition.
    pub fn subscribe(&self, watcher: Watcher) {
        self.cache.subscribe(self.addr, watcher);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn eth0() -> IfaceInfo {
        IfaceInfo {
            name: "eth0".into(),
            addr: ip("10.0.0.1"),
            link_local: None,
        }
    }

    #[test]
    fn sticky_find_waits_for_reachability() {
        let cache = NeighborCache::new();
        assert!(cache.find(ip("10.0.0.2"), false).is_none());

        let n = cache.find(ip("10.0.0.2"), true).expect("sticky find");
        assert!(n.iface().is_none());

        cache.set_iface(ip("10.0.0.2"), Some(eth0()));
        assert_eq!(n.iface().unwrap().name, "eth0");
        assert!(cache.find(ip("10.0.0.2"), false).is_some());
    }

    #[test]
    fn unresolvable_addresses_never_resolve() {
        let cache = NeighborCache::new();
        cache.mark_unresolvable(ip("192.0.2.99"));
        assert!(cache.find(ip("192.0.2.99"), true).is_none());
    }

    #[test]
    fn watchers_fire_on_transitions() {
        let cache = NeighborCache::new();
        let n = cache.find(ip("10.0.0.2"), true).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        n.subscribe(Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));

        cache.set_iface(ip("10.0.0.2"), Some(eth0()));
        cache.set_iface(ip("10.0.0.2"), None);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
