// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end scenarios over the channel transport. Peers run their real
//! event loops against either another full peer or a scripted remote that
//! the test drives message by message.

use crate::clock::{Jitter, NoReduction, RandomReduction};
use crate::codec::{BgpError, OpenContext, OpenParams, SessionCodec};
use crate::config::PeerConfig;
use crate::connection::{BgpConnection, BgpListener, ConnDirection, SockOpts};
use crate::connection_channel::{BgpConnectionChannel, BgpListenerChannel};
use crate::dispatcher::Dispatcher;
use crate::lock;
use crate::messages::{Message, NotificationMessage, OpenMessage, UpdateMessage, BGP4};
use crate::neigh::{IfaceInfo, NeighborCache};
use crate::olock::LockManager;
use crate::rib::SessionNote;
use crate::session::{
    ConnState, ErrorClass, PeerRunner, PeerState, ShutdownCause, StartupState,
};
use slog::Logger;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{sleep, spawn};
use std::time::{Duration, Instant};

type Cnx = BgpConnectionChannel;
type Lst = BgpListenerChannel;
type Runner = PeerRunner<Cnx, Lst>;
type Disp = Dispatcher<Cnx, Lst>;
type FsmEvent = crate::session::FsmEvent<Cnx>;

const RESOLUTION: Duration = Duration::from_millis(10);

/// A codec for the tests: structured OPEN negotiation, update import counted
/// by body length.
#[derive(Default)]
struct TestCodec {
    imported: Mutex<HashMap<IpAddr, u64>>,
    refreshes: Mutex<u64>,
}

impl SessionCodec for TestCodec {
    fn create_open(&self, cx: &OpenContext) -> OpenMessage {
        let mut open = if cx.as4 {
            OpenMessage::new4(cx.local_as, cx.hold_time, cx.local_id)
        } else {
            OpenMessage::new2(cx.local_as as u16, cx.hold_time, cx.local_id)
        };
        if !cx.capabilities {
            open.capabilities.clear();
        } else if cx.refresh {
            open.capabilities.push(crate::messages::Capability::RouteRefresh);
        }
        open
    }

    fn open_received(&self, cx: &OpenContext, msg: &OpenMessage) -> Result<OpenParams, BgpError> {
        if msg.version != BGP4 {
            return Err(BgpError::new(2, 1));
        }
        let asn = msg.advertised_asn();
        if asn != cx.remote_as {
            return Err(BgpError::new(2, 2));
        }
        if msg.hold_time == 1 || msg.hold_time == 2 {
            return Err(BgpError::new(2, 6));
        }
        Ok(OpenParams {
            remote_id: msg.id,
            remote_as: asn,
            hold_time: msg.hold_time,
            as4: msg.has_capability(crate::messages::CapabilityCode::FourOctetAs),
            refresh: msg.has_capability(crate::messages::CapabilityCode::RouteRefresh),
        })
    }

    fn create_update(&self, _peer: IpAddr) -> Option<UpdateMessage> {
        None
    }

    fn update_received(&self, peer: IpAddr, msg: &UpdateMessage) -> Result<u64, BgpError> {
        let mut imported = lock!(self.imported);
        let count = imported.entry(peer).or_insert(0);
        *count += msg.body.len() as u64;
        Ok(*count)
    }

    fn refresh_received(&self, _peer: IpAddr, _msg: &crate::messages::RouteRefreshMessage) {
        *lock!(self.refreshes) += 1;
    }
}

struct TestPeer {
    runner: Arc<Runner>,
    dispatcher: Arc<Disp>,
    cache: Arc<NeighborCache>,
    notes_rx: Receiver<SessionNote>,
    ups: usize,
    downs: usize,
}

impl TestPeer {
    fn pump_notes(&mut self) {
        for note in self.notes_rx.try_iter() {
            match note {
                SessionNote::Up(_) => self.ups += 1,
                SessionNote::Down { .. } => self.downs += 1,
            }
        }
    }
}

fn test_config(name: &str, local_as: u32, remote_as: u32, remote: &str, id: u32) -> PeerConfig {
    let mut cf = PeerConfig::new(name, local_as, remote_as, remote.parse().unwrap());
    cf.router_id = id;
    cf.hold_time = 3;
    cf.connect_retry_time = 1;
    cf.start_delay_time = 1;
    cf.error_delay_time_min = 1;
    cf.error_delay_time_max = 4;
    cf
}

/// Build a peer with its own dispatcher, neighbor cache and lock manager,
/// with the neighbor already reachable. Does not start it.
fn make_peer(
    log: Logger,
    local: &str,
    cf: PeerConfig,
    jitter: Arc<dyn Jitter>,
) -> TestPeer {
    let remote_ip = cf.remote_ip;
    let dispatcher = Disp::new(format!("{local}:179"), (), log.clone());
    let cache = NeighborCache::new();
    cache.set_iface(
        remote_ip,
        Some(IfaceInfo {
            name: "eth0".into(),
            addr: local.parse().unwrap(),
            link_local: None,
        }),
    );
    let locks = LockManager::new();
    let (notes_tx, notes_rx) = mpsc::channel();
    let runner = Runner::new(
        cf,
        dispatcher.clone(),
        Arc::new(TestCodec::default()),
        (),
        cache.clone(),
        locks,
        notes_tx,
        jitter,
        RESOLUTION,
        log,
    );
    TestPeer {
        runner,
        dispatcher,
        cache,
        notes_rx,
        ups: 0,
        downs: 0,
    }
}

fn spawn_peer(log: Logger, local: &str, cf: PeerConfig, jitter: Arc<dyn Jitter>) -> TestPeer {
    let peer = make_peer(log, local, cf, jitter);
    peer.runner.start();
    let r = peer.runner.clone();
    spawn(move || r.run());
    peer
}

fn wait_for(what: &str, timeout: Duration, f: impl Fn() -> bool) {
    let deadline = Instant::now() + timeout;
    loop {
        if f() {
            return;
        }
        if Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        sleep(Duration::from_millis(20));
    }
}

/// The far side of a connection, driven directly by the test.
struct Remote {
    cnx: BgpConnectionChannel,
    rx: Receiver<FsmEvent>,
}

impl Remote {
    fn attach(cnx: BgpConnectionChannel) -> Self {
        let (tx, rx) = mpsc::channel();
        cnx.set_rx_hook(ConnDirection::Incoming, tx);
        Self { cnx, rx }
    }

    /// Connect into a peer, posing as `from`.
    fn connect_to(peer: &str, from: &str, log: Logger) -> Self {
        let (tx, rx) = mpsc::channel();
        let opts = SockOpts {
            source: Some(SocketAddr::new(from.parse().unwrap(), 0)),
            ..SockOpts::default()
        };
        let cnx = BgpConnectionChannel::new_outgoing(
            format!("{peer}:179").parse().unwrap(),
            opts,
            (),
            log,
        );
        cnx.connect(tx.clone(), Duration::from_secs(1));
        let this = Self { cnx, rx };
        // The connect is synchronous for channels; consume the confirmation.
        this.expect_event("connection confirmed", Duration::from_secs(1));
        this.cnx.set_rx_hook(ConnDirection::Incoming, tx);
        this
    }

    fn send(&self, msg: Message) {
        self.cnx.send(msg).expect("remote send");
    }

    fn expect_event(&self, what: &str, timeout: Duration) -> FsmEvent {
        match self.rx.recv_timeout(timeout) {
            Ok(e) => e,
            Err(RecvTimeoutError::Timeout) => panic!("timed out waiting for {what}"),
            Err(RecvTimeoutError::Disconnected) => panic!("remote disconnected ({what})"),
        }
    }

    /// Wait for the next message, skipping transport events.
    fn expect_msg(&self, what: &str, timeout: Duration) -> Message {
        let deadline = Instant::now() + timeout;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.expect_event(what, left.max(Duration::from_millis(1))) {
                FsmEvent::Message { msg, .. } => return msg,
                _ => continue,
            }
        }
    }
}

// ===== scenarios ===========================================================

#[test]
fn s1_clean_bring_up_and_keepalive_cadence() {
    let log = crate::log::init_logger();
    let jitter: Arc<dyn Jitter> = Arc::new(RandomReduction::seeded(1));

    let mut a = spawn_peer(
        log.clone(),
        "10.1.0.1",
        test_config("b", 65010, 65020, "10.1.0.2", 1),
        jitter.clone(),
    );
    let mut b = spawn_peer(log, "10.1.0.2", {
        let mut cf = test_config("a", 65020, 65010, "10.1.0.1", 2);
        cf.passive = true;
        cf
    }, jitter);

    wait_for("both peers up", Duration::from_secs(15), || {
        a.runner.peer_state() == PeerState::Up && b.runner.peer_state() == PeerState::Up
    });

    // At most one connection per peer is Established and it is the session
    // connection.
    for peer in [&a, &b] {
        let established: Vec<_> = [ConnDirection::Outgoing, ConnDirection::Incoming]
            .iter()
            .filter(|d| peer.runner.conn(**d).state() == ConnState::Established)
            .cloned()
            .collect();
        assert_eq!(established.len(), 1);
        assert_eq!(peer.runner.session_conn(), Some(established[0]));
    }
    assert!(a.runner.get_status().starts_with("Established"));

    // Keepalives flow at roughly keepalive_time (hold 3 -> keepalive 1),
    // jittered by up to a quarter.
    let base = b.runner.counters.keepalives_rcvd.load(Ordering::Relaxed);
    sleep(Duration::from_millis(3500));
    let delta = b.runner.counters.keepalives_rcvd.load(Ordering::Relaxed) - base;
    assert!((2..=6).contains(&delta), "keepalive cadence off: {delta}");

    // The hold timer never expired: still up, exactly one session up event.
    assert_eq!(a.runner.peer_state(), PeerState::Up);
    a.pump_notes();
    b.pump_notes();
    assert_eq!((a.ups, a.downs), (1, 0));
    assert_eq!((b.ups, b.downs), (1, 0));

    a.runner.terminate();
    b.runner.terminate();
}

#[test]
fn s2_passive_peer_never_initiates() {
    let log = crate::log::init_logger();
    let jitter: Arc<dyn Jitter> = Arc::new(NoReduction);

    let a = spawn_peer(log.clone(), "10.2.0.1", {
        let mut cf = test_config("b", 65010, 65020, "10.2.0.2", 1);
        cf.passive = true;
        cf
    }, jitter.clone());
    let b = spawn_peer(
        log,
        "10.2.0.2",
        test_config("a", 65020, 65010, "10.2.0.1", 2),
        jitter,
    );

    wait_for("passive peer up", Duration::from_secs(15), || {
        // The passive peer's outgoing slot must stay Idle the whole way up.
        assert_eq!(a.runner.conn(ConnDirection::Outgoing).state(), ConnState::Idle);
        a.runner.peer_state() == PeerState::Up && b.runner.peer_state() == PeerState::Up
    });

    assert_eq!(a.runner.session_conn(), Some(ConnDirection::Incoming));
    assert_eq!(b.runner.session_conn(), Some(ConnDirection::Outgoing));
    // The only OPEN the passive peer sent went out on the inbound connection.
    assert_eq!(a.runner.counters.opens_sent.load(Ordering::Relaxed), 1);

    a.runner.terminate();
    b.runner.terminate();
}

#[test]
fn s3_hold_expiry_applies_backoff_and_reattempts() {
    let log = crate::log::init_logger();
    let jitter: Arc<dyn Jitter> = Arc::new(NoReduction);

    let mut a = spawn_peer(
        log.clone(),
        "10.3.0.1",
        test_config("b", 65010, 65020, "10.3.0.2", 1),
        jitter.clone(),
    );
    let b = spawn_peer(log, "10.3.0.2", {
        let mut cf = test_config("a", 65020, 65010, "10.3.0.1", 2);
        cf.passive = true;
        cf
    }, jitter);

    wait_for("peers up", Duration::from_secs(15), || {
        a.runner.peer_state() == PeerState::Up && b.runner.peer_state() == PeerState::Up
    });

    // Silence the peer entirely; nothing keeps the hold timer alive now.
    b.runner.terminate();

    wait_for("hold expiry", Duration::from_secs(10), || {
        // Whenever a draining connection is visible, its hold and keepalive
        // timers must already be stopped.
        for dir in [ConnDirection::Outgoing, ConnDirection::Incoming] {
            let conn = a.runner.conn(dir);
            if conn.state() == ConnState::Close {
                assert!(!conn.hold_timer_enabled());
                assert!(!conn.keepalive_timer_enabled());
            }
        }
        a.runner.last_error()
            == crate::session::LastError {
                class: ErrorClass::BgpTx,
                code: 4 << 16,
            }
    });

    assert!(a.runner.counters.notifications_sent.load(Ordering::Relaxed) >= 1);
    assert_eq!(a.runner.startup_delay(), 1);
    assert!(a.runner.get_status().contains("Hold timer expired"));

    a.pump_notes();
    assert_eq!((a.ups, a.downs), (1, 1));

    // After the back-off the peer attempts to connect again.
    let opens = a.runner.counters.opens_sent.load(Ordering::Relaxed);
    wait_for("re-attempt after backoff", Duration::from_secs(10), || {
        a.runner.counters.opens_sent.load(Ordering::Relaxed) > opens
    });

    a.runner.terminate();
}

#[test]
fn s4_route_limit_shuts_the_session_down() {
    let log = crate::log::init_logger();
    let jitter: Arc<dyn Jitter> = Arc::new(NoReduction);

    let a = spawn_peer(log.clone(), "10.4.0.1", {
        let mut cf = test_config("b", 65010, 65020, "10.4.0.2", 1);
        cf.route_limit = 100;
        // Keep the restart quiet for the duration of the test.
        cf.error_delay_time_min = 60;
        cf.error_delay_time_max = 300;
        cf
    }, jitter.clone());
    let b = spawn_peer(log, "10.4.0.2", {
        let mut cf = test_config("a", 65020, 65010, "10.4.0.1", 2);
        cf.passive = true;
        cf
    }, jitter);

    wait_for("peers up", Duration::from_secs(15), || {
        a.runner.peer_state() == PeerState::Up && b.runner.peer_state() == PeerState::Up
    });

    // 101 routes arrive in one update.
    let dir = a.runner.session_conn().unwrap();
    a.runner
        .event_sender()
        .send(FsmEvent::Message {
            dir,
            msg: Message::Update(UpdateMessage {
                body: vec![0u8; 101],
            }),
        })
        .unwrap();

    wait_for("route limit error", Duration::from_secs(10), || {
        a.runner.last_error()
            == crate::session::LastError {
                class: ErrorClass::AutoDown,
                code: crate::session::AUTO_ROUTE_LIMIT_EXCEEDED,
            }
    });
    // The peer told its neighbor why: Cease / maximum prefixes reached.
    wait_for("cease received by peer", Duration::from_secs(10), || {
        b.runner.last_error()
            == crate::session::LastError {
                class: ErrorClass::BgpRx,
                code: (6 << 16) | 1,
            }
    });
    wait_for("status converges", Duration::from_secs(10), || {
        a.runner.get_status() == "Idle Automatic shutdown: Route limit exceeded"
    });

    a.runner.terminate();
    b.runner.terminate();
}

#[test]
fn s5_simultaneous_open_yields_one_session() {
    let log = crate::log::init_logger();
    let jitter: Arc<dyn Jitter> = Arc::new(NoReduction);

    let mut a = spawn_peer(
        log.clone(),
        "10.5.0.1",
        test_config("b", 65010, 65020, "10.5.0.2", 1),
        jitter.clone(),
    );
    let mut b = spawn_peer(
        log,
        "10.5.0.2",
        test_config("a", 65020, 65010, "10.5.0.1", 2),
        jitter,
    );

    wait_for("both peers up", Duration::from_secs(30), || {
        a.runner.peer_state() == PeerState::Up && b.runner.peer_state() == PeerState::Up
    });

    // Exactly one session, surviving connections paired consistently.
    for peer in [&a, &b] {
        let established = [ConnDirection::Outgoing, ConnDirection::Incoming]
            .iter()
            .filter(|d| peer.runner.conn(**d).state() == ConnState::Established)
            .count();
        assert_eq!(established, 1);
    }
    let pair = (a.runner.session_conn().unwrap(), b.runner.session_conn().unwrap());
    assert!(
        pair == (ConnDirection::Outgoing, ConnDirection::Incoming)
            || pair == (ConnDirection::Incoming, ConnDirection::Outgoing),
        "inconsistent winner: {pair:?}"
    );

    // "Session established" went up exactly once on each side.
    sleep(Duration::from_millis(200));
    a.pump_notes();
    b.pump_notes();
    assert_eq!((a.ups, a.downs), (1, 0));
    assert_eq!((b.ups, b.downs), (1, 0));

    a.runner.terminate();
    b.runner.terminate();
}

#[test]
fn s6_admin_shutdown_while_up() {
    let log = crate::log::init_logger();
    let jitter: Arc<dyn Jitter> = Arc::new(NoReduction);

    let mut a = spawn_peer(log.clone(), "10.6.0.1", {
        let mut cf = test_config("b", 65010, 65020, "10.6.0.2", 1);
        cf.password = Some("s3cret".into());
        cf
    }, jitter.clone());
    let b = spawn_peer(log, "10.6.0.2", {
        let mut cf = test_config("a", 65020, 65010, "10.6.0.1", 2);
        cf.passive = true;
        cf
    }, jitter);

    wait_for("peers up", Duration::from_secs(15), || {
        a.runner.peer_state() == PeerState::Up && b.runner.peer_state() == PeerState::Up
    });
    assert_eq!(a.dispatcher.refcount(), 1);
    assert!(a.dispatcher.listener_bound());

    a.runner.request_shutdown(ShutdownCause::Admin);

    // The peer saw Cease / administrative shutdown.
    wait_for("cease received", Duration::from_secs(10), || {
        b.runner.last_error()
            == crate::session::LastError {
                class: ErrorClass::BgpRx,
                code: (6 << 16) | 2,
            }
    });
    wait_for("peer down", Duration::from_secs(10), || {
        a.runner.peer_state() == PeerState::Down
    });

    // Session down notified exactly once; listening reference released.
    a.pump_notes();
    assert_eq!((a.ups, a.downs), (1, 1));
    assert_eq!(a.dispatcher.refcount(), 0);
    assert!(!a.dispatcher.listener_bound());
    assert!(a.runner.is_disabled());
    // Manual shutdown carries no status text.
    assert_eq!(a.runner.get_status(), "");

    a.runner.terminate();
    b.runner.terminate();
}

// ===== scripted-remote scenarios ===========================================

/// Bring a spawned peer to OpenSent against a listener the test owns, and
/// return the accepted connection.
fn to_open_sent(peer: &TestPeer, listener: &Lst) -> (Remote, OpenMessage) {
    let cnx = listener
        .accept(Duration::from_secs(10))
        .expect("accept outgoing connection");
    let remote = Remote::attach(cnx);
    let open = match remote.expect_msg("peer's open", Duration::from_secs(10)) {
        Message::Open(o) => o,
        other => panic!("expected open, got {other}"),
    };
    wait_for("peer in OpenSent", Duration::from_secs(5), || {
        peer.runner.conn(ConnDirection::Outgoing).state() == ConnState::OpenSent
    });
    (remote, open)
}

#[test]
fn collision_resolution_closes_the_lower_id_initiator() {
    let log = crate::log::init_logger();
    let jitter: Arc<dyn Jitter> = Arc::new(NoReduction);

    // Our id is 2, the scripted remote's is 1: connections we initiated win.
    let mut a = spawn_peer(
        log.clone(),
        "10.7.0.1",
        test_config("b", 65010, 65020, "10.7.0.2", 2),
        jitter,
    );
    let listener = Lst::bind("10.7.0.2:179", (), log.clone()).unwrap();
    let (out_remote, out_open) = to_open_sent(&a, &listener);
    assert!(out_open.hold_time >= 3);

    // Collide: connect in while the outgoing connection is still OpenSent.
    let in_remote = Remote::connect_to("10.7.0.1", "10.7.0.2", log.clone());
    match in_remote.expect_msg("open on inbound", Duration::from_secs(10)) {
        Message::Open(_) => {}
        other => panic!("expected open, got {other}"),
    }
    wait_for("incoming slot in OpenSent", Duration::from_secs(5), || {
        a.runner.conn(ConnDirection::Incoming).state() == ConnState::OpenSent
    });

    // The remote's OPEN arrives on the outgoing connection first; it moves
    // to OpenConfirm and answers with a keepalive.
    out_remote.send(Message::Open(OpenMessage::new2(65020, 3, 1)));
    match out_remote.expect_msg("keepalive", Duration::from_secs(10)) {
        Message::KeepAlive => {}
        other => panic!("expected keepalive, got {other}"),
    }

    // The OPEN on the incoming connection now collides with OpenConfirm.
    // Our id is higher, so the connection we initiated survives and the
    // inbound one is closed with Cease / collision resolution.
    in_remote.send(Message::Open(OpenMessage::new2(65020, 3, 1)));
    match in_remote.expect_msg("collision notification", Duration::from_secs(10)) {
        Message::Notification(n) => {
            assert_eq!((n.error_code, n.error_subcode), (6, 7));
        }
        other => panic!("expected notification, got {other}"),
    }
    wait_for("loser drained", Duration::from_secs(5), || {
        a.runner.conn(ConnDirection::Incoming).state() == ConnState::Idle
    });

    // The survivor completes the session.
    out_remote.send(Message::KeepAlive);
    wait_for("session up on survivor", Duration::from_secs(5), || {
        a.runner.peer_state() == PeerState::Up
    });
    assert_eq!(a.runner.session_conn(), Some(ConnDirection::Outgoing));
    a.pump_notes();
    assert_eq!((a.ups, a.downs), (1, 0));

    a.runner.terminate();
}

#[test]
fn fsm_error_queues_notification_and_backs_off() {
    let log = crate::log::init_logger();
    let jitter: Arc<dyn Jitter> = Arc::new(NoReduction);

    let a = spawn_peer(
        log.clone(),
        "10.10.0.1",
        test_config("b", 65010, 65020, "10.10.0.2", 1),
        jitter,
    );
    let listener = Lst::bind("10.10.0.2:179", (), log.clone()).unwrap();
    let (remote, _) = to_open_sent(&a, &listener);

    // An UPDATE before the OPEN exchange finishes is an FSM error.
    remote.send(Message::Update(UpdateMessage::default()));
    match remote.expect_msg("fsm error notification", Duration::from_secs(10)) {
        Message::Notification(n) => {
            assert_eq!((n.error_code, n.error_subcode), (5, 0));
        }
        other => panic!("expected notification, got {other}"),
    }

    wait_for("backoff applied", Duration::from_secs(5), || {
        a.runner.startup_delay() == 1
    });
    assert_eq!(
        a.runner.last_error(),
        crate::session::LastError {
            class: ErrorClass::BgpTx,
            code: 5 << 16,
        }
    );

    a.runner.terminate();
}

#[test]
fn received_notification_backs_off_except_cease() {
    let log = crate::log::init_logger();
    let jitter: Arc<dyn Jitter> = Arc::new(NoReduction);

    // A non-Cease notification from the peer applies back-off.
    let a = spawn_peer(
        log.clone(),
        "10.11.0.1",
        test_config("b", 65010, 65020, "10.11.0.2", 1),
        jitter.clone(),
    );
    let listener = Lst::bind("10.11.0.2:179", (), log.clone()).unwrap();
    let (remote, _) = to_open_sent(&a, &listener);
    remote.send(Message::Notification(NotificationMessage {
        error_code: 2,
        error_subcode: 2,
        data: Vec::new(),
    }));
    wait_for("backoff applied", Duration::from_secs(5), || {
        a.runner.startup_delay() == 1
    });
    assert_eq!(
        a.runner.last_error(),
        crate::session::LastError {
            class: ErrorClass::BgpRx,
            code: (2 << 16) | 2,
        }
    );
    a.runner.terminate();
    drop(listener);

    // A Cease from the peer does not.
    let b = spawn_peer(
        log.clone(),
        "10.12.0.1",
        test_config("b", 65010, 65020, "10.12.0.2", 1),
        jitter,
    );
    let listener = Lst::bind("10.12.0.2:179", (), log.clone()).unwrap();
    let (remote, _) = to_open_sent(&b, &listener);
    remote.send(Message::Notification(NotificationMessage {
        error_code: 6,
        error_subcode: 4,
        data: Vec::new(),
    }));
    wait_for("connection drained", Duration::from_secs(5), || {
        b.runner.conn(ConnDirection::Outgoing).state() == ConnState::Idle
            || b.runner.conn(ConnDirection::Outgoing).state() == ConnState::Connect
            || b.runner.conn(ConnDirection::Outgoing).state() == ConnState::Active
    });
    assert_eq!(b.runner.startup_delay(), 0);

    b.runner.terminate();
}

#[test]
fn second_error_within_amnesia_doubles_backoff() {
    let log = crate::log::init_logger();
    let jitter: Arc<dyn Jitter> = Arc::new(NoReduction);

    let a = spawn_peer(
        log.clone(),
        "10.13.0.1",
        test_config("b", 65010, 65020, "10.13.0.2", 1),
        jitter,
    );
    let listener = Lst::bind("10.13.0.2:179", (), log.clone()).unwrap();

    let (remote, _) = to_open_sent(&a, &listener);
    remote.send(Message::Update(UpdateMessage::default()));
    wait_for("first backoff", Duration::from_secs(5), || {
        a.runner.startup_delay() == 1
    });

    // The peer reconnects after the delay; fail it again.
    let (remote, _) = to_open_sent(&a, &listener);
    remote.send(Message::Update(UpdateMessage::default()));
    wait_for("doubled backoff", Duration::from_secs(10), || {
        a.runner.startup_delay() == 2
    });

    a.runner.terminate();
}

#[test]
fn unknown_inbound_address_is_dropped() {
    let log = crate::log::init_logger();
    let jitter: Arc<dyn Jitter> = Arc::new(NoReduction);

    let a = spawn_peer(log.clone(), "10.14.0.1", {
        let mut cf = test_config("b", 65010, 65020, "10.14.0.2", 1);
        cf.passive = true;
        cf
    }, jitter);
    wait_for("listener bound", Duration::from_secs(5), || {
        a.dispatcher.listener_bound()
    });

    // A connection from an address no peer is configured for goes nowhere.
    let stranger = Remote::connect_to("10.14.0.1", "10.14.9.9", log);
    match stranger.expect_event("drop", Duration::from_secs(5)) {
        FsmEvent::SocketError { .. } => {}
        FsmEvent::Message { msg, .. } => panic!("unexpected message {msg}"),
        _ => {}
    }
    assert_eq!(a.runner.peer_state(), PeerState::Start);
    assert_eq!(a.runner.conn(ConnDirection::Incoming).state(), ConnState::Idle);

    a.runner.terminate();
}

#[test]
fn neighbor_lost_and_recovered() {
    let log = crate::log::init_logger();
    let jitter: Arc<dyn Jitter> = Arc::new(NoReduction);

    let a = spawn_peer(
        log.clone(),
        "10.17.0.1",
        test_config("b", 65010, 65020, "10.17.0.2", 1),
        jitter.clone(),
    );
    let b = spawn_peer(log, "10.17.0.2", {
        let mut cf = test_config("a", 65020, 65010, "10.17.0.1", 2);
        cf.passive = true;
        cf
    }, jitter);

    wait_for("peers up", Duration::from_secs(15), || {
        a.runner.peer_state() == PeerState::Up && b.runner.peer_state() == PeerState::Up
    });

    // The next hop disappears from the neighbor cache.
    a.cache.set_iface("10.17.0.2".parse().unwrap(), None);
    wait_for("neighbor lost recorded", Duration::from_secs(10), || {
        a.runner.last_error()
            == crate::session::LastError {
                class: ErrorClass::Misc,
                code: crate::session::MISC_NEIGHBOR_LOST,
            }
    });
    // No back-off for a lost neighbor; the peer waits in prepare.
    wait_for("waiting for neighbor", Duration::from_secs(10), || {
        a.runner.peer_state() == PeerState::Start
            && a.runner.startup_state() == StartupState::Prepare
    });
    assert_eq!(a.runner.startup_delay(), 0);
    assert_eq!(a.runner.get_status(), "Idle Error: Neighbor lost");

    // Reachability returns; the session comes back on its own.
    a.cache.set_iface(
        "10.17.0.2".parse().unwrap(),
        Some(IfaceInfo {
            name: "eth0".into(),
            addr: "10.17.0.1".parse().unwrap(),
            link_local: None,
        }),
    );
    wait_for("session re-established", Duration::from_secs(20), || {
        a.runner.peer_state() == PeerState::Up
    });

    a.runner.terminate();
    b.runner.terminate();
}

#[test]
fn invalid_next_hop_disables_peer() {
    let log = crate::log::init_logger();
    let a = make_peer(
        log,
        "10.18.0.1",
        test_config("b", 65010, 65020, "10.18.0.2", 1),
        Arc::new(NoReduction),
    );
    a.cache.mark_unresolvable("10.18.0.2".parse().unwrap());
    a.runner.start();
    // Drive the engine by hand; it only has the lock grant to chew on.
    while a.runner.step(Duration::from_millis(200)) {}

    assert!(a.runner.is_disabled());
    assert_eq!(a.runner.peer_state(), PeerState::Down);
    assert_eq!(
        a.runner.last_error(),
        crate::session::LastError {
            class: ErrorClass::Misc,
            code: crate::session::MISC_INVALID_NEXT_HOP,
        }
    );
    assert_eq!(a.runner.get_status(), "Error: Invalid next hop");
}

#[test]
fn contended_object_lock_serializes_peers() {
    let log = crate::log::init_logger();

    // Two logical peers target the same address through one lock manager.
    let locks = LockManager::new();
    let mk = |name: &str, local: &str| {
        let cf = test_config(name, 65010, 65020, "10.15.0.2", 1);
        let dispatcher = Disp::new(format!("{local}:179"), (), log.clone());
        let cache = NeighborCache::new();
        cache.set_iface(
            "10.15.0.2".parse().unwrap(),
            Some(IfaceInfo {
                name: "eth0".into(),
                addr: local.parse().unwrap(),
                link_local: None,
            }),
        );
        let (notes_tx, _notes_rx) = mpsc::channel();
        let runner = Runner::new(
            cf,
            dispatcher,
            Arc::new(TestCodec::default()),
            (),
            cache,
            locks.clone(),
            notes_tx,
            Arc::new(NoReduction),
            RESOLUTION,
            log.clone(),
        );
        runner
    };

    let first = mk("p1", "10.15.0.1");
    let second = mk("p2", "10.15.0.3");
    first.start();
    let r = first.clone();
    spawn(move || r.run());
    wait_for("first peer past prepare", Duration::from_secs(10), || {
        first.startup_state() >= StartupState::Connect
    });

    second.start();
    let r = second.clone();
    spawn(move || r.run());
    // The second peer cannot progress while the first holds the lock.
    sleep(Duration::from_millis(500));
    assert_eq!(second.startup_state(), StartupState::Prepare);

    // Destroying the first peer releases the lock and unblocks the second.
    first.terminate();
    wait_for("second peer past prepare", Duration::from_secs(10), || {
        second.startup_state() >= StartupState::Connect
    });

    second.terminate();
}

#[test]
fn reconfigure_same_absorbs_and_different_rejects() {
    let log = crate::log::init_logger();
    let a = make_peer(
        log,
        "10.16.0.1",
        test_config("b", 65010, 65020, "10.16.0.2", 1),
        Arc::new(NoReduction),
    );

    let same = test_config("b", 65010, 65020, "10.16.0.2", 1);
    assert!(a.runner.reconfigure(same));

    let mut different = test_config("b", 65010, 65020, "10.16.0.2", 1);
    different.hold_time = 90;
    assert!(!a.runner.reconfigure(different));

    // Password changes alone also make the config "same" only when equal.
    let mut pw = test_config("b", 65010, 65020, "10.16.0.2", 1);
    pw.password = Some("k1".into());
    assert!(!a.runner.reconfigure(pw));
}

// ===== property tests ======================================================

mod props {
    use super::*;
    use crate::session::next_startup_delay;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn timer_reduction_within_bounds(secs in 1u64..100_000, seed in any::<u64>()) {
            let j = RandomReduction::seeded(seed);
            let nominal = Duration::from_secs(secs);
            let actual = j.reduce(nominal);
            prop_assert!(actual <= nominal);
            prop_assert!(actual >= nominal - nominal / 4);
        }

        #[test]
        fn backoff_monotone_and_capped(start in 0u32..=300, rounds in 1usize..12) {
            let cf = test_config("b", 65010, 65020, "10.0.0.2", 1);
            let cf = PeerConfig {
                error_delay_time_min: 60,
                error_delay_time_max: 300,
                ..cf
            };
            let mut delay = start;
            let mut prev = delay;
            for _ in 0..rounds {
                delay = next_startup_delay(delay, &cf);
                prop_assert!(delay >= prev);
                prop_assert!(delay <= u32::from(cf.error_delay_time_max));
                prev = delay;
            }
        }

        #[test]
        fn reconfigure_same_iff_fields_and_password_match(
            hold_a in 3u16..=240,
            hold_b in 3u16..=240,
            pw_a in proptest::option::of("[a-z]{1,8}"),
            pw_b in proptest::option::of("[a-z]{1,8}"),
        ) {
            let mut a = test_config("b", 65010, 65020, "10.0.0.2", 1);
            let mut b = test_config("b", 65010, 65020, "10.0.0.2", 1);
            a.hold_time = hold_a;
            b.hold_time = hold_b;
            a.password = pw_a.clone();
            b.password = pw_b.clone();
            prop_assert_eq!(a.same(&b), hold_a == hold_b && pw_a == pw_b);
        }
    }
}
