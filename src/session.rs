// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The per-peer session engine. Each configured neighbor gets one
//! [`PeerRunner`] owning two connection slots (outgoing and incoming), the
//! startup timer, the coalescing decision event, an object lock on the peer
//! address, and the last-error summary used for status reporting. All state
//! transitions run to completion on the peer's event loop; timers, sockets,
//! the listening endpoint, the neighbor cache and the lock manager only post
//! events into it.

use crate::clock::Clock;
use crate::codec::{OpenContext, SessionCodec};
use crate::config::PeerConfig;
use crate::connection::{BgpConnection, BgpListener, ConnDirection, SockOpts};
use crate::dispatcher::Dispatcher;
use crate::event::Event;
use crate::lock;
use crate::messages::{error_dsc, Message, NotificationMessage};
use crate::neigh::{Neighbor, NeighborCache};
use crate::olock::{LockKey, LockManager, LockProto, ObjectLock};
use crate::peer_log;
use crate::rib::{SessionNote, SessionSummary};
use crate::BGP_PORT;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use slog::Logger;
use std::fmt::{self, Display, Formatter};
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Hold interval applied when the hold timer expires but unread input is
/// sitting in the receive buffer: we are probably congested, not dead.
const CONGESTION_HOLD_SECS: u64 = 10;

/// Protocol-level state of a peer, as reported to the surrounding daemon.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
pub enum PeerState {
    /// Not running: never started, disabled, or shut down.
    Down,
    /// Started, session not yet established.
    Start,
    /// One connection is Established.
    Up,
    /// Tearing down; waiting for both connections to drain to Idle.
    Stop,
}

impl Display for PeerState {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let s = match self {
            PeerState::Down => "down",
            PeerState::Start => "start",
            PeerState::Up => "up",
            PeerState::Stop => "stop",
        };
        write!(f, "{s}")
    }
}

/// How far the peer's startup sequence has progressed.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
pub enum StartupState {
    /// Waiting for the object lock and a reachable neighbor.
    Prepare,
    /// Connecting with capability advertisement.
    Connect,
    /// Connecting with capability advertisement suppressed.
    ConnectNoCap,
}

/// Connection FSM states. The ordering is used when reporting status: the
/// most advanced of the two slots names the peer's state line.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
pub enum ConnState {
    Idle,
    Connect,
    Active,
    OpenSent,
    OpenConfirm,
    Established,
    Close,
}

impl ConnState {
    pub fn name(&self) -> &'static str {
        match self {
            ConnState::Idle => "Idle",
            ConnState::Connect => "Connect",
            ConnState::Active => "Active",
            ConnState::OpenSent => "OpenSent",
            ConnState::OpenConfirm => "OpenConfirm",
            ConnState::Established => "Established",
            ConnState::Close => "Close",
        }
    }
}

impl Display for ConnState {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Classes of last-error for status reporting. The discriminants match the
/// prefix table in `prefix()`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
pub enum ErrorClass {
    None,
    Misc,
    Socket,
    BgpRx,
    BgpTx,
    AutoDown,
    ManDown,
}

impl ErrorClass {
    fn prefix(&self) -> &'static str {
        match self {
            ErrorClass::None => "",
            ErrorClass::Misc => "Error: ",
            ErrorClass::Socket => "Socket: ",
            ErrorClass::BgpRx => "Received: ",
            ErrorClass::BgpTx => "BGP Error: ",
            ErrorClass::AutoDown => "Automatic shutdown: ",
            ErrorClass::ManDown => "",
        }
    }
}

/// Misc error codes.
pub const MISC_NEIGHBOR_LOST: u32 = 1;
pub const MISC_INVALID_NEXT_HOP: u32 = 2;
pub const MISC_INVALID_MD5: u32 = 3;

/// Auto-down error codes.
pub const AUTO_ROUTE_LIMIT_EXCEEDED: u32 = 1;

/// The last error retained for status reporting. For BgpRx/BgpTx the code is
/// `(notification code << 16) | subcode`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
pub struct LastError {
    pub class: ErrorClass,
    pub code: u32,
}

impl LastError {
    fn none() -> Self {
        Self {
            class: ErrorClass::None,
            code: 0,
        }
    }

    /// Render as "<class prefix><message>" for the status line.
    pub fn render(&self) -> String {
        let msg = match self.class {
            ErrorClass::None | ErrorClass::ManDown => String::new(),
            ErrorClass::Misc => match self.code {
                MISC_NEIGHBOR_LOST => "Neighbor lost".to_string(),
                MISC_INVALID_NEXT_HOP => "Invalid next hop".to_string(),
                MISC_INVALID_MD5 => "Kernel MD5 auth failed".to_string(),
                _ => String::new(),
            },
            ErrorClass::Socket => {
                if self.code == 0 {
                    "Connection closed".to_string()
                } else {
                    std::io::Error::from_raw_os_error(self.code as i32).to_string()
                }
            }
            ErrorClass::BgpRx | ErrorClass::BgpTx => {
                error_dsc((self.code >> 16) as u8, (self.code & 0xff) as u8)
            }
            ErrorClass::AutoDown => match self.code {
                AUTO_ROUTE_LIMIT_EXCEEDED => "Route limit exceeded".to_string(),
                _ => String::new(),
            },
        };
        format!("{}{}", self.class.prefix(), msg)
    }
}

/// Why a shutdown was requested; selects the Cease subcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownCause {
    Admin,
    Deconfigured,
    OtherConfigChange,
}

impl ShutdownCause {
    fn subcode(&self) -> u8 {
        match self {
            ShutdownCause::Admin => 2,
            ShutdownCause::Deconfigured => 3,
            ShutdownCause::OtherConfigChange => 6,
        }
    }
}

/// Packet types a connection can have scheduled, in transmission priority
/// order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Notification,
    Open,
    KeepAlive,
    Update,
    RouteRefresh,
}

const PACKET_PRIORITY: [PacketKind; 5] = [
    PacketKind::Notification,
    PacketKind::Open,
    PacketKind::KeepAlive,
    PacketKind::Update,
    PacketKind::RouteRefresh,
];

impl PacketKind {
    fn bit(&self) -> u8 {
        match self {
            PacketKind::Notification => 1 << 0,
            PacketKind::Open => 1 << 1,
            PacketKind::KeepAlive => 1 << 2,
            PacketKind::Update => 1 << 3,
            PacketKind::RouteRefresh => 1 << 4,
        }
    }
}

/// The packets-to-send bitmask of a connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketSet(u8);

impl PacketSet {
    pub fn set(&mut self, kind: PacketKind) {
        self.0 |= kind.bit();
    }

    pub fn clear(&mut self, kind: PacketKind) {
        self.0 &= !kind.bit();
    }

    pub fn contains(&self, kind: PacketKind) -> bool {
        self.0 & kind.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// The highest priority packet type currently scheduled.
    pub fn next(&self) -> Option<PacketKind> {
        PACKET_PRIORITY.iter().copied().find(|k| self.contains(*k))
    }
}

/// Events driving a peer's state machine. Everything that happens to a peer
/// arrives here: timer expiries, transport callbacks, the object-lock grant,
/// neighbor cache transitions, and administrative requests.
pub enum FsmEvent<Cnx: BgpConnection> {
    /// The object lock on the peer address was granted.
    LockGranted,

    /// The neighbor cache recorded a reachability transition for our next
    /// hop.
    NeighborChanged,

    /// The startup (back-off) timer ran out.
    StartupTimerExpires,

    ConnectRetryTimerExpires(ConnDirection),
    HoldTimerExpires(ConnDirection),
    KeepaliveTimerExpires(ConnDirection),

    /// A connection has packets scheduled and the transmit path is free.
    TxWake(ConnDirection),

    /// The coalescing decision event.
    Decision,

    /// The listening endpoint accepted a connection from our neighbor.
    Inbound(Cnx),

    /// Our outgoing connection attempt completed.
    ConnectionConfirmed,

    /// Transport error on a connection. `errno` zero means an orderly close.
    SocketError { dir: ConnDirection, errno: i32 },

    /// A message arrived on a connection.
    Message { dir: ConnDirection, msg: Message },

    /// The wire codec rejected incoming bytes; answer with a Notification.
    ProtocolError {
        dir: ConnDirection,
        error: crate::codec::BgpError,
    },

    /// The RIB importer reports the imported route count for this peer.
    ImportedRoutes(u64),

    /// Re-send our routes: schedule a route refresh request.
    ReloadRoutes,

    /// Administrative shutdown.
    Shutdown(ShutdownCause),

    /// Stop the event loop; the peer is being destroyed.
    Terminate,
}

impl<Cnx: BgpConnection> FsmEvent<Cnx> {
    pub fn title(&self) -> &'static str {
        match self {
            Self::LockGranted => "lock granted",
            Self::NeighborChanged => "neighbor changed",
            Self::StartupTimerExpires => "startup timer expires",
            Self::ConnectRetryTimerExpires(_) => "connect retry timer expires",
            Self::HoldTimerExpires(_) => "hold timer expires",
            Self::KeepaliveTimerExpires(_) => "keepalive timer expires",
            Self::TxWake(_) => "tx wake",
            Self::Decision => "decision",
            Self::Inbound(_) => "inbound connection",
            Self::ConnectionConfirmed => "connection confirmed",
            Self::SocketError { .. } => "socket error",
            Self::Message { .. } => "message",
            Self::ProtocolError { .. } => "protocol error",
            Self::ImportedRoutes(_) => "imported routes",
            Self::ReloadRoutes => "reload routes",
            Self::Shutdown(_) => "shutdown",
            Self::Terminate => "terminate",
        }
    }
}

/// One connection slot of a peer. Holds the transport handle, the per-slot
/// timers, the transmit wake event, the packets-to-send bitmask and the
/// parameters learned from the OPEN exchange. A slot in Idle holds no socket
/// and all its timers are stopped.
pub struct Conn<Cnx: BgpConnection> {
    pub dir: ConnDirection,
    state: Mutex<ConnState>,
    sock: Mutex<Option<Arc<Cnx>>>,
    timers: Arc<crate::clock::ConnTimers>,
    tx_wake: Event<Cnx>,
    packets: Mutex<PacketSet>,

    /// Startup-state snapshot taken when OPEN is sent.
    start_state: Mutex<StartupState>,

    want_as4: AtomicBool,
    peer_as4: AtomicBool,
    peer_refresh: AtomicBool,
    advertised_as: AtomicU32,
    remote_id: AtomicU32,
    remote_as: AtomicU32,

    /// Negotiated timer values, seconds. Zero until the OPEN exchange.
    hold_time: AtomicU32,
    keepalive_time: AtomicU32,

    notify: Mutex<Option<NotificationMessage>>,
}

impl<Cnx: BgpConnection> Conn<Cnx> {
    fn new(
        dir: ConnDirection,
        timers: Arc<crate::clock::ConnTimers>,
        event_tx: Sender<FsmEvent<Cnx>>,
    ) -> Self {
        Self {
            dir,
            state: Mutex::new(ConnState::Idle),
            sock: Mutex::new(None),
            timers,
            tx_wake: Event::new(event_tx, Box::new(move || FsmEvent::TxWake(dir))),
            packets: Mutex::new(PacketSet::default()),
            start_state: Mutex::new(StartupState::Prepare),
            want_as4: AtomicBool::new(false),
            peer_as4: AtomicBool::new(false),
            peer_refresh: AtomicBool::new(false),
            advertised_as: AtomicU32::new(0),
            remote_id: AtomicU32::new(0),
            remote_as: AtomicU32::new(0),
            hold_time: AtomicU32::new(0),
            keepalive_time: AtomicU32::new(0),
            notify: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnState {
        *lock!(self.state)
    }

    fn set_state(&self, s: ConnState) {
        *lock!(self.state) = s;
    }

    fn sock(&self) -> Option<Arc<Cnx>> {
        lock!(self.sock).clone()
    }

    pub fn packets(&self) -> PacketSet {
        *lock!(self.packets)
    }

    pub fn hold_timer_enabled(&self) -> bool {
        self.timers.hold.enabled()
    }

    pub fn keepalive_timer_enabled(&self) -> bool {
        self.timers.keepalive.enabled()
    }

    /// The Notification queued for transmission, if any.
    pub fn queued_notification(&self) -> Option<NotificationMessage> {
        lock!(self.notify).clone()
    }

    /// The AS number advertised in our OPEN on this connection.
    pub fn advertised_as(&self) -> u32 {
        self.advertised_as.load(Ordering::Relaxed)
    }

    pub fn remote_id(&self) -> u32 {
        self.remote_id.load(Ordering::Relaxed)
    }
}

/// Peer transition and message counters.
#[derive(Default)]
pub struct PeerCounters {
    pub opens_sent: AtomicU64,
    pub keepalives_sent: AtomicU64,
    pub keepalives_rcvd: AtomicU64,
    pub updates_rcvd: AtomicU64,
    pub notifications_sent: AtomicU64,
    pub notifications_rcvd: AtomicU64,
    pub session_ups: AtomicU64,
    pub session_downs: AtomicU64,
}

/// Information about a neighbor (peer).
#[derive(Debug, Clone)]
pub struct NeighborInfo {
    pub name: String,
    pub host: SocketAddr,
}

/// Which connection survives a collision, per RFC 4271 §6.8: the connection
/// initiated by the side with the numerically larger BGP identifier is kept.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CollisionResolution {
    ExistWins,
    NewWins,
}

/// Decide a collision between an existing connection (already in
/// OpenConfirm) and a new one whose OPEN just arrived. Both connections go
/// to the same peer, so the remote identifier is the same for both; what
/// differs is who initiated them.
pub fn collision_resolution(
    exist_direction: ConnDirection,
    local_id: u32,
    remote_id: u32,
) -> CollisionResolution {
    if local_id < remote_id {
        // The peer has the higher identifier: keep the connection they
        // initiated.
        match exist_direction {
            ConnDirection::Incoming => CollisionResolution::ExistWins,
            ConnDirection::Outgoing => CollisionResolution::NewWins,
        }
    } else {
        match exist_direction {
            ConnDirection::Incoming => CollisionResolution::NewWins,
            ConnDirection::Outgoing => CollisionResolution::ExistWins,
        }
    }
}

/// The next back-off value after a protocol error: start at the configured
/// minimum and double up to the configured maximum.
pub fn next_startup_delay(current: u32, cf: &PeerConfig) -> u32 {
    if current == 0 {
        u32::from(cf.error_delay_time_min)
    } else {
        (2 * current).min(u32::from(cf.error_delay_time_max))
    }
}

/// The per-peer session engine.
pub struct PeerRunner<Cnx: BgpConnection, L: BgpListener<Cnx>> {
    pub config: Mutex<PeerConfig>,
    pub neighbor: NeighborInfo,
    pub counters: Arc<PeerCounters>,

    state: Mutex<PeerState>,
    startup_state: Mutex<StartupState>,
    startup_delay: Mutex<u32>,
    last_proto_error: Mutex<Option<Instant>>,
    last_error: Mutex<LastError>,
    disabled: AtomicBool,
    opened: AtomicBool,

    session_conn: Mutex<Option<ConnDirection>>,
    conn_out: Conn<Cnx>,
    conn_in: Conn<Cnx>,

    decision: Event<Cnx>,
    clock: Clock,

    event_tx: Sender<FsmEvent<Cnx>>,
    event_rx: Mutex<Receiver<FsmEvent<Cnx>>>,

    dispatcher: Arc<Dispatcher<Cnx, L>>,
    codec: Arc<dyn SessionCodec>,
    cnx_ctx: Cnx::Ctx,
    neigh_cache: Arc<NeighborCache>,
    locks: Arc<LockManager>,
    lock_handle: Mutex<Option<ObjectLock>>,
    neigh: Mutex<Option<Neighbor>>,
    neigh_subscribed: AtomicBool,

    local_id: AtomicU32,
    rr_cluster_id: AtomicU32,
    next_hop: Mutex<Option<IpAddr>>,
    local_addr: Mutex<Option<IpAddr>>,
    local_link: Mutex<Option<Ipv6Addr>>,
    source_addr: Mutex<Option<IpAddr>>,

    notes_tx: Sender<SessionNote>,

    shutdown: AtomicBool,
    running: AtomicBool,

    pub log: Logger,
}

impl<Cnx: BgpConnection, L: BgpListener<Cnx>> PeerRunner<Cnx, L> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: PeerConfig,
        dispatcher: Arc<Dispatcher<Cnx, L>>,
        codec: Arc<dyn SessionCodec>,
        cnx_ctx: Cnx::Ctx,
        neigh_cache: Arc<NeighborCache>,
        locks: Arc<LockManager>,
        notes_tx: Sender<SessionNote>,
        jitter: Arc<dyn crate::clock::Jitter>,
        resolution: Duration,
        log: Logger,
    ) -> Arc<Self> {
        let (event_tx, event_rx) = std::sync::mpsc::channel();
        let clock = Clock::new(resolution, jitter, event_tx.clone(), log.clone());
        let neighbor = NeighborInfo {
            name: config.name.clone(),
            host: SocketAddr::new(config.remote_ip, BGP_PORT),
        };
        let conn_out = Conn::new(
            ConnDirection::Outgoing,
            clock.timers.conn(ConnDirection::Outgoing).clone(),
            event_tx.clone(),
        );
        let conn_in = Conn::new(
            ConnDirection::Incoming,
            clock.timers.conn(ConnDirection::Incoming).clone(),
            event_tx.clone(),
        );
        Arc::new(Self {
            config: Mutex::new(config),
            neighbor,
            counters: Arc::new(PeerCounters::default()),
            state: Mutex::new(PeerState::Down),
            startup_state: Mutex::new(StartupState::Prepare),
            startup_delay: Mutex::new(0),
            last_proto_error: Mutex::new(None),
            last_error: Mutex::new(LastError::none()),
            disabled: AtomicBool::new(false),
            opened: AtomicBool::new(false),
            session_conn: Mutex::new(None),
            conn_out,
            conn_in,
            decision: Event::new(event_tx.clone(), Box::new(|| FsmEvent::Decision)),
            clock,
            event_tx,
            event_rx: Mutex::new(event_rx),
            dispatcher,
            codec,
            cnx_ctx,
            neigh_cache,
            locks,
            lock_handle: Mutex::new(None),
            neigh: Mutex::new(None),
            neigh_subscribed: AtomicBool::new(false),
            local_id: AtomicU32::new(0),
            rr_cluster_id: AtomicU32::new(0),
            next_hop: Mutex::new(None),
            local_addr: Mutex::new(None),
            local_link: Mutex::new(None),
            source_addr: Mutex::new(None),
            notes_tx,
            shutdown: AtomicBool::new(false),
            running: AtomicBool::new(false),
            log,
        })
    }

    // ===== public surface ==================================================

    /// Begin the peer's startup sequence: register with the listening
    /// endpoint's address map and request the object lock on the neighbor
    /// address. Progress continues from the lock grant.
    pub fn start(self: &Arc<Self>) {
        *lock!(self.state) = PeerState::Start;
        *lock!(self.startup_state) = StartupState::Prepare;
        self.dispatcher
            .add_peer(self.neighbor.host.ip(), self.event_tx.clone());

        let key = LockKey {
            addr: self.neighbor.host.ip(),
            proto: LockProto::Tcp,
            port: BGP_PORT,
        };
        let tx = self.event_tx.clone();
        let handle = self.locks.acquire(
            key,
            Box::new(move || {
                let _ = tx.send(FsmEvent::LockGranted);
            }),
        );
        *lock!(self.lock_handle) = Some(handle);
    }

    /// Run the event loop. Call on a dedicated thread.
    pub fn run(self: &Arc<Self>) {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        peer_log!(self, debug, "peer event loop starting");
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            self.step(Duration::from_millis(100));
        }
        peer_log!(self, debug, "peer event loop done");
        // Releasing the lock handle wakes the next contender.
        *lock!(self.lock_handle) = None;
        self.dispatcher.remove_peer(self.neighbor.host.ip());
    }

    /// Process at most one pending event. Returns whether one was handled.
    /// `run` calls this in a loop; tests can call it directly to drive the
    /// engine deterministically.
    pub fn step(&self, timeout: Duration) -> bool {
        let event = {
            let rx = lock!(self.event_rx);
            match rx.recv_timeout(timeout) {
                Ok(e) => e,
                Err(RecvTimeoutError::Timeout) => return false,
                Err(RecvTimeoutError::Disconnected) => return false,
            }
        };
        if let FsmEvent::Terminate = event {
            self.shutdown.store(true, Ordering::Release);
            return true;
        }
        self.handle_event(event);
        true
    }

    /// Request an administrative shutdown. Processed on the event loop; a
    /// Notification with the cause-specific Cease subcode is transmitted
    /// before the connections drain.
    pub fn request_shutdown(&self, cause: ShutdownCause) {
        let _ = self.event_tx.send(FsmEvent::Shutdown(cause));
    }

    /// Stop the event loop and tear the peer down.
    pub fn terminate(&self) {
        self.shutdown.store(true, Ordering::Release);
        let _ = self.event_tx.send(FsmEvent::Terminate);
    }

    /// Absorb a new configuration without a session reset if it describes
    /// the same session (everything but the password matches, passwords
    /// compare equal as strings). Returns whether it did.
    pub fn reconfigure(&self, new: PeerConfig) -> bool {
        let mut cf = lock!(self.config);
        if cf.same(&new) {
            *cf = new;
            true
        } else {
            false
        }
    }

    /// Ask for a route refresh from the peer. Succeeds only when a session
    /// is up and the peer advertised refresh support.
    pub fn reload_routes(&self) -> bool {
        match *lock!(self.session_conn) {
            Some(dir) => {
                if self.conn(dir).peer_refresh.load(Ordering::Relaxed) {
                    let _ = self.event_tx.send(FsmEvent::ReloadRoutes);
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    }

    /// Event channel for the subsystems feeding this peer.
    pub fn event_sender(&self) -> Sender<FsmEvent<Cnx>> {
        self.event_tx.clone()
    }

    pub fn peer_state(&self) -> PeerState {
        *lock!(self.state)
    }

    pub fn startup_state(&self) -> StartupState {
        *lock!(self.startup_state)
    }

    pub fn startup_delay(&self) -> u32 {
        *lock!(self.startup_delay)
    }

    pub fn last_error(&self) -> LastError {
        *lock!(self.last_error)
    }

    pub fn conn(&self, dir: ConnDirection) -> &Conn<Cnx> {
        match dir {
            ConnDirection::Outgoing => &self.conn_out,
            ConnDirection::Incoming => &self.conn_in,
        }
    }

    pub fn session_conn(&self) -> Option<ConnDirection> {
        *lock!(self.session_conn)
    }

    /// The address the session actually connects to: the multihop via when
    /// configured, the neighbor address otherwise. None before the lock
    /// grant.
    pub fn next_hop(&self) -> Option<IpAddr> {
        *lock!(self.next_hop)
    }

    pub fn source_addr(&self) -> Option<IpAddr> {
        *lock!(self.source_addr)
    }

    pub fn local_addr(&self) -> Option<IpAddr> {
        *lock!(self.local_addr)
    }

    pub fn local_link(&self) -> Option<Ipv6Addr> {
        *lock!(self.local_link)
    }

    pub fn rr_cluster_id(&self) -> u32 {
        self.rr_cluster_id.load(Ordering::Relaxed)
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Relaxed)
    }

    /// The status line: the retained error when Down, otherwise the most
    /// advanced connection state followed by the retained error.
    pub fn get_status(&self) -> String {
        let err = lock!(self.last_error).render();
        if *lock!(self.state) == PeerState::Down {
            return err;
        }
        let state = self.conn_in.state().max(self.conn_out.state());
        if err.is_empty() {
            state.name().to_string()
        } else {
            format!("{} {}", state.name(), err)
        }
    }

    // ===== event dispatch ==================================================

    fn handle_event(&self, event: FsmEvent<Cnx>) {
        match event {
            FsmEvent::LockGranted => self.start_locked(),
            FsmEvent::NeighborChanged => self.neigh_notify(),
            FsmEvent::StartupTimerExpires => self.startup_timeout(),
            FsmEvent::ConnectRetryTimerExpires(dir) => self.connect_timeout(dir),
            FsmEvent::HoldTimerExpires(dir) => self.hold_timeout(dir),
            FsmEvent::KeepaliveTimerExpires(dir) => self.keepalive_timeout(dir),
            FsmEvent::TxWake(dir) => self.fire_tx(dir),
            FsmEvent::Decision => self.decide(),
            FsmEvent::Inbound(cnx) => self.incoming_connection(cnx),
            FsmEvent::ConnectionConfirmed => self.connected(),
            FsmEvent::SocketError { dir, errno } => self.sock_err(dir, errno),
            FsmEvent::Message { dir, msg } => self.rx_message(dir, msg),
            FsmEvent::ProtocolError { dir, error } => {
                self.bgp_error(dir, error.code, error.subcode, error.data)
            }
            FsmEvent::ImportedRoutes(n) => self.apply_limits(n),
            FsmEvent::ReloadRoutes => self.schedule_refresh(),
            FsmEvent::Shutdown(cause) => self.shutdown_requested(cause),
            FsmEvent::Terminate => {}
        }
    }

    // ===== startup sequence ================================================

    /// The lock callback: compute identifiers and the next hop, look the
    /// neighbor up, and either continue to the neighbor start or wait for
    /// reachability.
    fn start_locked(&self) {
        if *lock!(self.state) != PeerState::Start {
            peer_log!(self, debug, "lock granted in state {}", *lock!(self.state));
            return;
        }
        let cf = lock!(self.config).clone();

        self.local_id.store(cf.router_id, Ordering::Relaxed);
        let next_hop = match (cf.multihop > 0, cf.multihop_via) {
            (true, Some(via)) => via,
            _ => cf.remote_ip,
        };
        *lock!(self.next_hop) = Some(next_hop);

        if cf.rr_client {
            let cluster = if cf.rr_cluster_id != 0 {
                cf.rr_cluster_id
            } else {
                cf.router_id
            };
            self.rr_cluster_id.store(cluster, Ordering::Relaxed);
        }

        let neigh = match self.neigh_cache.find(next_hop, true) {
            Some(n) => n,
            None => {
                peer_log!(self, error, "invalid next hop {next_hop}");
                self.disabled.store(true, Ordering::Relaxed);
                self.store_error(None, ErrorClass::Misc, MISC_INVALID_NEXT_HOP);
                *lock!(self.state) = PeerState::Down;
                return;
            }
        };
        if !self.neigh_subscribed.swap(true, Ordering::SeqCst) {
            let tx = self.event_tx.clone();
            neigh.subscribe(Box::new(move || {
                let _ = tx.send(FsmEvent::NeighborChanged);
            }));
        }
        let reachable = neigh.iface().is_some();
        *lock!(self.neigh) = Some(neigh);

        if reachable {
            self.start_neighbor();
        } else {
            peer_log!(self, info, "waiting for {next_hop} to become my neighbor");
        }
    }

    /// The neighbor is reachable: record addresses, open shared resources,
    /// and initiate connecting.
    fn start_neighbor(&self) {
        let cf = lock!(self.config).clone();
        let iface = match lock!(self.neigh).as_ref().and_then(|n| n.iface()) {
            Some(i) => i,
            None => return,
        };
        if let Some(ref want) = cf.iface {
            if *want != iface.name {
                peer_log!(
                    self,
                    debug,
                    "configured interface {want} overrides {}",
                    iface.name
                );
            }
        }
        *lock!(self.local_addr) = Some(iface.addr);
        *lock!(self.source_addr) = Some(cf.source_addr.unwrap_or(iface.addr));
        *lock!(self.local_link) = iface.link_local;
        if self.neighbor.host.ip().is_ipv6() && iface.link_local.is_none() {
            peer_log!(
                self,
                warn,
                "missing link local address on interface {}",
                iface.name
            );
        }

        if !self.open_peer(&cf) {
            return;
        }
        self.initiate();
    }

    /// Take shared resources: a reference on the listening endpoint and,
    /// when configured, the MD5 key on the shared socket.
    fn open_peer(&self, cf: &PeerConfig) -> bool {
        self.dispatcher.acquire_ref();
        self.opened.store(true, Ordering::Relaxed);

        if let Some(ref password) = cf.password {
            if let Err(e) = self
                .dispatcher
                .set_md5_key(self.neighbor.host.ip(), Some(password))
            {
                peer_log!(self, error, "md5 auth setup failed: {e}");
                self.close_peer(false);
                self.disabled.store(true, Ordering::Relaxed);
                self.store_error(None, ErrorClass::Misc, MISC_INVALID_MD5);
                *lock!(self.state) = PeerState::Down;
                return false;
            }
        }
        true
    }

    /// Release shared resources. `apply_md5` is false when cleaning up from
    /// a failed open.
    fn close_peer(&self, apply_md5: bool) {
        if !self.opened.swap(false, Ordering::Relaxed) {
            return;
        }
        let has_password = lock!(self.config).password.is_some();
        if has_password && apply_md5 {
            if let Err(e) = self.dispatcher.set_md5_key(self.neighbor.host.ip(), None) {
                peer_log!(self, warn, "md5 key removal failed: {e}");
            }
        }
        self.dispatcher.release_ref();
    }

    /// Apply the startup delay before connecting, if one is pending.
    fn initiate(&self) {
        let delay = *lock!(self.startup_delay);
        if delay > 0 {
            peer_log!(self, info, "startup delayed by {delay} seconds");
            self.clock.timers.startup.start_secs(u64::from(delay));
        } else {
            self.startup();
        }
    }

    fn startup(&self) {
        peer_log!(self, info, "started");
        let cf = lock!(self.config).clone();
        *lock!(self.startup_state) = if cf.capabilities {
            StartupState::Connect
        } else {
            StartupState::ConnectNoCap
        };
        if !cf.passive {
            self.conn_active();
        }
    }

    fn startup_timeout(&self) {
        if *lock!(self.state) == PeerState::Start {
            self.startup();
        }
    }

    // ===== connection management ===========================================

    /// Enter the Active state on the outgoing slot: wait a beat, then
    /// connect. The delay spreads connect attempts after daemon startup.
    fn conn_active(&self) {
        let cf = lock!(self.config).clone();
        let delay = u64::from(cf.start_delay_time.max(1));
        peer_log!(self, info, "connect delayed by {delay} seconds");
        let conn = &self.conn_out;
        self.setup_conn(conn);
        conn.set_state(ConnState::Active);
        conn.timers.connect_retry.start(Duration::from_secs(delay));
    }

    /// Initiate an outgoing TCP connection and enter Connect.
    fn conn_connect(&self) {
        let cf = lock!(self.config).clone();
        let conn = &self.conn_out;
        self.setup_conn(conn);

        let source = lock!(self.source_addr).map(|ip| SocketAddr::new(ip, 0));
        let opts = SockOpts {
            source,
            ttl: if cf.multihop > 0 { cf.multihop } else { 1 },
            md5_key: cf.password.clone(),
            ..SockOpts::default()
        };
        peer_log!(
            self,
            info,
            "connecting to {} from local address {:?}",
            self.neighbor.host,
            opts.source
        );
        let cnx = Arc::new(Cnx::new_outgoing(
            self.neighbor.host,
            opts,
            self.cnx_ctx.clone(),
            self.log.clone(),
        ));
        *lock!(conn.sock) = Some(cnx.clone());
        conn.set_state(ConnState::Connect);
        cnx.connect(
            self.event_tx.clone(),
            Duration::from_secs(u64::from(cf.connect_retry_time)),
        );
        conn.timers
            .connect_retry
            .start(Duration::from_secs(u64::from(cf.connect_retry_time)));
    }

    /// Reset a slot for a fresh attempt.
    fn setup_conn(&self, conn: &Conn<Cnx>) {
        *lock!(conn.packets) = PacketSet::default();
        *lock!(conn.notify) = None;
        conn.timers.stop_all();
        conn.tx_wake.take();
        conn.want_as4.store(false, Ordering::Relaxed);
        conn.peer_as4.store(false, Ordering::Relaxed);
        conn.peer_refresh.store(false, Ordering::Relaxed);
        conn.advertised_as.store(0, Ordering::Relaxed);
        conn.remote_id.store(0, Ordering::Relaxed);
        conn.remote_as.store(0, Ordering::Relaxed);
        conn.hold_time.store(0, Ordering::Relaxed);
        conn.keepalive_time.store(0, Ordering::Relaxed);
    }

    /// The outgoing TCP handshake completed.
    fn connected(&self) {
        let conn = &self.conn_out;
        if conn.state() != ConnState::Connect {
            return;
        }
        peer_log!(self, info, "connected");
        self.send_open(conn);
    }

    /// The connect retry timer governs both Active (initial delay) and
    /// Connect (stuck handshake).
    fn connect_timeout(&self, dir: ConnDirection) {
        let conn = self.conn(dir);
        match conn.state() {
            ConnState::Connect | ConnState::Active => {
                if *lock!(self.state) == PeerState::Start {
                    self.close_conn(conn);
                    self.conn_connect();
                } else {
                    self.enter_idle(conn);
                }
            }
            _ => {}
        }
    }

    /// Advertise our OPEN on a connection and wait for the peer's.
    fn send_open(&self, conn: &Conn<Cnx>) {
        let cf = lock!(self.config).clone();
        let start_state = *lock!(self.startup_state);
        *lock!(conn.start_state) = start_state;
        conn.want_as4.store(
            cf.enable_as4 && start_state != StartupState::ConnectNoCap,
            Ordering::Relaxed,
        );
        conn.peer_as4.store(false, Ordering::Relaxed);
        conn.advertised_as.store(0, Ordering::Relaxed);

        if let Some(sock) = conn.sock() {
            sock.set_rx_hook(conn.dir, self.event_tx.clone());
        }
        conn.timers.connect_retry.stop();
        self.schedule_packet(conn, PacketKind::Open);
        conn.set_state(ConnState::OpenSent);
        conn.timers
            .hold
            .start(Duration::from_secs(u64::from(cf.initial_hold_time)));
    }

    /// An inbound connection for our neighbor address arrived on the shared
    /// listener. Accept it onto the incoming slot when the peer is in a
    /// proper state and the slot is free.
    ///
    /// Note the predicate does not consider the outgoing slot: an inbound
    /// connection is accepted even when the outgoing connection is already
    /// Established, and collision resolution decides which one survives.
    fn incoming_connection(&self, cnx: Cnx) {
        let state = *lock!(self.state);
        let acc = (state == PeerState::Start || state == PeerState::Up)
            && *lock!(self.startup_state) >= StartupState::Connect
            && lock!(self.conn_in.sock).is_none();
        peer_log!(
            self,
            info,
            "incoming connection from {} {}",
            cnx.peer(),
            if acc { "accepted" } else { "rejected" }
        );
        if !acc {
            return;
        }
        let cf = lock!(self.config).clone();
        let conn = &self.conn_in;
        self.setup_conn(conn);
        let cnx = Arc::new(cnx);
        if let Err(e) = cnx.set_ttl(if cf.multihop > 0 { cf.multihop } else { 1 }) {
            peer_log!(self, warn, "ttl setup on incoming connection failed: {e}");
        }
        *lock!(conn.sock) = Some(cnx);
        self.send_open(conn);
    }

    // ===== timers ==========================================================

    fn hold_timeout(&self, dir: ConnDirection) {
        let conn = self.conn(dir);
        match conn.state() {
            ConnState::OpenSent | ConnState::OpenConfirm | ConnState::Established => {
                // If there is something in the input queue, we are probably
                // congested and perhaps just not processed BGP packets in
                // time.
                if conn.sock().map(|s| s.rx_pending()).unwrap_or(false) {
                    conn.timers
                        .hold
                        .start(Duration::from_secs(CONGESTION_HOLD_SECS));
                } else {
                    self.bgp_error(dir, 4, 0, Vec::new());
                }
            }
            _ => {}
        }
    }

    fn keepalive_timeout(&self, dir: ConnDirection) {
        let conn = self.conn(dir);
        match conn.state() {
            ConnState::OpenConfirm | ConnState::Established => {
                self.schedule_packet(conn, PacketKind::KeepAlive);
            }
            _ => {}
        }
    }

    // ===== transmit path ===================================================

    fn schedule_packet(&self, conn: &Conn<Cnx>, kind: PacketKind) {
        lock!(conn.packets).set(kind);
        conn.tx_wake.schedule();
    }

    /// Transmit the highest priority scheduled packet type, then wake again
    /// if more remain. One packet type per wake.
    fn fire_tx(&self, dir: ConnDirection) {
        let conn = self.conn(dir);
        conn.tx_wake.take();
        if conn.state() == ConnState::Idle {
            return;
        }
        let kind = match lock!(conn.packets).next() {
            Some(k) => k,
            None => return,
        };
        lock!(conn.packets).clear(kind);

        let msg = match kind {
            PacketKind::Open => {
                let cx = self.open_context(conn);
                let open = self.codec.create_open(&cx);
                conn.advertised_as
                    .store(open.advertised_asn(), Ordering::Relaxed);
                self.counters.opens_sent.fetch_add(1, Ordering::Relaxed);
                Message::Open(open)
            }
            PacketKind::KeepAlive => {
                self.counters.keepalives_sent.fetch_add(1, Ordering::Relaxed);
                Message::KeepAlive
            }
            PacketKind::Notification => match lock!(conn.notify).clone() {
                Some(n) => {
                    self.counters
                        .notifications_sent
                        .fetch_add(1, Ordering::Relaxed);
                    Message::Notification(n)
                }
                None => return,
            },
            PacketKind::Update => match self.codec.create_update(self.neighbor.host.ip()) {
                Some(u) => Message::Update(u),
                None => {
                    if !lock!(conn.packets).is_empty() {
                        conn.tx_wake.schedule();
                    }
                    return;
                }
            },
            PacketKind::RouteRefresh => {
                Message::RouteRefresh(crate::messages::RouteRefreshMessage { afi: 1, safi: 1 })
            }
        };

        let sock = match conn.sock() {
            Some(s) => s,
            None => return,
        };
        if let Err(e) = sock.send(msg) {
            peer_log!(self, info, "connection lost ({e})");
            self.sock_err(dir, 0);
            return;
        }

        match kind {
            PacketKind::KeepAlive => {
                let ka = conn.keepalive_time.load(Ordering::Relaxed);
                conn.timers.keepalive.start(Duration::from_secs(u64::from(ka)));
            }
            PacketKind::Notification => {
                if conn.state() == ConnState::Close {
                    // The notification is flushed; the connection can go.
                    self.enter_idle(conn);
                    return;
                }
            }
            _ => {}
        }

        if !lock!(conn.packets).is_empty() {
            conn.tx_wake.schedule();
        }
    }

    fn open_context(&self, conn: &Conn<Cnx>) -> OpenContext {
        let cf = lock!(self.config).clone();
        let caps = cf.capabilities && *lock!(conn.start_state) != StartupState::ConnectNoCap;
        OpenContext {
            local_as: cf.local_as,
            remote_as: cf.remote_as,
            local_id: self.local_id.load(Ordering::Relaxed),
            hold_time: cf.hold_time,
            capabilities: caps,
            as4: conn.want_as4.load(Ordering::Relaxed),
            refresh: caps && cf.enable_refresh,
            is_internal: cf.is_internal(),
        }
    }

    // ===== receive path ====================================================

    fn rx_message(&self, dir: ConnDirection, msg: Message) {
        let conn = self.conn(dir);
        match conn.state() {
            ConnState::OpenSent => match msg {
                Message::Open(m) => self.rx_open(dir, m),
                Message::Notification(n) => self.rx_notification(dir, n),
                _ => self.bgp_error(dir, 5, 0, Vec::new()),
            },
            ConnState::OpenConfirm => match msg {
                Message::KeepAlive => {
                    self.counters.keepalives_rcvd.fetch_add(1, Ordering::Relaxed);
                    self.restart_hold(conn);
                    self.enter_established(dir);
                }
                Message::Notification(n) => self.rx_notification(dir, n),
                _ => self.bgp_error(dir, 5, 0, Vec::new()),
            },
            ConnState::Established => {
                self.restart_hold(conn);
                match msg {
                    Message::KeepAlive => {
                        self.counters.keepalives_rcvd.fetch_add(1, Ordering::Relaxed);
                    }
                    Message::Update(u) => {
                        self.counters.updates_rcvd.fetch_add(1, Ordering::Relaxed);
                        match self.codec.update_received(self.neighbor.host.ip(), &u) {
                            Ok(imported) => self.apply_limits(imported),
                            Err(e) => self.bgp_error(dir, e.code, e.subcode, e.data),
                        }
                    }
                    Message::RouteRefresh(r) => {
                        self.codec.refresh_received(self.neighbor.host.ip(), &r);
                    }
                    Message::Notification(n) => self.rx_notification(dir, n),
                    Message::Open(_) => self.bgp_error(dir, 5, 0, Vec::new()),
                }
            }
            // Late deliveries on a draining or dead connection.
            ConnState::Idle | ConnState::Connect | ConnState::Active | ConnState::Close => {}
        }
    }

    fn restart_hold(&self, conn: &Conn<Cnx>) {
        let hold = conn.hold_time.load(Ordering::Relaxed);
        conn.timers.hold.start(Duration::from_secs(u64::from(hold)));
    }

    /// A received OPEN: let the codec validate and negotiate, then arbitrate
    /// against the other slot before moving to OpenConfirm.
    fn rx_open(&self, dir: ConnDirection, msg: crate::messages::OpenMessage) {
        let conn = self.conn(dir);
        let cx = self.open_context(conn);
        let params = match self.codec.open_received(&cx, &msg) {
            Ok(p) => p,
            Err(e) => {
                self.bgp_error(dir, e.code, e.subcode, e.data);
                return;
            }
        };

        let other_dir = dir.other();
        match self.conn(other_dir).state() {
            ConnState::Established => {
                // A session already runs on the other slot; the new
                // connection loses outright.
                self.bgp_error(dir, 6, 7, Vec::new());
                return;
            }
            ConnState::OpenConfirm => {
                let local_id = self.local_id.load(Ordering::Relaxed);
                match collision_resolution(other_dir, local_id, params.remote_id) {
                    CollisionResolution::ExistWins => {
                        self.bgp_error(dir, 6, 7, Vec::new());
                        return;
                    }
                    CollisionResolution::NewWins => {
                        self.bgp_error(other_dir, 6, 7, Vec::new());
                    }
                }
            }
            _ => {}
        }

        let cf = lock!(self.config).clone();
        conn.remote_id.store(params.remote_id, Ordering::Relaxed);
        conn.remote_as.store(params.remote_as, Ordering::Relaxed);
        conn.peer_as4.store(
            conn.want_as4.load(Ordering::Relaxed) && params.as4,
            Ordering::Relaxed,
        );
        conn.peer_refresh
            .store(cf.enable_refresh && params.refresh, Ordering::Relaxed);

        let hold = params.hold_time.min(cf.hold_time);
        let keepalive = if hold == 0 {
            0
        } else if cf.keepalive_time != 0 && cf.hold_time != 0 {
            // Scale the configured keepalive by how much of our hold
            // proposal survived negotiation.
            u16::try_from(
                u32::from(cf.keepalive_time) * u32::from(hold) / u32::from(cf.hold_time),
            )
            .unwrap_or(hold / 3)
        } else {
            hold / 3
        };
        conn.hold_time.store(u32::from(hold), Ordering::Relaxed);
        conn.keepalive_time
            .store(u32::from(keepalive), Ordering::Relaxed);

        conn.set_state(ConnState::OpenConfirm);
        self.schedule_packet(conn, PacketKind::KeepAlive);
        conn.timers
            .keepalive
            .start(Duration::from_secs(u64::from(keepalive)));
        conn.timers.hold.start(Duration::from_secs(u64::from(hold)));
    }

    /// The peer told us why it is closing. Non-Cease codes feed the
    /// back-off.
    fn rx_notification(&self, dir: ConnDirection, n: NotificationMessage) {
        let conn = self.conn(dir);
        if matches!(conn.state(), ConnState::Idle | ConnState::Close) {
            return;
        }
        self.counters.notifications_rcvd.fetch_add(1, Ordering::Relaxed);
        peer_log!(
            self,
            warn,
            "received: {}",
            error_dsc(n.error_code, n.error_subcode)
        );
        self.store_error(
            Some(dir),
            ErrorClass::BgpRx,
            (u32::from(n.error_code) << 16) | u32::from(n.error_subcode),
        );
        self.enter_close(conn);
        self.enter_idle(conn);
        if n.error_code != 6 {
            self.update_startup_delay();
            self.stop(0);
        }
    }

    /// Transport error or orderly close on a connection.
    fn sock_err(&self, dir: ConnDirection, errno: i32) {
        let conn = self.conn(dir);
        if conn.state() == ConnState::Idle {
            return;
        }
        self.store_error(Some(dir), ErrorClass::Socket, errno as u32);
        if errno != 0 {
            peer_log!(self, info, "connection lost (errno {errno})");
        } else {
            peer_log!(self, info, "connection closed");
        }
        self.enter_idle(conn);
    }

    // ===== error machinery =================================================

    /// Report a protocol error on a connection: schedule a Notification with
    /// (code, subcode), close the connection, and unless the code is Cease,
    /// apply back-off and stop the peer. A no-op on a connection already in
    /// Close.
    pub fn bgp_error(&self, dir: ConnDirection, code: u8, subcode: u8, data: Vec<u8>) {
        let conn = self.conn(dir);
        if conn.state() == ConnState::Close {
            return;
        }
        peer_log!(self, warn, "error: {}", error_dsc(code, subcode));
        self.store_error(
            Some(dir),
            ErrorClass::BgpTx,
            (u32::from(code) << 16) | u32::from(subcode),
        );
        self.enter_close(conn);

        *lock!(conn.notify) = Some(NotificationMessage {
            error_code: code,
            error_subcode: subcode,
            data,
        });
        self.schedule_packet(conn, PacketKind::Notification);

        if code != 6 {
            self.update_startup_delay();
            self.stop(0);
        }
    }

    /// Decide whether an error is interesting enough to retain for status
    /// reporting: while Up, errors on connections other than the session
    /// connection are ignored, and while Stop we keep the error that caused
    /// the stop.
    fn store_error(&self, conn: Option<ConnDirection>, class: ErrorClass, code: u32) {
        let state = *lock!(self.state);
        if state == PeerState::Up {
            if let Some(dir) = conn {
                if *lock!(self.session_conn) != Some(dir) {
                    return;
                }
            }
        }
        if state == PeerState::Stop {
            return;
        }
        *lock!(self.last_error) = LastError { class, code };
    }

    /// Update the back-off used before the next connect attempt. Called on
    /// protocol errors.
    fn update_startup_delay(&self) {
        let cf = lock!(self.config).clone();
        let now = Instant::now();
        let mut delay = lock!(self.startup_delay);
        let mut last = lock!(self.last_proto_error);

        if let Some(t) = *last {
            if now.duration_since(t) >= Duration::from_secs(u64::from(cf.error_amnesia_time)) {
                *delay = 0;
            }
        }
        *last = Some(now);

        if cf.disable_after_error {
            *delay = 0;
            self.disabled.store(true, Ordering::Relaxed);
            return;
        }

        *delay = next_startup_delay(*delay, &cf);
    }

    /// The route limit guard: when the imported route count crosses the
    /// configured limit, shut the session down with Cease subcode 1.
    fn apply_limits(&self, imported: u64) {
        let cf = lock!(self.config).clone();
        if cf.route_limit == 0 || imported <= u64::from(cf.route_limit) {
            return;
        }
        peer_log!(self, warn, "route limit exceeded, shutting down");
        self.store_error(None, ErrorClass::AutoDown, AUTO_ROUTE_LIMIT_EXCEEDED);
        self.update_startup_delay();
        self.stop(1);
    }

    // ===== state transitions ===============================================

    /// Entering Close stops hold and keepalive and detaches the receive
    /// hook; the socket lingers until the queued Notification is flushed.
    fn enter_close(&self, conn: &Conn<Cnx>) {
        let os = conn.state();
        conn.set_state(ConnState::Close);
        conn.timers.hold.stop();
        conn.timers.keepalive.stop();
        if let Some(sock) = conn.sock() {
            sock.clear_rx_hook();
        }
        if os == ConnState::Established {
            self.leave_established();
        }
    }

    /// Entering Idle releases everything the connection owned and schedules
    /// the peer's decision event.
    fn enter_idle(&self, conn: &Conn<Cnx>) {
        let os = conn.state();
        if os == ConnState::Idle {
            return;
        }
        self.close_conn(conn);
        conn.set_state(ConnState::Idle);
        self.decision.schedule();
        if os == ConnState::Established {
            self.leave_established();
        }
    }

    /// Drop the slot's resources: scheduled packets, timers, the receive
    /// hook and the socket.
    fn close_conn(&self, conn: &Conn<Cnx>) {
        *lock!(conn.packets) = PacketSet::default();
        *lock!(conn.notify) = None;
        conn.timers.stop_all();
        if let Some(sock) = lock!(conn.sock).take() {
            sock.clear_rx_hook();
        }
    }

    fn enter_established(&self, dir: ConnDirection) {
        let conn = self.conn(dir);
        peer_log!(self, info, "BGP session established");
        *lock!(self.session_conn) = Some(dir);
        *lock!(self.last_error) = LastError::none();
        conn.set_state(ConnState::Established);
        *lock!(self.state) = PeerState::Up;
        self.counters.session_ups.fetch_add(1, Ordering::Relaxed);
        let _ = self.notes_tx.send(SessionNote::Up(self.summary(conn)));
    }

    fn leave_established(&self) {
        peer_log!(self, info, "BGP session closed");
        *lock!(self.session_conn) = None;
        self.counters.session_downs.fetch_add(1, Ordering::Relaxed);
        let _ = self.notes_tx.send(SessionNote::Down {
            peer: self.neighbor.host.ip(),
        });
        if *lock!(self.state) == PeerState::Up {
            self.stop(0);
        }
    }

    fn summary(&self, conn: &Conn<Cnx>) -> SessionSummary {
        SessionSummary {
            peer: self.neighbor.host.ip(),
            remote_id: conn.remote_id.load(Ordering::Relaxed),
            remote_as: conn.remote_as.load(Ordering::Relaxed),
            hold_time: conn.hold_time.load(Ordering::Relaxed) as u16,
            keepalive_time: conn.keepalive_time.load(Ordering::Relaxed) as u16,
            as4: conn.peer_as4.load(Ordering::Relaxed),
            refresh: conn.peer_refresh.load(Ordering::Relaxed),
        }
    }

    /// Close a connection politely: setup states drop straight to Idle,
    /// conversational states get a Cease notification first.
    fn graceful_close_conn(&self, dir: ConnDirection, subcode: u8) {
        let conn = self.conn(dir);
        match conn.state() {
            ConnState::Idle | ConnState::Close => {}
            ConnState::Connect | ConnState::Active => self.enter_idle(conn),
            ConnState::OpenSent | ConnState::OpenConfirm | ConnState::Established => {
                self.bgp_error(dir, 6, subcode, Vec::new())
            }
        }
    }

    /// Stop the peer: drain both connections and let the decision event
    /// take the peer down once they reach Idle.
    fn stop(&self, subcode: u8) {
        *lock!(self.state) = PeerState::Stop;
        self.graceful_close_conn(ConnDirection::Outgoing, subcode);
        self.graceful_close_conn(ConnDirection::Incoming, subcode);
        self.decision.schedule();
    }

    /// The coalescing decision event: restart the outgoing connection when
    /// the peer should be connecting, and finish a stop once both slots are
    /// Idle.
    fn decide(&self) {
        self.decision.take();
        let state = *lock!(self.state);
        let passive = lock!(self.config).passive;

        if state == PeerState::Start && self.conn_out.state() == ConnState::Idle && !passive {
            self.conn_active();
        }

        if state == PeerState::Stop
            && self.conn_out.state() == ConnState::Idle
            && self.conn_in.state() == ConnState::Idle
        {
            self.down();
        }
    }

    /// Both connections are gone: release shared resources and either stay
    /// Down (disabled) or run the start sequence again so the startup timer
    /// applies the accumulated back-off.
    fn down(&self) {
        self.close_peer(true);
        self.clock.timers.startup.stop();
        peer_log!(self, info, "down");
        *lock!(self.state) = PeerState::Down;
        if self.disabled.load(Ordering::Relaxed) || self.shutdown.load(Ordering::Acquire) {
            return;
        }
        *lock!(self.state) = PeerState::Start;
        *lock!(self.startup_state) = StartupState::Prepare;
        self.start_locked();
    }

    /// Administrative shutdown: remember the cause, clear the back-off and
    /// drain with the cause-specific Cease subcode.
    fn shutdown_requested(&self, cause: ShutdownCause) {
        peer_log!(self, info, "shutdown requested");
        self.store_error(None, ErrorClass::ManDown, 0);
        self.disabled.store(true, Ordering::Relaxed);
        *lock!(self.startup_delay) = 0;
        self.stop(cause.subcode());
    }

    /// Neighbor cache transition for our next hop.
    fn neigh_notify(&self) {
        let reachable = lock!(self.neigh)
            .as_ref()
            .and_then(|n| n.iface())
            .is_some();
        let state = *lock!(self.state);
        if reachable {
            // The opened check keeps a repeated "found" from taking a second
            // reference on the shared resources.
            if state == PeerState::Start
                && *lock!(self.startup_state) == StartupState::Prepare
                && !self.opened.load(Ordering::Relaxed)
            {
                peer_log!(self, info, "neighbor found");
                self.start_neighbor();
            }
        } else if state == PeerState::Start || state == PeerState::Up {
            peer_log!(self, info, "neighbor lost");
            self.store_error(None, ErrorClass::Misc, MISC_NEIGHBOR_LOST);
            self.stop(0);
        }
    }

    fn schedule_refresh(&self) {
        if let Some(dir) = *lock!(self.session_conn) {
            let conn = self.conn(dir);
            if conn.peer_refresh.load(Ordering::Relaxed) {
                self.schedule_packet(conn, PacketKind::RouteRefresh);
            }
        }
    }
}

impl<Cnx: BgpConnection, L: BgpListener<Cnx>> Drop for PeerRunner<Cnx, L> {
    fn drop(&mut self) {
        peer_log!(self, debug, "dropping peer runner");
    }
}
