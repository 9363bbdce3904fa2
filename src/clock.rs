// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::connection::{BgpConnection, ConnDirection};
use crate::lock;
use crate::session::FsmEvent;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use slog::{error, Logger};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread::{sleep, spawn, JoinHandle};
use std::time::Duration;

/// Source of the randomized reduction applied when a timer is armed.
/// Pluggable so tests can pin timers to either bound.
pub trait Jitter: Send + Sync {
    fn reduce(&self, nominal: Duration) -> Duration;
}

/// The randomization procedure specified in RFC 1771 §9.2.3.3: the actual
/// interval is the nominal value minus a uniform random amount of up to a
/// quarter of it.
pub struct RandomReduction {
    rng: Mutex<StdRng>,
}

impl RandomReduction {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Default for RandomReduction {
    fn default() -> Self {
        Self::new()
    }
}

impl Jitter for RandomReduction {
    fn reduce(&self, nominal: Duration) -> Duration {
        let quarter = nominal / 4;
        if quarter.is_zero() {
            return nominal;
        }
        let cut = lock!(self.rng).gen_range(Duration::ZERO..=quarter);
        nominal - cut
    }
}

/// No reduction at all. Timers fire at exactly the nominal value.
pub struct NoReduction;

impl Jitter for NoReduction {
    fn reduce(&self, nominal: Duration) -> Duration {
        nominal
    }
}

/// Always the maximum reduction, i.e. three quarters of the nominal value.
pub struct MaxReduction;

impl Jitter for MaxReduction {
    fn reduce(&self, nominal: Duration) -> Duration {
        nominal - nominal / 4
    }
}

struct TimerState {
    enabled: bool,
    interval: Duration,
    remaining: Duration,
}

/// A one-shot timer stepped by the peer's clock thread. Arming applies the
/// jitter reduction; expiry disables the timer and posts one event. Handlers
/// re-arm where the state machine calls for it.
pub struct Timer {
    jitter: Arc<dyn Jitter>,
    state: Mutex<TimerState>,
}

impl Timer {
    fn new(jitter: Arc<dyn Jitter>) -> Self {
        Self {
            jitter,
            state: Mutex::new(TimerState {
                enabled: false,
                interval: Duration::ZERO,
                remaining: Duration::ZERO,
            }),
        }
    }

    /// Arm the timer with a nominal interval. Zero stops the timer.
    pub fn start(&self, nominal: Duration) {
        if nominal.is_zero() {
            self.stop();
            return;
        }
        let actual = self.jitter.reduce(nominal);
        let mut state = lock!(self.state);
        state.interval = actual;
        state.remaining = actual;
        state.enabled = true;
    }

    /// Convenience for second-granular configuration values.
    pub fn start_secs(&self, seconds: u64) {
        self.start(Duration::from_secs(seconds));
    }

    pub fn stop(&self) {
        lock!(self.state).enabled = false;
    }

    pub fn enabled(&self) -> bool {
        lock!(self.state).enabled
    }

    /// The jittered interval the timer was last armed with. None when the
    /// timer is stopped.
    pub fn armed_interval(&self) -> Option<Duration> {
        let state = lock!(self.state);
        state.enabled.then_some(state.interval)
    }

    /// Advance by one clock resolution. Returns true exactly once per armed
    /// interval, at the tick the timer runs out.
    fn tick(&self, resolution: Duration) -> bool {
        let mut state = lock!(self.state);
        if !state.enabled {
            return false;
        }
        state.remaining = state.remaining.saturating_sub(resolution);
        if state.remaining.is_zero() {
            state.enabled = false;
            return true;
        }
        false
    }
}

/// The three timers every connection slot runs.
pub struct ConnTimers {
    pub connect_retry: Timer,
    pub hold: Timer,
    pub keepalive: Timer,
}

impl ConnTimers {
    fn new(jitter: &Arc<dyn Jitter>) -> Self {
        Self {
            connect_retry: Timer::new(jitter.clone()),
            hold: Timer::new(jitter.clone()),
            keepalive: Timer::new(jitter.clone()),
        }
    }

    pub fn stop_all(&self) {
        self.connect_retry.stop();
        self.hold.stop();
        self.keepalive.stop();
    }
}

/// All the timers a peer owns: its startup timer plus one timer set per
/// connection slot. The slot sets are shared with the connection objects.
pub struct ClockTimers {
    pub startup: Timer,
    pub outgoing: Arc<ConnTimers>,
    pub incoming: Arc<ConnTimers>,
}

impl ClockTimers {
    pub fn conn(&self, dir: ConnDirection) -> &Arc<ConnTimers> {
        match dir {
            ConnDirection::Outgoing => &self.outgoing,
            ConnDirection::Incoming => &self.incoming,
        }
    }
}

/// Steps a peer's timers at a fixed resolution on a dedicated thread,
/// posting expiries into the peer's event channel.
pub struct Clock {
    pub resolution: Duration,
    pub timers: Arc<ClockTimers>,
    #[allow(dead_code)]
    join_handle: Arc<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl Clock {
    pub fn new<Cnx: BgpConnection + 'static>(
        resolution: Duration,
        jitter: Arc<dyn Jitter>,
        event_tx: Sender<FsmEvent<Cnx>>,
        log: Logger,
    ) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let timers = Arc::new(ClockTimers {
            startup: Timer::new(jitter.clone()),
            outgoing: Arc::new(ConnTimers::new(&jitter)),
            incoming: Arc::new(ConnTimers::new(&jitter)),
        });
        let join_handle = Arc::new(Self::run(
            resolution,
            timers.clone(),
            event_tx,
            shutdown.clone(),
            log,
        ));
        Self {
            resolution,
            timers,
            join_handle,
            shutdown,
        }
    }

    fn run<Cnx: BgpConnection + 'static>(
        resolution: Duration,
        timers: Arc<ClockTimers>,
        event_tx: Sender<FsmEvent<Cnx>>,
        shutdown: Arc<AtomicBool>,
        log: Logger,
    ) -> JoinHandle<()> {
        spawn(move || loop {
            if shutdown.load(Ordering::Relaxed) {
                return;
            }
            Self::step_all(resolution, &timers, &event_tx, &log);
            sleep(resolution);
        })
    }

    fn step_all<Cnx: BgpConnection>(
        resolution: Duration,
        timers: &ClockTimers,
        event_tx: &Sender<FsmEvent<Cnx>>,
        log: &Logger,
    ) {
        let mut expired = Vec::new();
        if timers.startup.tick(resolution) {
            expired.push(FsmEvent::StartupTimerExpires);
        }
        for dir in [ConnDirection::Outgoing, ConnDirection::Incoming] {
            let t = timers.conn(dir);
            if t.connect_retry.tick(resolution) {
                expired.push(FsmEvent::ConnectRetryTimerExpires(dir));
            }
            if t.hold.tick(resolution) {
                expired.push(FsmEvent::HoldTimerExpires(dir));
            }
            if t.keepalive.tick(resolution) {
                expired.push(FsmEvent::KeepaliveTimerExpires(dir));
            }
        }
        for event in expired {
            if let Err(e) = event_tx.send(event) {
                error!(log, "send timer event: {e}");
            }
        }
    }
}

impl Drop for Clock {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}
