// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use slog::{Drain, Logger};

/// Root logger for the engine: bunyan-style JSON on stderr, behind an async
/// drain so peer event loops never block on a slow log consumer. The channel
/// is sized for the burst a busy peer produces around session setup and
/// teardown; overflow drops records rather than stalling the FSM.
pub fn init_logger() -> Logger {
    let drain = slog_bunyan::new(std::io::stderr()).build().fuse();
    let drain = slog_async::Async::new(drain)
        .chan_size(4096)
        .overflow_strategy(slog_async::OverflowStrategy::DropAndReport)
        .build()
        .fuse();
    slog::Logger::root(drain, slog::o!("system" => "bgp-session"))
}

/// Log in the context of a peer. The first argument must have a `log` field
/// holding a `Logger` and a `neighbor` field with a `host` address.
#[macro_export]
macro_rules! peer_log {
    ($self:ident, $level:ident, $($args:tt)+) => {
        slog::$level!($self.log, $($args)+;
            "unit" => "peer",
            "peer" => $self.neighbor.host.to_string()
        )
    };
}
