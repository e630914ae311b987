// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use slog::{Drain, Logger};
use std::io::Write;

pub fn init_logger() -> Logger {
    build_logger(std::io::stdout())
}

pub fn build_logger<W: Write + Send + 'static>(w: W) -> Logger {
    let drain = slog_bunyan::new(w).build().fuse();
    let drain = slog_async::Async::new(drain)
        .chan_size(0x8000)
        .build()
        .fuse();
    slog::Logger::root(drain, slog::o!())
}

#[macro_export]
macro_rules! trc {
    ($log:expr, $state:expr, $peer:expr; $($args:tt)+) => {
        slog::trace!(
            $log,
            "{}",
            format!($($args)+);
            "state" => format_args!("{:?}", $state),
            "peer" => format_args!("{}", $peer),
        )
    };
}

#[macro_export]
macro_rules! inf {
    ($log:expr, $state:expr, $peer:expr; $($args:tt)+) => {
        slog::info!(
            $log,
            "{}",
            format!($($args)+);
            "state" => format_args!("{:?}", $state),
            "peer" => format_args!("{}", $peer),
        )
    };
}

#[macro_export]
macro_rules! wrn {
    ($log:expr, $state:expr, $peer:expr; $($args:tt)+) => {
        slog::warn!(
            $log,
            "{}",
            format!($($args)+);
            "state" => format_args!("{:?}", $state),
            "peer" => format_args!("{}", $peer),
        )
    };
}

#[macro_export]
macro_rules! err {
    ($log:expr, $state:expr, $peer:expr; $($args:tt)+) => {
        slog::error!(
            $log,
            "{}",
            format!($($args)+);
            "state" => format_args!("{:?}", $state),
            "peer" => format_args!("{}", $peer),
        )
    };
}
