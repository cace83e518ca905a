//! Configuration surface.
//!
//! Deliberately small: pooling policy, topology discovery and auth live
//! above this crate. What's here is the handful of knobs the connection
//! core itself needs to answer "am I still good to use".
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use std::time::Duration;

/// Bounds on how long a single connection may live or sit idle before
/// [`Connection::is_expired`] starts reporting `true`.
///
/// The upstream design expressed "no bound" as a negative duration; here
/// it's `None`, which is the idiomatic Rust spelling of the same thing and
/// can't be misread as a typo'd negative number.
///
/// [`Connection::is_expired`]: crate::connection::Connection::is_expired
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionSettings {
    pub max_lifetime: Option<Duration>,
    pub max_idle_time: Option<Duration>,
}

impl ConnectionSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_lifetime(mut self, max_lifetime: Option<Duration>) -> Self {
        self.max_lifetime = max_lifetime;
        self
    }

    pub fn with_max_idle_time(mut self, max_idle_time: Option<Duration>) -> Self {
        self.max_idle_time = max_idle_time;
        self
    }
}
