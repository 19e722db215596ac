//! Process-wide refusal window opened when the upstream signals rate limiting.

use crate::clock::SharedClock;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

/// Body fragments that identify a rate-limit response even without a 429.
const RATE_LIMIT_MARKERS: &[&str] = &[
    "rate limit",
    "ratelimit",
    "too many requests",
    "request limit",
    "throttl",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CooldownState {
    Open,
    Closed { until: DateTime<Utc> },
}

#[derive(Debug)]
pub struct CooldownCoordinator {
    until: Mutex<Option<DateTime<Utc>>>,
    default_duration: Duration,
    clock: SharedClock,
}

impl CooldownCoordinator {
    pub fn new(default_duration: Duration, clock: SharedClock) -> Self {
        Self {
            until: Mutex::new(None),
            default_duration,
            clock,
        }
    }

    pub fn state(&self) -> CooldownState {
        let now = self.clock.now();
        match *self.until.lock() {
            Some(until) if now < until => CooldownState::Closed { until },
            _ => CooldownState::Open,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state(), CooldownState::Open)
    }

    /// Time left before calls are permitted again, or `None` while open.
    pub fn remaining(&self) -> Option<Duration> {
        match self.state() {
            CooldownState::Open => None,
            CooldownState::Closed { until } => Some(until - self.clock.now()),
        }
    }

    /// Remaining cooldown rounded up to whole seconds; zero while open.
    pub fn remaining_secs(&self) -> u64 {
        self.remaining()
            .map(|left| {
                let millis = left.num_milliseconds().max(0) as u64;
                millis.div_ceil(1000)
            })
            .unwrap_or(0)
    }

    /// Closes the gate for `retry_after` (or the default). Last write wins.
    pub fn trip(&self, retry_after: Option<Duration>) -> DateTime<Utc> {
        let window = retry_after
            .filter(|d| *d > Duration::zero())
            .unwrap_or(self.default_duration);
        let now = self.clock.now();
        let until = now.checked_add_signed(window).unwrap_or(DateTime::<Utc>::MAX_UTC);
        *self.until.lock() = Some(until);
        warn!(
            "upstream rate limited, cooling down for {}s (until {})",
            window.num_seconds(),
            until.to_rfc3339()
        );
        until
    }

    /// Clears the window early. Only used by operators and tests.
    pub fn reset(&self) {
        if self.until.lock().take().is_some() {
            info!("cooldown cleared");
        }
    }
}

/// Whether a non-success upstream response should be treated as rate limiting.
pub fn is_rate_limit_signal(status: Option<u16>, body: &str) -> bool {
    if status == Some(429) {
        return true;
    }
    let body = body.to_ascii_lowercase();
    RATE_LIMIT_MARKERS.iter().any(|marker| body.contains(marker))
}
