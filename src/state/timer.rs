use std::time::Duration;

use tokio::time::Instant;

use crate::state::game::CountdownState;

/// Pure countdown computed from a monotonic start instant.
///
/// The remaining time is always derived from `started_at`, never decremented
/// tick by tick, so it cannot drift.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Countdown {
    duration: Duration,
    started_at: Option<Instant>,
    /// Remaining time while stopped.
    frozen: Duration,
    /// Bumped on every start; tick tasks stamped with an older epoch stand down.
    epoch: u64,
}

impl Countdown {
    /// Rebuild a stopped countdown from persisted fields.
    pub fn stopped(remaining: Duration) -> Self {
        Self {
            duration: remaining,
            started_at: None,
            frozen: remaining,
            epoch: 0,
        }
    }

    /// Start (or restart) a countdown of `seconds` at `now`.
    pub fn start(&mut self, now: Instant, seconds: u64) {
        self.duration = Duration::from_secs(seconds);
        self.frozen = self.duration;
        self.started_at = Some(now);
        self.epoch += 1;
    }

    /// Run a stopped countdown again from what it had left.
    ///
    /// Returns `false` when there is nothing left to run.
    pub fn resume(&mut self, now: Instant) -> bool {
        if self.is_running() || self.frozen.is_zero() {
            return false;
        }
        self.duration = self.frozen;
        self.started_at = Some(now);
        self.epoch += 1;
        true
    }

    /// Freeze the countdown at whatever is left at `now`.
    pub fn stop(&mut self, now: Instant) {
        self.frozen = self.remaining(now);
        self.started_at = None;
    }

    /// Back to zero, stopped.
    pub fn reset(&mut self) {
        *self = Self {
            epoch: self.epoch,
            ..Self::default()
        };
    }

    /// Swap in a stopped countdown, keeping the epoch.
    pub fn set_stopped(&mut self, remaining: Duration) {
        *self = Self {
            epoch: self.epoch,
            ..Self::stopped(remaining)
        };
    }

    /// Start counter identifying the current run.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Whether the countdown is ticking.
    pub fn is_running(&self) -> bool {
        self.started_at.is_some()
    }

    /// Time left at `now`, saturating at zero.
    pub fn remaining(&self, now: Instant) -> Duration {
        match self.started_at {
            Some(started_at) => self
                .duration
                .saturating_sub(now.saturating_duration_since(started_at)),
            None => self.frozen,
        }
    }

    /// Whether a running countdown reached zero.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.is_running() && self.remaining(now).is_zero()
    }

    /// Projection mirrored into the game state.
    pub fn state(&self, now: Instant) -> CountdownState {
        CountdownState {
            remaining_ms: millis(self.remaining(now)),
            running: self.is_running(),
        }
    }
}

/// Client-side interpolation between two `timer:tick` broadcasts.
///
/// Every tick overwrites the local value; between ticks the display counts
/// down on its own.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalCountdown {
    anchor: Option<(Instant, CountdownState)>,
}

impl LocalCountdown {
    /// Overwrite the local value with an authoritative one.
    pub fn sync(&mut self, now: Instant, state: CountdownState) {
        self.anchor = Some((now, state));
    }

    /// Interpolated remaining milliseconds at `now`.
    pub fn remaining_ms(&self, now: Instant) -> u64 {
        match self.anchor {
            Some((at, state)) if state.running => {
                let elapsed = millis(now.saturating_duration_since(at));
                state.remaining_ms.saturating_sub(elapsed)
            }
            Some((_, state)) => state.remaining_ms,
            None => 0,
        }
    }

    /// Whether the last authoritative value said the countdown was running.
    pub fn is_running(&self) -> bool {
        self.anchor.is_some_and(|(_, state)| state.running)
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
