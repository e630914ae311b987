// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use rand::Rng;
use std::time::{Duration, Instant};

/// A monotonic clock for one protocol instance. All session timestamps and
/// timer deadlines are expressed as time since this clock's origin, so they
/// are plain `Duration` values that order and subtract cheaply.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    origin: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Monotonic time since the clock origin.
    pub fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// A deadline-based timer. One-shot by default; with a nonzero `recurrent`
/// interval the timer reschedules itself on every firing at
/// `deadline + recurrent + U[0, randomize]`.
///
/// Timers do not run anywhere on their own. The protocol thread's event loop
/// asks each timer whether it is due and fires it; nothing else may.
#[derive(Debug, Default)]
pub struct Timer {
    deadline: Option<Duration>,
    pub recurrent: Duration,
    pub randomize: Duration,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the timer to fire `after` from `now`.
    pub fn start(&mut self, now: Duration, after: Duration) {
        self.deadline = Some(now + after);
    }

    /// Arm the timer with an absolute deadline.
    pub fn set(&mut self, at: Duration) {
        self.deadline = Some(at);
    }

    pub fn stop(&mut self) {
        self.deadline = None;
    }

    pub fn active(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline
    }

    /// Time left until the deadline, zero if already due or inactive.
    pub fn remains(&self, now: Duration) -> Duration {
        self.deadline
            .map(|d| d.saturating_sub(now))
            .unwrap_or(Duration::ZERO)
    }

    pub fn due(&self, now: Duration) -> bool {
        matches!(self.deadline, Some(d) if d <= now)
    }

    /// Fire the timer if due. A recurrent timer reschedules relative to the
    /// old deadline; if that already passed it reschedules relative to `now`
    /// so a stalled loop does not replay a backlog of firings.
    pub fn fire(&mut self, now: Duration) -> bool {
        let Some(deadline) = self.deadline else {
            return false;
        };
        if deadline > now {
            return false;
        }
        if self.recurrent.is_zero() {
            self.deadline = None;
        } else {
            let jitter = if self.randomize.is_zero() {
                Duration::ZERO
            } else {
                let range = self.randomize.as_micros() as u64;
                Duration::from_micros(rand::thread_rng().gen_range(0..=range))
            };
            let mut next = deadline + self.recurrent + jitter;
            if next <= now {
                next = now + self.recurrent + jitter;
            }
            self.deadline = Some(next);
        }
        true
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_one_shot() {
        let mut t = Timer::new();
        assert!(!t.active());
        assert!(!t.fire(ms(100)));

        t.start(ms(0), ms(50));
        assert!(t.active());
        assert_eq!(t.remains(ms(20)), ms(30));
        assert!(!t.due(ms(49)));
        assert!(t.due(ms(50)));

        assert!(t.fire(ms(50)));
        assert!(!t.active());
        assert_eq!(t.remains(ms(60)), ms(0));
    }

    #[test]
    fn test_stop_and_set() {
        let mut t = Timer::new();
        t.set(ms(75));
        assert!(t.due(ms(80)));
        t.stop();
        assert!(!t.active());
        assert!(!t.fire(ms(80)));
    }

    #[test]
    fn test_recurrent_reschedule_bounds() {
        let mut t = Timer::new();
        t.recurrent = ms(75);
        t.randomize = ms(15);
        t.start(ms(0), ms(0));

        assert!(t.fire(ms(0)));
        let next = t.deadline().unwrap();
        assert!(next >= ms(75) && next <= ms(90), "next = {next:?}");
    }

    #[test]
    fn test_recurrent_skips_backlog() {
        let mut t = Timer::new();
        t.recurrent = ms(10);
        t.start(ms(0), ms(0));

        // Loop stalled well past several periods; next firing is anchored to
        // now, not to the missed deadlines.
        assert!(t.fire(ms(95)));
        let next = t.deadline().unwrap();
        assert!(next > ms(95) && next <= ms(105), "next = {next:?}");
    }
}
