// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
//! Pending timers, ordered by deadline.

use crate::heap::{Heap, HeapKey};
use std::{
    fmt,
    time::{Duration, Instant},
};

/// Identifies a timer registered with an [`IoClock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerKey(HeapKey);

#[derive(Debug)]
struct Timer<T> {
    deadline: Instant,
    /// Breaks ties between timers sharing a deadline: first registered,
    /// first expired.
    sequence: u64,
    payload: T,
}

/// Stands in for deadlines too far out for [`Instant`] to represent.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

fn timer_order<T>(a: &Timer<T>, b: &Timer<T>) -> bool {
    (a.deadline, a.sequence) <= (b.deadline, b.sequence)
}

/// The set of pending timers.
///
/// Each timer carries a payload of type `T`, typically whatever must be woken
/// when it fires. Deadlines are points of the monotonic clock.
pub struct IoClock<T> {
    timers: Heap<Timer<T>>,
    sequence: u64,
}

impl<T> fmt::Debug for IoClock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoClock")
            .field("timers", &self.timers.len())
            .field("earliest_deadline", &self.earliest_deadline())
            .finish()
    }
}

impl<T> Default for IoClock<T> {
    fn default() -> Self {
        IoClock::new()
    }
}

impl<T> IoClock<T> {
    /// Creates a clock with no pending timer.
    pub fn new() -> IoClock<T> {
        IoClock {
            timers: Heap::new(timer_order),
            sequence: 0,
        }
    }

    /// Registers a timer that expires `duration` from now.
    ///
    /// A duration that overflows the clock is capped to about thirty years.
    pub fn add_timer(&mut self, payload: T, duration: Duration) -> TimerKey {
        let now = Instant::now();
        let deadline = now
            .checked_add(duration)
            .or_else(|| now.checked_add(FAR_FUTURE))
            .unwrap_or(now);
        self.add_timer_at(payload, deadline)
    }

    /// Registers a timer that expires at `deadline`.
    pub fn add_timer_at(&mut self, payload: T, deadline: Instant) -> TimerKey {
        self.sequence += 1;
        TimerKey(self.timers.add(Timer {
            deadline,
            sequence: self.sequence,
            payload,
        }))
    }

    /// Cancels a timer, handing back its payload.
    ///
    /// Returns `None` if the timer already expired or was cancelled.
    pub fn remove_timer(&mut self, key: TimerKey) -> Option<T> {
        self.timers.remove(key.0).map(|timer| timer.payload)
    }

    /// Whether `key` is still pending.
    pub fn contains(&self, key: TimerKey) -> bool {
        self.timers.contains(key.0)
    }

    /// Moves every timer whose deadline has passed into `out`, earliest
    /// first. Reported timers are no longer pending.
    pub fn get_expired_timers(&mut self, out: &mut Vec<(TimerKey, T)>) {
        self.expire_until(Instant::now(), out)
    }

    fn expire_until(&mut self, now: Instant, out: &mut Vec<(TimerKey, T)>) {
        while let Some((_, timer)) = self.timers.top() {
            if timer.deadline > now {
                break;
            }
            if let Some((key, timer)) = self.timers.remove_top() {
                out.push((TimerKey(key), timer.payload));
            }
        }
    }

    /// The deadline of the timer that expires first.
    pub fn earliest_deadline(&self) -> Option<Instant> {
        self.timers.top().map(|(_, timer)| timer.deadline)
    }

    /// How long until the earliest deadline, zero if it already passed and
    /// `None` if no timer is pending.
    pub fn timeout(&self) -> Option<Duration> {
        self.earliest_deadline()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Number of pending timers.
    pub fn len(&self) -> usize {
        self.timers.len()
    }

    /// Whether no timer is pending.
    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}
