//! Scheduled events with one-second granularity
//!
//! Timers carry a [`TimerEvent`] payload that the run loop routes to
//! the owning subsystem. A payload referring to state that has since
//! been freed (for example a DNS request id whose reply already
//! arrived) is validated by the consumer and ignored.

use std::collections::{BTreeMap, HashMap};

/// Opaque timer handle, usable with [`TimerManager::cancel`]
pub type TimerId = u64;

/// What to do when a timer fires
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerEvent {
    /// An in-flight DNS request has been waiting too long
    DnsRequestTimeout(u16),
    /// Sweep expired entries out of the DNS cache
    DnsCachePrune,
    /// A module-scheduled event, routed by name
    Module(String),
}

#[derive(Debug)]
struct Entry {
    fires_at: u64,
    interval: u64,
    repeating: bool,
    event: TimerEvent,
}

/// Monotonic timer queue.
///
/// Timers due at the same tick fire in insertion order. If several
/// ticks elapse between calls (a stall), each repeating timer fires
/// once per elapsed period rather than compressing the misses.
#[derive(Default)]
pub struct TimerManager {
    queue: BTreeMap<(u64, TimerId), Entry>,
    index: HashMap<TimerId, (u64, TimerId)>,
    next_id: TimerId,
}

impl TimerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `event` to fire `interval` seconds after `now`.
    /// Intervals below one second are rounded up to the tick size.
    pub fn add(&mut self, now: u64, interval: u64, repeating: bool, event: TimerEvent) -> TimerId {
        let interval = interval.max(1);
        let id = self.next_id;
        self.next_id += 1;
        let key = (now + interval, id);
        self.queue.insert(
            key,
            Entry {
                fires_at: now + interval,
                interval,
                repeating,
                event,
            },
        );
        self.index.insert(id, key);
        id
    }

    /// Cancel a timer. Idempotent; cancelling an already-fired or
    /// unknown id is a no-op.
    pub fn cancel(&mut self, id: TimerId) {
        if let Some(key) = self.index.remove(&id) {
            self.queue.remove(&key);
        }
    }

    /// Number of armed timers
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drain every timer due at or before `now`, in firing order.
    /// Repeating timers are re-armed one interval ahead and fire again
    /// within the same drain if still due.
    pub fn tick(&mut self, now: u64) -> Vec<(TimerId, TimerEvent)> {
        let mut fired = Vec::new();
        loop {
            let key = match self.queue.keys().next() {
                Some(&key) if key.0 <= now => key,
                _ => break,
            };
            let entry = match self.queue.remove(&key) {
                Some(entry) => entry,
                None => break,
            };
            let (_, id) = key;
            self.index.remove(&id);
            fired.push((id, entry.event.clone()));
            if entry.repeating {
                let next_key = (entry.fires_at + entry.interval, id);
                self.queue.insert(
                    next_key,
                    Entry {
                        fires_at: entry.fires_at + entry.interval,
                        ..entry
                    },
                );
                self.index.insert(id, next_key);
            }
        }
        fired
    }
}
