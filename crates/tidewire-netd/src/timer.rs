//! Timers fired by the dispatch loop's cron tick.
//!
//! Timers are only ever touched by the dispatch loop: creating or stopping one
//! sends a message on an unbounded channel, so it is safe from handlers and
//! from inside another timer's callback. Resolution is the cron tick period.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::pcall::call_protected;

pub type TimerId = u64;

pub type TimerFn = Box<dyn FnMut() + Send>;

pub(crate) struct TimerEntry {
    id: TimerId,
    interval: Duration,
    next_fire: Instant,
    /// `None` repeats until stopped.
    remaining: Option<u64>,
    callback: TimerFn,
}

/// Receiving halves owned by the dispatch loop.
pub(crate) struct TimerChannels {
    pub(crate) created_rx: mpsc::UnboundedReceiver<TimerEntry>,
    pub(crate) closing_rx: mpsc::UnboundedReceiver<TimerId>,
}

/// Creates timers. Cheap to clone.
#[derive(Clone)]
pub struct TimerManager {
    next_id: Arc<AtomicU64>,
    created_tx: mpsc::UnboundedSender<TimerEntry>,
    closing_tx: mpsc::UnboundedSender<TimerId>,
}

impl TimerManager {
    pub(crate) fn channel() -> (Self, TimerChannels) {
        let (created_tx, created_rx) = mpsc::unbounded_channel();
        let (closing_tx, closing_rx) = mpsc::unbounded_channel();
        (
            Self {
                next_id: Arc::new(AtomicU64::new(1)),
                created_tx,
                closing_tx,
            },
            TimerChannels {
                created_rx,
                closing_rx,
            },
        )
    }

    /// Run `f` every `interval` until the returned handle is stopped.
    pub fn new_timer<F>(&self, interval: Duration, f: F) -> Timer
    where
        F: FnMut() + Send + 'static,
    {
        self.create(interval, None, Box::new(f))
    }

    /// Run `f` every `interval`, `count` times in total.
    pub fn new_count_timer<F>(&self, interval: Duration, count: u64, f: F) -> Timer
    where
        F: FnMut() + Send + 'static,
    {
        self.create(interval, Some(count), Box::new(f))
    }

    fn create(&self, interval: Duration, remaining: Option<u64>, callback: TimerFn) -> Timer {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if remaining != Some(0) {
            let entry = TimerEntry {
                id,
                interval,
                next_fire: Instant::now() + interval,
                remaining,
                callback,
            };
            if self.created_tx.send(entry).is_err() {
                debug!(timer_id = id, "Dispatch loop gone, timer dropped");
            }
        }
        Timer {
            id,
            closing_tx: self.closing_tx.clone(),
        }
    }
}

impl std::fmt::Debug for TimerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerManager")
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish()
    }
}

/// Handle to a scheduled timer. Dropping it does not stop the timer.
#[derive(Debug, Clone)]
pub struct Timer {
    id: TimerId,
    closing_tx: mpsc::UnboundedSender<TimerId>,
}

impl Timer {
    pub fn id(&self) -> TimerId {
        self.id
    }

    pub fn stop(&self) {
        let _ = self.closing_tx.send(self.id);
    }
}

#[derive(Default)]
pub(crate) struct TimerTable {
    entries: BTreeMap<TimerId, TimerEntry>,
}

impl TimerTable {
    pub(crate) fn insert(&mut self, entry: TimerEntry) {
        self.entries.insert(entry.id, entry);
    }

    pub(crate) fn remove(&mut self, id: TimerId) {
        self.entries.remove(&id);
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Fire every timer due at `now`, in id order. Returns how many fired.
    pub(crate) fn fire_due(&mut self, now: Instant) -> usize {
        let mut fired = 0;
        self.entries.retain(|id, entry| {
            if entry.next_fire > now {
                return true;
            }
            fired += 1;
            call_protected("timer", || (entry.callback)());
            entry.next_fire = now + entry.interval;
            match entry.remaining.as_mut() {
                Some(n) => {
                    *n -= 1;
                    if *n == 0 {
                        debug!(timer_id = id, "Counted timer exhausted");
                    }
                    *n > 0
                }
                None => true,
            }
        });
        fired
    }
}
