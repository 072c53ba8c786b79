// Copyright Distributed Cache Project Authors
// SPDX-License-Identifier: Apache-2.0

//! Process-wide auto-flush scheduler.
//!
//! Every streamer configured with `auto_flush_period > 0` registers
//! itself here; a single background worker wakes whenever the earliest
//! deadline elapses and calls `try_flush` on whichever streamers are due.
//! Ordering among streamers that become due at the same time is
//! unspecified.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::debug;

/// Anything that can be asked to attempt a non-blocking flush.
pub trait AutoFlushable: Send + Sync {
    /// Attempts a non-blocking flush; a no-op if the streamer is busy or
    /// has nothing buffered.
    fn try_flush(&self);

    /// This streamer's configured auto-flush period, or `None` if it has
    /// since been closed and should be dropped from the schedule.
    fn auto_flush_period(&self) -> Option<Duration>;
}

struct Scheduled {
    deadline: Instant,
    target: Weak<dyn AutoFlushable>,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}
impl Eq for Scheduled {}
impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline.cmp(&other.deadline)
    }
}

/// Delay-ordered queue of streamers due for an auto-flush attempt, keyed
/// by `last_flush_ts + auto_flush_period`.
pub struct AutoFlushScheduler {
    heap: parking_lot::Mutex<BinaryHeap<Reverse<Scheduled>>>,
    notify: Notify,
}

impl Default for AutoFlushScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl AutoFlushScheduler {
    /// Creates an empty scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self {
            heap: parking_lot::Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
        }
    }

    /// Registers `target` to be woken at `last_flush_ts + period`.
    pub fn schedule(&self, target: Weak<dyn AutoFlushable>, last_flush_ts: Instant, period: Duration) {
        let deadline = last_flush_ts + period;
        self.heap.lock().push(Reverse(Scheduled { deadline, target }));
        self.notify.notify_one();
    }

    /// Runs the worker loop until `target` resolves, popping due
    /// streamers and calling `try_flush` on each, then rescheduling them
    /// if they are still live and configured for auto-flush.
    pub async fn run(&self, mut shutdown: tokio::sync::oneshot::Receiver<()>) {
        loop {
            let wait = {
                let heap = self.heap.lock();
                heap.peek().map(|Reverse(s)| s.deadline)
            };

            let sleep = match wait {
                Some(deadline) => {
                    let now = Instant::now();
                    if deadline <= now {
                        Duration::ZERO
                    } else {
                        deadline - now
                    }
                }
                None => Duration::from_secs(3600),
            };

            tokio::select! {
                _ = &mut shutdown => return,
                () = tokio::time::sleep(sleep) => {},
                () = self.notify.notified() => continue,
            }

            self.pop_and_fire();
        }
    }

    fn pop_and_fire(&self) {
        let now = Instant::now();
        loop {
            let due = {
                let mut heap = self.heap.lock();
                match heap.peek() {
                    Some(Reverse(s)) if s.deadline <= now => heap.pop().map(|Reverse(s)| s),
                    _ => None,
                }
            };
            let Some(scheduled) = due else { break };
            let Some(target) = scheduled.target.upgrade() else { continue };
            let Some(period) = target.auto_flush_period() else { continue };
            debug!("auto-flush firing for due streamer");
            target.try_flush();
            self.schedule(Arc::downgrade(&target), now, period);
        }
    }
}
