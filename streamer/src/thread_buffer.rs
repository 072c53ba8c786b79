// Copyright Distributed Cache Project Authors
// SPDX-License-Identifier: Apache-2.0

//! Producer-thread-local accumulator that amortizes per-call overhead
//! before entries reach the [`crate::router::Router`].

use crate::entry::Entry;
use crate::future::{Completer, CompletionFuture, new_completion};
use parking_lot::Mutex;

/// A captured batch handed off by a [`ThreadBuffer`] once it crosses
/// `per_thread_buffer_size` or is force-flushed.
pub struct ThreadHandoff {
    /// Entries captured at hand-off time, in submission order.
    pub entries: Vec<Entry>,
    /// The future callers were given for this batch, needed again here so
    /// a forced flush can wait on it.
    pub future: CompletionFuture,
    /// Resolves `future`.
    pub completer: Completer,
}

struct ThreadState {
    entries: Vec<Entry>,
    current_future: Option<CompletionFuture>,
    current_completer: Option<Completer>,
}

impl ThreadState {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            current_future: None,
            current_completer: None,
        }
    }

    fn ensure_future(&mut self) -> CompletionFuture {
        if self.current_future.is_none() {
            let (completer, fut) = new_completion();
            self.current_completer = Some(completer);
            self.current_future = Some(fut);
        }
        self.current_future.clone().expect("just ensured")
    }

    fn rotate(&mut self) -> Option<ThreadHandoff> {
        if self.entries.is_empty() {
            return None;
        }
        let entries = std::mem::take(&mut self.entries);
        let future = self.current_future.take();
        let completer = self.current_completer.take();
        match (future, completer) {
            (Some(future), Some(completer)) => Some(ThreadHandoff { entries, future, completer }),
            _ => None,
        }
    }
}

/// Accumulator for one producer thread. Only the owning thread mutates
/// this through [`ThreadBuffer::append`] during normal operation; a
/// write-locked `flush`/`close` observes it via [`ThreadBuffer::force_handoff`].
pub struct ThreadBuffer {
    thread_id: std::thread::ThreadId,
    state: Mutex<ThreadState>,
}

impl ThreadBuffer {
    /// Creates an empty buffer for `thread_id`.
    #[must_use]
    pub fn new(thread_id: std::thread::ThreadId) -> Self {
        Self {
            thread_id,
            state: Mutex::new(ThreadState::new()),
        }
    }

    /// The producer thread this buffer belongs to.
    #[must_use]
    pub fn thread_id(&self) -> std::thread::ThreadId {
        self.thread_id
    }

    /// Appends `entry`. Returns the future covering the
    /// currently-buffered batch (every caller before the next hand-off
    /// shares the same future) and, if the append crossed
    /// `per_thread_buffer_size`, the captured hand-off to route.
    pub fn append(&self, entry: Entry, per_thread_buffer_size: usize) -> (CompletionFuture, Option<ThreadHandoff>) {
        let mut state = self.state.lock();
        let future = state.ensure_future();
        state.entries.push(entry);
        let handoff = if state.entries.len() >= per_thread_buffer_size {
            state.rotate()
        } else {
            None
        };
        (future, handoff)
    }

    /// Force-captures whatever is buffered, regardless of size. Returns
    /// `None` if the buffer is empty.
    pub fn force_handoff(&self) -> Option<ThreadHandoff> {
        self.state.lock().rotate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_handoff_below_threshold() {
        let buf = ThreadBuffer::new(std::thread::current().id());
        let (_f1, h1) = buf.append(Entry::new(bytes::Bytes::from_static(b"a"), None), 3);
        assert!(h1.is_none());
        let (_f2, h2) = buf.append(Entry::new(bytes::Bytes::from_static(b"b"), None), 3);
        assert!(h2.is_none());
    }

    #[test]
    fn handoff_at_threshold_clears_buffer() {
        let buf = ThreadBuffer::new(std::thread::current().id());
        let (_f1, h1) = buf.append(Entry::new(bytes::Bytes::from_static(b"a"), None), 2);
        assert!(h1.is_none());
        let (_f2, h2) = buf.append(Entry::new(bytes::Bytes::from_static(b"b"), None), 2);
        let handoff = h2.expect("threshold crossed");
        assert_eq!(handoff.entries.len(), 2);
        assert!(buf.force_handoff().is_none());
    }

    #[tokio::test]
    async fn handoff_completer_resolves_both_callers_futures() {
        let buf = ThreadBuffer::new(std::thread::current().id());
        let (f1, _) = buf.append(Entry::new(bytes::Bytes::from_static(b"a"), None), 2);
        let (f2, h2) = buf.append(Entry::new(bytes::Bytes::from_static(b"b"), None), 2);
        let handoff = h2.expect("threshold crossed");
        handoff.completer.complete(Ok(()));
        assert!(f1.await.is_ok());
        assert!(f2.await.is_ok());
    }
}
