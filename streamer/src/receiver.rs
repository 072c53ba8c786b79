// Copyright Distributed Cache Project Authors
// SPDX-License-Identifier: Apache-2.0

//! Built-in server-side [`Receiver`] strategies.
//!
//! These are reference implementations over a trait-erased key/value
//! store so the crate's own tests can exercise end-to-end scenarios
//! without an embedder. A production embedder almost always supplies its
//! own [`Receiver`] wired to the real store instead.

use crate::collaborators::Receiver;
use crate::entry::Entry;
use crate::error::StreamerError;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;

/// Minimal trait-erased store a built-in receiver applies entries to.
/// Distinct from [`crate::collaborators::AffinityResolver`]/[`crate::collaborators::Discovery`]:
/// this is the data plane the receiver writes into, not the control plane
/// the streamer routes against.
pub trait KeyValueStore: Send + Sync {
    /// `true` if `cache` already holds a value for `key`.
    fn contains_key(&self, cache: &str, key: &[u8]) -> bool;

    /// Writes `value` for `key`, or removes the key if `value` is `None`.
    fn put(&self, cache: &str, key: Bytes, value: Option<Bytes>);
}

/// In-memory [`KeyValueStore`] used by this crate's own tests.
#[derive(Default)]
pub struct InMemoryStore {
    caches: parking_lot::Mutex<HashMap<String, HashMap<Bytes, Bytes>>>,
}

impl InMemoryStore {
    /// Builds an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of `cache`'s contents, for test assertions.
    #[must_use]
    pub fn snapshot(&self, cache: &str) -> HashMap<Bytes, Bytes> {
        self.caches.lock().get(cache).cloned().unwrap_or_default()
    }
}

impl KeyValueStore for InMemoryStore {
    fn contains_key(&self, cache: &str, key: &[u8]) -> bool {
        self.caches
            .lock()
            .get(cache)
            .is_some_and(|entries| entries.contains_key(key))
    }

    fn put(&self, cache: &str, key: Bytes, value: Option<Bytes>) {
        let mut caches = self.caches.lock();
        let entries = caches.entry(cache.to_string()).or_default();
        match value {
            Some(value) => {
                let _ = entries.insert(key, value);
            }
            None => {
                let _ = entries.remove(&key);
            }
        }
    }
}

/// Writes each entry's initial value only; keys already present in the
/// target cache are left untouched. Selected when `allow_overwrite` is
/// `false`, since backups receive the same batch as the primary and must
/// not clobber a value the primary already applied.
pub struct IsolatedReceiver {
    store: Arc<dyn KeyValueStore>,
}

impl IsolatedReceiver {
    /// Builds an isolated receiver over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Receiver for IsolatedReceiver {
    async fn receive(&self, cache: &str, entries: &[Entry]) -> Result<(), StreamerError> {
        for entry in entries {
            if self.store.contains_key(cache, &entry.key) {
                continue;
            }
            self.store.put(cache, entry.key.clone(), entry.value.clone());
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "isolated"
    }
}

/// Full put semantics: every entry overwrites whatever is currently
/// stored for its key. Selected when `allow_overwrite` is `true`, since
/// only the primary receives the batch.
pub struct IndividualReceiver {
    store: Arc<dyn KeyValueStore>,
}

impl IndividualReceiver {
    /// Builds an individual receiver over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Receiver for IndividualReceiver {
    async fn receive(&self, cache: &str, entries: &[Entry]) -> Result<(), StreamerError> {
        for entry in entries {
            self.store.put(cache, entry.key.clone(), entry.value.clone());
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "individual"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn isolated_receiver_skips_already_present_keys() {
        let store = Arc::new(InMemoryStore::new());
        store.put("c", Bytes::from_static(b"k"), Some(Bytes::from_static(b"first")));
        let receiver = IsolatedReceiver::new(store.clone());
        let entries = vec![Entry::new(Bytes::from_static(b"k"), Some(Bytes::from_static(b"second")))];
        receiver.receive("c", &entries).await.unwrap();
        assert_eq!(store.snapshot("c").get(&Bytes::from_static(b"k")).unwrap(), &Bytes::from_static(b"first"));
    }

    #[tokio::test]
    async fn individual_receiver_overwrites() {
        let store = Arc::new(InMemoryStore::new());
        store.put("c", Bytes::from_static(b"k"), Some(Bytes::from_static(b"first")));
        let receiver = IndividualReceiver::new(store.clone());
        let entries = vec![Entry::new(Bytes::from_static(b"k"), Some(Bytes::from_static(b"second")))];
        receiver.receive("c", &entries).await.unwrap();
        assert_eq!(store.snapshot("c").get(&Bytes::from_static(b"k")).unwrap(), &Bytes::from_static(b"second"));
    }

    #[tokio::test]
    async fn individual_receiver_removes_on_none_value() {
        let store = Arc::new(InMemoryStore::new());
        store.put("c", Bytes::from_static(b"k"), Some(Bytes::from_static(b"first")));
        let receiver = IndividualReceiver::new(store.clone());
        let entries = vec![Entry::new(Bytes::from_static(b"k"), None::<Bytes>)];
        receiver.receive("c", &entries).await.unwrap();
        assert!(store.snapshot("c").get(&Bytes::from_static(b"k")).is_none());
    }
}
