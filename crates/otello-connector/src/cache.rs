//! Last-value caches for application affordances.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use bytes::Bytes;

/// A last-value cache consumed by device controllers.
///
/// Every application publication a controller receives is stored under the
/// `{affordance type}/{name}` key, so integrations can read the most recent
/// value of a property or event without subscribing themselves.
pub trait NodeCache: Send + Sync {
    /// Returns the cached payload for a key.
    fn get(&self, key: &str) -> Option<Bytes>;

    /// Stores a payload under a key, replacing the previous one.
    fn set(&self, key: &str, payload: Bytes);
}

/// An in-memory [`NodeCache`].
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Bytes>>,
}

impl MemoryCache {
    /// Creates an empty [`MemoryCache`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl NodeCache for MemoryCache {
    fn get(&self, key: &str) -> Option<Bytes> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, payload: Bytes) {
        let _ = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_owned(), payload);
    }
}
