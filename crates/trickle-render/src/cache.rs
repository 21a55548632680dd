//! Request-scoped data cache collaborator.
//!
//! Render units fetch their data through a [`DataCache`]. At bootstrap
//! the pipeline serializes everything the cache holds into the page, and
//! asks for the fetches that are still outstanding so it can keep
//! notifying the client as they resolve (see [`crate::late`]).
//!
//! [`MemoryDataCache`] is the in-process implementation: one
//! `tokio::sync::watch` channel per key carries the entry's state from
//! `Pending` to `Ready` or `Failed`.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, warn};

use trickle_core::FetchError;

use crate::page::BoxFuture;

/// An outstanding fetch observed by the late arrival tracker.
pub struct PendingFetch {
    pub key: String,
    /// Resolves to the entry's serialized snapshot.
    pub ready: BoxFuture<Result<Value, FetchError>>,
}

impl std::fmt::Debug for PendingFetch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingFetch").field("key", &self.key).finish()
    }
}

pub trait DataCache: Send + Sync {
    /// Fetches that have not resolved yet.
    fn pending_requests(&self) -> Vec<PendingFetch>;
    /// Flag every currently pending fetch as late, for reporting.
    fn mark_late_requests(&self);
    fn request_count(&self) -> usize;
    fn late_request_count(&self) -> usize;
    /// Serializable snapshot of every entry.
    fn dehydrate(&self) -> Value;
}

#[derive(Debug, Clone, PartialEq)]
enum EntryState {
    Pending,
    Ready(Value),
    Failed(String),
}

impl EntryState {
    fn snapshot(&self) -> Value {
        match self {
            EntryState::Pending => json!({ "status": "pending" }),
            EntryState::Ready(data) => json!({ "status": "ready", "data": data }),
            EntryState::Failed(error) => json!({ "status": "failed", "error": error }),
        }
    }
}

struct Entry {
    state: watch::Sender<EntryState>,
    late: bool,
}

#[derive(Clone, Default)]
pub struct MemoryDataCache {
    entries: Arc<Mutex<BTreeMap<String, Entry>>>,
}

impl MemoryDataCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register `key` as pending. Registering an existing key is a no-op.
    pub fn register(&self, key: &str) {
        let mut entries = self.lock();
        entries.entry(key.to_string()).or_insert_with(|| {
            debug!(%key, "data fetch registered");
            let (state, _) = watch::channel(EntryState::Pending);
            Entry { state, late: false }
        });
    }

    pub fn resolve(&self, key: &str, data: Value) {
        self.settle(key, EntryState::Ready(data));
    }

    pub fn fail(&self, key: &str, reason: impl Into<String>) {
        self.settle(key, EntryState::Failed(reason.into()));
    }

    fn settle(&self, key: &str, state: EntryState) {
        self.register(key);
        let entries = self.lock();
        if let Some(entry) = entries.get(key) {
            if *entry.state.borrow() != EntryState::Pending {
                warn!(%key, "data fetch settled twice, keeping first result");
                return;
            }
            entry.state.send_replace(state);
        }
    }

    /// Register `key` and resolve it from `source` on a background task.
    pub fn fetch(
        &self,
        key: &str,
        source: impl Future<Output = Result<Value, String>> + Send + 'static,
    ) {
        self.register(key);
        let cache = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            match source.await {
                Ok(data) => cache.resolve(&key, data),
                Err(reason) => cache.fail(&key, reason),
            }
        });
    }

    /// Wait for the data behind `key`.
    pub fn get(&self, key: &str) -> BoxFuture<Result<Value, FetchError>> {
        let rx = self.lock().get(key).map(|e| e.state.subscribe());
        let key = key.to_string();
        Box::pin(async move {
            let Some(rx) = rx else {
                return Err(FetchError::Failed {
                    key,
                    reason: "no such fetch".to_string(),
                });
            };
            match wait_settled(rx).await {
                Some(EntryState::Ready(data)) => Ok(data),
                Some(EntryState::Failed(reason)) => Err(FetchError::Failed { key, reason }),
                _ => Err(FetchError::Dropped(key)),
            }
        })
    }
}

async fn wait_settled(mut rx: watch::Receiver<EntryState>) -> Option<EntryState> {
    loop {
        {
            let state = rx.borrow_and_update();
            if *state != EntryState::Pending {
                return Some(state.clone());
            }
        }
        if rx.changed().await.is_err() {
            return None;
        }
    }
}

impl DataCache for MemoryDataCache {
    fn pending_requests(&self) -> Vec<PendingFetch> {
        self.lock()
            .iter()
            .filter(|(_, entry)| *entry.state.borrow() == EntryState::Pending)
            .map(|(key, entry)| {
                let rx = entry.state.subscribe();
                let key = key.clone();
                let fetch_key = key.clone();
                PendingFetch {
                    key,
                    ready: Box::pin(async move {
                        match wait_settled(rx).await {
                            Some(state @ EntryState::Ready(_)) => Ok(state.snapshot()),
                            Some(EntryState::Failed(reason)) => Err(FetchError::Failed {
                                key: fetch_key,
                                reason,
                            }),
                            _ => Err(FetchError::Dropped(fetch_key)),
                        }
                    }),
                }
            })
            .collect()
    }

    fn mark_late_requests(&self) {
        for entry in self.lock().values_mut() {
            if *entry.state.borrow() == EntryState::Pending {
                entry.late = true;
            }
        }
    }

    fn request_count(&self) -> usize {
        self.lock().len()
    }

    fn late_request_count(&self) -> usize {
        self.lock().values().filter(|e| e.late).count()
    }

    fn dehydrate(&self) -> Value {
        let entries = self.lock();
        let map: serde_json::Map<String, Value> = entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.state.borrow().snapshot()))
            .collect();
        Value::Object(map)
    }
}
