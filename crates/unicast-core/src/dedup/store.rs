//! Request store: remembers in-flight and completed correlation ids.

use super::cleaner::{Cleaner, CleanerStep};
use crate::config::DispatchConfig;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::debug;

/// Outcome stored for a finished call: the result or the error text.
pub type Completion = std::result::Result<Value, String>;

type Signal = Arc<watch::Sender<Option<Completion>>>;

/// Per-id record. The watch value doubles as the result placeholder.
#[derive(Debug)]
struct DedupEntry {
    signal: Signal,
}

#[derive(Debug)]
struct StoreInner {
    entries: HashMap<String, DedupEntry>,
    /// Insertion order, oldest first.
    order: VecDeque<String>,
    cleaner: Cleaner,
}

impl StoreInner {
    fn evict_oldest(&mut self, count: usize) -> usize {
        let count = count.min(self.order.len());
        for id in self.order.drain(..count) {
            self.entries.remove(&id);
        }
        count
    }
}

/// Result of registering an id.
#[derive(Debug)]
pub enum Registration {
    /// The id was new; the holder is the only one allowed to complete it.
    First(CompletionHandle),
    /// The id was already registered.
    Duplicate(CompletionWaiter),
}

/// Write side of an entry's completion signal.
///
/// Dropping the handle without calling [`complete`](Self::complete) marks the
/// call as abandoned so duplicate waiters are still released.
#[derive(Debug)]
pub struct CompletionHandle {
    signal: Signal,
    completed: bool,
}

impl CompletionHandle {
    /// Store the outcome and wake every waiter.
    pub fn complete(mut self, outcome: Completion) {
        self.signal.send_replace(Some(outcome));
        self.completed = true;
    }
}

impl Drop for CompletionHandle {
    fn drop(&mut self) {
        if !self.completed {
            self.signal
                .send_replace(Some(Err("Call abandoned before completion".to_string())));
        }
    }
}

/// Read side of an entry's completion signal.
#[derive(Debug)]
pub struct CompletionWaiter {
    rx: watch::Receiver<Option<Completion>>,
}

impl CompletionWaiter {
    /// Whether the original call has already finished.
    pub fn is_complete(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// Wait for the original call to finish and return its outcome.
    ///
    /// Returns `None` if the entry was evicted and its writer dropped without
    /// ever completing.
    pub async fn wait(mut self) -> Option<Completion> {
        let outcome = match self.rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        outcome
    }
}

/// Dedup cache shared by every request dispatched on a server.
///
/// Registration is a single critical section, so two concurrent calls with the
/// same id always see a consistent first and duplicate.
#[derive(Debug)]
pub struct RequestStore {
    inner: Mutex<StoreInner>,
}

impl RequestStore {
    /// Create a store whose entries live for roughly `clear_timeout`.
    pub fn new(clear_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                entries: HashMap::new(),
                order: VecDeque::new(),
                cleaner: Cleaner::new(clear_timeout),
            }),
        }
    }

    pub fn from_config(config: &DispatchConfig) -> Self {
        Self::new(config.clear_timeout)
    }

    /// Advance the eviction cycle; returns how many entries were evicted.
    pub async fn try_clear(&self) -> usize {
        let mut inner = self.inner.lock().await;
        let len = inner.order.len();
        match inner.cleaner.tick(len) {
            CleanerStep::Evict(count) => {
                let evicted = inner.evict_oldest(count);
                if evicted > 0 {
                    debug!("Evicted {} request ids ({} remain)", evicted, inner.order.len());
                }
                evicted
            }
            _ => 0,
        }
    }

    /// Check for an entry and create it if absent, in one step.
    pub async fn register(&self, id: &str) -> Registration {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.entries.get(id) {
            return Registration::Duplicate(CompletionWaiter {
                rx: entry.signal.subscribe(),
            });
        }

        let (tx, _rx) = watch::channel(None);
        let signal = Arc::new(tx);
        inner.entries.insert(
            id.to_string(),
            DedupEntry {
                signal: signal.clone(),
            },
        );
        inner.order.push_back(id.to_string());

        Registration::First(CompletionHandle {
            signal,
            completed: false,
        })
    }

    /// Whether an id currently has an entry.
    pub async fn is_called(&self, id: &str) -> bool {
        self.inner.lock().await.entries.contains_key(id)
    }

    /// Outcome recorded for an id, if it has finished and is still cached.
    pub async fn outcome(&self, id: &str) -> Option<Completion> {
        let inner = self.inner.lock().await;
        let entry = inner.entries.get(id)?;
        let outcome = entry.signal.borrow().clone();
        outcome
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.order.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for RequestStore {
    fn default() -> Self {
        Self::from_config(&DispatchConfig::default())
    }
}
