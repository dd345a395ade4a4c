//! Registry of in-flight units of work, keyed by guest output-buffer address.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, watch};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

use crate::error::TaskError;

pub type TaskOutcome = Result<Vec<u8>, TaskError>;

struct Entry {
    /// Generation id; a finishing unit only removes the entry it created.
    id: u64,
    abort: AbortHandle,
    outcome: watch::Receiver<Option<TaskOutcome>>,
}

/// Awaitable view of one registered unit of work.
#[derive(Clone)]
pub struct Pending {
    key: u32,
    outcome: watch::Receiver<Option<TaskOutcome>>,
}

impl Pending {
    pub fn key(&self) -> u32 {
        self.key
    }

    /// Wait for the unit to finish. A unit dropped before reporting (abort,
    /// teardown) reads as cancelled.
    pub async fn wait(mut self) -> TaskOutcome {
        let outcome = match self.outcome.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).clone(),
            Err(_) => None,
        };
        outcome.unwrap_or(Err(TaskError::Cancelled))
    }
}

/// One task scope per engine instance.
///
/// A key is present exactly while its unit is queued or running. Units are
/// spawned on the runtime captured at construction and are all aborted by
/// [`TaskManager::release_all`].
pub struct TaskManager {
    entries: Arc<DashMap<u32, Entry>>,
    next_id: AtomicU64,
    runtime: Handle,
    token: CancellationToken,
}

impl TaskManager {
    pub fn new(runtime: Handle) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
            runtime,
            token: CancellationToken::new(),
        }
    }

    /// Token observed by every unit at its checkpoints.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Register `work` under `key` and start it.
    ///
    /// The unit does not begin until its entry is in the registry, so a
    /// caller can always subscribe to a key it just registered.
    pub fn register<F>(&self, key: u32, work: F) -> Pending
    where
        F: Future<Output = TaskOutcome> + Send + 'static,
    {
        let (tx, rx) = watch::channel(None);
        let pending = Pending {
            key,
            outcome: rx.clone(),
        };
        if self.token.is_cancelled() {
            tracing::debug!(key = format_args!("{key:#x}"), "task scope released; dropping unit");
            return pending;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (registered_tx, registered_rx) = oneshot::channel::<()>();
        let entries = Arc::clone(&self.entries);
        let handle = self.runtime.spawn(async move {
            if registered_rx.await.is_err() {
                return;
            }
            let outcome = work.await;
            entries.remove_if(&key, |_, entry| entry.id == id);
            let _ = tx.send(Some(outcome));
        });

        let previous = self.entries.insert(
            key,
            Entry {
                id,
                abort: handle.abort_handle(),
                outcome: rx,
            },
        );
        if let Some(previous) = previous {
            tracing::warn!(key = format_args!("{key:#x}"), "key reused while a unit was still live");
            previous.abort.abort();
        }
        let _ = registered_tx.send(());
        tracing::trace!(key = format_args!("{key:#x}"), id, "task registered");
        pending
    }

    /// Awaitable handle to a live unit.
    pub fn subscribe(&self, key: u32) -> Result<Pending, TaskError> {
        if self.token.is_cancelled() {
            return Err(TaskError::Cancelled);
        }
        self.entries
            .get(&key)
            .map(|entry| Pending {
                key,
                outcome: entry.outcome.clone(),
            })
            .ok_or(TaskError::NotFound(key))
    }

    /// Await the unit registered under `key`.
    pub async fn wait(&self, key: u32) -> TaskOutcome {
        self.subscribe(key)?.wait().await
    }

    /// Cancel every outstanding unit and empty the registry. Idempotent.
    pub fn release_all(&self) {
        self.token.cancel();
        let mut aborted = 0usize;
        self.entries.retain(|_, entry| {
            entry.abort.abort();
            aborted += 1;
            false
        });
        if aborted > 0 {
            tracing::debug!(aborted, "task scope released");
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: u32) -> bool {
        self.entries.contains_key(&key)
    }
}

impl Drop for TaskManager {
    fn drop(&mut self) {
        self.release_all();
    }
}
