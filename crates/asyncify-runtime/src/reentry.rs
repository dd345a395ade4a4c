//! Hands store access to units of work that need to run guest code.
//!
//! The wasmtime store has a single owner at any time: the call façade while it
//! awaits a chain, or a blocking `get` frame. Units of work queue jobs here and
//! the owner runs them between polls of whatever it is waiting on.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use wasmtime::{AsContextMut, StoreContextMut};

use crate::error::TaskError;
use crate::host::HostState;

pub type Job = Box<dyn FnOnce(StoreContextMut<'_, HostState>) + Send>;

#[derive(Clone)]
pub struct Reentry {
    tx: mpsc::UnboundedSender<Job>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Job>>>,
    token: CancellationToken,
}

impl Reentry {
    pub fn new(token: CancellationToken) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
            token,
        }
    }

    /// Run `f` against the store on whichever frame currently owns it.
    ///
    /// Jobs queued before a teardown are skipped when they are dequeued, and
    /// the caller sees `Cancelled`.
    pub async fn run<R, F>(&self, f: F) -> Result<R, TaskError>
    where
        R: Send + 'static,
        F: FnOnce(StoreContextMut<'_, HostState>) -> R + Send + 'static,
    {
        if self.token.is_cancelled() {
            return Err(TaskError::Cancelled);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        let token = self.token.clone();
        let job: Job = Box::new(move |ctx: StoreContextMut<'_, HostState>| {
            if token.is_cancelled() {
                return;
            }
            let _ = reply_tx.send(f(ctx));
        });
        self.tx.send(job).map_err(|_| TaskError::Cancelled)?;
        reply_rx.await.map_err(|_| TaskError::Cancelled)
    }

    /// Poll `fut` to completion while running queued jobs on `ctx`.
    pub async fn drive<T>(&self, mut ctx: StoreContextMut<'_, HostState>, fut: impl Future<Output = T>) -> T {
        tokio::pin!(fut);
        loop {
            let job = {
                let mut rx = self.rx.lock().await;
                tokio::select! {
                    biased;
                    out = &mut fut => return out,
                    job = rx.recv() => job,
                }
            };
            match job {
                Some(job) => job(ctx.as_context_mut()),
                None => return fut.await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use tokio::runtime::Handle;
    use wasmtime::{Engine, Store};

    use super::*;
    use crate::tasks::TaskManager;

    fn store() -> Store<HostState> {
        let tasks = Arc::new(TaskManager::new(Handle::current()));
        Store::new(&Engine::default(), HostState::new(tasks, Handle::current(), false))
    }

    #[tokio::test]
    async fn job_runs_on_driving_frame() {
        let mut store = store();
        let reentry = Reentry::new(CancellationToken::new());

        let queued = tokio::spawn({
            let reentry = reentry.clone();
            async move { reentry.run(|ctx: StoreContextMut<'_, HostState>| ctx.data().guest_logging).await }
        });
        let outcome = reentry.drive(store.as_context_mut(), queued).await.unwrap();
        assert_eq!(outcome, Ok(false));
    }

    #[tokio::test]
    async fn queued_job_is_skipped_after_teardown() {
        let mut store = store();
        let token = CancellationToken::new();
        let reentry = Reentry::new(token.clone());
        let ran = Arc::new(AtomicBool::new(false));

        let queued = tokio::spawn({
            let reentry = reentry.clone();
            let ran = Arc::clone(&ran);
            async move {
                reentry
                    .run(move |_ctx: StoreContextMut<'_, HostState>| ran.store(true, Ordering::SeqCst))
                    .await
            }
        });
        // Let the job reach the channel before the scope is torn down.
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();

        let outcome = reentry.drive(store.as_context_mut(), queued).await.unwrap();
        assert_eq!(outcome, Err(TaskError::Cancelled));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn run_after_teardown_is_refused() {
        let token = CancellationToken::new();
        let reentry = Reentry::new(token.clone());
        token.cancel();

        let outcome = reentry.run(|_ctx: StoreContextMut<'_, HostState>| ()).await;
        assert_eq!(outcome, Err(TaskError::Cancelled));
    }
}
