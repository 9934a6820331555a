use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

/// One save at a time across all packages, in arrival order. The job
/// closure runs only once its turn comes.
#[derive(Debug, Default)]
pub struct SaveQueue {
    turn: AsyncMutex<()>,
    pending: AtomicUsize,
}

struct Pending<'a>(&'a AtomicUsize);

impl<'a> Pending<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for Pending<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl SaveQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub async fn enqueue<F, Fut>(&self, pkg: &str, job: F) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = bool>,
    {
        let _pending = Pending::enter(&self.pending);
        let _turn = self.turn.lock().await;
        debug!(event = "save_queue.run", pkg, waiting = self.pending().saturating_sub(1));
        let saved = job().await;
        debug!(event = "save_queue.done", pkg, saved);
        saved
    }
}
