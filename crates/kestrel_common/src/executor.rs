//! Periodic background task scheduling.
//!
//! All background work (cluster refresh, idle reaping, per-node health
//! probes) registers with a `TaskExecutor`. Stopping the executor signals
//! every task and waits for it to exit before shutdown proceeds.

use std::future::Future;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Owns a set of cancellable periodic tasks.
pub struct TaskExecutor {
    tasks: Arc<AtomicI32>,
    close_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Default for TaskExecutor {
    fn default() -> TaskExecutor {
        TaskExecutor::new()
    }
}

impl TaskExecutor {
    pub fn new() -> TaskExecutor {
        let (close_tx, _) = watch::channel(false);
        TaskExecutor {
            tasks: Arc::new(AtomicI32::new(0)),
            close_tx,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Run `action` every `period` until the executor is stopped. The first
    /// run happens one period after registration.
    pub fn start<F, Fut>(&self, period: Duration, action: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut close_rx = self.close_tx.subscribe();
        let tasks = Arc::clone(&self.tasks);
        tasks.fetch_add(1, Ordering::SeqCst);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // interval fires immediately on the first tick
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => action().await,
                    _ = close_rx.changed() => break,
                }
            }
            tasks.fetch_sub(1, Ordering::SeqCst);
        });
        self.handles.lock().push(handle);
    }

    /// Number of live tasks.
    pub fn num_tasks(&self) -> i32 {
        self.tasks.load(Ordering::SeqCst)
    }

    /// Signal every task and wait for it to finish.
    pub async fn stop_all(&self) {
        let _ = self.close_tx.send(true);
        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}
