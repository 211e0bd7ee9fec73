//! Shared task scheduler
//!
//! One pool used by every connection for connect attempts, heartbeats,
//! reconnect delays and fire-and-forget calls. The pool is the tokio
//! runtime the scheduler was built on; every task it spawns is a child of
//! one root cancellation token so shutdown is a single call.

use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// `max(8, 2 x available cores)`
pub fn default_pool_size() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (cores * 2).max(8)
}

/// Handle to a scheduled task. Dropping it does not cancel the task.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    cancel: CancellationToken,
}

impl TaskHandle {
    /// Cancel the task; never waits for it to finish
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Build the multi-threaded runtime backing a scheduler of `size` workers
pub fn build_runtime(size: usize) -> io::Result<Runtime> {
    Builder::new_multi_thread()
        .worker_threads(size.max(1))
        .thread_name("keeper-worker")
        .enable_all()
        .build()
}

#[derive(Clone)]
pub struct Scheduler {
    handle: Handle,
    root: CancellationToken,
    size: usize,
}

impl Scheduler {
    /// Create a scheduler on the current tokio runtime.
    ///
    /// Must be called from within a runtime.
    pub fn new(size: usize) -> Self {
        Self::with_handle(Handle::current(), size)
    }

    pub fn with_handle(handle: Handle, size: usize) -> Self {
        Self {
            handle,
            root: CancellationToken::new(),
            size: size.max(1),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Run `task` on the pool
    pub fn execute<F>(&self, task: F) -> TaskHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.schedule(Duration::ZERO, task)
    }

    /// Run `task` once after `delay`
    pub fn schedule<F>(&self, delay: Duration, task: F) -> TaskHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.root.child_token();
        let token = cancel.clone();

        self.handle.spawn(async move {
            if !delay.is_zero() {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            tokio::select! {
                _ = token.cancelled() => {}
                _ = task => {}
            }
        });

        TaskHandle { cancel }
    }

    /// Run a long-lived I/O loop (a socket reader) until it ends or is
    /// cancelled
    pub fn spawn_io<F>(&self, task: F) -> TaskHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.root.child_token();
        let token = cancel.clone();

        self.handle.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = task => {}
            }
        });

        TaskHandle { cancel }
    }

    /// Run `tick` every `period`, first after `initial_delay`, until cancelled.
    /// A tick that overruns delays the following one instead of bursting.
    pub fn schedule_at_fixed_rate<F, Fut>(
        &self,
        initial_delay: Duration,
        period: Duration,
        mut tick: F,
    ) -> TaskHandle
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.root.child_token();
        let token = cancel.clone();

        self.handle.spawn(async move {
            let mut ticker = interval_at(Instant::now() + initial_delay, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tick() => {}
                }
            }
        });

        TaskHandle { cancel }
    }

    /// Cancel every task scheduled so far; later tasks are cancelled on arrival
    pub fn shutdown(&self) {
        debug!(pool_size = self.size, "Scheduler shutting down");
        self.root.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.root.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_schedule_runs_after_delay() {
        let scheduler = Scheduler::new(2);
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        scheduler.schedule(Duration::from_secs(5), async move {
            h.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_task_never_runs() {
        let scheduler = Scheduler::new(2);
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        let handle = scheduler.schedule(Duration::from_secs(1), async move {
            h.fetch_add(1, Ordering::SeqCst);
        });
        handle.cancel();
        assert!(handle.is_cancelled());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_rate_until_cancel() {
        let scheduler = Scheduler::new(2);
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        let handle = scheduler.schedule_at_fixed_rate(
            Duration::from_secs(30),
            Duration::from_secs(30),
            move || {
                let h = h.clone();
                async move {
                    h.fetch_add(1, Ordering::SeqCst);
                }
            },
        );

        tokio::time::sleep(Duration::from_secs(95)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 3);

        handle.cancel();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_everything() {
        let scheduler = Scheduler::new(1);
        let hits = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let h = hits.clone();
                scheduler.schedule(Duration::from_secs(1), async move {
                    h.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();
        scheduler.shutdown();
        assert!(handles.iter().all(TaskHandle::is_cancelled));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(scheduler.is_shut_down());
    }
}
