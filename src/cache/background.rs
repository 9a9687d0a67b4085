//! Background task queue for promotions and cache fills.
//!
//! Bounded: once `max_pending` tasks are queued or running, further
//! submissions are dropped and counted. `drain` stops intake and waits for
//! everything in flight.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Notify, Semaphore};
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::error::Result;

/// Snapshot of background queue counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackgroundStats {
    pub spawned: u64,
    pub completed: u64,
    pub failed: u64,
    pub dropped: u64,
    pub in_flight: u64,
}

#[derive(Debug, Default)]
struct Counters {
    spawned: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    pending: AtomicU64,
    idle: Notify,
}

/// Bounded, drainable set of detached tasks
#[derive(Debug)]
pub struct BackgroundTasks {
    tracker: TaskTracker,
    permits: Arc<Semaphore>,
    counters: Arc<Counters>,
}

impl BackgroundTasks {
    pub fn new(max_pending: usize) -> Self {
        Self {
            tracker: TaskTracker::new(),
            permits: Arc::new(Semaphore::new(max_pending.max(1))),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Run `task` in the background. Returns false when the queue is full
    /// or draining; the task is then dropped without running.
    pub fn spawn<F>(&self, label: &'static str, task: F) -> bool
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        if self.tracker.is_closed() {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            debug!("Background {}: dropped, queue is draining", label);
            return false;
        }

        let permit = match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Background {}: dropped, queue is full", label);
                return false;
            }
        };

        self.counters.spawned.fetch_add(1, Ordering::Relaxed);
        self.counters.pending.fetch_add(1, Ordering::AcqRel);
        let counters = Arc::clone(&self.counters);

        self.tracker.spawn(async move {
            let _permit = permit;
            match task.await {
                Ok(()) => {
                    counters.completed.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    warn!("Background {} failed: {}", label, e);
                }
            }
            if counters.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
                counters.idle.notify_waiters();
            }
        });
        true
    }

    /// Wait until nothing is queued or running. Intake stays open, so tasks
    /// spawned meanwhile are waited for too.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.counters.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.counters.pending.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stop accepting tasks and wait for the rest to finish
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        debug!("Background queue drained: {:?}", self.stats());
    }

    pub fn stats(&self) -> BackgroundStats {
        BackgroundStats {
            spawned: self.counters.spawned.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            in_flight: self.counters.pending.load(Ordering::Acquire),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_background_tasks_count_outcomes() {
        let tasks = BackgroundTasks::new(8);

        assert!(tasks.spawn("ok", async { Ok(()) }));
        assert!(tasks.spawn("fail", async { Err(Error::Internal("boom".into())) }));
        tasks.wait_idle().await;

        let stats = tasks.stats();
        assert_eq!(stats.spawned, 2);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.in_flight, 0);

        // Intake stays open after waiting
        assert!(tasks.spawn("again", async { Ok(()) }));
        tasks.wait_idle().await;
        assert_eq!(tasks.stats().completed, 2);
    }

    #[tokio::test]
    async fn test_wait_idle_accepts_tasks_while_waiting() {
        let tasks = Arc::new(BackgroundTasks::new(8));
        let (release, gate) = oneshot::channel::<()>();
        tasks.spawn("blocker", async move {
            let _ = gate.await;
            Ok(())
        });

        let waiter = {
            let tasks = Arc::clone(&tasks);
            tokio::spawn(async move { tasks.wait_idle().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(tasks.spawn("during wait", async { Ok(()) }));
        release.send(()).unwrap();
        waiter.await.unwrap();

        tasks.wait_idle().await;
        let stats = tasks.stats();
        assert_eq!(stats.dropped, 0);
        assert_eq!(stats.completed, 2);

        tasks.drain().await;
        assert!(!tasks.spawn("after drain", async { Ok(()) }));
    }

    #[tokio::test]
    async fn test_background_tasks_drop_when_full() {
        let tasks = BackgroundTasks::new(1);
        let (release, gate) = oneshot::channel::<()>();

        assert!(tasks.spawn("blocker", async move {
            let _ = gate.await;
            Ok(())
        }));
        assert!(!tasks.spawn("overflow", async { Ok(()) }));
        assert_eq!(tasks.stats().dropped, 1);

        release.send(()).unwrap();
        tasks.drain().await;
        assert_eq!(tasks.stats().completed, 1);
    }

    #[tokio::test]
    async fn test_background_tasks_drain_waits_and_closes() {
        let tasks = BackgroundTasks::new(4);

        tasks.spawn("slow", async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            Ok(())
        });
        tasks.drain().await;

        assert_eq!(tasks.stats().completed, 1);
        assert!(!tasks.spawn("late", async { Ok(()) }));
        assert_eq!(tasks.stats().dropped, 1);
    }
}
