//! Task scheduling for reconciliation jobs.
//!
//! Reconciliation of one application must never overlap with another
//! reconciliation of the same application. [`KeyedScheduler`] provides that
//! guarantee with one FIFO worker per key, while jobs for different keys run
//! concurrently.

use super::Result;
use dashmap::DashMap;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Notify, mpsc, watch};
use tracing::{debug, error};

/// A scheduled unit of work.
pub type Job = BoxFuture<'static, Result<()>>;

/// Runs jobs with at most one in-flight job per key.
pub trait TaskScheduler: Send + Sync {
    /// Queue `job` behind every job already queued for `key`.
    ///
    /// Failures are logged together with `description`; they are never
    /// propagated to the caller.
    fn schedule(&self, key: &str, description: &str, job: Job);

    /// Resolves once every job scheduled so far has finished.
    fn drained(&self) -> BoxFuture<'_, ()> {
        Box::pin(futures::future::ready(()))
    }
}

struct Task {
    description: String,
    job: Job,
}

#[derive(Default)]
struct Inner {
    workers: DashMap<String, mpsc::UnboundedSender<Task>>,
    pending: AtomicUsize,
    idle: Notify,
}

impl Inner {
    fn finish(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// [`TaskScheduler`] with one FIFO worker task per key.
///
/// Must be used within a tokio runtime.
#[derive(Clone, Default)]
pub struct KeyedScheduler {
    inner: Arc<Inner>,
}

impl KeyedScheduler {
    /// Create a scheduler without workers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Jobs queued or running.
    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::SeqCst)
    }

    /// Wait until every queued job has finished.
    pub async fn idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }

    fn spawn_worker(&self, key: &str) -> mpsc::UnboundedSender<Task> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Task>();
        let inner = self.inner.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            while let Some(task) = rx.recv().await {
                debug!("[{}] {}", key, task.description);
                // Run on its own task so a panicking job cannot take the worker down
                match tokio::spawn(task.job).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!("[{}] {} failed: {}", key, task.description, e),
                    Err(e) => error!("[{}] {} aborted: {}", key, task.description, e),
                }
                inner.finish();
            }
        });
        tx
    }
}

impl TaskScheduler for KeyedScheduler {
    fn schedule(&self, key: &str, description: &str, job: Job) {
        self.inner.pending.fetch_add(1, Ordering::SeqCst);
        let task = Task {
            description: description.to_string(),
            job,
        };
        let worker = self
            .inner
            .workers
            .entry(key.to_string())
            .or_insert_with(|| self.spawn_worker(key))
            .clone();
        if worker.send(task).is_err() {
            error!("[{}] worker is gone, dropping: {}", key, description);
            self.inner.finish();
        }
    }

    fn drained(&self) -> BoxFuture<'_, ()> {
        Box::pin(self.idle())
    }
}

/// A scheduler that becomes available after construction.
///
/// Resolves at most once; later [`SchedulerSlot::bind`] calls are ignored.
pub struct SchedulerSlot {
    tx: watch::Sender<Option<Arc<dyn TaskScheduler>>>,
}

impl Default for SchedulerSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulerSlot {
    /// An unbound slot.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Bind the scheduler. Returns `false` if the slot was already bound.
    pub fn bind(&self, scheduler: Arc<dyn TaskScheduler>) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(scheduler);
                true
            } else {
                false
            }
        })
    }

    /// The scheduler, if bound.
    pub fn get(&self) -> Option<Arc<dyn TaskScheduler>> {
        self.tx.borrow().clone()
    }

    /// Wait until the slot is bound.
    pub async fn wait(&self) -> Option<Arc<dyn TaskScheduler>> {
        let mut rx = self.tx.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(slot) => slot.clone(),
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::DeployError;
    use std::sync::Mutex;
    use std::time::Duration;

    fn recorder() -> Arc<Mutex<Vec<String>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn job(log: &Arc<Mutex<Vec<String>>>, entry: &str, delay_ms: u64) -> Job {
        let log = log.clone();
        let entry = entry.to_string();
        Box::pin(async move {
            log.lock().unwrap().push(format!("start {}", entry));
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            log.lock().unwrap().push(format!("end {}", entry));
            Ok(())
        })
    }

    #[tokio::test]
    async fn test_jobs_for_one_key_never_overlap() {
        let scheduler = KeyedScheduler::new();
        let log = recorder();
        scheduler.schedule("demo", "first", job(&log, "a", 20));
        scheduler.schedule("demo", "second", job(&log, "b", 0));
        scheduler.idle().await;

        assert_eq!(
            *log.lock().unwrap(),
            vec!["start a", "end a", "start b", "end b"]
        );
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test]
    async fn test_keys_run_concurrently() {
        let scheduler = KeyedScheduler::new();
        let log = recorder();
        scheduler.schedule("one", "slow", job(&log, "slow", 50));
        scheduler.schedule("two", "fast", job(&log, "fast", 0));
        scheduler.idle().await;

        let log = log.lock().unwrap();
        let fast_end = log.iter().position(|e| e == "end fast").unwrap();
        let slow_end = log.iter().position(|e| e == "end slow").unwrap();
        assert!(fast_end < slow_end);
    }

    #[tokio::test]
    async fn test_failing_job_does_not_stop_queue() {
        let scheduler = KeyedScheduler::new();
        let log = recorder();
        scheduler.schedule(
            "demo",
            "fails",
            Box::pin(async { Err(DeployError::UnknownApp("demo".into())) }),
        );
        scheduler.schedule("demo", "panics", Box::pin(async { panic!("boom") }));
        scheduler.schedule("demo", "runs", job(&log, "c", 0));
        scheduler.idle().await;
        assert_eq!(*log.lock().unwrap(), vec!["start c", "end c"]);
    }

    #[tokio::test]
    async fn test_slot_resolves_once() {
        let slot = Arc::new(SchedulerSlot::new());
        assert!(slot.get().is_none());

        let waiter = {
            let slot = slot.clone();
            tokio::spawn(async move { slot.wait().await.is_some() })
        };
        let scheduler: Arc<dyn TaskScheduler> = Arc::new(KeyedScheduler::new());
        assert!(slot.bind(scheduler.clone()));
        assert!(!slot.bind(scheduler));
        assert!(waiter.await.unwrap());
        assert!(slot.get().is_some());
    }
}
