//! Admission/dispatch engine.
//!
//! A sorted collection of lazily-created priority buckets behind one
//! mutation lock (which doubles as the admission lock), a concurrency
//! gate, and a serialized dispatch loop. The dispatcher is the single
//! writer of queue state; `admit`, cancellation and concurrency
//! updates are safe against it.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::error::Error;
use crate::executor::TaskExecutor;
use crate::registry::{LifecycleRegistry, TaskState};
use crate::validate::TaskSpec;

/// Future produced by one attempt of a generation function.
pub type TaskFuture<T> = BoxFuture<'static, anyhow::Result<T>>;

/// Caller-supplied generation function. Invoked once per attempt with
/// that attempt's cancellation token, which the function must honour.
pub type TaskFn<T> = Arc<dyn Fn(CancellationToken) -> TaskFuture<T> + Send + Sync>;

/// Read-only scheduler snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct QueueMetrics {
    pub queue_size: usize,
    pub active_jobs: usize,
    pub concurrency: usize,
    pub config_max_queue: usize,
}

/// Why an admission was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AdmitRefusal {
    Full,
    ShuttingDown,
}

/// One queued entry: the payload that travels to the executor. The
/// registry owns the lifecycle state; the queue references tasks by
/// `request_id` plus this payload.
pub(crate) struct QueuedTask<T> {
    pub(crate) spec: TaskSpec,
    pub(crate) seq: u64,
    pub(crate) attempt: u32,
    pub(crate) enqueued_at_mono: Duration,
    pub(crate) enqueued_at_epoch_ms: i64,
    pub(crate) task_fn: TaskFn<T>,
    pub(crate) done: oneshot::Sender<Result<T, Error>>,
}

impl<T> std::fmt::Debug for QueuedTask<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedTask")
            .field("spec", &self.spec)
            .field("seq", &self.seq)
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}

struct Buckets<T> {
    by_priority: BTreeMap<i32, VecDeque<QueuedTask<T>>>,
    queued: usize,
    next_seq: u64,
}

pub struct PriorityQueueCore<T> {
    inner: Mutex<Buckets<T>>,
    active: AtomicUsize,
    concurrency: AtomicUsize,
    max_queue_size: usize,
    accepting: AtomicBool,
    /// Wakes the dispatcher.
    wake: Notify,
    /// Notifies shutdown waiters when the scheduler goes idle.
    idle: Notify,
}

impl<T: Send + 'static> PriorityQueueCore<T> {
    pub(crate) fn new(concurrency: usize, max_queue_size: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Buckets {
                by_priority: BTreeMap::new(),
                queued: 0,
                next_seq: 0,
            }),
            active: AtomicUsize::new(0),
            concurrency: AtomicUsize::new(concurrency),
            max_queue_size,
            accepting: AtomicBool::new(true),
            wake: Notify::new(),
            idle: Notify::new(),
        })
    }

    /// Admit a task under the single mutation lock. Clock stamps and
    /// the admission sequence are taken inside the lock, so
    /// `enqueued_at_mono` is non-decreasing in admission order.
    /// `on_admitted` runs under the same lock, before the dispatcher
    /// can observe the entry.
    pub(crate) fn admit<F>(
        &self,
        clock: &Clock,
        spec: TaskSpec,
        task_fn: TaskFn<T>,
        done: oneshot::Sender<Result<T, Error>>,
        on_admitted: F,
    ) -> Result<(), AdmitRefusal>
    where
        F: FnOnce(&QueuedTask<T>),
    {
        let mut inner = self.inner.lock();

        if !self.accepting.load(Ordering::Acquire) {
            return Err(AdmitRefusal::ShuttingDown);
        }
        if inner.queued + self.active.load(Ordering::Acquire) >= self.max_queue_size {
            return Err(AdmitRefusal::Full);
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        let task = QueuedTask {
            enqueued_at_mono: clock.monotonic_now(),
            enqueued_at_epoch_ms: clock.epoch_now(),
            seq,
            attempt: 0,
            spec,
            task_fn,
            done,
        };
        on_admitted(&task);

        let priority = task.spec.priority;
        inner.by_priority.entry(priority).or_default().push_back(task);
        inner.queued += 1;
        drop(inner);

        self.wake.notify_one();
        Ok(())
    }

    /// Re-admit a retried task. Bypasses the admission boundary (the
    /// slot was already accounted for while the task ran) but not the
    /// shutdown gate; the task comes back to the caller on refusal.
    pub(crate) fn readmit(&self, task: QueuedTask<T>) -> Result<(), QueuedTask<T>> {
        let mut inner = self.inner.lock();
        if !self.accepting.load(Ordering::Acquire) {
            return Err(task);
        }
        let priority = task.spec.priority;
        inner.by_priority.entry(priority).or_default().push_back(task);
        inner.queued += 1;
        drop(inner);

        self.wake.notify_one();
        Ok(())
    }

    /// Pop the head of the highest-priority bucket.
    fn pop_highest(&self) -> Option<QueuedTask<T>> {
        let mut inner = self.inner.lock();
        let prio = *inner.by_priority.keys().next_back()?;
        let (task, empty) = {
            let bucket = inner.by_priority.get_mut(&prio)?;
            (bucket.pop_front(), bucket.is_empty())
        };
        if empty {
            inner.by_priority.remove(&prio);
        }
        if task.is_some() {
            inner.queued -= 1;
        }
        task
    }

    /// Serialized dispatch loop. Runs on a dedicated worker; loops on
    /// wakeups from admissions, finished slots and concurrency updates.
    pub(crate) async fn dispatch_loop(
        self: Arc<Self>,
        registry: Arc<LifecycleRegistry>,
        executor: Arc<TaskExecutor<T>>,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        loop {
            Self::drain_ready(&self, &registry, &executor);
            tokio::select! {
                _ = self.wake.notified() => {}
                _ = cancel.cancelled() => break,
            }
        }
        Ok(())
    }

    fn drain_ready(
        core: &Arc<Self>,
        registry: &Arc<LifecycleRegistry>,
        executor: &Arc<TaskExecutor<T>>,
    ) {
        loop {
            if core.active.load(Ordering::Acquire) >= core.concurrency.load(Ordering::Acquire) {
                break;
            }
            let Some(task) = core.pop_highest() else { break };

            // Cancelled while queued: the cancellation path already
            // emitted the terminal event; discard without executing.
            match registry.state(&task.spec.request_id) {
                Some(TaskState::Cancelled) | None => {
                    drop(task);
                    core.maybe_notify_idle();
                    continue;
                }
                _ => {}
            }

            let guard = SlotGuard::claim(core.clone());
            if let Err(e) = registry.transition(&task.spec.request_id, TaskState::Running) {
                tracing::error!(request_id = %task.spec.request_id, error = %e, "dispatch transition failed");
                drop(guard);
                continue;
            }
            registry.set_attempt(&task.spec.request_id, task.attempt);
            tracing::trace!(
                request_id = %task.spec.request_id,
                seq = task.seq,
                priority = task.spec.priority,
                attempt = task.attempt,
                "dispatching task"
            );

            let executor = executor.clone();
            tokio::spawn(async move {
                executor.run_attempt(task).await;
                drop(guard);
            });
        }
    }

    /// Change the concurrency gate; takes effect at the next
    /// dispatcher wakeup. In-flight workers are not interrupted.
    pub(crate) fn set_concurrency(&self, n: usize) {
        self.concurrency.store(n, Ordering::Release);
        self.wake.notify_one();
    }

    /// Stop admitting. Queued work stays queued; the dispatcher keeps
    /// draining it.
    pub(crate) fn close(&self) {
        self.accepting.store(false, Ordering::Release);
        self.wake.notify_one();
    }

    pub(crate) fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.active.load(Ordering::Acquire) == 0 && self.inner.lock().queued == 0
    }

    /// Wait until no work is queued or running.
    pub(crate) async fn wait_idle(&self) {
        loop {
            // Register interest before checking, so a notification
            // landing between the check and the await is not lost.
            let mut notified = std::pin::pin!(self.idle.notified());
            notified.as_mut().enable();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    fn maybe_notify_idle(&self) {
        if self.is_idle() {
            self.idle.notify_waiters();
        }
    }

    pub fn metrics(&self) -> QueueMetrics {
        QueueMetrics {
            queue_size: self.inner.lock().queued,
            active_jobs: self.active.load(Ordering::Acquire),
            concurrency: self.concurrency.load(Ordering::Acquire),
            config_max_queue: self.max_queue_size,
        }
    }
}

/// Holds one unit of the concurrency gate. Dropping the guard is the
/// single place `active_jobs` is decremented, and it runs even when a
/// worker unwinds.
pub(crate) struct SlotGuard<T: Send + 'static> {
    core: Arc<PriorityQueueCore<T>>,
}

impl<T: Send + 'static> SlotGuard<T> {
    fn claim(core: Arc<PriorityQueueCore<T>>) -> Self {
        core.active.fetch_add(1, Ordering::AcqRel);
        Self { core }
    }
}

impl<T: Send + 'static> Drop for SlotGuard<T> {
    fn drop(&mut self) {
        self.core.active.fetch_sub(1, Ordering::AcqRel);
        self.core.wake.notify_one();
        self.core.maybe_notify_idle();
    }
}
