//! Queue façade.
//!
//! The only externally-visible handle: admission, cancellation,
//! concurrency updates, metrics and shutdown all go through
//! `QueueManager`. Construction happens in `init::QueueBuilder`, which
//! fixes the component wiring order.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use runtime::config::QueueConfig;

use crate::analytics::{Action, Analytics};
use crate::clock::Clock;
use crate::error::Error;
use crate::queue::{AdmitRefusal, PriorityQueueCore, QueueMetrics, TaskFn};
use crate::rate_limit::RateLimiter;
use crate::registry::{CancelOutcome, LifecycleRecord, LifecycleRegistry, TaskState};
use crate::shutdown::{ShutdownManager, ShutdownOptions, ShutdownOutcome, ShutdownState};
use crate::signal;
use crate::validate::{EnqueueOptions, Validator};

/// Handle for one admitted task. Resolves with the generation
/// function's value or a classified error.
#[derive(Debug)]
pub struct JobHandle<T> {
    request_id: Arc<str>,
    rx: oneshot::Receiver<Result<T, Error>>,
    cancel: CancellationToken,
}

impl<T> JobHandle<T> {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Await the task's outcome. Resolves early with `Cancelled` when
    /// the cancel handle fires while the task is still queued.
    pub async fn wait(mut self) -> Result<T, Error> {
        tokio::select! {
            biased;
            res = &mut self.rx => match res {
                Ok(outcome) => outcome,
                // Sender dropped without a result: the task was
                // discarded after cancellation.
                Err(_) => Err(Error::cancelled(self.request_id.to_string())),
            },
            _ = self.cancel.cancelled() => Err(Error::cancelled(self.request_id.to_string())),
        }
    }
}

pub struct QueueManager<T> {
    config: QueueConfig,
    clock: Clock,
    validator: Validator,
    core: Arc<PriorityQueueCore<T>>,
    registry: Arc<LifecycleRegistry>,
    analytics: Analytics,
    rate_limiter: Arc<RateLimiter>,
    shutdown: ShutdownManager<T>,
}

impl<T> std::fmt::Debug for QueueManager<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueManager").finish_non_exhaustive()
    }
}

impl<T: Send + 'static> QueueManager<T> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: QueueConfig,
        clock: Clock,
        validator: Validator,
        core: Arc<PriorityQueueCore<T>>,
        registry: Arc<LifecycleRegistry>,
        analytics: Analytics,
        rate_limiter: Arc<RateLimiter>,
        shutdown: ShutdownManager<T>,
    ) -> Self {
        Self {
            config,
            clock,
            validator,
            core,
            registry,
            analytics,
            rate_limiter,
            shutdown,
        }
    }

    /// Admit a task. The closure is invoked once per attempt with that
    /// attempt's cancellation token, which it must honour.
    pub fn add_to_queue<F, Fut>(
        &self,
        task_fn: F,
        opts: EnqueueOptions,
    ) -> Result<JobHandle<T>, Error>
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let task_fn: TaskFn<T> = Arc::new(move |token| Box::pin(task_fn(token)));
        self.enqueue(task_fn, opts)
    }

    /// Type-erased admission path.
    pub fn enqueue(&self, task_fn: TaskFn<T>, mut opts: EnqueueOptions) -> Result<JobHandle<T>, Error> {
        // Canonicalise the signal fields, then strip internal-only
        // keys; neither reaches the queue core.
        signal::normalize(&mut opts);
        let clock = opts.clock.take().unwrap_or_else(|| self.clock.clone());

        let requested_id = opts.request_id.clone();
        let spec = match self.validator.validate(opts) {
            Ok(spec) => spec,
            Err(err) => {
                let mut ev = self
                    .analytics
                    .event(Action::TaskEnqueueError)
                    .reason(err.to_string());
                ev.request_id = requested_id;
                self.analytics.emit(ev);
                return Err(err);
            }
        };
        let request_id = spec.request_id.clone();
        let cancel = spec.abort_signal.token().child_token();

        // Already-aborted signal: exactly one terminal event, and the
        // task is never queued.
        if spec.abort_signal.aborted() {
            self.registry.record_cancelled(&spec, cancel)?;
            let m = self.core.metrics();
            let mut ev = self
                .analytics
                .event(Action::TaskCancelledBeforeEnqueue)
                .request(&request_id)
                .user(spec.user_id.as_deref())
                .priority(spec.priority);
            ev.queue_size = Some(m.queue_size);
            ev.active_jobs = Some(m.active_jobs);
            ev.concurrency = Some(m.concurrency);
            ev.config_max_queue = Some(m.config_max_queue);
            self.analytics.emit(ev);
            return Err(Error::enqueue_cancelled(request_id.to_string()));
        }

        self.registry.record_pending(&spec, cancel.clone())?;

        let (done_tx, done_rx) = oneshot::channel();
        let registry = self.registry.clone();
        let user_id = spec.user_id.clone();
        let res = self.core.admit(&clock, spec, task_fn, done_tx, |task| {
            // Under the admission lock, before the dispatcher can see
            // the entry.
            if let Err(e) = registry.activate(
                &task.spec.request_id,
                task.enqueued_at_mono,
                task.enqueued_at_epoch_ms,
            ) {
                tracing::error!(request_id = %task.spec.request_id, error = %e, "activation failed");
            }
        });

        match res {
            Ok(()) => {
                if let Some(user) = user_id.as_deref() {
                    self.rate_limiter.touch(user);
                }
                Ok(JobHandle {
                    request_id,
                    rx: done_rx,
                    cancel,
                })
            }
            Err(refusal) => {
                self.registry.remove_pending(&request_id);
                let m = self.core.metrics();
                let mut ev = self
                    .analytics
                    .event(Action::TaskEnqueueRejected)
                    .request(&request_id)
                    .user(user_id.as_deref());
                ev.queue_size = Some(m.queue_size);
                ev.active_jobs = Some(m.active_jobs);
                ev.concurrency = Some(m.concurrency);
                ev.config_max_queue = Some(m.config_max_queue);
                if refusal == AdmitRefusal::ShuttingDown {
                    ev = ev.reason("shutdown");
                }
                self.analytics.emit(ev);
                Err(Error::QueueFull {
                    max_queue_size: self.config.max_queue_size,
                })
            }
        }
    }

    /// Request cancellation. Returns true iff a non-terminal record
    /// existed. Queued tasks are moved to their terminal state here;
    /// running tasks get their handle fired and the executor emits the
    /// single terminal event when the function returns.
    pub fn cancel_request(&self, request_id: &str) -> bool {
        match self.registry.cancel(request_id) {
            None => false,
            Some(CancelOutcome::WasQueued { user_id }) => {
                self.analytics.emit(
                    self.analytics
                        .event(Action::TaskCancelled)
                        .request(request_id)
                        .user(user_id.as_deref()),
                );
                if let Some(user) = user_id.as_deref() {
                    self.rate_limiter.release(user);
                }
                true
            }
            Some(CancelOutcome::WasRunning) => true,
        }
    }

    /// Atomically change the concurrency gate. Takes effect at the
    /// next dispatcher wakeup; in-flight workers are not interrupted.
    pub fn update_concurrency(&self, n: usize) -> Result<(), Error> {
        let n = Validator::validate_concurrency(n)?;
        self.core.set_concurrency(n);
        Ok(())
    }

    /// Read-only snapshot.
    pub fn metrics(&self) -> QueueMetrics {
        self.core.metrics()
    }

    /// Current lifecycle state of a request, if a record exists.
    pub fn task_state(&self, request_id: &str) -> Option<TaskState> {
        self.registry.state(request_id)
    }

    /// Lifecycle record snapshot, if one exists.
    pub fn lifecycle(&self, request_id: &str) -> Option<LifecycleRecord> {
        self.registry.get(request_id)
    }

    /// Initiate shutdown; returns when drained/aborted or the deadline
    /// elapsed. Idempotent: later calls wait for the first.
    pub async fn shutdown(&self, opts: ShutdownOptions) -> ShutdownOutcome {
        self.shutdown.shutdown(opts).await
    }

    pub fn shutdown_state(&self) -> ShutdownState {
        self.shutdown.state()
    }

    /// Per-user token budget spend (bookkeeping surface for the
    /// embedding service).
    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    /// Telemetry drop counter, for operational dashboards.
    pub fn analytics_dropped(&self) -> u64 {
        self.analytics.dropped()
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub(crate) fn bundle_status(&self) -> Vec<(&'static str, bool)> {
        let mut status = self.shutdown.worker_status();
        status.push(("rate limiter cleanup", self.rate_limiter.is_running()));
        status
    }
}
