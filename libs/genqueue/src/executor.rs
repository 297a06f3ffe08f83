//! One-attempt task runner.
//!
//! Owns everything that happens between dispatch and the terminal
//! outcome of an attempt: the attempt-local cancellation channel
//! (child of the record's cancel handle), the timeout, classification
//! of the result, retry scheduling, lifecycle transitions, analytics,
//! and resolving the caller.
//!
//! Classification precedence on return: caller cancellation, then
//! attempt timeout, then the cancellation detector, then the retry
//! policy.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;

use crate::analytics::{Action, Analytics};
use crate::cancel::is_cancellation;
use crate::clock::Clock;
use crate::error::Error;
use crate::queue::{PriorityQueueCore, QueuedTask};
use crate::rate_limit::RateLimiter;
use crate::registry::{LifecycleRegistry, TaskState};
use crate::retry::RetryPolicy;

pub(crate) struct TaskExecutor<T> {
    core: Arc<PriorityQueueCore<T>>,
    registry: Arc<LifecycleRegistry>,
    analytics: Analytics,
    retry: RetryPolicy,
    rate_limiter: Arc<RateLimiter>,
    clock: Clock,
}

impl<T: Send + 'static> TaskExecutor<T> {
    pub(crate) fn new(
        core: Arc<PriorityQueueCore<T>>,
        registry: Arc<LifecycleRegistry>,
        analytics: Analytics,
        retry: RetryPolicy,
        rate_limiter: Arc<RateLimiter>,
        clock: Clock,
    ) -> Self {
        Self {
            core,
            registry,
            analytics,
            retry,
            rate_limiter,
            clock,
        }
    }

    /// Run one attempt. The caller (dispatch loop) owns the
    /// concurrency slot; this method owns the terminal bookkeeping.
    pub(crate) async fn run_attempt(&self, task: QueuedTask<T>) {
        let request_id = task.spec.request_id.clone();

        let Some(record) = self.registry.get(&request_id) else {
            tracing::error!(%request_id, "record missing at execution time");
            return;
        };
        let cancel = record.cancel.clone();
        let enqueued_at = record.enqueued_at_mono;

        // Caller abort observed between dispatch and start: terminal
        // without invoking the generation function.
        if cancel.is_cancelled() {
            let duration = self.clock.monotonic_now().saturating_sub(enqueued_at);
            self.finish_cancelled(task, duration);
            return;
        }

        let attempt_token = cancel.child_token();
        let fut = (task.task_fn)(attempt_token.clone());
        let fut = AssertUnwindSafe(fut).catch_unwind();
        tokio::pin!(fut);

        let mut timed_out = false;
        let outcome = tokio::select! {
            res = &mut fut => res,
            _ = tokio::time::sleep(task.spec.timeout) => {
                timed_out = true;
                self.analytics.emit(
                    self.analytics
                        .event(Action::TaskTimeout)
                        .request(&request_id)
                        .user(task.spec.user_id.as_deref())
                        .attempt(task.attempt)
                        .duration_ms(task.spec.timeout),
                );
                // Cooperative: signal the attempt and wait for the
                // generation function to observe it and return.
                attempt_token.cancel();
                (&mut fut).await
            }
        };

        let result = match outcome {
            Ok(res) => res,
            Err(_panic) => Err(anyhow::anyhow!("generation function panicked")),
        };

        let duration = self.clock.monotonic_now().saturating_sub(enqueued_at);

        match result {
            // A value that arrives after a timeout signal still counts:
            // the work is done and discarding it would waste it.
            Ok(value) => self.finish_completed(task, value, duration),
            Err(err) => {
                if cancel.is_cancelled() {
                    self.finish_cancelled(task, duration);
                } else if timed_out {
                    if task.attempt < task.spec.max_retries {
                        self.schedule_retry(task, duration);
                    } else {
                        self.finish_timeout_exhausted(task, duration);
                    }
                } else if is_cancellation(&err) {
                    self.finish_cancelled(task, duration);
                } else if self.retry.should_retry(&err, task.attempt, task.spec.max_retries) {
                    self.schedule_retry(task, duration);
                } else {
                    self.finish_failed(task, err, duration);
                }
            }
        }
    }

    fn finish_completed(&self, task: QueuedTask<T>, value: T, duration: Duration) {
        let id = task.spec.request_id.clone();
        if let Err(e) = self.registry.transition(&id, TaskState::Completed) {
            tracing::error!(request_id = %id, error = %e, "completion transition failed");
        }
        self.analytics.emit(
            self.analytics
                .event(Action::TaskCompleted)
                .request(&id)
                .user(task.spec.user_id.as_deref())
                .attempt(task.attempt)
                .duration_ms(duration),
        );
        self.release(&task.spec.user_id);
        let _ = task.done.send(Ok(value));
    }

    fn finish_cancelled(&self, task: QueuedTask<T>, duration: Duration) {
        let id = task.spec.request_id.clone();
        if let Err(e) = self.registry.transition(&id, TaskState::Cancelled) {
            tracing::error!(request_id = %id, error = %e, "cancel transition failed");
        }
        self.analytics.emit(
            self.analytics
                .event(Action::TaskCancelled)
                .request(&id)
                .user(task.spec.user_id.as_deref())
                .attempt(task.attempt)
                .duration_ms(duration),
        );
        self.release(&task.spec.user_id);
        let _ = task.done.send(Err(Error::cancelled(id.to_string())));
    }

    fn finish_timeout_exhausted(&self, task: QueuedTask<T>, duration: Duration) {
        let id = task.spec.request_id.clone();
        if let Err(e) = self.registry.transition(&id, TaskState::TimedOut) {
            tracing::error!(request_id = %id, error = %e, "timeout transition failed");
        }
        self.analytics.emit(
            self.analytics
                .event(Action::TaskTimeoutExhausted)
                .request(&id)
                .user(task.spec.user_id.as_deref())
                .attempt(task.attempt)
                .duration_ms(duration),
        );
        self.release(&task.spec.user_id);
        let last = Error::TimedOut {
            request_id: id.to_string(),
            timeout: task.spec.timeout,
            duration,
            retry_count: task.attempt,
        };
        let _ = task.done.send(Err(Error::RetryExhausted {
            request_id: id.to_string(),
            duration,
            retry_count: task.attempt,
            source: Box::new(last),
        }));
    }

    fn finish_failed(&self, task: QueuedTask<T>, err: anyhow::Error, duration: Duration) {
        let id = task.spec.request_id.clone();
        if let Err(e) = self.registry.transition(&id, TaskState::Failed) {
            tracing::error!(request_id = %id, error = %e, "failure transition failed");
        }
        self.analytics.emit(
            self.analytics
                .event(Action::TaskFailed)
                .request(&id)
                .user(task.spec.user_id.as_deref())
                .attempt(task.attempt)
                .duration_ms(duration)
                .reason(err.to_string()),
        );
        self.release(&task.spec.user_id);
        let _ = task.done.send(Err(Error::RetryExhausted {
            request_id: id.to_string(),
            duration,
            retry_count: task.attempt,
            source: err.into(),
        }));
    }

    /// Running → Queued, backoff, and a timer that re-admits the task.
    fn schedule_retry(&self, mut task: QueuedTask<T>, duration: Duration) {
        let id = task.spec.request_id.clone();
        if let Err(e) = self.registry.transition(&id, TaskState::Queued) {
            tracing::error!(request_id = %id, error = %e, "retry transition failed");
            return;
        }

        let delay = self.retry.backoff_delay(task.attempt);
        self.analytics.emit(
            self.analytics
                .event(Action::TaskRetryScheduled)
                .request(&id)
                .user(task.spec.user_id.as_deref())
                .attempt(task.attempt + 1)
                .delay_ms(delay)
                .duration_ms(duration),
        );

        task.attempt += 1;
        self.registry.set_attempt(&id, task.attempt);

        let core = self.core.clone();
        let registry = self.registry.clone();
        let analytics = self.analytics.clone();
        let rate_limiter = self.rate_limiter.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(task) = core.readmit(task) {
                // Shutdown began while the retry was pending; the task
                // terminates through the cancellation path.
                let id = task.spec.request_id.clone();
                if registry.transition(&id, TaskState::Cancelled).is_ok() {
                    analytics.emit(
                        analytics
                            .event(Action::TaskCancelled)
                            .request(&id)
                            .user(task.spec.user_id.as_deref())
                            .attempt(task.attempt),
                    );
                    if let Some(user) = task.spec.user_id.as_deref() {
                        rate_limiter.release(user);
                    }
                    let _ = task.done.send(Err(Error::cancelled(id.to_string())));
                }
            }
        });
    }

    fn release(&self, user_id: &Option<Arc<str>>) {
        if let Some(user) = user_id.as_deref() {
            self.rate_limiter.release(user);
        }
    }
}
