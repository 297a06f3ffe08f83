//! Shutdown sequencing.
//!
//! Single process-wide token: Open → Draining → Closed. `drain` stops
//! admission and waits for in-flight and queued work to finish;
//! `abort` additionally fires every non-terminal record's cancel
//! handle and waits for executors to observe it. Either way the
//! background workers are torn down afterwards, analytics drain last
//! so the shutdown events themselves get delivered.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::analytics::{Action, Analytics};
use crate::clock::Clock;
use crate::lifecycle::Lifecycle;
use crate::queue::PriorityQueueCore;
use crate::rate_limit::RateLimiter;
use crate::registry::LifecycleRegistry;

/// How long each background worker gets to observe cancellation before
/// it is aborted.
const WORKER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Stop admitting, let queued and running work finish.
    Drain,
    /// Stop admitting, cancel everything, wait for workers to observe.
    Abort,
}

#[derive(Debug, Clone, Copy)]
pub struct ShutdownOptions {
    pub mode: ShutdownMode,
    /// Defaults to `shutdown_default_deadline_ms` from config.
    pub deadline: Option<Duration>,
}

impl ShutdownOptions {
    pub fn drain() -> Self {
        Self {
            mode: ShutdownMode::Drain,
            deadline: None,
        }
    }

    pub fn abort() -> Self {
        Self {
            mode: ShutdownMode::Abort,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

impl Default for ShutdownOptions {
    fn default() -> Self {
        Self::drain()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ShutdownState {
    Open,
    Draining,
    Closed,
}

impl ShutdownState {
    const fn as_u8(self) -> u8 {
        match self {
            ShutdownState::Open => 0,
            ShutdownState::Draining => 1,
            ShutdownState::Closed => 2,
        }
    }

    const fn from_u8(x: u8) -> Self {
        match x {
            1 => ShutdownState::Draining,
            2 => ShutdownState::Closed,
            _ => ShutdownState::Open,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    Drained,
    Aborted,
    DeadlineElapsed,
}

impl ShutdownOutcome {
    fn as_str(self) -> &'static str {
        match self {
            ShutdownOutcome::Drained => "drained",
            ShutdownOutcome::Aborted => "aborted",
            ShutdownOutcome::DeadlineElapsed => "deadline_elapsed",
        }
    }
}

pub struct ShutdownManager<T> {
    state: AtomicU8,
    outcome: Mutex<Option<ShutdownOutcome>>,
    closed: Notify,
    core: Arc<PriorityQueueCore<T>>,
    registry: Arc<LifecycleRegistry>,
    analytics: Analytics,
    rate_limiter: Arc<RateLimiter>,
    clock: Clock,
    dispatcher: Lifecycle,
    janitor: Lifecycle,
    drain_worker: Lifecycle,
    default_deadline: Duration,
}

impl<T: Send + 'static> ShutdownManager<T> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        core: Arc<PriorityQueueCore<T>>,
        registry: Arc<LifecycleRegistry>,
        analytics: Analytics,
        rate_limiter: Arc<RateLimiter>,
        clock: Clock,
        dispatcher: Lifecycle,
        janitor: Lifecycle,
        drain_worker: Lifecycle,
        default_deadline: Duration,
    ) -> Self {
        Self {
            state: AtomicU8::new(ShutdownState::Open.as_u8()),
            outcome: Mutex::new(None),
            closed: Notify::new(),
            core,
            registry,
            analytics,
            rate_limiter,
            clock,
            dispatcher,
            janitor,
            drain_worker,
            default_deadline,
        }
    }

    pub fn state(&self) -> ShutdownState {
        ShutdownState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn worker_status(&self) -> Vec<(&'static str, bool)> {
        vec![
            ("dispatcher", self.dispatcher.is_running()),
            ("lifecycle janitor", self.janitor.is_running()),
            ("analytics drain", self.drain_worker.is_running()),
        ]
    }

    /// Drive the full shutdown sequence. Only the first caller runs
    /// it; later callers wait for `Closed` and get the same outcome.
    pub async fn shutdown(&self, opts: ShutdownOptions) -> ShutdownOutcome {
        let first = self
            .state
            .compare_exchange(
                ShutdownState::Open.as_u8(),
                ShutdownState::Draining.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if !first {
            self.wait_closed().await;
            return self.outcome.lock().unwrap_or(ShutdownOutcome::Drained);
        }

        let started = self.clock.monotonic_now();
        let deadline = opts.deadline.unwrap_or(self.default_deadline);
        let mode = match opts.mode {
            ShutdownMode::Drain => "drain",
            ShutdownMode::Abort => "abort",
        };

        self.core.close();
        self.analytics
            .emit(self.analytics.event(Action::ShutdownStarted).reason(mode));
        tracing::info!(mode, deadline_ms = deadline.as_millis() as u64, "shutdown started");

        if opts.mode == ShutdownMode::Abort {
            // Queued records are terminal here and emitted by us;
            // running records only get their handles fired and the
            // executors emit, preserving terminal-event uniqueness.
            for (request_id, user_id) in self.registry.cancel_all() {
                self.analytics.emit(
                    self.analytics
                        .event(Action::TaskCancelled)
                        .request(&request_id)
                        .user(user_id.as_deref()),
                );
                if let Some(user) = user_id.as_deref() {
                    self.rate_limiter.release(user);
                }
            }
        }

        let outcome = tokio::select! {
            _ = self.core.wait_idle() => match opts.mode {
                ShutdownMode::Drain => ShutdownOutcome::Drained,
                ShutdownMode::Abort => ShutdownOutcome::Aborted,
            },
            _ = tokio::time::sleep(deadline) => ShutdownOutcome::DeadlineElapsed,
        };

        let duration = self.clock.monotonic_now().saturating_sub(started);
        self.analytics.emit(
            self.analytics
                .event(Action::ShutdownCompleted)
                .reason(outcome.as_str())
                .duration_ms(duration),
        );
        tracing::info!(outcome = outcome.as_str(), duration_ms = duration.as_millis() as u64, "shutdown completed");

        // Teardown order matters: analytics drain goes last so the
        // shutdown events above are flushed to the sink.
        let _ = self.dispatcher.stop(WORKER_STOP_TIMEOUT).await;
        self.rate_limiter.stop(WORKER_STOP_TIMEOUT).await;
        let _ = self.janitor.stop(WORKER_STOP_TIMEOUT).await;
        let _ = self.drain_worker.stop(WORKER_STOP_TIMEOUT).await;

        *self.outcome.lock() = Some(outcome);
        self.state
            .store(ShutdownState::Closed.as_u8(), Ordering::Release);
        self.closed.notify_waiters();
        outcome
    }

    async fn wait_closed(&self) {
        loop {
            // Register interest before checking, so a notification
            // landing between the check and the await is not lost.
            let mut notified = std::pin::pin!(self.closed.notified());
            notified.as_mut().enable();
            if self.state() == ShutdownState::Closed {
                return;
            }
            notified.await;
        }
    }
}
