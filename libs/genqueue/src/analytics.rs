//! Structured telemetry pipeline.
//!
//! Producers are never blocked: events go through a bounded channel
//! with `try_send`, overflow increments a drop counter, and a drain
//! worker forwards buffered events to the configured sink. The worker
//! surfaces accumulated drops as an `analytics_drop` event so the loss
//! is itself observable. Consumers must order by `timestamp` (epoch
//! milliseconds), not by arrival.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;

/// Closed set of telemetry actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    TaskCancelledBeforeEnqueue,
    TaskEnqueueRejected,
    TaskEnqueueError,
    TaskCompleted,
    TaskFailed,
    TaskCancelled,
    TaskTimeout,
    TaskTimeoutExhausted,
    TaskRetryScheduled,
    RateLimiterCleanupRestartNoop,
    AnalyticsDrop,
    ShutdownStarted,
    ShutdownCompleted,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::TaskCancelledBeforeEnqueue => "task_cancelled_before_enqueue",
            Action::TaskEnqueueRejected => "task_enqueue_rejected",
            Action::TaskEnqueueError => "task_enqueue_error",
            Action::TaskCompleted => "task_completed",
            Action::TaskFailed => "task_failed",
            Action::TaskCancelled => "task_cancelled",
            Action::TaskTimeout => "task_timeout",
            Action::TaskTimeoutExhausted => "task_timeout_exhausted",
            Action::TaskRetryScheduled => "task_retry_scheduled",
            Action::RateLimiterCleanupRestartNoop => "rate_limiter_cleanup_restart_noop",
            Action::AnalyticsDrop => "analytics_drop",
            Action::ShutdownStarted => "shutdown_started",
            Action::ShutdownCompleted => "shutdown_completed",
        }
    }

    /// Terminal actions: exactly one of these is emitted per admitted
    /// (or pre-admission-cancelled) task.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Action::TaskCompleted
                | Action::TaskFailed
                | Action::TaskCancelled
                | Action::TaskCancelledBeforeEnqueue
                | Action::TaskTimeoutExhausted
        )
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One telemetry event. `timestamp` is always epoch milliseconds.
#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsEvent {
    pub action: Action,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_jobs: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_max_queue: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
}

impl AnalyticsEvent {
    pub fn new(action: Action, timestamp: i64) -> Self {
        Self {
            action,
            timestamp,
            request_id: None,
            user_id: None,
            priority: None,
            queue_size: None,
            active_jobs: None,
            concurrency: None,
            config_max_queue: None,
            duration_ms: None,
            attempt: None,
            delay_ms: None,
            reason: None,
            count: None,
        }
    }

    pub fn request(mut self, id: &str) -> Self {
        self.request_id = Some(id.to_string());
        self
    }

    pub fn user(mut self, id: Option<&str>) -> Self {
        self.user_id = id.map(str::to_string);
        self
    }

    pub fn priority(mut self, p: i32) -> Self {
        self.priority = Some(p);
        self
    }

    pub fn duration_ms(mut self, d: Duration) -> Self {
        self.duration_ms = Some(d.as_millis() as u64);
        self
    }

    pub fn attempt(mut self, n: u32) -> Self {
        self.attempt = Some(n);
        self
    }

    pub fn delay_ms(mut self, d: Duration) -> Self {
        self.delay_ms = Some(d.as_millis() as u64);
        self
    }

    pub fn reason(mut self, r: impl Into<String>) -> Self {
        self.reason = Some(r.into());
        self
    }

    pub fn count(mut self, n: u64) -> Self {
        self.count = Some(n);
        self
    }
}

/// Destination for drained events. Delivery may be slow or
/// back-pressured; only the drain worker ever awaits it.
#[async_trait]
pub trait AnalyticsSink: Send + Sync + 'static {
    async fn deliver(&self, event: AnalyticsEvent);
}

/// Default sink: structured `tracing` records.
pub struct TracingSink;

#[async_trait]
impl AnalyticsSink for TracingSink {
    async fn deliver(&self, event: AnalyticsEvent) {
        let payload = serde_json::to_string(&event).unwrap_or_default();
        tracing::info!(target: "genqueue::analytics", action = %event.action, %payload, "event");
    }
}

/// Capturing sink for tests and local inspection.
#[derive(Default)]
pub struct MemorySink {
    events: parking_lot::Mutex<Vec<AnalyticsEvent>>,
}

#[async_trait]
impl AnalyticsSink for MemorySink {
    async fn deliver(&self, event: AnalyticsEvent) {
        self.events.lock().push(event);
    }
}

impl MemorySink {
    pub fn events(&self) -> Vec<AnalyticsEvent> {
        self.events.lock().clone()
    }

    pub fn actions(&self) -> Vec<Action> {
        self.events.lock().iter().map(|e| e.action).collect()
    }

    pub fn count(&self, action: Action) -> usize {
        self.events.lock().iter().filter(|e| e.action == action).count()
    }

    pub fn events_for(&self, request_id: &str) -> Vec<AnalyticsEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.request_id.as_deref() == Some(request_id))
            .cloned()
            .collect()
    }

    /// Poll until `action` has been delivered at least `n` times or
    /// `deadline` elapses. Returns the observed count.
    pub async fn wait_for(&self, action: Action, n: usize, deadline: Duration) -> usize {
        let end = tokio::time::Instant::now() + deadline;
        loop {
            let seen = self.count(action);
            if seen >= n || tokio::time::Instant::now() >= end {
                return seen;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

/// Producer handle. Cloned into every component that emits telemetry.
#[derive(Clone)]
pub struct Analytics {
    tx: mpsc::Sender<AnalyticsEvent>,
    dropped: Arc<AtomicU64>,
    clock: Clock,
}

impl Analytics {
    pub(crate) fn channel(capacity: usize, clock: Clock) -> (Self, mpsc::Receiver<AnalyticsEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
                clock,
            },
            rx,
        )
    }

    /// Start an event stamped with the wall clock.
    pub fn event(&self, action: Action) -> AnalyticsEvent {
        AnalyticsEvent::new(action, self.clock.epoch_now())
    }

    /// Non-blocking emit. Overflow and post-shutdown sends are counted
    /// as drops, never propagated to the caller.
    pub fn emit(&self, event: AnalyticsEvent) {
        if let Err(e) = self.tx.try_send(event) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(action = %e.into_inner().action, "analytics buffer full, dropping event");
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub(crate) fn dropped_handle(&self) -> Arc<AtomicU64> {
        self.dropped.clone()
    }
}

/// Drain worker: forwards buffered events to the sink until cancelled,
/// then flushes what is left. Accumulated drops are reported in-band.
pub(crate) async fn drain(
    mut rx: mpsc::Receiver<AnalyticsEvent>,
    sink: Arc<dyn AnalyticsSink>,
    dropped: Arc<AtomicU64>,
    clock: Clock,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let mut reported: u64 = 0;

    loop {
        tokio::select! {
            ev = rx.recv() => match ev {
                Some(ev) => {
                    sink.deliver(ev).await;
                    reported = report_drops(&sink, &dropped, &clock, reported).await;
                }
                None => break,
            },
            _ = cancel.cancelled() => break,
        }
    }

    // Flush without waiting on producers.
    while let Ok(ev) = rx.try_recv() {
        sink.deliver(ev).await;
    }
    report_drops(&sink, &dropped, &clock, reported).await;
    Ok(())
}

async fn report_drops(
    sink: &Arc<dyn AnalyticsSink>,
    dropped: &Arc<AtomicU64>,
    clock: &Clock,
    reported: u64,
) -> u64 {
    let total = dropped.load(Ordering::Relaxed);
    if total > reported {
        let ev = AnalyticsEvent::new(Action::AnalyticsDrop, clock.epoch_now()).count(total - reported);
        sink.deliver(ev).await;
    }
    total
}
