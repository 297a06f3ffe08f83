//! Task lifecycle registry.
//!
//! Single source of truth for per-task state. One record per
//! `request_id`, never resurrected after a terminal state; writes
//! serialise per shard, snapshot reads clone the record out.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::error::Error;
use crate::validate::TaskSpec;

/// Task states. Terminal states are `Completed`, `Failed`,
/// `Cancelled`, `TimedOut`.
///
/// ```text
/// (admit) → Queued → Running → {Completed, Failed, TimedOut}
///                  ↘ Cancelled (from any non-terminal state)
/// Running → Queued (retry re-admission only)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    PendingAdmit,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled | TaskState::TimedOut
        )
    }
}

fn transition_allowed(from: TaskState, to: TaskState) -> bool {
    use TaskState::*;
    matches!(
        (from, to),
        (PendingAdmit, Queued)
            | (PendingAdmit, Cancelled)
            | (Queued, Running)
            | (Queued, Cancelled)
            | (Running, Completed)
            | (Running, Failed)
            | (Running, TimedOut)
            | (Running, Cancelled)
            | (Running, Queued) // retry re-admission
    )
}

/// Snapshot of one task's scheduler-side state.
#[derive(Debug, Clone)]
pub struct LifecycleRecord {
    pub request_id: Arc<str>,
    pub user_id: Option<Arc<str>>,
    pub priority: i32,
    pub timeout: Duration,
    pub max_retries: u32,
    pub attempt: u32,
    pub state: TaskState,
    pub enqueued_at_mono: Duration,
    pub enqueued_at_epoch_ms: i64,
    /// Cancel handle: child of the caller's abort signal, fired by
    /// `cancel_request` and by abort-mode shutdown.
    pub cancel: CancellationToken,
    /// State history with monotonic timestamps.
    pub history: Vec<(TaskState, Duration)>,
    pub terminal_at: Option<Duration>,
}

impl LifecycleRecord {
    fn new(spec: &TaskSpec, cancel: CancellationToken, state: TaskState, now: Duration) -> Self {
        Self {
            request_id: spec.request_id.clone(),
            user_id: spec.user_id.clone(),
            priority: spec.priority,
            timeout: spec.timeout,
            max_retries: spec.max_retries,
            attempt: 0,
            state,
            enqueued_at_mono: Duration::ZERO,
            enqueued_at_epoch_ms: 0,
            cancel,
            history: vec![(state, now)],
            terminal_at: state.is_terminal().then_some(now),
        }
    }
}

/// Outcome of a cancellation request, from the registry's perspective.
#[derive(Debug, Clone)]
pub(crate) enum CancelOutcome {
    /// The record was still queued (or pending admission); it has been
    /// moved to `Cancelled` and the caller owns emitting the terminal
    /// event.
    WasQueued { user_id: Option<Arc<str>> },
    /// The record was running; only the cancel handle was fired. The
    /// executor observes the signal and emits the terminal event.
    WasRunning,
}

pub struct LifecycleRegistry {
    records: DashMap<Arc<str>, LifecycleRecord>,
    clock: Clock,
}

impl LifecycleRegistry {
    pub fn new(clock: Clock) -> Self {
        Self {
            records: DashMap::new(),
            clock,
        }
    }

    /// Insert a record in `PendingAdmit`. Rejects duplicate ids while a
    /// record for the same request is alive.
    pub(crate) fn record_pending(
        &self,
        spec: &TaskSpec,
        cancel: CancellationToken,
    ) -> Result<(), Error> {
        self.insert(spec, cancel, TaskState::PendingAdmit)
    }

    /// Insert a record directly in `Cancelled` (pre-admission abort).
    pub(crate) fn record_cancelled(
        &self,
        spec: &TaskSpec,
        cancel: CancellationToken,
    ) -> Result<(), Error> {
        self.insert(spec, cancel, TaskState::Cancelled)
    }

    fn insert(
        &self,
        spec: &TaskSpec,
        cancel: CancellationToken,
        state: TaskState,
    ) -> Result<(), Error> {
        let now = self.clock.monotonic_now();
        match self.records.entry(spec.request_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(Error::invalid_argument(
                "request_id",
                format!("duplicate request id '{}'", spec.request_id),
            )),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(LifecycleRecord::new(spec, cancel, state, now));
                Ok(())
            }
        }
    }

    /// Flip a `PendingAdmit` record to `Queued` with its admission
    /// stamps. Called under the admission lock.
    pub(crate) fn activate(
        &self,
        request_id: &str,
        enqueued_at_mono: Duration,
        enqueued_at_epoch_ms: i64,
    ) -> Result<(), Error> {
        let now = self.clock.monotonic_now();
        let mut rec = self.records.get_mut(request_id).ok_or_else(|| {
            Error::invalid_argument("request_id", format!("unknown request '{request_id}'"))
        })?;
        if !transition_allowed(rec.state, TaskState::Queued) {
            return Err(Error::InvalidState {
                request_id: request_id.to_string(),
                from: rec.state,
                to: TaskState::Queued,
            });
        }
        rec.enqueued_at_mono = enqueued_at_mono;
        rec.enqueued_at_epoch_ms = enqueued_at_epoch_ms;
        rec.state = TaskState::Queued;
        rec.history.push((TaskState::Queued, now));
        Ok(())
    }

    /// Remove a record that never got admitted (refused admission).
    pub(crate) fn remove_pending(&self, request_id: &str) {
        self.records
            .remove_if(request_id, |_, rec| rec.state == TaskState::PendingAdmit);
    }

    /// Snapshot of a record.
    pub fn get(&self, request_id: &str) -> Option<LifecycleRecord> {
        self.records.get(request_id).map(|r| r.clone())
    }

    pub fn state(&self, request_id: &str) -> Option<TaskState> {
        self.records.get(request_id).map(|r| r.state)
    }

    /// Enforced state-machine transition. Terminal states stamp
    /// `terminal_at`; illegal transitions fail with `InvalidState`.
    pub(crate) fn transition(&self, request_id: &str, to: TaskState) -> Result<(), Error> {
        let now = self.clock.monotonic_now();
        let mut rec = self.records.get_mut(request_id).ok_or_else(|| {
            Error::invalid_argument("request_id", format!("unknown request '{request_id}'"))
        })?;
        if !transition_allowed(rec.state, to) {
            return Err(Error::InvalidState {
                request_id: request_id.to_string(),
                from: rec.state,
                to,
            });
        }
        rec.state = to;
        rec.history.push((to, now));
        if to.is_terminal() {
            rec.terminal_at = Some(now);
        }
        Ok(())
    }

    pub(crate) fn set_attempt(&self, request_id: &str, attempt: u32) {
        if let Some(mut rec) = self.records.get_mut(request_id) {
            rec.attempt = attempt;
        }
    }

    /// Cancel a request. No-op (returning `None`) on missing or
    /// terminal records. Queued/pending records are moved to
    /// `Cancelled` atomically under the shard lock; running records
    /// only get their handle fired.
    pub(crate) fn cancel(&self, request_id: &str) -> Option<CancelOutcome> {
        let now = self.clock.monotonic_now();
        let mut rec = self.records.get_mut(request_id)?;
        if rec.state.is_terminal() {
            return None;
        }
        rec.cancel.cancel();
        match rec.state {
            TaskState::Queued | TaskState::PendingAdmit => {
                rec.state = TaskState::Cancelled;
                rec.history.push((TaskState::Cancelled, now));
                rec.terminal_at = Some(now);
                Some(CancelOutcome::WasQueued {
                    user_id: rec.user_id.clone(),
                })
            }
            TaskState::Running => Some(CancelOutcome::WasRunning),
            // Terminal states handled above.
            _ => None,
        }
    }

    /// Cancel every non-terminal record (abort-mode shutdown). Returns
    /// the queued-side cancellations so the caller can emit their
    /// terminal events.
    pub(crate) fn cancel_all(&self) -> Vec<(Arc<str>, Option<Arc<str>>)> {
        let now = self.clock.monotonic_now();
        let mut was_queued = Vec::new();
        for mut rec in self.records.iter_mut() {
            if rec.state.is_terminal() {
                continue;
            }
            rec.cancel.cancel();
            if matches!(rec.state, TaskState::Queued | TaskState::PendingAdmit) {
                rec.state = TaskState::Cancelled;
                rec.history.push((TaskState::Cancelled, now));
                rec.terminal_at = Some(now);
                was_queued.push((rec.request_id.clone(), rec.user_id.clone()));
            }
        }
        was_queued
    }

    /// Drop terminal records older than `grace`. Returns how many were
    /// purged.
    pub fn purge_after(&self, grace: Duration) -> usize {
        let now = self.clock.monotonic_now();
        let before = self.records.len();
        self.records.retain(|_, rec| match rec.terminal_at {
            Some(t) => now.saturating_sub(t) < grace,
            None => true,
        });
        before - self.records.len()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
