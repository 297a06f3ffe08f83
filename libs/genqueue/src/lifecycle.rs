//! Control handles for the queue's resident workers.
//!
//! Four long-lived loops keep the scheduler moving: the dispatcher,
//! the analytics drain, the rate-limiter sweeper and the registry
//! janitor. Each one is owned through a `Lifecycle` handle that can
//! spawn the loop exactly once, deliver a stop signal, and bound how
//! long winding down may take before the task is cut loose.
//!
//! The handle never forces anything while the worker cooperates: the
//! loop observes its token and returns, and its exit is visible
//! through the `done` flag it flips on the way out. Only a worker
//! that outlives the stop grace is aborted.

use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicBool, AtomicU8, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Result returned by worker loops.
type WorkerResult<T = ()> = anyhow::Result<T>;

/// Where a worker is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Stopped,
    Running,
    Stopping,
}

impl Status {
    #[inline]
    pub const fn as_u8(self) -> u8 {
        match self {
            Status::Stopped => 0,
            Status::Running => 1,
            Status::Stopping => 2,
        }
    }

    #[inline]
    pub const fn from_u8(x: u8) -> Self {
        match x {
            1 => Status::Running,
            2 => Status::Stopping,
            _ => Status::Stopped,
        }
    }
}

/// How a stop resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The worker had already exited on its own.
    Finished,
    /// The worker observed the stop signal and returned within grace.
    Cancelled,
    /// The grace elapsed first; the worker was aborted.
    Timeout,
}

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("already started")]
    AlreadyStarted,
}

/// Handle owning one resident worker loop.
pub struct Lifecycle {
    phase: AtomicU8,
    /// Join handle and stop token for the spawned loop, each drained
    /// at most once behind a short-lived lock.
    join: Mutex<Option<JoinHandle<()>>>,
    stop_token: Mutex<Option<CancellationToken>>,
    /// Flipped by the worker itself on the way out.
    done: Arc<AtomicBool>,
    done_notify: Arc<Notify>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            phase: AtomicU8::new(Status::Stopped.as_u8()),
            join: Mutex::new(None),
            stop_token: Mutex::new(None),
            done: Arc::new(AtomicBool::new(false)),
            done_notify: Arc::new(Notify::new()),
        }
    }

    /// Spawn the worker loop with a fresh stop token.
    pub fn start<F, Fut>(&self, make: F) -> Result<(), LifecycleError>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = WorkerResult> + Send + 'static,
    {
        self.start_with_token(CancellationToken::new(), make)
    }

    /// Spawn the worker loop on a caller-owned token, so an outer
    /// shutdown signal reaches the loop directly.
    pub fn start_with_token<F, Fut>(
        &self,
        token: CancellationToken,
        make: F,
    ) -> Result<(), LifecycleError>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = WorkerResult> + Send + 'static,
    {
        // A loop that ran to completion on its own left no phase mark;
        // fold its exit in before admitting a new one.
        if self.done.load(Ordering::Acquire) {
            self.phase
                .store(Status::Stopped.as_u8(), Ordering::Release);
        }

        // One worker per handle. Losing this race means a loop is
        // already (or still) attached; the sweeper's restart() turns
        // that into its no-op event.
        if self
            .phase
            .compare_exchange(
                Status::Stopped.as_u8(),
                Status::Running.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(LifecycleError::AlreadyStarted);
        }

        self.done.store(false, Ordering::Release);
        *self.stop_token.lock() = Some(token.clone());

        let done = self.done.clone();
        let done_notify = self.done_notify.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = make(token).await {
                tracing::error!(error = %e, "queue worker exited with error");
            }
            done.store(true, Ordering::Release);
            done_notify.notify_waiters();
        });
        *self.join.lock() = Some(handle);

        Ok(())
    }

    /// Deliver the stop signal and wait up to `grace` for the loop to
    /// come back. A worker deaf to its token is aborted once the
    /// grace runs out, so a wedged drain or sweeper cannot hold up
    /// queue shutdown.
    pub async fn stop(&self, grace: Duration) -> StopReason {
        if self.status() == Status::Stopped {
            return StopReason::Finished;
        }
        self.phase
            .store(Status::Stopping.as_u8(), Ordering::Release);

        // Whoever drains the token slot delivers the signal; racing
        // callers fall through and just wait alongside.
        let signalled = match self.stop_token.lock().take() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        };

        let within_grace = tokio::select! {
            _ = self.wait_stopped() => true,
            _ = tokio::time::sleep(grace) => false,
        };

        // Reap the task exactly once.
        let leftover = self.join.lock().take();
        if let Some(task) = leftover {
            if !within_grace && !task.is_finished() {
                tracing::warn!("queue worker ignored its stop signal; aborting");
                task.abort();
            }
            match task.await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => tracing::debug!("queue worker aborted"),
                Err(e) => tracing::warn!(error = %e, "queue worker panicked"),
            }
            self.done.store(true, Ordering::Release);
            self.done_notify.notify_waiters();
        }

        self.phase
            .store(Status::Stopped.as_u8(), Ordering::Release);
        let reason = if !within_grace {
            StopReason::Timeout
        } else if signalled {
            StopReason::Cancelled
        } else {
            StopReason::Finished
        };
        tracing::debug!(?reason, "queue worker stopped");
        reason
    }

    /// Current phase. A worker that exited on its own reads as
    /// `Stopped` even before anyone calls `stop`.
    #[inline]
    #[must_use]
    pub fn status(&self) -> Status {
        if self.done.load(Ordering::Acquire) {
            return Status::Stopped;
        }
        Status::from_u8(self.phase.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.status() == Status::Running
    }

    /// Park until the worker has fully exited.
    pub async fn wait_stopped(&self) {
        loop {
            // Register interest before checking, so an exit landing
            // between the check and the await is not lost.
            let mut parked = std::pin::pin!(self.done_notify.notified());
            parked.as_mut().enable();
            if self.done.load(Ordering::Acquire) {
                return;
            }
            parked.await;
        }
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Lifecycle {
    /// A handle dropped without `stop()` takes its worker down with
    /// it; the queue never leaves a dispatcher or sweeper orphaned
    /// behind a dead handle.
    fn drop(&mut self) {
        if let Some(token) = self.stop_token.get_mut().take() {
            token.cancel();
        }
        if let Some(task) = self.join.get_mut().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering as AOrd};
    use tokio::time::{sleep, Duration};

    #[tokio::test]
    async fn drives_a_dispatcher_style_loop_from_start_to_stop() {
        let lc = Lifecycle::new();
        assert_eq!(lc.status(), Status::Stopped);

        lc.start(|stop| async move {
            // Stands in for the dispatch loop: park until told to go.
            stop.cancelled().await;
            Ok(())
        })
        .unwrap();
        assert!(lc.is_running());

        let reason = lc.stop(Duration::from_millis(100)).await;
        assert_eq!(reason, StopReason::Cancelled);
        assert_eq!(lc.status(), Status::Stopped);
    }

    #[tokio::test]
    async fn sweeper_style_interval_loop_ticks_until_stopped() {
        let ticks = Arc::new(AtomicU32::new(0));
        let lc = Lifecycle::new();

        let counter = ticks.clone();
        lc.start(move |stop| async move {
            let mut every = tokio::time::interval(Duration::from_millis(5));
            loop {
                tokio::select! {
                    _ = every.tick() => { counter.fetch_add(1, AOrd::Relaxed); }
                    _ = stop.cancelled() => return Ok(()),
                }
            }
        })
        .unwrap();

        sleep(Duration::from_millis(40)).await;
        let _ = lc.stop(Duration::from_millis(100)).await;
        assert!(ticks.load(AOrd::Relaxed) >= 2);
        assert_eq!(lc.status(), Status::Stopped);
    }

    #[tokio::test]
    async fn second_start_is_refused_while_a_worker_is_attached() {
        // Backs the sweeper's restart() contract: restarting a running
        // cleanup must surface as a refusal, not a second loop.
        let lc = Lifecycle::new();
        lc.start(|stop| async move {
            stop.cancelled().await;
            Ok(())
        })
        .unwrap();

        assert!(matches!(
            lc.start(|_| async { Ok(()) }),
            Err(LifecycleError::AlreadyStarted)
        ));

        let _ = lc.stop(Duration::from_millis(80)).await;

        // After a clean stop the handle accepts a fresh loop.
        assert!(lc
            .start(|stop| async move {
                stop.cancelled().await;
                Ok(())
            })
            .is_ok());
        let _ = lc.stop(Duration::from_millis(80)).await;
    }

    #[tokio::test]
    async fn a_worker_deaf_to_its_stop_signal_is_cut_loose() {
        let lc = Lifecycle::new();
        lc.start(|_stop| async move {
            // Deliberately ignores the token, like a wedged drain loop.
            loop {
                sleep(Duration::from_secs(600)).await;
            }
            #[allow(unreachable_code)]
            Ok::<_, anyhow::Error>(())
        })
        .unwrap();

        let reason = lc.stop(Duration::from_millis(30)).await;
        assert_eq!(reason, StopReason::Timeout);
        assert_eq!(lc.status(), Status::Stopped);
    }

    #[tokio::test]
    async fn racing_stops_settle_with_a_single_signal() {
        let lc = Arc::new(Lifecycle::new());
        lc.start(|stop| async move {
            stop.cancelled().await;
            Ok(())
        })
        .unwrap();

        let a = lc.clone();
        let b = lc.clone();
        let (ra, rb) = tokio::join!(
            async move { a.stop(Duration::from_millis(80)).await },
            async move { b.stop(Duration::from_millis(80)).await },
        );

        // Only the caller that drained the token slot reports the
        // cancellation; both come back with a settled worker.
        assert!(matches!(ra, StopReason::Cancelled | StopReason::Finished));
        assert!(matches!(rb, StopReason::Cancelled | StopReason::Finished));
        assert_eq!(lc.status(), Status::Stopped);
    }

    #[tokio::test]
    async fn natural_exit_is_visible_without_a_stop() {
        let lc = Lifecycle::new();
        lc.start(|_stop| async move { Ok(()) }).unwrap();

        lc.wait_stopped().await;
        assert_eq!(lc.status(), Status::Stopped);

        // Stopping an already-finished worker is a quiet no-op.
        assert_eq!(
            lc.stop(Duration::from_millis(10)).await,
            StopReason::Finished
        );

        // And the handle can host the next loop.
        assert!(lc
            .start(|stop| async move {
                stop.cancelled().await;
                Ok(())
            })
            .is_ok());
        let _ = lc.stop(Duration::from_millis(80)).await;
    }

    #[tokio::test]
    async fn a_shared_shutdown_token_reaches_the_worker() {
        let shutdown = CancellationToken::new();
        let lc = Lifecycle::new();
        lc.start_with_token(shutdown.clone(), |stop| async move {
            stop.cancelled().await;
            Ok(())
        })
        .unwrap();

        shutdown.cancel();
        lc.wait_stopped().await;
        assert_eq!(lc.status(), Status::Stopped);
    }
}
