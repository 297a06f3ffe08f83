//! Shutdown sequencing scenarios.

mod common;

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use genqueue::{
    Action, EnqueueOptions, ErrorKind, ShutdownOptions, ShutdownOutcome, ShutdownState, TaskState,
};
use tokio::sync::Notify;

use common::{build, config};

const WAIT: Duration = Duration::from_secs(3);

#[tokio::test]
async fn drain_waits_for_queued_and_running_work() {
    let h = build(config(1, 10));

    let mut handles = Vec::new();
    for i in 0..3 {
        handles.push(
            h.queue
                .add_to_queue(
                    |_cancel| async {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(0)
                    },
                    EnqueueOptions::new().request_id(format!("d{i}")),
                )
                .unwrap(),
        );
    }

    let outcome = h.queue.shutdown(ShutdownOptions::drain()).await;
    assert_eq!(outcome, ShutdownOutcome::Drained);
    assert_eq!(h.queue.shutdown_state(), ShutdownState::Closed);

    // All work finished before the queue closed.
    for handle in handles {
        handle.wait().await.unwrap();
    }
    assert_eq!(h.queue.metrics().active_jobs, 0);
    assert_eq!(h.queue.metrics().queue_size, 0);
    assert_eq!(h.sink.count(Action::TaskCompleted), 3);
    assert_eq!(h.sink.count(Action::ShutdownStarted), 1);
    assert_eq!(h.sink.count(Action::ShutdownCompleted), 1);
}

#[tokio::test]
async fn admission_is_rejected_while_shutting_down() {
    let h = build(config(1, 10));

    // A parked task keeps the drain in progress.
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let blocker = {
        let started = started.clone();
        let release = release.clone();
        h.queue
            .add_to_queue(
                move |_cancel| {
                    let started = started.clone();
                    let release = release.clone();
                    async move {
                        started.notify_one();
                        release.notified().await;
                        Ok(0)
                    }
                },
                EnqueueOptions::new().request_id("blocker"),
            )
            .unwrap()
    };
    started.notified().await;

    let queue = h.queue.clone();
    let shutdown_task = tokio::spawn(async move { queue.shutdown(ShutdownOptions::drain()).await });

    // Keep trying until the admission gate is observably closed.
    let err = tokio::time::timeout(WAIT, async {
        let mut i = 0u32;
        loop {
            match h.queue.add_to_queue(
                |_cancel| async { Ok(0) },
                EnqueueOptions::new().request_id(format!("late{i}")),
            ) {
                Err(e) => break e,
                Ok(_accepted_before_close) => {
                    i += 1;
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            }
        }
    })
    .await
    .expect("admission must close");
    assert_eq!(err.kind(), ErrorKind::QueueFull);

    // The rejection is observable while the drain worker still runs,
    // and it names its cause.
    let seen = h.sink.wait_for(Action::TaskEnqueueRejected, 1, WAIT).await;
    assert!(seen >= 1);
    assert!(h
        .sink
        .events()
        .iter()
        .any(|e| e.action == Action::TaskEnqueueRejected
            && e.reason.as_deref() == Some("shutdown")));

    release.notify_waiters();
    blocker.wait().await.unwrap();
    assert_eq!(shutdown_task.await.unwrap(), ShutdownOutcome::Drained);

    // After close, late admissions still fail fast; their telemetry is
    // counted as dropped rather than blocking the caller.
    let err = h
        .queue
        .add_to_queue(
            |_cancel| async { Ok(0) },
            EnqueueOptions::new().request_id("after-close"),
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::QueueFull);
}

#[tokio::test]
async fn abort_cancels_queued_and_running_work_exactly_once() {
    let h = build(config(1, 10));

    let started = Arc::new(Notify::new());
    let running = {
        let started = started.clone();
        h.queue
            .add_to_queue(
                move |cancel| {
                    let started = started.clone();
                    async move {
                        started.notify_one();
                        cancel.cancelled().await;
                        Err::<u32, _>(anyhow!("cancelled by user"))
                    }
                },
                EnqueueOptions::new().request_id("running").user_id("u1"),
            )
            .unwrap()
    };
    started.notified().await;

    let queued = h
        .queue
        .add_to_queue(
            |_cancel| async { Ok(0) },
            EnqueueOptions::new().request_id("queued").user_id("u2"),
        )
        .unwrap();

    let outcome = h.queue.shutdown(ShutdownOptions::abort()).await;
    assert_eq!(outcome, ShutdownOutcome::Aborted);

    assert_eq!(
        running.wait().await.unwrap_err().kind(),
        ErrorKind::Cancelled
    );
    assert_eq!(
        queued.wait().await.unwrap_err().kind(),
        ErrorKind::Cancelled
    );
    assert_eq!(h.queue.task_state("running"), Some(TaskState::Cancelled));
    assert_eq!(h.queue.task_state("queued"), Some(TaskState::Cancelled));

    // One terminal event per task, through two different paths.
    assert_eq!(h.sink.events_for("running").len(), 1);
    assert_eq!(h.sink.events_for("queued").len(), 1);
    assert_eq!(h.sink.count(Action::TaskCancelled), 2);
}

#[tokio::test]
async fn deadline_elapses_when_work_ignores_cancellation() {
    let h = build(config(1, 10));

    let _stubborn = h
        .queue
        .add_to_queue(
            |_cancel| async {
                // Deliberately ignores the cancellation signal.
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(0)
            },
            EnqueueOptions::new().request_id("stubborn"),
        )
        .unwrap();

    // Give the dispatcher a beat to start it.
    tokio::time::timeout(WAIT, async {
        while h.queue.metrics().active_jobs == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let outcome = h
        .queue
        .shutdown(ShutdownOptions::abort().with_deadline(Duration::from_millis(50)))
        .await;
    assert_eq!(outcome, ShutdownOutcome::DeadlineElapsed);
    assert_eq!(h.queue.shutdown_state(), ShutdownState::Closed);
}

#[tokio::test]
async fn shutdown_is_idempotent() {
    let h = build(config(1, 10));

    let first = h.queue.shutdown(ShutdownOptions::drain()).await;
    assert_eq!(first, ShutdownOutcome::Drained);

    // Later calls observe the closed state and the original outcome,
    // and nothing is re-emitted.
    let second = h.queue.shutdown(ShutdownOptions::abort()).await;
    assert_eq!(second, ShutdownOutcome::Drained);
    assert_eq!(h.sink.count(Action::ShutdownStarted), 1);
    assert_eq!(h.sink.count(Action::ShutdownCompleted), 1);
}

#[tokio::test]
async fn shutdown_events_are_flushed_before_the_drain_worker_stops() {
    let h = build(config(1, 10));

    h.queue.shutdown(ShutdownOptions::drain()).await;

    // No waiting: the drain worker was flushed during shutdown.
    assert_eq!(h.sink.count(Action::ShutdownStarted), 1);
    assert_eq!(h.sink.count(Action::ShutdownCompleted), 1);
}
