//! Shared harness for the end-to-end scheduler tests.

use std::sync::Arc;

use genqueue::{MemorySink, QueueBuilder, QueueConfig, QueueManager};

pub struct Harness {
    pub queue: Arc<QueueManager<u32>>,
    pub sink: Arc<MemorySink>,
}

/// Fast-retry config used by most scenarios.
pub fn config(concurrency: usize, max_queue_size: usize) -> QueueConfig {
    QueueConfig {
        concurrency,
        max_queue_size,
        default_timeout_ms: 5_000,
        max_timeout_ms: 60_000,
        default_max_retries: 0,
        retry_base_ms: 10,
        retry_max_ms: 500,
        lifecycle_terminal_grace_ms: 60_000,
        shutdown_default_deadline_ms: 5_000,
        analytics_buffer_capacity: 256,
        ..QueueConfig::default()
    }
}

pub fn build(cfg: QueueConfig) -> Harness {
    let sink = Arc::new(MemorySink::default());
    let queue = QueueBuilder::<u32>::new()
        .config(cfg)
        .sink(sink.clone())
        .build()
        .expect("queue bundle");
    Harness { queue, sink }
}
