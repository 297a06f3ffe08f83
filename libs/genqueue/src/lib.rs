//! # Genqueue: server-side generation queue
//!
//! A concurrency-bounded, priority-aware task scheduler that mediates
//! between many concurrent callers (HTTP handlers enqueueing
//! image-generation work) and a bounded pool of worker slots executing
//! each task's asynchronous function.
//!
//! The scheduler owns admission control, prioritisation, cancellation,
//! timeouts, retries, per-user rate-limiter bookkeeping and structured
//! telemetry. Everything else (HTTP, persistence, providers) stays
//! outside and talks to it through [`QueueManager`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use genqueue::{EnqueueOptions, Priority, QueueBuilder};
//!
//! # async fn example() -> Result<(), genqueue::Error> {
//! let queue = QueueBuilder::<String>::new().build()?;
//!
//! let handle = queue.add_to_queue(
//!     |cancel| async move {
//!         // Call the image provider; honour `cancel`.
//!         let _ = cancel;
//!         Ok("image-url".to_string())
//!     },
//!     EnqueueOptions::new().user_id("u1").priority(Priority::High),
//! )?;
//!
//! let url = handle.wait().await?;
//! # let _ = url;
//! # Ok(())
//! # }
//! ```

pub mod analytics;
pub mod cancel;
pub mod clock;
pub mod error;
mod executor;
pub mod init;
pub mod lifecycle;
pub mod manager;
pub mod queue;
pub mod rate_limit;
pub mod registry;
pub mod retry;
pub mod shutdown;
pub mod signal;
pub mod validate;

// The strongly-typed config section lives in the runtime crate so the
// embedding binary can load it alongside logging settings.
pub use runtime::config::QueueConfig;

pub use analytics::{Action, Analytics, AnalyticsEvent, AnalyticsSink, MemorySink, TracingSink};
pub use cancel::is_cancellation;
pub use clock::{Clock, ManualClock};
pub use error::{EnqueueCancel, Error, ErrorKind, TaggedError};
pub use init::QueueBuilder;
pub use manager::{JobHandle, QueueManager};
pub use queue::{PriorityQueueCore, QueueMetrics, TaskFn, TaskFuture};
pub use rate_limit::RateLimiter;
pub use registry::{LifecycleRecord, LifecycleRegistry, TaskState};
pub use retry::RetryPolicy;
pub use shutdown::{ShutdownMode, ShutdownOptions, ShutdownOutcome, ShutdownState};
pub use signal::AbortSignal;
pub use validate::{EnqueueOptions, Priority, Validator};
