use std::fmt;
use std::time::Duration;

use crate::registry::TaskState;

/// Closed classification of every error the scheduler can produce.
///
/// Retry logic and callers branch on this, never on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    QueueFull,
    EnqueueCancelled,
    Cancelled,
    TimedOut,
    TaskFailed,
    RetryExhausted,
    Initialization,
    InvalidState,
}

/// Sentinel attached to pre-admission aborts so the cancellation
/// detector recognises them without inspecting messages.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("enqueue cancelled")]
pub struct EnqueueCancel;

/// Adapter for provider error shapes that carry a name, a code, or an
/// explicit cancelled flag instead of a distinct Rust type. Generation
/// functions wrap vendor errors in this so the detector can classify
/// them against its closed sets.
#[derive(Debug)]
pub struct TaggedError {
    name: Option<String>,
    code: Option<String>,
    is_cancelled: bool,
    message: String,
}

impl TaggedError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            name: None,
            code: None,
            is_cancelled: false,
            message: message.into(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn cancelled(mut self) -> Self {
        self.is_cancelled = true;
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    pub fn is_cancelled(&self) -> bool {
        self.is_cancelled
    }
}

impl fmt::Display for TaggedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for TaggedError {}

/// Scheduler error surfaced to callers and internals.
///
/// A caller only ever observes `InvalidArgument`, `QueueFull`,
/// `EnqueueCancelled`, `Cancelled`, or `RetryExhausted`; the remaining
/// variants are internal classifications and construction-time
/// failures.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid {field}: {reason}")]
    InvalidArgument { field: &'static str, reason: String },

    #[error("queue full: admission boundary {max_queue_size} reached")]
    QueueFull { max_queue_size: usize },

    #[error("request {request_id} cancelled before admission")]
    EnqueueCancelled {
        request_id: String,
        #[source]
        sentinel: EnqueueCancel,
    },

    #[error("request {request_id} cancelled")]
    Cancelled { request_id: String },

    #[error("request {request_id} timed out after {timeout:?} (attempt {retry_count})")]
    TimedOut {
        request_id: String,
        timeout: Duration,
        duration: Duration,
        retry_count: u32,
    },

    #[error("request {request_id} failed after {retry_count} retries")]
    RetryExhausted {
        request_id: String,
        duration: Duration,
        retry_count: u32,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    #[error("initialization failed: {0}")]
    Initialization(String),

    #[error("invalid lifecycle transition for {request_id}: {from:?} -> {to:?}")]
    InvalidState {
        request_id: String,
        from: TaskState,
        to: TaskState,
    },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Error::QueueFull { .. } => ErrorKind::QueueFull,
            Error::EnqueueCancelled { .. } => ErrorKind::EnqueueCancelled,
            Error::Cancelled { .. } => ErrorKind::Cancelled,
            Error::TimedOut { .. } => ErrorKind::TimedOut,
            Error::RetryExhausted { .. } => ErrorKind::RetryExhausted,
            Error::Initialization(_) => ErrorKind::Initialization,
            Error::InvalidState { .. } => ErrorKind::InvalidState,
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        match self {
            Error::EnqueueCancelled { request_id, .. }
            | Error::Cancelled { request_id }
            | Error::TimedOut { request_id, .. }
            | Error::RetryExhausted { request_id, .. }
            | Error::InvalidState { request_id, .. } => Some(request_id),
            _ => None,
        }
    }

    /// Monotonic duration from admission to the terminal outcome.
    pub fn duration(&self) -> Option<Duration> {
        match self {
            Error::TimedOut { duration, .. } | Error::RetryExhausted { duration, .. } => {
                Some(*duration)
            }
            _ => None,
        }
    }

    /// Retries consumed before the terminal outcome.
    pub fn retry_count(&self) -> Option<u32> {
        match self {
            Error::TimedOut { retry_count, .. } | Error::RetryExhausted { retry_count, .. } => {
                Some(*retry_count)
            }
            _ => None,
        }
    }

    pub fn invalid_argument(field: &'static str, reason: impl Into<String>) -> Self {
        Error::InvalidArgument {
            field,
            reason: reason.into(),
        }
    }

    pub fn enqueue_cancelled(request_id: impl Into<String>) -> Self {
        Error::EnqueueCancelled {
            request_id: request_id.into(),
            sentinel: EnqueueCancel,
        }
    }

    pub fn cancelled(request_id: impl Into<String>) -> Self {
        Error::Cancelled {
            request_id: request_id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_match_variants() {
        assert_eq!(
            Error::invalid_argument("priority", "bad").kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(
            Error::QueueFull { max_queue_size: 3 }.kind(),
            ErrorKind::QueueFull
        );
        assert_eq!(
            Error::enqueue_cancelled("r1").kind(),
            ErrorKind::EnqueueCancelled
        );
        assert_eq!(Error::cancelled("r1").kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn enqueue_cancelled_carries_the_sentinel() {
        let err = Error::enqueue_cancelled("r1");
        let source = std::error::Error::source(&err).expect("sentinel source");
        assert!(source.downcast_ref::<EnqueueCancel>().is_some());
    }

    #[test]
    fn retry_exhausted_exposes_duration_and_count() {
        let err = Error::RetryExhausted {
            request_id: "r9".into(),
            duration: Duration::from_millis(1500),
            retry_count: 3,
            source: Box::new(TaggedError::new("backend exploded")),
        };
        assert_eq!(err.request_id(), Some("r9"));
        assert_eq!(err.retry_count(), Some(3));
        assert_eq!(err.duration(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn tagged_error_builder() {
        let e = TaggedError::new("aborted upstream")
            .with_name("AbortError")
            .with_code("ABORT_ERR");
        assert_eq!(e.name(), Some("AbortError"));
        assert_eq!(e.code(), Some("ABORT_ERR"));
        assert!(!e.is_cancelled());
        assert_eq!(e.to_string(), "aborted upstream");
    }
}
