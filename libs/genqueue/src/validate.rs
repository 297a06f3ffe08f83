//! Enqueue-request validation.
//!
//! Single normalisation point: every duck-shaped thing a caller can
//! pass (priority tags or numbers, optional ids, optional bounds)
//! becomes a fully-populated `TaskSpec` here or the request fails with
//! `InvalidArgument` naming the offending field.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use runtime::config::QueueConfig;

use crate::clock::Clock;
use crate::error::Error;
use crate::signal::AbortSignal;

/// Priority as callers express it: a tag or a raw number.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Priority {
    High,
    Normal,
    Low,
    Value(f64),
}

impl Priority {
    /// Tag mapping {high, normal, low} → {10, 0, −10}; numbers are
    /// clamped to [−100, 100]; non-finite input coerces to the default
    /// bucket.
    pub fn normalized(self) -> i32 {
        match self {
            Priority::High => 10,
            Priority::Normal => 0,
            Priority::Low => -10,
            Priority::Value(v) => {
                if v.is_finite() {
                    v.clamp(-100.0, 100.0).round() as i32
                } else {
                    0
                }
            }
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            other => Err(Error::invalid_argument(
                "priority",
                format!("unknown tag '{other}'"),
            )),
        }
    }
}

impl From<f64> for Priority {
    fn from(v: f64) -> Self {
        Priority::Value(v)
    }
}

/// Options recognised on enqueue. All fields optional; unset fields
/// take config defaults during validation.
#[derive(Debug, Default)]
pub struct EnqueueOptions {
    pub request_id: Option<String>,
    pub user_id: Option<String>,
    pub priority: Option<Priority>,
    pub timeout_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub abort_signal: Option<AbortSignal>,
    /// Legacy alias for `abort_signal`; canonicalised away before
    /// validation (`signal::normalize`).
    pub signal: Option<AbortSignal>,
    /// Internal clock override. Stripped by the façade; never reaches
    /// the queue core.
    pub clock: Option<Clock>,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    pub fn user_id(mut self, id: impl Into<String>) -> Self {
        self.user_id = Some(id.into());
        self
    }

    pub fn priority(mut self, p: Priority) -> Self {
        self.priority = Some(p);
        self
    }

    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = Some(n);
        self
    }

    pub fn abort_signal(mut self, s: AbortSignal) -> Self {
        self.abort_signal = Some(s);
        self
    }

    pub fn signal(mut self, s: AbortSignal) -> Self {
        self.signal = Some(s);
        self
    }
}

/// Fully-validated task parameters handed to the queue core. No
/// optional fields and no internal-only keys survive past this point.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub request_id: Arc<str>,
    pub user_id: Option<Arc<str>>,
    pub priority: i32,
    pub timeout: Duration,
    pub max_retries: u32,
    pub abort_signal: AbortSignal,
}

/// Bounds-checks and normalises enqueue requests.
#[derive(Debug, Clone)]
pub struct Validator {
    cfg: QueueConfig,
}

impl Validator {
    pub fn new(cfg: QueueConfig) -> Self {
        Self { cfg }
    }

    /// Options must already be canonical (`signal` merged away).
    pub fn validate(&self, opts: EnqueueOptions) -> Result<TaskSpec, Error> {
        debug_assert!(opts.signal.is_none(), "options not canonicalised");

        let request_id: Arc<str> = match opts.request_id {
            Some(id) if id.trim().is_empty() => {
                return Err(Error::invalid_argument("request_id", "must not be empty"));
            }
            Some(id) => Arc::from(id.as_str()),
            None => Arc::from(uuid::Uuid::new_v4().to_string().as_str()),
        };

        let user_id = opts.user_id.map(|u| Arc::from(u.as_str()));

        let priority = opts.priority.unwrap_or_default().normalized();

        let timeout_ms = match opts.timeout_ms {
            Some(0) => {
                return Err(Error::invalid_argument("timeout_ms", "must be positive"));
            }
            Some(t) => t.min(self.cfg.max_timeout_ms),
            None => self.cfg.default_timeout_ms,
        };

        let max_retries = opts.max_retries.unwrap_or(self.cfg.default_max_retries);

        Ok(TaskSpec {
            request_id,
            user_id,
            priority,
            timeout: Duration::from_millis(timeout_ms),
            max_retries,
            abort_signal: opts.abort_signal.unwrap_or_default(),
        })
    }

    /// Concurrency updates must be ≥ 1.
    pub fn validate_concurrency(n: usize) -> Result<usize, Error> {
        if n == 0 {
            return Err(Error::invalid_argument("concurrency", "must be >= 1"));
        }
        Ok(n)
    }
}
