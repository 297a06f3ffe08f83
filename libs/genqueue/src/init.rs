//! Deterministic construction of the queue bundle.
//!
//! Components are built in one fixed order (clock → analytics → rate
//! limiter → lifecycle registry → validator → retry policy → queue
//! core → executor → shutdown → manager; signal handling is
//! stateless), the background workers are started, and a final
//! completeness check fails fast if any piece of the bundle did not
//! come up.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;

use runtime::config::QueueConfig;

use crate::analytics::{self, Analytics, AnalyticsSink, TracingSink};
use crate::clock::Clock;
use crate::error::Error;
use crate::executor::TaskExecutor;
use crate::lifecycle::Lifecycle;
use crate::manager::QueueManager;
use crate::queue::PriorityQueueCore;
use crate::rate_limit::RateLimiter;
use crate::registry::LifecycleRegistry;
use crate::retry::RetryPolicy;
use crate::shutdown::ShutdownManager;
use crate::validate::Validator;

/// Builder for a fully-wired `QueueManager`.
///
/// Must be called from within a Tokio runtime: building starts the
/// dispatcher, the analytics drain, the registry janitor and the
/// rate-limiter sweeper.
pub struct QueueBuilder<T> {
    config: Option<QueueConfig>,
    clock: Option<Clock>,
    sink: Option<Arc<dyn AnalyticsSink>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Send + 'static> QueueBuilder<T> {
    pub fn new() -> Self {
        Self {
            config: None,
            clock: None,
            sink: None,
            _marker: PhantomData,
        }
    }

    pub fn config(mut self, config: QueueConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn AnalyticsSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn build(self) -> Result<Arc<QueueManager<T>>, Error> {
        let config = self.config.unwrap_or_default();
        validate_config(&config)?;

        let clock = self.clock.unwrap_or_default();
        let sink = self.sink.unwrap_or_else(|| Arc::new(TracingSink));

        let (analytics, events_rx) =
            Analytics::channel(config.analytics_buffer_capacity, clock.clone());
        let rate_limiter = RateLimiter::new(&config, clock.clone(), analytics.clone());
        let registry = Arc::new(LifecycleRegistry::new(clock.clone()));
        let validator = Validator::new(config.clone());
        let retry = RetryPolicy::from_config(&config);
        let core = PriorityQueueCore::new(config.concurrency, config.max_queue_size);
        let executor = Arc::new(TaskExecutor::new(
            core.clone(),
            registry.clone(),
            analytics.clone(),
            retry,
            rate_limiter.clone(),
            clock.clone(),
        ));

        let drain_worker = Lifecycle::new();
        drain_worker
            .start({
                let sink = sink.clone();
                let dropped = analytics.dropped_handle();
                let clock = clock.clone();
                move |cancel| analytics::drain(events_rx, sink, dropped, clock, cancel)
            })
            .map_err(|_| bundle_error("analytics drain"))?;

        let dispatcher = Lifecycle::new();
        dispatcher
            .start({
                let core = core.clone();
                let registry = registry.clone();
                let executor = executor.clone();
                move |cancel| core.dispatch_loop(registry, executor, cancel)
            })
            .map_err(|_| bundle_error("dispatcher"))?;

        let janitor = Lifecycle::new();
        let grace = Duration::from_millis(config.lifecycle_terminal_grace_ms);
        janitor
            .start({
                let registry = registry.clone();
                move |cancel| async move {
                    let mut interval =
                        tokio::time::interval(grace.max(Duration::from_millis(10)));
                    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    loop {
                        tokio::select! {
                            _ = interval.tick() => { registry.purge_after(grace); }
                            _ = cancel.cancelled() => break,
                        }
                    }
                    Ok(())
                }
            })
            .map_err(|_| bundle_error("lifecycle janitor"))?;

        if !rate_limiter.restart() {
            return Err(bundle_error("rate limiter cleanup"));
        }

        let shutdown = ShutdownManager::new(
            core.clone(),
            registry.clone(),
            analytics.clone(),
            rate_limiter.clone(),
            clock.clone(),
            dispatcher,
            janitor,
            drain_worker,
            Duration::from_millis(config.shutdown_default_deadline_ms),
        );

        let manager = QueueManager::new(
            config,
            clock,
            validator,
            core,
            registry,
            analytics,
            rate_limiter,
            shutdown,
        );

        // Bundle completeness: every required piece must be live.
        for (name, ok) in manager.bundle_status() {
            if !ok {
                return Err(bundle_error(name));
            }
        }

        Ok(Arc::new(manager))
    }
}

impl<T: Send + 'static> Default for QueueBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn bundle_error(name: &str) -> Error {
    Error::Initialization(format!("bundle failed to return {name}"))
}

fn validate_config(cfg: &QueueConfig) -> Result<(), Error> {
    if cfg.concurrency == 0 {
        return Err(Error::Initialization(
            "config: concurrency must be >= 1".into(),
        ));
    }
    if cfg.max_queue_size == 0 {
        return Err(Error::Initialization(
            "config: max_queue_size must be >= 1".into(),
        ));
    }
    if cfg.default_timeout_ms == 0 || cfg.default_timeout_ms > cfg.max_timeout_ms {
        return Err(Error::Initialization(
            "config: default_timeout_ms must be positive and <= max_timeout_ms".into(),
        ));
    }
    if cfg.retry_base_ms == 0 || cfg.retry_base_ms > cfg.retry_max_ms {
        return Err(Error::Initialization(
            "config: retry_base_ms must be positive and <= retry_max_ms".into(),
        ));
    }
    if cfg.analytics_buffer_capacity == 0 {
        return Err(Error::Initialization(
            "config: analytics_buffer_capacity must be >= 1".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn build_with_defaults_brings_up_the_bundle() {
        let manager = QueueBuilder::<u32>::new().build().unwrap();
        assert_eq!(manager.metrics().active_jobs, 0);
        assert_eq!(manager.metrics().queue_size, 0);
        for (name, ok) in manager.bundle_status() {
            assert!(ok, "{name} must be running");
        }
        manager
            .shutdown(crate::shutdown::ShutdownOptions::drain())
            .await;
    }

    #[tokio::test]
    async fn invalid_config_fails_fast() {
        for cfg in [
            QueueConfig {
                concurrency: 0,
                ..QueueConfig::default()
            },
            QueueConfig {
                max_queue_size: 0,
                ..QueueConfig::default()
            },
            QueueConfig {
                default_timeout_ms: 0,
                ..QueueConfig::default()
            },
            QueueConfig {
                retry_base_ms: 100,
                retry_max_ms: 10,
                ..QueueConfig::default()
            },
            QueueConfig {
                analytics_buffer_capacity: 0,
                ..QueueConfig::default()
            },
        ] {
            let err = QueueBuilder::<u32>::new().config(cfg).build().unwrap_err();
            assert_eq!(err.kind(), crate::error::ErrorKind::Initialization);
        }
    }
}
