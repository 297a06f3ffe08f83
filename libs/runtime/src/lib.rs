//! Process-level runtime support for the generation queue: layered
//! configuration loading and logging bootstrap.
//!
//! This crate is intentionally small. The scheduler core lives in
//! `genqueue`; everything here is ambient plumbing shared by any
//! binary embedding the queue.

pub mod config;
pub mod logging;

pub use config::{default_logging_config, AppConfig, LoggingConfig, QueueConfig, Section};
pub use logging::init_logging_from_config;
