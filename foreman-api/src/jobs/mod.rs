//! Background jobs.

pub mod janitor;

pub use janitor::{janitor_task, JanitorConfig, JanitorMetrics};
