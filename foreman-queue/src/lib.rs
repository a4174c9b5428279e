//! Foreman Stream Queue - Durable Logs with Consumer Groups
//!
//! This crate defines the `StreamQueue` trait: append-only named logs with
//! named consumer groups, per-group pending lists, explicit acknowledgement,
//! and claim-on-stale for messages whose owner appears dead.
//!
//! Guarantees the rest of the system leans on:
//! - ordering within a stream is preserved
//! - delivery within a group is at-least-once
//! - a message stays on the group's pending list until `ack` or an explicit
//!   `claim` moves it
//!
//! Two implementations ship here: `InMemoryStreamQueue` for tests and
//! single-node runs, and `PgStreamQueue`, a durable log over Postgres
//! (`schema.sql` in this crate).

mod memory;
mod pg;
mod stream;

pub use memory::InMemoryStreamQueue;
pub use pg::{PgQueueConfig, PgStreamQueue};
pub use stream::{
    assign_stream, control_stream, GroupStart, PendingEntry, StreamMessage, StreamQueue,
    DLQ_STREAM, GROUP_INGESTERS, GROUP_WORKERS, RESULTS_STREAM,
};
