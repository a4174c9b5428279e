//! Shared defaults for timeouts, intervals and limits.

/// PM loop scheduling tick.
pub const DEFAULT_TICK_INTERVAL_SECS: u64 = 5;

/// Interval at which workers are expected to heartbeat.
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// A worker that has not heartbeat for two intervals is `offline`.
pub const DEFAULT_LIVENESS_CUTOFF_SECS: u64 = 2 * DEFAULT_HEARTBEAT_INTERVAL_SECS;

/// In-flight assignment caps.
pub const DEFAULT_MAX_IN_FLIGHT_PER_PHASE: usize = 1;
pub const DEFAULT_MAX_IN_FLIGHT_PER_PROJECT: usize = 4;

/// CAS retry budgets for the idempotent actors.
pub const DEFAULT_DISPATCH_RETRIES: u32 = 3;
pub const DEFAULT_INGEST_RETRIES: u32 = 3;

/// Janitor sweep cadence and the idle threshold for claiming stale results.
pub const DEFAULT_JANITOR_SWEEP_SECS: u64 = 30;
pub const DEFAULT_CLAIM_IDLE_MS: u64 = 60_000;

/// Work streams are bounded to this many retained entries.
pub const DEFAULT_STREAM_TRIM_LEN: usize = 1000;

/// Dispatch pauses above the high watermark and resumes below the low one.
pub const DEFAULT_BACKPRESSURE_HIGH: usize = 1000;
pub const DEFAULT_BACKPRESSURE_LOW: usize = 500;

/// Per-subscriber board event buffer; oldest events drop on overflow.
pub const DEFAULT_BOARD_BUFFER: usize = 256;

/// Blocking window for one stream consume call.
pub const DEFAULT_CONSUME_BLOCK_MS: u64 = 1000;

/// Batch size for one ingester consume call.
pub const DEFAULT_INGEST_BATCH: usize = 10;

/// Exponential backoff schedule for retriable store/queue failures.
pub const BACKOFF_SCHEDULE_MS: [u64; 3] = [100, 400, 1600];
