//! Pending-results janitor.
//!
//! Sweeps the `ingesters` pending list every 30 seconds, claiming any result
//! message idle for more than 60 seconds onto a fresh consumer and running
//! it through the ingester again. At-least-once delivery plus the version
//! check make the re-run safe.
//!
//! The janitor also bounds the durable work streams: entries beyond the
//! retention length are trimmed oldest-first. It never touches assignments
//! for `in_progress` tasks; recovering a crashed worker's task is an
//! operator action.

use crate::constants::{
    DEFAULT_CLAIM_IDLE_MS, DEFAULT_JANITOR_SWEEP_SECS, DEFAULT_STREAM_TRIM_LEN,
};
use crate::services::ResultIngester;
use foreman_queue::{StreamQueue, DLQ_STREAM, GROUP_INGESTERS, RESULTS_STREAM};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Janitor cadence and thresholds.
#[derive(Debug, Clone)]
pub struct JanitorConfig {
    /// How often to sweep the pending list (default: 30 s)
    pub sweep_interval: Duration,
    /// Pending entries idle longer than this are claimed (default: 60 s)
    pub claim_idle: Duration,
    /// Retained entries per work stream (default: 1000)
    pub trim_len: usize,
    /// Consumer name used for claimed messages
    pub consumer: String,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(DEFAULT_JANITOR_SWEEP_SECS),
            claim_idle: Duration::from_millis(DEFAULT_CLAIM_IDLE_MS),
            trim_len: DEFAULT_STREAM_TRIM_LEN,
            consumer: "janitor".to_string(),
        }
    }
}

impl JanitorConfig {
    /// Read configuration from `FOREMAN_JANITOR_*` environment variables.
    pub fn from_env() -> Self {
        let sweep_interval = Duration::from_secs(
            std::env::var("FOREMAN_JANITOR_SWEEP_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_JANITOR_SWEEP_SECS),
        );
        let claim_idle = Duration::from_millis(
            std::env::var("FOREMAN_JANITOR_CLAIM_IDLE_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_CLAIM_IDLE_MS),
        );
        let trim_len = std::env::var("FOREMAN_JANITOR_TRIM_LEN")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_STREAM_TRIM_LEN);
        Self {
            sweep_interval,
            claim_idle,
            trim_len,
            consumer: "janitor".to_string(),
        }
    }

    /// Short intervals for tests.
    pub fn development() -> Self {
        Self {
            sweep_interval: Duration::from_millis(50),
            claim_idle: Duration::from_millis(20),
            ..Self::default()
        }
    }
}

// ============================================================================
// METRICS
// ============================================================================

/// Counters for janitor activity.
#[derive(Debug, Default)]
pub struct JanitorMetrics {
    pub sweeps: AtomicU64,
    pub messages_claimed: AtomicU64,
    pub entries_trimmed: AtomicU64,
    pub sweep_errors: AtomicU64,
}

impl JanitorMetrics {
    pub fn new() -> Self {
        Self::default()
    }
}

// ============================================================================
// BACKGROUND TASK
// ============================================================================

/// Run the janitor until the shutdown signal flips. Returns the collected
/// metrics.
pub async fn janitor_task(
    queue: Arc<dyn StreamQueue>,
    ingester: Arc<ResultIngester>,
    config: JanitorConfig,
    mut shutdown: watch::Receiver<bool>,
) -> Arc<JanitorMetrics> {
    let metrics = Arc::new(JanitorMetrics::new());

    let mut sweep_interval = interval(config.sweep_interval);
    sweep_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        sweep_secs = config.sweep_interval.as_secs(),
        claim_idle_ms = config.claim_idle.as_millis() as u64,
        "Janitor started"
    );

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    tracing::info!("Janitor shutting down");
                    break;
                }
            }
            _ = sweep_interval.tick() => {
                sweep(&queue, &ingester, &config, &metrics).await;
                trim(&queue, &config, &metrics).await;
            }
        }
    }

    metrics
}

/// One sweep: claim stale pending results and re-run them.
async fn sweep(
    queue: &Arc<dyn StreamQueue>,
    ingester: &Arc<ResultIngester>,
    config: &JanitorConfig,
    metrics: &JanitorMetrics,
) {
    metrics.sweeps.fetch_add(1, Ordering::Relaxed);

    let pending = match queue.pending(RESULTS_STREAM, GROUP_INGESTERS).await {
        Ok(pending) => pending,
        Err(err) => {
            tracing::error!(error = %err, "Janitor failed to read pending list");
            metrics.sweep_errors.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };

    let idle_cutoff = config.claim_idle.as_millis() as u64;
    let stale: Vec<String> = pending
        .iter()
        .filter(|p| p.idle_ms > idle_cutoff)
        .map(|p| p.id.clone())
        .collect();
    if stale.is_empty() {
        return;
    }

    let claimed = match queue
        .claim(
            RESULTS_STREAM,
            GROUP_INGESTERS,
            &config.consumer,
            idle_cutoff,
            &stale,
        )
        .await
    {
        Ok(claimed) => claimed,
        Err(err) => {
            tracing::error!(error = %err, "Janitor claim failed");
            metrics.sweep_errors.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };

    tracing::warn!(count = claimed.len(), "Janitor reclaimed stale results");
    metrics
        .messages_claimed
        .fetch_add(claimed.len() as u64, Ordering::Relaxed);

    for message in claimed {
        ingester.handle(&message).await;
    }
}

/// Bound the durable work streams.
async fn trim(queue: &Arc<dyn StreamQueue>, config: &JanitorConfig, metrics: &JanitorMetrics) {
    for stream in [RESULTS_STREAM, DLQ_STREAM] {
        match queue.trim(stream, config.trim_len).await {
            Ok(removed) if removed > 0 => {
                tracing::debug!(stream, removed, "Stream trimmed");
                metrics.entries_trimmed.fetch_add(removed, Ordering::Relaxed);
            }
            Ok(_) => {}
            Err(err) => {
                tracing::error!(stream, error = %err, "Stream trim failed");
                metrics.sweep_errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default_matches_contract() {
        let config = JanitorConfig::default();
        assert_eq!(config.sweep_interval, Duration::from_secs(30));
        assert_eq!(config.claim_idle, Duration::from_secs(60));
        assert_eq!(config.trim_len, 1000);
    }

    #[test]
    fn test_config_development_is_fast() {
        let config = JanitorConfig::development();
        assert!(config.sweep_interval < Duration::from_secs(1));
        assert!(config.claim_idle < Duration::from_secs(1));
    }
}
