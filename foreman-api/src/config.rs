//! API and runtime configuration.
//!
//! Everything is env-var driven with defaults from `constants`: 5 s tick,
//! 30 s heartbeats, 60 s liveness cutoff, 30 s janitor sweep.

use crate::constants::{
    DEFAULT_BACKPRESSURE_HIGH, DEFAULT_BACKPRESSURE_LOW, DEFAULT_BOARD_BUFFER,
    DEFAULT_HEARTBEAT_INTERVAL_SECS, DEFAULT_MAX_IN_FLIGHT_PER_PHASE,
    DEFAULT_MAX_IN_FLIGHT_PER_PROJECT, DEFAULT_TICK_INTERVAL_SECS,
};
use std::time::Duration;

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

// ============================================================================
// API CONFIGURATION
// ============================================================================

/// HTTP-surface configuration.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Bind host (default 0.0.0.0)
    pub bind: String,
    /// Bind port (default 3000)
    pub port: u16,
    /// Allowed CORS origins; empty means allow-any (development)
    pub cors_origins: Vec<String>,
    /// Board event buffer per subscriber
    pub board_buffer: usize,
    /// Heartbeat interval advertised to workers
    pub heartbeat_interval: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 3000,
            cors_origins: Vec::new(),
            board_buffer: DEFAULT_BOARD_BUFFER,
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS),
        }
    }
}

impl ApiConfig {
    /// Read configuration from `FOREMAN_*` environment variables.
    pub fn from_env() -> Self {
        let cors_origins = std::env::var("FOREMAN_CORS_ORIGINS")
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        Self {
            bind: std::env::var("FOREMAN_API_BIND").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("PORT")
                .ok()
                .or_else(|| std::env::var("FOREMAN_API_PORT").ok())
                .and_then(|s| s.parse().ok())
                .unwrap_or(3000),
            cors_origins,
            board_buffer: env_usize("FOREMAN_BOARD_BUFFER", DEFAULT_BOARD_BUFFER),
            heartbeat_interval: Duration::from_secs(env_u64(
                "FOREMAN_HEARTBEAT_INTERVAL_SECS",
                DEFAULT_HEARTBEAT_INTERVAL_SECS,
            )),
        }
    }
}

// ============================================================================
// ORCHESTRATOR CONFIGURATION
// ============================================================================

/// PM loop configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Periodic scheduling tick
    pub tick_interval: Duration,
    /// Cap on in-flight tasks per project
    pub max_in_flight_project: usize,
    /// Cap on in-flight tasks per phase
    pub max_in_flight_phase: usize,
    /// Dispatch pauses when the results pending list exceeds this
    pub backpressure_high: usize,
    /// ... and resumes once it drains below this
    pub backpressure_low: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(DEFAULT_TICK_INTERVAL_SECS),
            max_in_flight_project: DEFAULT_MAX_IN_FLIGHT_PER_PROJECT,
            max_in_flight_phase: DEFAULT_MAX_IN_FLIGHT_PER_PHASE,
            backpressure_high: DEFAULT_BACKPRESSURE_HIGH,
            backpressure_low: DEFAULT_BACKPRESSURE_LOW,
        }
    }
}

impl OrchestratorConfig {
    /// Read configuration from `FOREMAN_PM_*` environment variables.
    pub fn from_env() -> Self {
        Self {
            tick_interval: Duration::from_secs(env_u64(
                "FOREMAN_PM_TICK_SECS",
                DEFAULT_TICK_INTERVAL_SECS,
            )),
            max_in_flight_project: env_usize(
                "FOREMAN_PM_MAX_IN_FLIGHT_PROJECT",
                DEFAULT_MAX_IN_FLIGHT_PER_PROJECT,
            ),
            max_in_flight_phase: env_usize(
                "FOREMAN_PM_MAX_IN_FLIGHT_PHASE",
                DEFAULT_MAX_IN_FLIGHT_PER_PHASE,
            ),
            backpressure_high: env_usize(
                "FOREMAN_PM_BACKPRESSURE_HIGH",
                DEFAULT_BACKPRESSURE_HIGH,
            ),
            backpressure_low: env_usize("FOREMAN_PM_BACKPRESSURE_LOW", DEFAULT_BACKPRESSURE_LOW),
        }
    }

    /// Short intervals for tests.
    pub fn development() -> Self {
        Self {
            tick_interval: Duration::from_millis(50),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_carry_timing_contract() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.tick_interval, Duration::from_secs(5));
        assert_eq!(config.max_in_flight_project, 4);
        assert_eq!(config.max_in_flight_phase, 1);
        assert_eq!(config.backpressure_high, 1000);
        assert_eq!(config.backpressure_low, 500);

        let api = ApiConfig::default();
        assert_eq!(api.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(api.board_buffer, 256);
    }
}
