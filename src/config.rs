//! Configuration surface consumed by the core.
//!
//! Loading YAML from disk is explicitly out of scope (see `spec.md` §1); the
//! external config loader is responsible for populating [`RailyardConfig`]
//! and seeding the `tracks` table from [`TrackConfig`]. The structs here
//! exist so the rest of the crate has a typed contract to program against.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RailyardConfig {
    pub owner: String,
    pub repo_url: String,
    pub branch_prefix: String,
    pub default_base_branch: String,
    #[serde(default)]
    pub require_pr: bool,
    pub repo_dir: String,
    #[serde(default)]
    pub tracks: Vec<TrackConfig>,
    #[serde(default)]
    pub stall_thresholds: StallThresholds,
}

/// Per-track configuration, mirrors the `tracks` table (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackConfig {
    pub name: String,
    pub language: String,
    #[serde(default)]
    pub file_patterns: Vec<String>,
    #[serde(default = "default_engine_slots")]
    pub engine_slots: u32,
    pub test_command: Option<String>,
    #[serde(default)]
    pub conventions: serde_json::Value,
    #[serde(default)]
    pub prompt: Option<String>,
}

fn default_engine_slots() -> u32 {
    1
}

/// Stall detector thresholds (§4.6). All three have defaults matching the
/// spec's stated defaults; an external loader may override any subset.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct StallThresholds {
    pub stdout_timeout_secs: u64,
    pub repeated_error_max: usize,
    pub max_clear_cycles: u32,
}

impl Default for StallThresholds {
    fn default() -> Self {
        Self {
            stdout_timeout_secs: 120,
            repeated_error_max: 3,
            max_clear_cycles: 5,
        }
    }
}

impl StallThresholds {
    pub fn stdout_timeout(&self) -> Duration {
        Duration::from_secs(self.stdout_timeout_secs)
    }

    /// Ticker interval for the stdout-timeout watchdog: timeout/4, floored at 1s.
    pub fn ticker_interval(&self) -> Duration {
        let quarter = self.stdout_timeout_secs / 4;
        Duration::from_secs(quarter.max(1))
    }
}

/// Database connection settings, analogous to a connection-pool config.
/// Populated from the environment the way a process-level concern should be,
/// independent of orchestration policy in [`RailyardConfig`].
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgresql://localhost/railyard".to_string()),
            max_connections: std::env::var("RAILYARD_DB_POOL_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stall_threshold_defaults_match_spec() {
        let t = StallThresholds::default();
        assert_eq!(t.stdout_timeout_secs, 120);
        assert_eq!(t.repeated_error_max, 3);
        assert_eq!(t.max_clear_cycles, 5);
    }

    #[test]
    fn ticker_interval_is_floored_at_one_second() {
        let t = StallThresholds {
            stdout_timeout_secs: 2,
            ..StallThresholds::default()
        };
        assert_eq!(t.ticker_interval(), Duration::from_secs(1));
    }

    #[test]
    fn ticker_interval_is_a_quarter_of_timeout() {
        let t = StallThresholds {
            stdout_timeout_secs: 120,
            ..StallThresholds::default()
        };
        assert_eq!(t.ticker_interval(), Duration::from_secs(30));
    }
}
