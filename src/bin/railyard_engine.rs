//! Engine daemon entry point (§2, §4). One process per track/slot; the
//! operator is expected to run one copy of this binary per engine slot,
//! pointed at a shared database and repo checkout via environment variables.
//!
//! Track definitions are not loaded from YAML here (out of scope, see
//! `RailyardConfig`'s doc comment) — this binary derives a single-track
//! config directly from the environment, matching what an external loader
//! would otherwise seed into the `tracks` table.

use std::time::Duration;

use railyard::config::{DatabaseConfig, RailyardConfig, StallThresholds, TrackConfig};
use railyard::db::Database;
use railyard::engine::{run_engine_loop, EngineLoopConfig};
use railyard::worktree;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn track_config() -> TrackConfig {
    TrackConfig {
        name: env_or("RAILYARD_TRACK", "default"),
        language: env_or("RAILYARD_TRACK_LANGUAGE", "rust"),
        file_patterns: Vec::new(),
        engine_slots: 1,
        test_command: std::env::var("RAILYARD_TEST_COMMAND").ok(),
        conventions: serde_json::Value::Null,
        prompt: std::env::var("RAILYARD_TRACK_PROMPT").ok(),
    }
}

fn railyard_config(track: TrackConfig) -> RailyardConfig {
    RailyardConfig {
        owner: env_or("RAILYARD_OWNER", "railyard"),
        repo_url: env_or("RAILYARD_REPO_URL", ""),
        branch_prefix: env_or("RAILYARD_BRANCH_PREFIX", "railyard"),
        default_base_branch: env_or("RAILYARD_DEFAULT_BASE_BRANCH", "main"),
        require_pr: std::env::var("RAILYARD_REQUIRE_PR")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false),
        repo_dir: env_or("RAILYARD_REPO_DIR", "."),
        tracks: vec![track],
        stall_thresholds: StallThresholds::default(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let db = Database::new(DatabaseConfig::default()).await?;
    db.run_migrations().await?;

    let track = track_config();
    let railyard = railyard_config(track.clone());
    let repo_dir = std::path::PathBuf::from(&railyard.repo_dir);

    let agent_program = env_or("RAILYARD_AGENT_PROGRAM", "claude");
    let agent_args = std::env::var("RAILYARD_AGENT_ARGS")
        .map(|s| s.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default();

    let cfg = EngineLoopConfig {
        railyard,
        track,
        agent_program,
        agent_args,
        poll_interval: Duration::from_secs(
            env_or("RAILYARD_POLL_INTERVAL_SECS", "10").parse().unwrap_or(10),
        ),
        cancel_grace: Duration::from_secs(
            env_or("RAILYARD_CANCEL_GRACE_SECS", "10").parse().unwrap_or(10),
        ),
    };

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let pool = db.pool().clone();
    let loop_handle = tokio::spawn(run_engine_loop(pool, cfg, shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, draining engine loop");
    let _ = shutdown_tx.send(true);

    if let Err(e) = loop_handle.await {
        warn!(error = %e, "engine loop task panicked");
    }

    if let Err(e) = worktree::cleanup_worktrees(&repo_dir).await {
        warn!(error = %e, "worktree cleanup on shutdown failed");
    }

    db.close().await;
    Ok(())
}
