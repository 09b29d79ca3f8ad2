//! Engine registry (§4, §11): register, heartbeat, deregister, stale reaping.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::ids;
use crate::models::Engine;

/// Errors surfaced by [`EngineRegistry`], prefixed `engine:` (§7).
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine: not found: {0}")]
    NotFound(String),

    #[error("engine: {0}")]
    Database(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;

pub struct EngineRegistry {
    pool: PgPool,
}

impl EngineRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Register a new worker daemon bound to `track`, starting `idle`.
    pub async fn register(&self, track: &str) -> Result<Engine> {
        let id = ids::new_engine_id();

        let engine = sqlx::query_as::<_, Engine>(
            r#"
            INSERT INTO engines (id, track, role, status)
            VALUES ($1, $2, 'engine', 'idle')
            RETURNING *
            "#,
        )
        .bind(&id)
        .bind(track)
        .fetch_one(&self.pool)
        .await?;

        info!(engine_id = %engine.id, track, "engine registered");
        Ok(engine)
    }

    /// Bump `last_activity` for a live engine. Fire-and-forget by design
    /// (§5): callers that get [`EngineError::NotFound`] should stop their
    /// heartbeat ticker rather than retry.
    pub async fn heartbeat(&self, engine_id: &str) -> Result<()> {
        let result = sqlx::query("UPDATE engines SET last_activity = now() WHERE id = $1")
            .bind(engine_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::NotFound(engine_id.to_string()));
        }

        Ok(())
    }

    /// Retire an engine record: status → `dead`, current work cleared (§11).
    pub async fn deregister(&self, engine_id: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE engines
            SET status = 'dead', current_car = NULL, session_id = NULL
            WHERE id = $1
            "#,
        )
        .bind(engine_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::NotFound(engine_id.to_string()));
        }

        info!(engine_id, "engine deregistered");
        Ok(())
    }

    pub async fn get(&self, engine_id: &str) -> Result<Engine> {
        sqlx::query_as::<_, Engine>("SELECT * FROM engines WHERE id = $1")
            .bind(engine_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| EngineError::NotFound(engine_id.to_string()))
    }

    pub async fn set_status(&self, engine_id: &str, status: &str) -> Result<()> {
        let result = sqlx::query("UPDATE engines SET status = $2 WHERE id = $1")
            .bind(engine_id)
            .bind(status)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::NotFound(engine_id.to_string()));
        }

        Ok(())
    }

    /// Engines whose heartbeat has gone quiet for longer than `older_than`
    /// (§11). Read-only; reaping action is left to an operator or watchdog.
    pub async fn find_stale(&self, older_than: Duration) -> Result<Vec<Engine>> {
        let cutoff: DateTime<Utc> = Utc::now() - chrono::Duration::from_std(older_than)
            .unwrap_or_else(|_| chrono::Duration::zero());

        let engines = sqlx::query_as::<_, Engine>(
            "SELECT * FROM engines WHERE last_activity < $1 AND status <> 'dead'",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        Ok(engines)
    }
}

/// Spawn a periodic heartbeat ticker for `engine_id`, stopping either when
/// `shutdown` fires or the engine row disappears (§5, §11).
pub fn spawn_heartbeat_task(
    pool: PgPool,
    engine_id: String,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let registry = EngineRegistry::new(pool);
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match registry.heartbeat(&engine_id).await {
                        Ok(()) => {}
                        Err(EngineError::NotFound(_)) => {
                            warn!(engine_id, "heartbeat target missing, stopping ticker");
                            break;
                        }
                        Err(e) => {
                            error!(engine_id, error = %e, "heartbeat failed");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_cutoff_computation_does_not_panic_on_large_durations() {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(Duration::from_secs(60 * 60 * 24 * 365))
                .unwrap_or_else(|_| chrono::Duration::zero());
        assert!(cutoff < Utc::now());
    }
}
