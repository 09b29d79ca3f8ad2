//! Outcome handlers (§4.7): completion and clear-cycle paths.

use std::path::Path;

use serde_json::json;
use sqlx::PgPool;
use tracing::{info, warn};

use crate::models::Car;
use crate::worktree;

/// Errors surfaced by the outcome handlers, prefixed `engine:` — they are
/// part of the engine loop's composition rather than a standalone subsystem (§7).
#[derive(Debug, thiserror::Error)]
pub enum OutcomeError {
    #[error("engine: {0}")]
    Worktree(#[from] worktree::WorktreeError),

    #[error("engine: {0}")]
    Database(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, OutcomeError>;

/// Invoked when the agent exits and the car is already `done` (self-reported
/// via the sibling CLI). Pushes the branch, appends a final progress entry,
/// and returns the engine to `idle` (§4.7 `HandleCompletion`).
pub async fn handle_completion(
    pool: &PgPool,
    worktree_dir: &Path,
    car: &Car,
    engine_id: &str,
    session_id: &str,
    cycle: i32,
    note: Option<&str>,
) -> Result<()> {
    worktree::push_branch(worktree_dir, &car.branch).await?;

    let commit_hash = worktree::recent_commits(worktree_dir, 1)
        .await
        .ok()
        .and_then(|commits| commits.into_iter().next())
        .and_then(|line| line.split_whitespace().next().map(str::to_string));

    let note = note.unwrap_or("car completed; branch pushed").to_string();

    sqlx::query(
        r#"
        INSERT INTO car_progress (car_id, cycle, session_id, engine_id, note, changed_files, commit_hash)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(&car.id)
    .bind(cycle)
    .bind(session_id)
    .bind(engine_id)
    .bind(&note)
    .bind(json!([]))
    .bind(commit_hash)
    .execute(pool)
    .await?;

    sqlx::query(
        "UPDATE engines SET status = 'idle', current_car = NULL, session_id = NULL WHERE id = $1",
    )
    .bind(engine_id)
    .execute(pool)
    .await?;

    info!(engine_id, car_id = %car.id, "completion handled, engine idle");
    Ok(())
}

/// Invoked when the agent exits mid-task (car not yet `done`). Records a
/// progress entry for this cycle and leaves the car assigned to the same
/// engine for reclaiming (§4.7 `HandleClearCycle`).
pub async fn handle_clear_cycle(
    pool: &PgPool,
    worktree_dir: &Path,
    car: &Car,
    engine_id: &str,
    session_id: &str,
    cycle: i32,
    note: Option<&str>,
) -> Result<()> {
    let changed = match worktree::changed_files(worktree_dir, car.base_branch.as_deref().unwrap_or("main")).await {
        Ok(files) => files,
        Err(e) => {
            warn!(car_id = %car.id, error = %e, "best-effort changed-files capture failed");
            Vec::new()
        }
    };

    let note = note
        .map(str::to_string)
        .unwrap_or_else(|| format!("cycle {cycle} cleared without completion"));

    sqlx::query(
        r#"
        INSERT INTO car_progress (car_id, cycle, session_id, engine_id, note, changed_files)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(&car.id)
    .bind(cycle)
    .bind(session_id)
    .bind(engine_id)
    .bind(&note)
    .bind(json!(changed))
    .execute(pool)
    .await?;

    info!(engine_id, car_id = %car.id, cycle, "clear cycle recorded, car remains assigned");
    Ok(())
}
