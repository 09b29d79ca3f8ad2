//! Atomic claim protocol (§4.3): the transactional "give me the top ready
//! car on my track" primitive, safe against many concurrent engines.

use sqlx::PgPool;
use tracing::{info, warn};

use crate::models::Car;

/// Errors surfaced by [`claim_car`], prefixed `engine:` to match the
/// operator-facing subsystem tag used for engine-side failures (§7).
#[derive(Debug, thiserror::Error)]
pub enum ClaimError {
    #[error("engine: no ready cars for track {0}")]
    NoReadyCars(String),

    #[error("engine: claim failed after retrying on repeated serialization conflicts")]
    SerializationExhausted,

    #[error("engine: {0}")]
    Database(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, ClaimError>;

const MAX_ATTEMPTS: u32 = 3;

/// Claim the highest-priority ready car on `track` for `engine_id`.
///
/// Retries up to [`MAX_ATTEMPTS`] times on a serialization failure or
/// deadlock, per §5; any other error is returned immediately.
pub async fn claim_car(pool: &PgPool, engine_id: &str, track: &str) -> Result<Car> {
    let mut last_err = None;

    for attempt in 1..=MAX_ATTEMPTS {
        match try_claim_once(pool, engine_id, track).await {
            Ok(car) => return Ok(car),
            Err(ClaimError::Database(e)) if is_serialization_conflict(&e) => {
                warn!(engine_id, track, attempt, "claim retry after serialization conflict");
                last_err = Some(e);
                continue;
            }
            Err(e) => return Err(e),
        }
    }

    warn!(engine_id, track, "claim exhausted retry budget");
    let _ = last_err;
    Err(ClaimError::SerializationExhausted)
}

fn is_serialization_conflict(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            // 40001 = serialization_failure, 40P01 = deadlock_detected
            if code == "40001" || code == "40P01" {
                return true;
            }
        }
        let message = db_err.message();
        return message.contains("serialization failure") || message.contains("deadlock");
    }
    false
}

async fn try_claim_once(pool: &PgPool, engine_id: &str, track: &str) -> Result<Car> {
    let mut tx = pool.begin().await?;

    let car = sqlx::query_as::<_, Car>(
        r#"
        WITH ranked AS (
            SELECT c.id
            FROM cars c
            WHERE c.status = 'open'
              AND c.assignee IS NULL
              AND c.car_type <> 'epic'
              AND c.track = $2
              AND NOT EXISTS (
                  SELECT 1 FROM car_deps d
                  JOIN cars blocker ON blocker.id = d.blocked_by
                  WHERE d.car_id = c.id
                    AND blocker.status NOT IN ('done', 'cancelled', 'merged')
              )
            ORDER BY c.priority ASC, c.created_at ASC
            LIMIT 1
            FOR UPDATE OF c SKIP LOCKED
        )
        UPDATE cars
        SET status = 'claimed', assignee = $1, claimed_at = now(), updated_at = now()
        FROM ranked
        WHERE cars.id = ranked.id
        RETURNING cars.*
        "#,
    )
    .bind(engine_id)
    .bind(track)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(car) = car else {
        tx.rollback().await?;
        return Err(ClaimError::NoReadyCars(track.to_string()));
    };

    sqlx::query("UPDATE engines SET status = 'working', current_car = $2 WHERE id = $1")
        .bind(engine_id)
        .bind(&car.id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;

    info!(engine_id, track, car_id = %car.id, "claimed car");
    Ok(car)
}

#[cfg(test)]
mod integration_tests {
    use super::*;

    async fn seed_engine(pool: &PgPool, id: &str, track: &str) {
        sqlx::query("INSERT INTO engines (id, track, role, status) VALUES ($1, $2, 'engine', 'idle')")
            .bind(id)
            .bind(track)
            .execute(pool)
            .await
            .unwrap();
    }

    async fn seed_car(pool: &PgPool, id: &str, track: &str, priority: i16) {
        sqlx::query(
            r#"
            INSERT INTO cars (id, title, car_type, status, priority, track, branch, created_at, updated_at)
            VALUES ($1, $1, 'task', 'open', $2, $3, $4, now(), now())
            "#,
        )
        .bind(id)
        .bind(priority)
        .bind(track)
        .bind(format!("railyard/{track}/{id}"))
        .execute(pool)
        .await
        .unwrap();
    }

    #[sqlx::test]
    async fn claim_car_returns_the_highest_priority_ready_car(pool: PgPool) {
        seed_engine(&pool, "eng-00000001", "rust").await;
        seed_car(&pool, "car-00001", "rust", 5).await;
        seed_car(&pool, "car-00002", "rust", 1).await;

        let car = claim_car(&pool, "eng-00000001", "rust").await.unwrap();
        assert_eq!(car.id, "car-00002");
        assert_eq!(car.status, crate::models::CarStatus::Claimed);
        assert_eq!(car.assignee.as_deref(), Some("eng-00000001"));
    }

    #[sqlx::test]
    async fn claim_car_skips_cars_already_claimed(pool: PgPool) {
        seed_engine(&pool, "eng-00000001", "rust").await;
        seed_engine(&pool, "eng-00000002", "rust").await;
        seed_car(&pool, "car-00001", "rust", 1).await;

        let first = claim_car(&pool, "eng-00000001", "rust").await.unwrap();
        assert_eq!(first.id, "car-00001");

        let second = claim_car(&pool, "eng-00000002", "rust").await.unwrap_err();
        assert!(matches!(second, ClaimError::NoReadyCars(_)));
    }

    #[sqlx::test]
    async fn claim_car_reports_no_ready_cars_for_an_unrelated_track(pool: PgPool) {
        seed_engine(&pool, "eng-00000001", "go").await;
        seed_car(&pool, "car-00001", "rust", 1).await;

        let err = claim_car(&pool, "eng-00000001", "go").await.unwrap_err();
        assert!(matches!(err, ClaimError::NoReadyCars(_)));
    }
}
