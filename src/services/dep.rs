//! Dependency service (§4.2): blockers, cycle detection, ready-work resolver.

use std::collections::HashSet;

use sqlx::PgPool;

use crate::models::{Car, CarDep};

/// Errors surfaced by [`DependencyService`], prefixed `dep:` (§7).
#[derive(Debug, thiserror::Error)]
pub enum DepError {
    #[error("dep: self-dependency rejected: {0}")]
    SelfEdge(String),

    #[error("dep: car not found: {0}")]
    CarNotFound(String),

    #[error("dep: adding {car_id} blocked-by {blocked_by} would introduce a cycle")]
    Cycle { car_id: String, blocked_by: String },

    #[error("dep: no such dependency edge ({car_id} blocked-by {blocked_by})")]
    EdgeNotFound { car_id: String, blocked_by: String },

    #[error("dep: {0}")]
    Database(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, DepError>;

#[derive(Debug, Clone, Default)]
pub struct CarDeps {
    pub blockers: Vec<CarDep>,
    pub dependents: Vec<CarDep>,
}

pub struct DependencyService {
    pool: PgPool,
}

impl DependencyService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn car_exists(&self, id: &str) -> Result<bool> {
        let row: Option<(String,)> = sqlx::query_as("SELECT id FROM cars WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Record that `car_id` is blocked by `blocked_by`, rejecting self-edges,
    /// missing cars, and edges that would close a cycle (§4.2 `AddDep`).
    pub async fn add_dep(
        &self,
        car_id: &str,
        blocked_by: &str,
        dep_type: Option<&str>,
    ) -> Result<CarDep> {
        if car_id == blocked_by {
            return Err(DepError::SelfEdge(car_id.to_string()));
        }
        if !self.car_exists(car_id).await? {
            return Err(DepError::CarNotFound(car_id.to_string()));
        }
        if !self.car_exists(blocked_by).await? {
            return Err(DepError::CarNotFound(blocked_by.to_string()));
        }

        if self.reachable(blocked_by, car_id).await? {
            return Err(DepError::Cycle {
                car_id: car_id.to_string(),
                blocked_by: blocked_by.to_string(),
            });
        }

        let dep = sqlx::query_as::<_, CarDep>(
            r#"
            INSERT INTO car_deps (car_id, blocked_by, dep_type)
            VALUES ($1, $2, $3)
            RETURNING *
            "#,
        )
        .bind(car_id)
        .bind(blocked_by)
        .bind(dep_type.unwrap_or("blocks"))
        .fetch_one(&self.pool)
        .await?;

        Ok(dep)
    }

    /// Bounded DFS over the child→blocker graph: is `target` reachable from `start`?
    async fn reachable(&self, start: &str, target: &str) -> Result<bool> {
        let mut visited: HashSet<String> = HashSet::new();
        let mut stack = vec![start.to_string()];

        while let Some(node) = stack.pop() {
            if node == target {
                return Ok(true);
            }
            if !visited.insert(node.clone()) {
                continue;
            }

            let next: Vec<(String,)> =
                sqlx::query_as("SELECT blocked_by FROM car_deps WHERE car_id = $1")
                    .bind(&node)
                    .fetch_all(&self.pool)
                    .await?;

            for (blocker,) in next {
                if !visited.contains(&blocker) {
                    stack.push(blocker);
                }
            }
        }

        Ok(false)
    }

    /// Delete an edge; not-found if no row matched (§4.2 `RemoveDep`).
    pub async fn remove_dep(&self, car_id: &str, blocked_by: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM car_deps WHERE car_id = $1 AND blocked_by = $2")
            .bind(car_id)
            .bind(blocked_by)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DepError::EdgeNotFound {
                car_id: car_id.to_string(),
                blocked_by: blocked_by.to_string(),
            });
        }

        Ok(())
    }

    /// Blockers of, and dependents on, `car_id` (§4.2 `ListDeps`).
    pub async fn list_deps(&self, car_id: &str) -> Result<CarDeps> {
        let blockers = sqlx::query_as::<_, CarDep>("SELECT * FROM car_deps WHERE car_id = $1")
            .bind(car_id)
            .fetch_all(&self.pool)
            .await?;

        let dependents =
            sqlx::query_as::<_, CarDep>("SELECT * FROM car_deps WHERE blocked_by = $1")
                .bind(car_id)
                .fetch_all(&self.pool)
                .await?;

        Ok(CarDeps {
            blockers,
            dependents,
        })
    }

    /// Open, unassigned, non-epic cars on `track` whose every blocker is
    /// resolved, ordered (priority asc, created_at asc) (§4.2 `ReadyCars`).
    pub async fn ready_cars(&self, track: Option<&str>) -> Result<Vec<Car>> {
        let mut qb = sqlx::QueryBuilder::new(
            r#"
            SELECT * FROM cars c
            WHERE c.status = 'open'
              AND c.assignee IS NULL
              AND c.car_type <> 'epic'
              AND NOT EXISTS (
                  SELECT 1 FROM car_deps d
                  JOIN cars blocker ON blocker.id = d.blocked_by
                  WHERE d.car_id = c.id
                    AND blocker.status NOT IN ('done', 'cancelled', 'merged')
              )
            "#,
        );

        if let Some(track) = track {
            qb.push(" AND c.track = ").push_bind(track);
        }

        qb.push(" ORDER BY c.priority ASC, c.created_at ASC");

        let cars = qb.build_query_as::<Car>().fetch_all(&self.pool).await?;
        Ok(cars)
    }
}

#[cfg(test)]
mod integration_tests {
    use super::*;
    use sqlx::PgPool;

    async fn seed_car(pool: &PgPool, id: &str, track: &str, status: &str) {
        sqlx::query(
            r#"
            INSERT INTO cars (id, title, car_type, status, priority, track, branch, created_at, updated_at)
            VALUES ($1, $1, 'task', $2, 2, $3, $4, now(), now())
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(track)
        .bind(format!("railyard/{track}/{id}"))
        .execute(pool)
        .await
        .unwrap();
    }

    #[sqlx::test]
    async fn add_dep_rejects_self_edge(pool: PgPool) {
        seed_car(&pool, "car-00001", "rust", "open").await;
        let deps = DependencyService::new(pool);

        let err = deps.add_dep("car-00001", "car-00001", None).await.unwrap_err();
        assert!(matches!(err, DepError::SelfEdge(_)));
    }

    #[sqlx::test]
    async fn add_dep_rejects_cycles(pool: PgPool) {
        seed_car(&pool, "car-00001", "rust", "open").await;
        seed_car(&pool, "car-00002", "rust", "open").await;
        let deps = DependencyService::new(pool);

        deps.add_dep("car-00002", "car-00001", None).await.unwrap();

        let err = deps.add_dep("car-00001", "car-00002", None).await.unwrap_err();
        assert!(matches!(err, DepError::Cycle { .. }));
    }

    #[sqlx::test]
    async fn ready_cars_excludes_those_with_unresolved_blockers(pool: PgPool) {
        seed_car(&pool, "car-00001", "rust", "open").await;
        seed_car(&pool, "car-00002", "rust", "open").await;
        let deps = DependencyService::new(pool);
        deps.add_dep("car-00002", "car-00001", None).await.unwrap();

        let ready = deps.ready_cars(Some("rust")).await.unwrap();
        let ids: Vec<&str> = ready.iter().map(|c| c.id.as_str()).collect();

        assert!(ids.contains(&"car-00001"));
        assert!(!ids.contains(&"car-00002"));
    }

    #[sqlx::test]
    async fn ready_cars_includes_a_previously_blocked_car_once_its_blocker_resolves(pool: PgPool) {
        seed_car(&pool, "car-00001", "rust", "done").await;
        seed_car(&pool, "car-00002", "rust", "open").await;
        let deps = DependencyService::new(pool);
        deps.add_dep("car-00002", "car-00001", None).await.unwrap();

        let ready = deps.ready_cars(Some("rust")).await.unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, "car-00002");
    }
}
