//! Car service (§4.1): CRUD over cars, transition validation, epic/child, publish.

use chrono::Utc;
use sqlx::PgPool;

use crate::ids;
use crate::models::{Car, CarDep, CarProgress, CarStatus, CarType};

/// Errors surfaced by [`CarService`], always prefixed `car:` for operators (§7).
#[derive(Debug, thiserror::Error)]
pub enum CarError {
    #[error("car: not found: {0}")]
    NotFound(String),

    #[error("car: parent not found: {0}")]
    ParentNotFound(String),

    #[error("car: parent {0} is not an epic")]
    NonEpicParent(String),

    #[error("car: missing required field: {0}")]
    MissingField(&'static str),

    #[error("car: invalid transition from {from} to {to}; valid targets are {valid:?}")]
    InvalidTransition {
        from: CarStatus,
        to: CarStatus,
        valid: Vec<CarStatus>,
    },

    #[error("car: could not generate a unique id after retrying")]
    IdExhausted,

    #[error("car: {0}")]
    Database(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, CarError>;

/// Parameters for [`CarService::create`].
#[derive(Debug, Clone, Default)]
pub struct CreateCarOpts {
    pub title: String,
    pub description: Option<String>,
    pub design_notes: Option<String>,
    pub acceptance_criteria: Option<String>,
    pub car_type: Option<CarType>,
    pub priority: Option<i16>,
    pub track: Option<String>,
    pub parent_id: Option<String>,
    pub assignee: Option<String>,
    pub skip_tests: bool,
    pub base_branch: Option<String>,
}

/// Partial update for [`CarService::update`]; `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct UpdateCar {
    pub title: Option<String>,
    pub description: Option<String>,
    pub design_notes: Option<String>,
    pub acceptance_criteria: Option<String>,
    pub priority: Option<i16>,
    pub assignee: Option<Option<String>>,
    pub status: Option<CarStatus>,
    pub skip_tests: Option<bool>,
    pub base_branch: Option<String>,
}

/// Equality filters for [`CarService::list`].
#[derive(Debug, Clone, Default)]
pub struct ListCarFilters {
    pub track: Option<String>,
    pub status: Option<CarStatus>,
    pub car_type: Option<CarType>,
    pub assignee: Option<String>,
    pub parent_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ChildrenSummary {
    pub total: i64,
    pub by_status: Vec<(CarStatus, i64)>,
}

/// A car together with its dependency edges and progress journal (§4.1 `Get`).
#[derive(Debug, Clone)]
pub struct CarDetail {
    pub car: Car,
    pub deps: Vec<CarDep>,
    pub progress: Vec<CarProgress>,
}

pub struct CarService {
    pool: PgPool,
    branch_prefix: String,
}

impl CarService {
    pub fn new(pool: PgPool, branch_prefix: impl Into<String>) -> Self {
        Self {
            pool,
            branch_prefix: branch_prefix.into(),
        }
    }

    fn branch_name(&self, track: &str, car_id: &str) -> String {
        format!("{}/{}/{}", self.branch_prefix, track, car_id)
    }

    /// Create a new car in `draft` status (§4.1 `Create`).
    pub async fn create(&self, opts: CreateCarOpts) -> Result<Car> {
        if opts.title.trim().is_empty() {
            return Err(CarError::MissingField("title"));
        }

        let car_type = opts.car_type.unwrap_or(CarType::Task);

        let track = match (&opts.track, &opts.parent_id) {
            (Some(track), _) => track.clone(),
            (None, Some(parent_id)) => {
                let parent = self.fetch_car(parent_id).await?;
                if parent.car_type != CarType::Epic {
                    return Err(CarError::NonEpicParent(parent_id.clone()));
                }
                parent.track
            }
            (None, None) => return Err(CarError::MissingField("track")),
        };

        if let Some(parent_id) = &opts.parent_id {
            let parent = self.fetch_car(parent_id).await?;
            if parent.car_type != CarType::Epic {
                return Err(CarError::NonEpicParent(parent_id.clone()));
            }
        }

        let priority = opts.priority.unwrap_or(2);
        let now = Utc::now();

        for attempt in 0..2 {
            let id = ids::new_car_id();
            let branch = self.branch_name(&track, &id);

            let result = sqlx::query_as::<_, Car>(
                r#"
                INSERT INTO cars (
                    id, title, description, design_notes, acceptance_criteria,
                    car_type, status, priority, track, assignee, parent_id,
                    branch, skip_tests, base_branch, created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, 'draft', $7, $8, $9, $10, $11, $12, $13, $14, $14)
                RETURNING *
                "#,
            )
            .bind(&id)
            .bind(&opts.title)
            .bind(&opts.description)
            .bind(&opts.design_notes)
            .bind(&opts.acceptance_criteria)
            .bind(car_type.as_str())
            .bind(priority)
            .bind(&track)
            .bind(&opts.assignee)
            .bind(&opts.parent_id)
            .bind(&branch)
            .bind(opts.skip_tests)
            .bind(&opts.base_branch)
            .bind(now)
            .fetch_one(&self.pool)
            .await;

            match result {
                Ok(car) => return Ok(car),
                Err(sqlx::Error::Database(e)) if e.is_unique_violation() && attempt == 0 => {
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(CarError::IdExhausted)
    }

    async fn fetch_car(&self, id: &str) -> Result<Car> {
        sqlx::query_as::<_, Car>("SELECT * FROM cars WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CarError::NotFound(id.to_string()))
    }

    /// Load a car including its dependency edges and progress entries (§4.1 `Get`).
    pub async fn get(&self, id: &str) -> Result<CarDetail> {
        let car = self.fetch_car(id).await?;

        let deps = sqlx::query_as::<_, CarDep>(
            "SELECT * FROM car_deps WHERE car_id = $1 OR blocked_by = $1",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        let progress = sqlx::query_as::<_, CarProgress>(
            "SELECT * FROM car_progress WHERE car_id = $1 ORDER BY created_at ASC",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        Ok(CarDetail { car, deps, progress })
    }

    /// Equality-filtered, (priority, created_at)-ordered listing (§4.1 `List`).
    pub async fn list(&self, filters: ListCarFilters) -> Result<Vec<Car>> {
        let mut qb = sqlx::QueryBuilder::new("SELECT * FROM cars WHERE 1=1");

        if let Some(track) = &filters.track {
            qb.push(" AND track = ").push_bind(track);
        }
        if let Some(status) = &filters.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(car_type) = &filters.car_type {
            qb.push(" AND car_type = ").push_bind(car_type.as_str());
        }
        if let Some(assignee) = &filters.assignee {
            qb.push(" AND assignee = ").push_bind(assignee);
        }
        if let Some(parent_id) = &filters.parent_id {
            qb.push(" AND parent_id = ").push_bind(parent_id);
        }

        qb.push(" ORDER BY priority ASC, created_at ASC");

        let cars = qb.build_query_as::<Car>().fetch_all(&self.pool).await?;
        Ok(cars)
    }

    /// Apply a partial update, validating any status transition (§4.1 `Update`).
    pub async fn update(&self, id: &str, changes: UpdateCar) -> Result<Car> {
        let current = self.fetch_car(id).await?;

        let target_status = if let Some(to) = changes.status {
            if !is_valid_transition(current.status, to) {
                return Err(CarError::InvalidTransition {
                    from: current.status,
                    to,
                    valid: current.status.allowed_successors().to_vec(),
                });
            }
            Some(to)
        } else {
            None
        };

        let now = Utc::now();
        let claimed_at = if target_status == Some(CarStatus::Claimed) {
            Some(now)
        } else {
            current.claimed_at
        };
        let completed_at = if target_status == Some(CarStatus::Done) {
            Some(now)
        } else {
            current.completed_at
        };

        let car = sqlx::query_as::<_, Car>(
            r#"
            UPDATE cars SET
                title = $2,
                description = $3,
                design_notes = $4,
                acceptance_criteria = $5,
                priority = $6,
                assignee = $7,
                status = $8,
                skip_tests = $9,
                base_branch = $10,
                claimed_at = $11,
                completed_at = $12,
                updated_at = $13
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(changes.title.unwrap_or(current.title))
        .bind(changes.description.or(current.description))
        .bind(changes.design_notes.or(current.design_notes))
        .bind(changes.acceptance_criteria.or(current.acceptance_criteria))
        .bind(changes.priority.unwrap_or(current.priority))
        .bind(changes.assignee.unwrap_or(current.assignee))
        .bind(target_status.unwrap_or(current.status).as_str())
        .bind(changes.skip_tests.unwrap_or(current.skip_tests))
        .bind(changes.base_branch.or(current.base_branch))
        .bind(claimed_at)
        .bind(completed_at)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(car)
    }

    /// Ordered children of an epic (§4.1 `GetChildren`).
    pub async fn get_children(&self, parent_id: &str) -> Result<Vec<Car>> {
        self.fetch_car(parent_id).await?;

        let children = sqlx::query_as::<_, Car>(
            "SELECT * FROM cars WHERE parent_id = $1 ORDER BY priority ASC, created_at ASC",
        )
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(children)
    }

    /// By-status counts over an epic's children (§4.1 `ChildrenSummary`).
    pub async fn children_summary(&self, parent_id: &str) -> Result<ChildrenSummary> {
        let children = self.get_children(parent_id).await?;

        let mut by_status: Vec<(CarStatus, i64)> = Vec::new();
        for child in &children {
            if let Some(entry) = by_status.iter_mut().find(|(s, _)| *s == child.status) {
                entry.1 += 1;
            } else {
                by_status.push((child.status, 1));
            }
        }

        Ok(ChildrenSummary {
            total: children.len() as i64,
            by_status,
        })
    }

    /// Transition `id` (and, when recursive over an epic, its draft descendants)
    /// from `draft` to `open`. Returns the number of cars touched (§4.1 `Publish`).
    pub async fn publish(&self, id: &str, recursive: bool) -> Result<u64> {
        let car = self.fetch_car(id).await?;

        let mut touched = 0u64;
        if car.status == CarStatus::Draft {
            self.update(
                id,
                UpdateCar {
                    status: Some(CarStatus::Open),
                    ..Default::default()
                },
            )
            .await?;
            touched += 1;
        }

        if recursive && car.car_type == CarType::Epic {
            let children = self.get_children(id).await?;
            for child in children {
                if child.status == CarStatus::Draft {
                    touched += Box::pin(self.publish(&child.id, recursive)).await?;
                }
            }
        }

        Ok(touched)
    }
}

/// The canonical transition table (§3): any status may move to `blocked`; all
/// other edges must be listed explicitly in [`CarStatus::allowed_successors`].
pub fn is_valid_transition(from: CarStatus, to: CarStatus) -> bool {
    if to == CarStatus::Blocked {
        return true;
    }
    from.allowed_successors().contains(&to)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocked_reachable_from_any_status() {
        for status in [
            CarStatus::Draft,
            CarStatus::Open,
            CarStatus::Ready,
            CarStatus::Claimed,
            CarStatus::InProgress,
            CarStatus::Done,
            CarStatus::Merged,
            CarStatus::MergeFailed,
            CarStatus::Cancelled,
        ] {
            assert!(is_valid_transition(status, CarStatus::Blocked));
        }
    }

    #[test]
    fn unlisted_edges_are_rejected() {
        assert!(!is_valid_transition(CarStatus::Draft, CarStatus::Done));
        assert!(!is_valid_transition(CarStatus::Merged, CarStatus::Open));
        assert!(!is_valid_transition(CarStatus::Cancelled, CarStatus::Open));
    }

    #[test]
    fn listed_edges_are_accepted() {
        assert!(is_valid_transition(CarStatus::Draft, CarStatus::Open));
        assert!(is_valid_transition(CarStatus::Done, CarStatus::Merged));
        assert!(is_valid_transition(CarStatus::MergeFailed, CarStatus::Done));
    }
}

#[cfg(test)]
mod integration_tests {
    use super::*;
    use sqlx::PgPool;

    #[sqlx::test]
    async fn create_requires_a_track_or_epic_parent(pool: PgPool) {
        let service = CarService::new(pool, "railyard");
        let err = service
            .create(CreateCarOpts {
                title: "no track".to_string(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CarError::MissingField("track")));
    }

    #[sqlx::test]
    async fn create_rejects_a_non_epic_parent(pool: PgPool) {
        let service = CarService::new(pool, "railyard");
        let task = service
            .create(CreateCarOpts {
                title: "a plain task".to_string(),
                track: Some("rust".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        let err = service
            .create(CreateCarOpts {
                title: "child of a task".to_string(),
                parent_id: Some(task.id),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CarError::NonEpicParent(_)));
    }

    #[sqlx::test]
    async fn update_rejects_an_unlisted_transition(pool: PgPool) {
        let service = CarService::new(pool, "railyard");
        let car = service
            .create(CreateCarOpts {
                title: "a task".to_string(),
                track: Some("rust".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        let err = service
            .update(
                &car.id,
                UpdateCar {
                    status: Some(CarStatus::Done),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CarError::InvalidTransition { .. }));
    }

    #[sqlx::test]
    async fn publish_recursively_opens_draft_children_of_an_epic(pool: PgPool) {
        let service = CarService::new(pool, "railyard");
        let epic = service
            .create(CreateCarOpts {
                title: "an epic".to_string(),
                track: Some("rust".to_string()),
                car_type: Some(CarType::Epic),
                ..Default::default()
            })
            .await
            .unwrap();

        let child = service
            .create(CreateCarOpts {
                title: "a child task".to_string(),
                parent_id: Some(epic.id.clone()),
                ..Default::default()
            })
            .await
            .unwrap();

        let touched = service.publish(&epic.id, true).await.unwrap();
        assert_eq!(touched, 2);

        let reloaded_child = service.get(&child.id).await.unwrap().car;
        assert_eq!(reloaded_child.status, CarStatus::Open);
    }

    #[sqlx::test]
    async fn list_filters_by_track_and_status(pool: PgPool) {
        let service = CarService::new(pool, "railyard");
        service
            .create(CreateCarOpts {
                title: "rust task".to_string(),
                track: Some("rust".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        service
            .create(CreateCarOpts {
                title: "go task".to_string(),
                track: Some("go".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        let rust_cars = service
            .list(ListCarFilters {
                track: Some("rust".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(rust_cars.len(), 1);
        assert_eq!(rust_cars[0].track, "rust");
    }
}
