//! The `cars` table and its satellite rows (`car_deps`, `car_progress`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Type of engineering work a car represents.
///
/// Only `Epic` cars may have children (§3 invariants); every other type is a
/// leaf that an engine can claim and work directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CarType {
    Task,
    Epic,
    Spike,
    Bug,
}

impl CarType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Epic => "epic",
            Self::Spike => "spike",
            Self::Bug => "bug",
        }
    }
}

impl std::fmt::Display for CarType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for CarType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task" => Ok(Self::Task),
            "epic" => Ok(Self::Epic),
            "spike" => Ok(Self::Spike),
            "bug" => Ok(Self::Bug),
            other => Err(format!("unknown car type: {other}")),
        }
    }
}

/// The canonical status a car occupies in its lifecycle (§3).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CarStatus {
    Draft,
    Open,
    Ready,
    Claimed,
    InProgress,
    Done,
    Merged,
    MergeFailed,
    Blocked,
    Cancelled,
}

impl CarStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Open => "open",
            Self::Ready => "ready",
            Self::Claimed => "claimed",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Merged => "merged",
            Self::MergeFailed => "merge-failed",
            Self::Blocked => "blocked",
            Self::Cancelled => "cancelled",
        }
    }

    /// Statuses that satisfy a blocker edge: once a blocker reaches one of
    /// these, dependents become eligible (§4.2 `ReadyCars`).
    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Done | Self::Cancelled | Self::Merged)
    }

    /// The canonical transition table (§3). `Blocked` is reachable from any
    /// status and is intentionally omitted here; callers should check for it
    /// separately (see [`crate::services::car::is_valid_transition`]).
    pub fn allowed_successors(&self) -> &'static [CarStatus] {
        use CarStatus::*;
        match self {
            Draft => &[Open],
            Open => &[Ready, Cancelled, Blocked],
            Ready => &[Claimed, Blocked],
            Claimed => &[InProgress, Blocked],
            InProgress => &[Done, Blocked],
            Done => &[Merged, MergeFailed],
            Blocked => &[Open, Ready],
            MergeFailed => &[Done],
            Merged => &[],
            Cancelled => &[],
        }
    }
}

impl std::fmt::Display for CarStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for CarStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "open" => Ok(Self::Open),
            "ready" => Ok(Self::Ready),
            "claimed" => Ok(Self::Claimed),
            "in_progress" => Ok(Self::InProgress),
            "done" => Ok(Self::Done),
            "merged" => Ok(Self::Merged),
            "merge-failed" => Ok(Self::MergeFailed),
            "blocked" => Ok(Self::Blocked),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown car status: {other}")),
        }
    }
}

/// A unit of engineering work.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Car {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub design_notes: Option<String>,
    pub acceptance_criteria: Option<String>,
    #[sqlx(try_from = "String")]
    pub car_type: CarType,
    #[sqlx(try_from = "String")]
    pub status: CarStatus,
    pub priority: i16,
    pub track: String,
    pub assignee: Option<String>,
    pub parent_id: Option<String>,
    pub branch: String,
    pub skip_tests: bool,
    pub base_branch: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<String> for CarType {
    type Error = String;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl TryFrom<String> for CarStatus {
    type Error = String;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A "car A is blocked by car B" edge (`car_deps`).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CarDep {
    pub car_id: String,
    pub blocked_by: String,
    pub dep_type: String,
    pub created_at: DateTime<Utc>,
}

/// An append-only progress journal entry (`car_progress`).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CarProgress {
    pub id: i64,
    pub car_id: String,
    pub cycle: i32,
    pub session_id: Option<String>,
    pub engine_id: Option<String>,
    pub note: String,
    pub changed_files: serde_json::Value,
    pub commit_hash: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_table_matches_spec_table() {
        use CarStatus::*;
        assert_eq!(Draft.allowed_successors(), &[Open]);
        assert_eq!(Open.allowed_successors(), &[Ready, Cancelled, Blocked]);
        assert_eq!(Ready.allowed_successors(), &[Claimed, Blocked]);
        assert_eq!(Claimed.allowed_successors(), &[InProgress, Blocked]);
        assert_eq!(InProgress.allowed_successors(), &[Done, Blocked]);
        assert_eq!(Done.allowed_successors(), &[Merged, MergeFailed]);
        assert_eq!(Blocked.allowed_successors(), &[Open, Ready]);
        assert_eq!(MergeFailed.allowed_successors(), &[Done]);
    }

    #[test]
    fn resolved_statuses_match_glossary() {
        assert!(CarStatus::Done.is_resolved());
        assert!(CarStatus::Cancelled.is_resolved());
        assert!(CarStatus::Merged.is_resolved());
        assert!(!CarStatus::Open.is_resolved());
        assert!(!CarStatus::Blocked.is_resolved());
    }

    #[test]
    fn status_round_trips_through_str() {
        for s in [
            CarStatus::Draft,
            CarStatus::Open,
            CarStatus::Ready,
            CarStatus::Claimed,
            CarStatus::InProgress,
            CarStatus::Done,
            CarStatus::Merged,
            CarStatus::MergeFailed,
            CarStatus::Blocked,
            CarStatus::Cancelled,
        ] {
            let parsed: CarStatus = s.as_str().parse().unwrap();
            assert_eq!(parsed, s);
        }
    }
}

impl PartialEq for CarStatus {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}
impl Eq for CarStatus {}
