//! The `engines` table: one row per running agent-supervisor process (§3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Lifecycle status of a registered engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineStatus {
    Idle,
    Working,
    Stalled,
    Dead,
}

impl EngineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Working => "working",
            Self::Stalled => "stalled",
            Self::Dead => "dead",
        }
    }
}

impl std::fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for EngineStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "working" => Ok(Self::Working),
            "stalled" => Ok(Self::Stalled),
            "dead" => Ok(Self::Dead),
            other => Err(format!("unknown engine status: {other}")),
        }
    }
}

impl TryFrom<String> for EngineStatus {
    type Error = String;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A registered, long-lived worker daemon bound to a single track.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Engine {
    pub id: String,
    pub track: String,
    pub role: String,
    #[sqlx(try_from = "String")]
    pub status: EngineStatus,
    pub current_car: Option<String>,
    pub session_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for s in [
            EngineStatus::Idle,
            EngineStatus::Working,
            EngineStatus::Stalled,
            EngineStatus::Dead,
        ] {
            let parsed: EngineStatus = s.as_str().parse().unwrap();
            assert_eq!(parsed, s);
        }
    }
}
