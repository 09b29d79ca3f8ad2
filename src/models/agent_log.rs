//! The `agent_logs` table: captured subprocess stdout/stderr (§4.5).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogDirection {
    Out,
    Err,
}

impl LogDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Out => "out",
            Self::Err => "err",
        }
    }
}

impl std::fmt::Display for LogDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for LogDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, <Self as std::str::FromStr>::Err> {
        match s {
            "out" => Ok(Self::Out),
            "err" => Ok(Self::Err),
            other => Err(format!("unknown log direction: {other}")),
        }
    }
}

impl TryFrom<String> for LogDirection {
    type Error = String;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A batched chunk of subprocess output (§4.5 log flush).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AgentLog {
    pub id: i64,
    pub engine_id: String,
    pub session_id: String,
    pub car_id: Option<String>,
    #[sqlx(try_from = "String")]
    pub direction: LogDirection,
    pub content: String,
    pub token_count: Option<i32>,
    pub model: Option<String>,
    pub created_at: DateTime<Utc>,
}
