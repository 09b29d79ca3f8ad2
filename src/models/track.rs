//! The `tracks` table: lanes of work scoped to a language/area (§3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Track {
    pub name: String,
    pub language: String,
    pub file_patterns: serde_json::Value,
    pub engine_slots: i32,
    pub test_command: Option<String>,
    pub conventions: serde_json::Value,
    pub active: bool,
    pub prompt: Option<String>,
    pub created_at: DateTime<Utc>,
}
