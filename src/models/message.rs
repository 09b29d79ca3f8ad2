//! The `messages` and `broadcast_acks` tables (§3, §4.8).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Recipient used for a [`Message`] that every agent should see.
pub const BROADCAST_RECIPIENT: &str = "broadcast";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagePriority {
    Low,
    Normal,
    High,
    Urgent,
}

impl MessagePriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }
}

impl std::fmt::Display for MessagePriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for MessagePriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "urgent" => Ok(Self::Urgent),
            other => Err(format!("unknown message priority: {other}")),
        }
    }
}

impl TryFrom<String> for MessagePriority {
    type Error = String;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl Default for MessagePriority {
    fn default() -> Self {
        Self::Normal
    }
}

/// A directed or broadcast note on the instruction bus (§4.8).
///
/// `to_agent` holds [`BROADCAST_RECIPIENT`] for broadcasts; per-recipient
/// consumption of those is tracked separately via [`BroadcastAck`] rather
/// than flipping `acknowledged` on the shared row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Message {
    pub id: i64,
    pub from_agent: String,
    pub to_agent: String,
    pub car_id: Option<String>,
    pub thread_id: Option<String>,
    pub reply_to: Option<i64>,
    pub subject: String,
    pub body: String,
    #[sqlx(try_from = "String")]
    pub priority: MessagePriority,
    pub acknowledged: bool,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn is_broadcast(&self) -> bool {
        self.to_agent == BROADCAST_RECIPIENT
    }
}

/// Records which agents have consumed a broadcast message.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BroadcastAck {
    pub message_id: i64,
    pub agent_id: String,
    pub acked_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_round_trips_through_str() {
        for p in [
            MessagePriority::Low,
            MessagePriority::Normal,
            MessagePriority::High,
            MessagePriority::Urgent,
        ] {
            let parsed: MessagePriority = p.as_str().parse().unwrap();
            assert_eq!(parsed, p);
        }
    }

    #[test]
    fn default_priority_is_normal() {
        assert_eq!(MessagePriority::default(), MessagePriority::Normal);
    }
}
