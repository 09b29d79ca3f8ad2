//! Messaging and inbox (§4.8, §11): the narrow instruction bus engines
//! consume between cycles.

use sqlx::PgPool;
use tracing::info;

pub use crate::models::MessagePriority;
use crate::models::{Message, BROADCAST_RECIPIENT};

/// The coordinator agent's well-known recipient id (§6 process boundary).
pub const YARDMASTER_AGENT: &str = "yardmaster";

/// Errors surfaced by [`Messaging`], prefixed `messaging:` (§7).
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    #[error("messaging: message not found: {0}")]
    NotFound(i64),

    #[error("messaging: {0}")]
    Database(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, MessagingError>;

/// Optional fields for [`Messaging::send`]/[`broadcast`](Messaging::broadcast).
#[derive(Debug, Clone, Default)]
pub struct SendOpts {
    pub priority: MessagePriority,
    pub thread_id: Option<String>,
    pub car_id: Option<String>,
    pub reply_to: Option<i64>,
}

/// Classification of a message's `subject` into the engine's reaction policy (§4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    Abort,
    Pause,
    Resume,
    SwitchTrack,
    Guidance,
    Unknown,
}

pub fn classify(subject: &str) -> Instruction {
    match subject {
        "abort" => Instruction::Abort,
        "pause" => Instruction::Pause,
        "resume" => Instruction::Resume,
        "switch-track" => Instruction::SwitchTrack,
        "guidance" => Instruction::Guidance,
        _ => Instruction::Unknown,
    }
}

/// True if any `abort` instruction applies to `car_id` — an abort with an
/// empty car-id matches any current work (§4.8).
pub fn should_abort(inbox: &[(Message, Instruction)], car_id: &str) -> bool {
    inbox.iter().any(|(msg, instr)| {
        *instr == Instruction::Abort
            && msg
                .car_id
                .as_deref()
                .map(|id| id.is_empty() || id == car_id)
                .unwrap_or(true)
    })
}

pub fn should_pause(inbox: &[(Message, Instruction)]) -> bool {
    inbox.iter().any(|(_, instr)| *instr == Instruction::Pause)
}

pub fn has_resume(inbox: &[(Message, Instruction)]) -> bool {
    inbox.iter().any(|(_, instr)| *instr == Instruction::Resume)
}

pub struct Messaging {
    pool: PgPool,
}

impl Messaging {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Write a directed message (§4.8 `Send`).
    pub async fn send(
        &self,
        from: &str,
        to: &str,
        subject: &str,
        body: &str,
        opts: SendOpts,
    ) -> Result<Message> {
        let message = sqlx::query_as::<_, Message>(
            r#"
            INSERT INTO messages (from_agent, to_agent, car_id, thread_id, reply_to, subject, body, priority)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
            "#,
        )
        .bind(from)
        .bind(to)
        .bind(&opts.car_id)
        .bind(&opts.thread_id)
        .bind(opts.reply_to)
        .bind(subject)
        .bind(body)
        .bind(opts.priority.as_str())
        .fetch_one(&self.pool)
        .await?;

        info!(from, to, subject, message_id = message.id, "message sent");
        Ok(message)
    }

    /// Reply to `original`, inheriting its thread and stamping a parent id (§4.8).
    pub async fn reply(
        &self,
        original: &Message,
        from: &str,
        body: &str,
        mut opts: SendOpts,
    ) -> Result<Message> {
        opts.thread_id = Some(
            original
                .thread_id
                .clone()
                .unwrap_or_else(|| original.id.to_string()),
        );
        opts.reply_to = Some(original.id);
        opts.car_id = opts.car_id.or_else(|| original.car_id.clone());

        self.send(from, &original.from_agent, &original.subject, body, opts)
            .await
    }

    /// Send to every agent; consumption is tracked per-recipient via `BroadcastAck` (§4.8).
    pub async fn broadcast(
        &self,
        from: &str,
        subject: &str,
        body: &str,
        opts: SendOpts,
    ) -> Result<Message> {
        self.send(from, BROADCAST_RECIPIENT, subject, body, opts)
            .await
    }

    /// Directed messages not yet acknowledged, plus broadcasts this agent has
    /// not consumed, newest first (§4.8 `Inbox`).
    pub async fn inbox(&self, agent_id: &str) -> Result<Vec<Message>> {
        let messages = sqlx::query_as::<_, Message>(
            r#"
            SELECT m.* FROM messages m
            WHERE (m.to_agent = $1 AND m.acknowledged = false)
               OR (m.to_agent = $2 AND NOT EXISTS (
                     SELECT 1 FROM broadcast_acks a
                     WHERE a.message_id = m.id AND a.agent_id = $1
                 ))
            ORDER BY m.created_at DESC
            "#,
        )
        .bind(agent_id)
        .bind(BROADCAST_RECIPIENT)
        .fetch_all(&self.pool)
        .await?;

        Ok(messages)
    }

    /// Acknowledge a directed message (idempotent) (§11).
    pub async fn acknowledge(&self, agent_id: &str, message_id: i64) -> Result<()> {
        let result = sqlx::query(
            "UPDATE messages SET acknowledged = true WHERE id = $1 AND to_agent = $2",
        )
        .bind(message_id)
        .bind(agent_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(MessagingError::NotFound(message_id));
        }
        Ok(())
    }

    /// Acknowledge a broadcast for one recipient (idempotent) (§11).
    pub async fn acknowledge_broadcast(&self, agent_id: &str, message_id: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO broadcast_acks (message_id, agent_id)
            VALUES ($1, $2)
            ON CONFLICT (message_id, agent_id) DO NOTHING
            "#,
        )
        .bind(message_id)
        .bind(agent_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Drain and classify the inbox, acknowledging each message as it is
    /// consumed (§4.8 `ProcessInbox`).
    pub async fn process_inbox(&self, engine_id: &str) -> Result<Vec<(Message, Instruction)>> {
        let messages = self.inbox(engine_id).await?;
        let mut classified = Vec::with_capacity(messages.len());

        for message in messages {
            let instruction = classify(&message.subject);

            if message.is_broadcast() {
                self.acknowledge_broadcast(engine_id, message.id).await?;
            } else {
                self.acknowledge(engine_id, message.id).await?;
            }

            classified.push((message, instruction));
        }

        Ok(classified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn msg(car_id: Option<&str>) -> Message {
        Message {
            id: 1,
            from_agent: "eng-aaaaaaaa".to_string(),
            to_agent: "eng-aaaaaaaa".to_string(),
            car_id: car_id.map(str::to_string),
            thread_id: None,
            reply_to: None,
            subject: "abort".to_string(),
            body: String::new(),
            priority: MessagePriority::Normal,
            acknowledged: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn classify_maps_known_subjects() {
        assert_eq!(classify("abort"), Instruction::Abort);
        assert_eq!(classify("pause"), Instruction::Pause);
        assert_eq!(classify("resume"), Instruction::Resume);
        assert_eq!(classify("switch-track"), Instruction::SwitchTrack);
        assert_eq!(classify("guidance"), Instruction::Guidance);
        assert_eq!(classify("something-else"), Instruction::Unknown);
    }

    #[test]
    fn abort_with_empty_car_id_matches_any_work() {
        let inbox = vec![(msg(None), Instruction::Abort)];
        assert!(should_abort(&inbox, "car-00001"));
        assert!(should_abort(&inbox, "car-99999"));
    }

    #[test]
    fn abort_with_car_id_only_matches_that_car() {
        let inbox = vec![(msg(Some("car-00001")), Instruction::Abort)];
        assert!(should_abort(&inbox, "car-00001"));
        assert!(!should_abort(&inbox, "car-99999"));
    }

    #[test]
    fn pause_and_resume_detection() {
        let mut a = msg(None);
        a.subject = "pause".to_string();
        let inbox = vec![(a, Instruction::Pause)];
        assert!(should_pause(&inbox));
        assert!(!has_resume(&inbox));
    }
}

#[cfg(test)]
mod integration_tests {
    use super::*;
    use sqlx::PgPool;

    #[sqlx::test]
    async fn directed_messages_appear_only_for_their_recipient(pool: PgPool) {
        let messaging = Messaging::new(pool);
        messaging
            .send("yardmaster", "eng-aaaaaaaa", "guidance", "focus on tests", SendOpts::default())
            .await
            .unwrap();

        let inbox_a = messaging.inbox("eng-aaaaaaaa").await.unwrap();
        let inbox_b = messaging.inbox("eng-bbbbbbbb").await.unwrap();
        assert_eq!(inbox_a.len(), 1);
        assert!(inbox_b.is_empty());
    }

    #[sqlx::test]
    async fn broadcast_is_consumed_independently_per_recipient(pool: PgPool) {
        let messaging = Messaging::new(pool);
        messaging
            .broadcast("yardmaster", "pause", "hold all tracks", SendOpts::default())
            .await
            .unwrap();

        let inbox_a = messaging.inbox("eng-aaaaaaaa").await.unwrap();
        assert_eq!(inbox_a.len(), 1);
        messaging.acknowledge_broadcast("eng-aaaaaaaa", inbox_a[0].id).await.unwrap();

        let inbox_a_again = messaging.inbox("eng-aaaaaaaa").await.unwrap();
        assert!(inbox_a_again.is_empty());

        let inbox_b = messaging.inbox("eng-bbbbbbbb").await.unwrap();
        assert_eq!(inbox_b.len(), 1, "a second recipient must still see the unacked broadcast");
    }

    #[sqlx::test]
    async fn process_inbox_classifies_and_acknowledges(pool: PgPool) {
        let messaging = Messaging::new(pool);
        messaging
            .send("yardmaster", "eng-aaaaaaaa", "abort", "stop now", SendOpts::default())
            .await
            .unwrap();

        let processed = messaging.process_inbox("eng-aaaaaaaa").await.unwrap();
        assert_eq!(processed.len(), 1);
        assert_eq!(processed[0].1, Instruction::Abort);

        let inbox_after = messaging.inbox("eng-aaaaaaaa").await.unwrap();
        assert!(inbox_after.is_empty(), "processed messages must be acknowledged");
    }

    #[sqlx::test]
    async fn reply_inherits_thread_and_targets_the_original_sender(pool: PgPool) {
        let messaging = Messaging::new(pool);
        let original = messaging
            .send("yardmaster", "eng-aaaaaaaa", "guidance", "check the logs", SendOpts::default())
            .await
            .unwrap();

        let reply = messaging
            .reply(&original, "eng-aaaaaaaa", "done, nothing unusual", SendOpts::default())
            .await
            .unwrap();

        assert_eq!(reply.to_agent, "yardmaster");
        assert_eq!(reply.reply_to, Some(original.id));
        assert_eq!(reply.thread_id.as_deref(), Some(original.id.to_string().as_str()));
    }
}
