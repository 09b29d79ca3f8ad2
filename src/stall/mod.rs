//! Stall detector (§4.6): a passive observer over a session's stdout stream
//! that decides when an agent has gone unproductive.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use sqlx::PgPool;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::config::StallThresholds;
use crate::engine::registry::EngineRegistry;
use crate::messaging::{Messaging, MessagePriority, YARDMASTER_AGENT};
use crate::models::CarStatus;
use crate::services::{CarError, UpdateCar};

const WINDOW_CAPACITY: usize = 100;
const SNIPPET_MAX_BYTES: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallKind {
    StdoutTimeout,
    RepeatedError,
    ExcessiveCycles,
}

impl StallKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StdoutTimeout => "stdout_timeout",
            Self::RepeatedError => "repeated_error",
            Self::ExcessiveCycles => "excessive_cycles",
        }
    }
}

#[derive(Debug, Clone)]
pub struct StallReason {
    pub kind: StallKind,
    pub detail: String,
    pub snippet: String,
}

struct Inner {
    tx: Mutex<Option<oneshot::Sender<StallReason>>>,
    last_output: Mutex<Instant>,
    window: Mutex<VecDeque<String>>,
    snippet: Mutex<Vec<u8>>,
    thresholds: StallThresholds,
}

/// Mutex-protected, one-shot observer attached to a session's stdout.
/// Additional triggers after the first emit are silently ignored.
pub struct StallDetector {
    inner: Arc<Inner>,
}

impl StallDetector {
    /// Construct a detector and its single-slot receiver.
    pub fn new(thresholds: StallThresholds) -> (Self, oneshot::Receiver<StallReason>) {
        let (tx, rx) = oneshot::channel();
        let inner = Arc::new(Inner {
            tx: Mutex::new(Some(tx)),
            last_output: Mutex::new(Instant::now()),
            window: Mutex::new(VecDeque::with_capacity(WINDOW_CAPACITY)),
            snippet: Mutex::new(Vec::new()),
            thresholds,
        });
        (Self { inner }, rx)
    }

    /// A per-chunk callback suitable for [`crate::supervisor::SpawnOpts::on_stdout_chunk`].
    pub fn hook(&self) -> crate::supervisor::ChunkHook {
        let inner = self.inner.clone();
        Arc::new(move |chunk: &[u8]| on_chunk(&inner, chunk))
    }

    /// Report a newly completed clear cycle (§4.6 rule 3).
    pub fn set_cycle(&self, n: u32) {
        if n > self.inner.thresholds.max_clear_cycles {
            emit(
                &self.inner,
                StallKind::ExcessiveCycles,
                format!("cycle {n} exceeds max_clear_cycles {}", self.inner.thresholds.max_clear_cycles),
            );
        }
    }

    /// Spawn the stdout-timeout watchdog ticker (§4.6 rule 1).
    pub fn spawn_timeout_watchdog(&self) -> tokio::task::JoinHandle<()> {
        let inner = self.inner.clone();
        let timeout = self.inner.thresholds.stdout_timeout();
        let interval = self.inner.thresholds.ticker_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let elapsed = inner.last_output.lock().unwrap().elapsed();
                if elapsed >= timeout {
                    emit(
                        &inner,
                        StallKind::StdoutTimeout,
                        format!("no output for {:.1}s (timeout {:.1}s)", elapsed.as_secs_f64(), timeout.as_secs_f64()),
                    );
                    break;
                }
            }
        })
    }
}

fn on_chunk(inner: &Arc<Inner>, chunk: &[u8]) {
    *inner.last_output.lock().unwrap() = Instant::now();

    {
        let mut snippet = inner.snippet.lock().unwrap();
        snippet.extend_from_slice(chunk);
        if snippet.len() > SNIPPET_MAX_BYTES {
            let excess = snippet.len() - SNIPPET_MAX_BYTES;
            snippet.drain(0..excess);
        }
    }

    let text = String::from_utf8_lossy(chunk);
    let mut window = inner.window.lock().unwrap();
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if window.len() == WINDOW_CAPACITY {
            window.pop_front();
        }
        window.push_back(trimmed.to_string());

        let count = window.iter().filter(|l| l.as_str() == trimmed).count();
        if count >= inner.thresholds.repeated_error_max {
            let line_owned = trimmed.to_string();
            drop(window);
            emit(
                inner,
                StallKind::RepeatedError,
                format!("line {line_owned:?} occurred {count} times"),
            );
            return;
        }
    }
}

fn emit(inner: &Arc<Inner>, kind: StallKind, detail: String) {
    let mut tx_slot = inner.tx.lock().unwrap();
    let Some(tx) = tx_slot.take() else {
        return;
    };

    let snippet = String::from_utf8_lossy(&inner.snippet.lock().unwrap()).to_string();
    let reason = StallReason { kind, detail, snippet };
    warn!(kind = kind.as_str(), detail = %reason.detail, "stall detected");
    let _ = tx.send(reason);
}

/// Escalate a detected stall (§4.6 `HandleStall`): mark the engine stalled,
/// block the car, and page the yardmaster with an urgent message.
pub async fn handle_stall(
    pool: &PgPool,
    engine_id: &str,
    car_id: &str,
    reason: &StallReason,
) -> Result<(), CarError> {
    let registry = EngineRegistry::new(pool.clone());
    if let Err(e) = registry.set_status(engine_id, "stalled").await {
        warn!(engine_id, error = %e, "failed to mark engine stalled during stall escalation");
    }

    let car_service = crate::services::CarService::new(pool.clone(), String::new());
    car_service
        .update(
            car_id,
            UpdateCar {
                status: Some(CarStatus::Blocked),
                ..Default::default()
            },
        )
        .await?;

    let messaging = Messaging::new(pool.clone());
    let body = format!(
        "engine={engine_id} car={car_id} stall_type={} detail={} snippet={:?}",
        reason.kind.as_str(),
        reason.detail,
        reason.snippet
    );
    if let Err(e) = messaging
        .send(
            engine_id,
            YARDMASTER_AGENT,
            "engine-stalled",
            &body,
            crate::messaging::SendOpts {
                priority: MessagePriority::Urgent,
                car_id: Some(car_id.to_string()),
                ..Default::default()
            },
        )
        .await
    {
        warn!(engine_id, car_id, error = %e, "failed to send stall escalation message");
    }

    info!(engine_id, car_id, kind = reason.kind.as_str(), "stall escalated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds() -> StallThresholds {
        StallThresholds {
            stdout_timeout_secs: 120,
            repeated_error_max: 3,
            max_clear_cycles: 5,
        }
    }

    #[tokio::test]
    async fn repeated_error_fires_at_threshold() {
        let (detector, rx) = StallDetector::new(thresholds());
        let hook = detector.hook();
        hook(b"Error: X\n");
        hook(b"Error: X\n");
        hook(b"Error: X\n");

        let reason = rx.await.unwrap();
        assert_eq!(reason.kind, StallKind::RepeatedError);
        assert!(reason.detail.contains("Error: X"));
        assert!(reason.detail.contains('3'));
    }

    #[tokio::test]
    async fn emit_is_one_shot() {
        let (detector, rx) = StallDetector::new(thresholds());
        let hook = detector.hook();
        hook(b"Error: X\n");
        hook(b"Error: X\n");
        hook(b"Error: X\n");
        // Additional identical lines must not panic or double-send.
        hook(b"Error: X\n");
        hook(b"Error: X\n");

        let reason = rx.await.unwrap();
        assert_eq!(reason.kind, StallKind::RepeatedError);
    }

    #[test]
    fn excessive_cycles_emits_past_threshold() {
        let (detector, mut rx) = StallDetector::new(thresholds());
        detector.set_cycle(5);
        assert!(rx.try_recv().is_err());
        detector.set_cycle(6);
        let reason = rx.try_recv().unwrap();
        assert_eq!(reason.kind, StallKind::ExcessiveCycles);
    }

    #[test]
    fn snippet_is_capped_at_500_bytes() {
        let (detector, _rx) = StallDetector::new(thresholds());
        let hook = detector.hook();
        let chunk = vec![b'a'; 1000];
        hook(&chunk);
        assert!(detector.inner.snippet.lock().unwrap().len() <= SNIPPET_MAX_BYTES);
    }
}
