//! Agent supervisor (§4.5): spawns the external agent CLI, captures its
//! output into the log store, and reports exit exactly once.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sqlx::PgPool;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::ids;
use crate::models::LogDirection;

/// Errors surfaced by the supervisor, prefixed `agent:` (§7).
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("agent: failed to start subprocess: {0}")]
    SpawnFailed(std::io::Error),

    #[error("agent: {0}")]
    Database(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, AgentError>;

/// Per-chunk observer invoked on every stdout read, used by the stall
/// detector (§4.6). Must not block the reader loop.
pub type ChunkHook = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Parameters for [`spawn_agent`].
pub struct SpawnOpts {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    pub engine_id: String,
    pub car_id: String,
    pub flush_interval: Duration,
    pub on_stdout_chunk: Option<ChunkHook>,
}

impl Default for SpawnOpts {
    fn default() -> Self {
        Self {
            program: String::new(),
            args: Vec::new(),
            cwd: PathBuf::from("."),
            env: Vec::new(),
            engine_id: String::new(),
            car_id: String::new(),
            flush_interval: Duration::from_secs(5),
            on_stdout_chunk: None,
        }
    }
}

struct StreamBuffer {
    bytes: Mutex<Vec<u8>>,
}

impl StreamBuffer {
    fn new() -> Self {
        Self {
            bytes: Mutex::new(Vec::new()),
        }
    }

    fn push(&self, chunk: &[u8]) {
        self.bytes.lock().unwrap().extend_from_slice(chunk);
    }

    fn drain(&self) -> Vec<u8> {
        std::mem::take(&mut *self.bytes.lock().unwrap())
    }
}

/// A live invocation of the agent subprocess for one (engine, car) pair.
///
/// The cycle counter lives here rather than in the database: it spans
/// multiple clear cycles within one session but resets on the next
/// `ClaimCar` (§11).
pub struct Session {
    pub id: String,
    pub engine_id: String,
    pub car_id: String,
    pid: Option<u32>,
    exit_rx: Mutex<Option<oneshot::Receiver<std::process::ExitStatus>>>,
    cycle: AtomicU32,
}

impl Session {
    /// The exit status, delivered exactly once. Subsequent calls after the
    /// first successful receive return `None`.
    pub async fn done(&self) -> Option<std::process::ExitStatus> {
        let rx = self.exit_rx.lock().unwrap().take()?;
        rx.await.ok()
    }

    pub fn cycle(&self) -> u32 {
        self.cycle.load(Ordering::SeqCst)
    }

    pub fn set_cycle(&self, n: u32) {
        self.cycle.store(n, Ordering::SeqCst);
    }

    /// Send SIGTERM, wait briefly, then force-kill (§4.5 cancellation).
    ///
    /// Signals the process by pid rather than through the `Child` handle
    /// itself, since the wait task holds exclusive access to that handle for
    /// the life of the subprocess.
    pub async fn cancel(&self, grace: Duration) {
        let Some(pid) = self.pid else { return };
        send_signal(pid, libc::SIGTERM);
        tokio::time::sleep(grace).await;
        send_signal(pid, libc::SIGKILL);
    }
}

fn send_signal(pid: u32, sig: i32) {
    unsafe {
        libc::kill(pid as i32, sig);
    }
}

async fn flush_loop(
    pool: PgPool,
    engine_id: String,
    session_id: String,
    car_id: String,
    direction: LogDirection,
    buffer: Arc<StreamBuffer>,
    mut interval: tokio::time::Interval,
    mut stop: tokio::sync::watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = interval.tick() => {
                flush_once(&pool, &engine_id, &session_id, &car_id, direction, &buffer).await;
            }
            _ = stop.changed() => {
                if *stop.borrow() {
                    flush_once(&pool, &engine_id, &session_id, &car_id, direction, &buffer).await;
                    break;
                }
            }
        }
    }
}

async fn flush_once(
    pool: &PgPool,
    engine_id: &str,
    session_id: &str,
    car_id: &str,
    direction: LogDirection,
    buffer: &StreamBuffer,
) {
    let chunk = buffer.drain();
    if chunk.is_empty() {
        return;
    }

    let content = String::from_utf8_lossy(&chunk).to_string();
    if let Err(e) = sqlx::query(
        r#"
        INSERT INTO agent_logs (engine_id, session_id, car_id, direction, content)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(engine_id)
    .bind(session_id)
    .bind(car_id)
    .bind(direction.as_str())
    .bind(content)
    .execute(pool)
    .await
    {
        warn!(engine_id, session_id, error = %e, "failed to flush agent log");
    }
}

/// Launch the agent subprocess and return a live [`Session`] handle (§4.5).
///
/// Stdout and stderr are each captured into an accumulating buffer drained
/// on `opts.flush_interval` into an `AgentLog` row; a final flush runs after
/// the process exits so forensic logs are never truncated at shutdown.
pub async fn spawn_agent(pool: PgPool, opts: SpawnOpts) -> Result<Arc<Session>> {
    let session_id = ids::new_session_id();

    let mut command = Command::new(&opts.program);
    command
        .args(&opts.args)
        .current_dir(&opts.cwd)
        .envs(opts.env.clone())
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());

    let mut child = command.spawn().map_err(AgentError::SpawnFailed)?;

    let stdout_pipe = child.stdout.take().expect("stdout was piped");
    let stderr_pipe = child.stderr.take().expect("stderr was piped");

    let stdout_buf = Arc::new(StreamBuffer::new());
    let stderr_buf = Arc::new(StreamBuffer::new());

    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);

    tokio::spawn(read_stream(
        stdout_pipe,
        stdout_buf.clone(),
        opts.on_stdout_chunk.clone(),
    ));
    tokio::spawn(read_stream(stderr_pipe, stderr_buf.clone(), None));

    tokio::spawn(flush_loop(
        pool.clone(),
        opts.engine_id.clone(),
        session_id.clone(),
        opts.car_id.clone(),
        LogDirection::Out,
        stdout_buf,
        tokio::time::interval(opts.flush_interval),
        stop_rx.clone(),
    ));
    tokio::spawn(flush_loop(
        pool.clone(),
        opts.engine_id.clone(),
        session_id.clone(),
        opts.car_id.clone(),
        LogDirection::Err,
        stderr_buf,
        tokio::time::interval(opts.flush_interval),
        stop_rx,
    ));

    let pid = child.id();

    let (exit_tx, exit_rx) = oneshot::channel();
    let mut waited_child = child;
    tokio::spawn(async move {
        let status = waited_child.wait().await;
        if let Ok(status) = status {
            let _ = exit_tx.send(status);
        }
        let _ = stop_tx.send(true);
    });

    info!(engine_id = %opts.engine_id, car_id = %opts.car_id, session_id = %session_id, "agent spawned");

    if let Err(e) = sqlx::query("UPDATE engines SET session_id = $2 WHERE id = $1")
        .bind(&opts.engine_id)
        .bind(&session_id)
        .execute(&pool)
        .await
    {
        warn!(engine_id = %opts.engine_id, error = %e, "best-effort session_id update failed");
    }

    Ok(Arc::new(Session {
        id: session_id,
        engine_id: opts.engine_id,
        car_id: opts.car_id,
        pid,
        exit_rx: Mutex::new(Some(exit_rx)),
        cycle: AtomicU32::new(0),
    }))
}

async fn read_stream<R: AsyncReadExt + Unpin>(
    mut reader: R,
    buffer: Arc<StreamBuffer>,
    hook: Option<ChunkHook>,
) {
    let mut chunk = vec![0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                buffer.push(&chunk[..n]);
                if let Some(hook) = &hook {
                    hook(&chunk[..n]);
                }
            }
            Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_buffer_drains_to_empty() {
        let buf = StreamBuffer::new();
        buf.push(b"hello");
        assert_eq!(buf.drain(), b"hello".to_vec());
        assert!(buf.drain().is_empty());
    }

    #[test]
    fn session_cycle_starts_at_zero() {
        let (_tx, rx) = oneshot::channel();
        let session = Session {
            id: "sess-00000000".to_string(),
            engine_id: "eng-00000000".to_string(),
            car_id: "car-00000".to_string(),
            pid: None,
            exit_rx: Mutex::new(Some(rx)),
            cycle: AtomicU32::new(0),
        };
        assert_eq!(session.cycle(), 0);
        session.set_cycle(3);
        assert_eq!(session.cycle(), 3);
    }
}
