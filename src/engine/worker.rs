//! The engine loop (§4, §2 data flow): composes inbox processing, atomic
//! claim, worktree reset, agent supervision, stall detection, and outcome
//! handling into one long-lived worker.

use std::path::PathBuf;
use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::claim::{self, ClaimError};
use crate::config::{RailyardConfig, TrackConfig};
use crate::engine::registry::{spawn_heartbeat_task, EngineRegistry};
use crate::messaging::{self, Messaging};
use crate::models::CarStatus;
use crate::outcome;
use crate::services::{CarService, UpdateCar};
use crate::stall::{self, StallDetector};
use crate::supervisor::{self, SpawnOpts};
use crate::worktree;

/// Static configuration for one engine daemon's loop.
pub struct EngineLoopConfig {
    pub railyard: RailyardConfig,
    pub track: TrackConfig,
    pub agent_program: String,
    pub agent_args: Vec<String>,
    pub poll_interval: Duration,
    pub cancel_grace: Duration,
}

/// Run one engine's loop until `shutdown` fires. Blocks for the daemon's
/// lifetime; callers spawn this per track/slot (§2: "many independent
/// OS-level worker daemons").
pub async fn run_engine_loop(pool: PgPool, cfg: EngineLoopConfig, mut shutdown: watch::Receiver<bool>) {
    let registry = EngineRegistry::new(pool.clone());
    let engine = match registry.register(&cfg.track.name).await {
        Ok(engine) => engine,
        Err(e) => {
            warn!(track = %cfg.track.name, error = %e, "failed to register engine, aborting loop");
            return;
        }
    };
    let engine_id = engine.id.clone();
    info!(engine_id = %engine_id, track = %cfg.track.name, "engine loop starting");

    let heartbeat_handle = spawn_heartbeat_task(
        pool.clone(),
        engine_id.clone(),
        Duration::from_secs(30),
        shutdown.clone(),
    );

    let repo_dir = PathBuf::from(&cfg.railyard.repo_dir);
    let messaging = Messaging::new(pool.clone());

    'outer: loop {
        if *shutdown.borrow() {
            break;
        }

        if let Err(e) = process_inbox_and_react(&messaging, &engine_id).await {
            warn!(engine_id = %engine_id, error = %e, "inbox processing failed");
        }

        let car = match claim::claim_car(&pool, &engine_id, &cfg.track.name).await {
            Ok(car) => car,
            Err(ClaimError::NoReadyCars(_)) => {
                tokio::select! {
                    _ = tokio::time::sleep(cfg.poll_interval) => continue 'outer,
                    _ = shutdown.changed() => { if *shutdown.borrow() { break; } else { continue 'outer; } }
                }
            }
            Err(e) => {
                warn!(engine_id = %engine_id, error = %e, "claim failed");
                tokio::time::sleep(cfg.poll_interval).await;
                continue 'outer;
            }
        };

        if let Err(e) = run_one_car(&pool, &cfg, &repo_dir, &engine_id, car, &mut shutdown).await {
            warn!(engine_id = %engine_id, error = %e, "car run failed");
        }
    }

    if let Err(e) = registry.deregister(&engine_id).await {
        warn!(engine_id = %engine_id, error = %e, "failed to deregister on shutdown");
    }
    heartbeat_handle.abort();
    info!(engine_id = %engine_id, "engine loop stopped");
}

async fn process_inbox_and_react(messaging: &Messaging, engine_id: &str) -> messaging::Result<()> {
    let inbox = messaging.process_inbox(engine_id).await?;
    if messaging::should_pause(&inbox) {
        info!(engine_id, "pause instruction received");
    }
    Ok(())
}

async fn run_one_car(
    pool: &PgPool,
    cfg: &EngineLoopConfig,
    repo_dir: &std::path::Path,
    engine_id: &str,
    mut car: crate::models::Car,
    shutdown: &mut watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let car_service = CarService::new(pool.clone(), cfg.railyard.branch_prefix.clone());
    let worktree_dir = worktree::ensure_worktree(repo_dir, engine_id).await?;

    let base_branch = match &car.base_branch {
        Some(b) => b.clone(),
        None => worktree::detect_base_branch(repo_dir, Some(&cfg.railyard.default_base_branch)).await?,
    };

    let mut cycle: i32 = 0;

    loop {
        worktree::reset_worktree(&worktree_dir, &base_branch).await?;
        worktree::create_branch(&worktree_dir, &car.branch).await?;

        let (detector, stall_rx) = StallDetector::new(cfg.railyard.stall_thresholds);
        let watchdog = detector.spawn_timeout_watchdog();

        let session = supervisor::spawn_agent(
            pool.clone(),
            SpawnOpts {
                program: cfg.agent_program.clone(),
                args: cfg.agent_args.clone(),
                cwd: worktree_dir.clone(),
                env: Vec::new(),
                engine_id: engine_id.to_string(),
                car_id: car.id.clone(),
                flush_interval: Duration::from_secs(5),
                on_stdout_chunk: Some(detector.hook()),
            },
        )
        .await?;

        cycle += 1;
        detector.set_cycle(cycle as u32);

        tokio::select! {
            status = session.done() => {
                watchdog.abort();
                let _ = status;
            }
            Ok(reason) = stall_rx => {
                session.cancel(cfg.cancel_grace).await;
                stall::handle_stall(pool, engine_id, &car.id, &reason).await?;
                return Ok(());
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    session.cancel(cfg.cancel_grace).await;
                    watchdog.abort();
                    return Ok(());
                }
            }
        }

        car = car_service.get(&car.id).await?.car;

        if car.status == CarStatus::Done {
            outcome::handle_completion(
                pool,
                &worktree_dir,
                &car,
                engine_id,
                &session.id,
                cycle,
                None,
            )
            .await?;
            return Ok(());
        }

        outcome::handle_clear_cycle(pool, &worktree_dir, &car, engine_id, &session.id, cycle, None).await?;

        let inbox_messages = Messaging::new(pool.clone()).process_inbox(engine_id).await?;
        if messaging::should_abort(&inbox_messages, &car.id) {
            car_service
                .update(
                    &car.id,
                    UpdateCar {
                        status: Some(CarStatus::Blocked),
                        ..Default::default()
                    },
                )
                .await?;
            return Ok(());
        }
    }
}
