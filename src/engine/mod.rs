//! Engine registry and worker loop (§4, composing §4.1-§4.8 into one
//! supervised process per daemon).

pub mod registry;
pub mod worker;

pub use registry::{spawn_heartbeat_task, EngineError, EngineRegistry};
pub use worker::{run_engine_loop, EngineLoopConfig};
