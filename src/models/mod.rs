//! Row types for every table in the work-lifecycle schema (§3).

mod agent_log;
mod car;
mod engine;
mod message;
mod track;

pub use agent_log::{AgentLog, LogDirection};
pub use car::{Car, CarDep, CarProgress, CarStatus, CarType};
pub use engine::{Engine, EngineStatus};
pub use message::{BroadcastAck, Message, MessagePriority, BROADCAST_RECIPIENT};
pub use track::Track;
