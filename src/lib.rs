#![forbid(unsafe_code)]

pub mod client;
pub mod config;
pub mod core;
pub mod daemon;
pub mod error;
pub mod service;
pub mod telemetry;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the domain model at the crate root for convenience
pub use crate::core::{
    Connection, ConnectionId, ConnectionState, Executor, ExecutorId, ExecutorState, InvalidId,
    Session, SessionId, SessionState, StateError, Task, TaskId, TaskState,
};
