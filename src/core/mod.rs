//! Domain model: connections, sessions, tasks, executors.
//!
//! Every entity is shared as an `Arc` and synchronised internally with its
//! own mutex; the blocking operations (`Executor::wait_binding`, the task
//! completion rendezvous) park on a condvar paired with that mutex. Lock
//! order across the crate is cache → session → task → executor; no entity
//! method calls into another entity while holding a lower lock.

pub mod connection;
pub mod executor;
pub mod session;
pub mod task;

pub use connection::{Connection, ConnectionState};
pub use executor::{Executor, ExecutorSnapshot, ExecutorState};
pub use session::{Session, SessionSnapshot, SessionState};
pub use task::{Task, TaskSnapshot, TaskState};

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// How often blocking waits re-check their cancellation probe.
pub(crate) const WAIT_POLL: std::time::Duration = std::time::Duration::from_millis(100);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid id {value:?}: not a UUID")]
pub struct InvalidId {
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

/// Executors name themselves at registration, so their id is an opaque
/// string rather than a manager-assigned UUID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutorId(String);

macro_rules! uuid_id {
    ($name:ident) => {
        impl $name {
            pub fn generate() -> Self {
                $name(Uuid::new_v4())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = InvalidId;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map($name).map_err(|_| InvalidId {
                    value: s.to_string(),
                })
            }
        }
    };
}

uuid_id!(ConnectionId);
uuid_id!(SessionId);
uuid_id!(TaskId);

impl ExecutorId {
    pub fn new(id: impl Into<String>) -> Self {
        ExecutorId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExecutorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Failures of entity state transitions and rendezvous waits.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("executor <{executor}> is already bound to session <{session}>")]
    AlreadyBound {
        executor: ExecutorId,
        session: SessionId,
    },

    #[error("executor <{0}> has no bound session")]
    NoBoundSession(ExecutorId),

    #[error("session <{0}> is closed")]
    SessionClosed(SessionId),

    #[error("connection <{0}> is closed")]
    ConnectionClosed(ConnectionId),

    #[error("no task <{task}> in session <{session}>")]
    UnknownTask { task: TaskId, session: SessionId },

    #[error("task <{task}> failed: {message}")]
    TaskFailed { task: TaskId, message: String },

    #[error("task <{task}> cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        task: TaskId,
        from: TaskState,
        to: TaskState,
    },

    #[error("wait cancelled by caller")]
    Cancelled,

    #[error("entity lock poisoned")]
    Poisoned,
}
