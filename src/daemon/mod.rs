//! Daemon module — the kiln task manager service.
//!
//! Provides:
//! - The process-wide entity cache and its detached snapshots
//! - The frontend (client) and backend (executor) RPC surfaces
//! - The scheduler binding idle executors to sessions with pending work
//! - The ndjson-over-TCP wire protocol and server loops

pub mod backend;
pub mod cache;
pub mod frontend;
pub mod ipc;
pub mod run;
pub mod scheduler;
pub mod server;

pub use backend::{Backend, StreamError};
pub use cache::{Cache, CacheError, Snapshot};
pub use frontend::Frontend;
pub use ipc::{
    ErrorCode, ErrorPayload, IpcError, Metadata, Request, Response, ResponsePayload, TaskInput,
    TaskOutput, decode_request, decode_response, send_frame,
};
pub use run::{DaemonHandle, run, start};
pub use scheduler::SchedulerHandle;
