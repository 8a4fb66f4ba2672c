//! Wire protocol types and codec.
//!
//! Protocol: newline-delimited JSON over TCP. Both RPC surfaces share the
//! endpoint; the `op` tag selects the operation.
//!
//! Request format: `{"op": "send_input", ...}\n`
//! Response format: `{"ok": ...}\n` or `{"err": {"code": "...", "message": "..."}}\n`
//!
//! `get_task` is the one streaming operation: the server answers with a
//! sequence of `{"ok":{"task_input":...}}` frames and terminates the stream
//! with `{"ok":{"drained":...}}`.

use std::fmt;
use std::io::Write;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::cache::CacheError;
use crate::core::StateError;

pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound on a single wire frame. Oversized frames are rejected
/// before JSON parsing.
pub const MAX_FRAME_BYTES: usize = 1 << 20;

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("i/o failure on the wire: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed frame: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("peer closed the stream")]
    Disconnected,
}

/// Entity reference carried by most operations. Ids are UUID strings,
/// except executor ids, which the executor chooses at registration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_ref: Option<String>,
}

impl Metadata {
    pub fn with_id(id: impl Into<String>) -> Self {
        Metadata {
            id: id.into(),
            ..Metadata::default()
        }
    }
}

/// A task handed to an executor. On `send_input` the task id is empty;
/// the manager assigns it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInput {
    #[serde(default)]
    pub task_id: String,
    pub session_id: String,
    pub input: String,
}

/// A finished task. `error` set means the executor failed the task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub task_id: String,
    pub session_id: String,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    // === Frontend (client-facing) ===
    NewConnection {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client: Option<Metadata>,
    },
    CloseConnection {
        connection: Metadata,
    },
    NewSession {
        connection: Metadata,
    },
    CloseSession {
        session: Metadata,
    },
    SendInput {
        input: TaskInput,
    },
    /// `task.id` is the task, `task.owner_ref` the owning session.
    RecvOutput {
        task: Metadata,
    },
    ListSession {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client: Option<Metadata>,
    },
    /// Declared on the wire; not implemented by the manager.
    Run,

    // === Backend (executor-facing) ===
    Register {
        executor: Metadata,
    },
    Unregister {
        executor: Metadata,
    },
    Bind {
        executor: Metadata,
    },
    Unbind {
        executor: Metadata,
    },
    GetTask {
        executor: Metadata,
    },
    CompleteTask {
        output: TaskOutput,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponsePayload {
    Connection(Metadata),
    Session(Metadata),
    Sessions(Vec<Metadata>),
    Task(Metadata),
    Executor(Metadata),
    Output(TaskOutput),
    /// One streamed `get_task` frame.
    TaskInput(TaskInput),
    /// Terminal `get_task` frame: the session the stream was draining.
    Drained(Metadata),
    /// Success of an outcome-reporting operation (close, unregister, ...).
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    Duplicate,
    SessionClosed,
    ConnectionClosed,
    NoBoundSession,
    AlreadyBound,
    TaskFailed,
    InvalidArgument,
    Cancelled,
    Internal,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::NotFound => "not_found",
            ErrorCode::Duplicate => "duplicate",
            ErrorCode::SessionClosed => "session_closed",
            ErrorCode::ConnectionClosed => "connection_closed",
            ErrorCode::NoBoundSession => "no_bound_session",
            ErrorCode::AlreadyBound => "already_bound",
            ErrorCode::TaskFailed => "task_failed",
            ErrorCode::InvalidArgument => "invalid_argument",
            ErrorCode::Cancelled => "cancelled",
            ErrorCode::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorPayload {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        ErrorPayload {
            code,
            message: message.into(),
        }
    }

    pub fn from_cache(err: &CacheError) -> Self {
        let code = match err {
            CacheError::ConnectionNotFound(_)
            | CacheError::SessionNotFound(_)
            | CacheError::ExecutorNotFound(_) => ErrorCode::NotFound,
            CacheError::DuplicateConnection(_)
            | CacheError::DuplicateSession(_)
            | CacheError::DuplicateExecutor(_) => ErrorCode::Duplicate,
            CacheError::State(state) => return ErrorPayload::from_state(state),
            CacheError::Poisoned => ErrorCode::Internal,
        };
        ErrorPayload::new(code, err.to_string())
    }

    pub fn from_state(err: &StateError) -> Self {
        let code = match err {
            StateError::AlreadyBound { .. } => ErrorCode::AlreadyBound,
            StateError::NoBoundSession(_) => ErrorCode::NoBoundSession,
            StateError::SessionClosed(_) => ErrorCode::SessionClosed,
            StateError::ConnectionClosed(_) => ErrorCode::ConnectionClosed,
            StateError::UnknownTask { .. } => ErrorCode::NotFound,
            StateError::TaskFailed { .. } => ErrorCode::TaskFailed,
            StateError::InvalidTransition { .. } => ErrorCode::InvalidArgument,
            StateError::Cancelled => ErrorCode::Cancelled,
            StateError::Poisoned => ErrorCode::Internal,
        };
        ErrorPayload::new(code, err.to_string())
    }
}

impl fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Response {
    Ok { ok: ResponsePayload },
    Err { err: ErrorPayload },
}

impl Response {
    pub fn ok(payload: ResponsePayload) -> Self {
        Response::Ok { ok: payload }
    }

    pub fn err(err: ErrorPayload) -> Self {
        Response::Err { err }
    }
}

pub fn decode_request(line: &str) -> Result<Request, IpcError> {
    check_frame_len(line)?;
    Ok(serde_json::from_str(line)?)
}

pub fn decode_response(line: &str) -> Result<Response, IpcError> {
    check_frame_len(line)?;
    Ok(serde_json::from_str(line)?)
}

fn check_frame_len(line: &str) -> Result<(), IpcError> {
    if line.len() > MAX_FRAME_BYTES {
        return Err(IpcError::FrameTooLarge {
            len: line.len(),
            max: MAX_FRAME_BYTES,
        });
    }
    Ok(())
}

/// Encode one value as a frame and flush it.
pub fn send_frame<W: Write, T: Serialize>(writer: &mut W, value: &T) -> Result<(), IpcError> {
    let encoded = serde_json::to_string(value)?;
    if encoded.len() > MAX_FRAME_BYTES {
        return Err(IpcError::FrameTooLarge {
            len: encoded.len(),
            max: MAX_FRAME_BYTES,
        });
    }
    writer.write_all(encoded.as_bytes())?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_wire_format_is_stable() {
        let line = r#"{"op":"send_input","input":{"session_id":"s-1","input":"k82cn"}}"#;
        let request = decode_request(line).unwrap();
        assert_eq!(
            request,
            Request::SendInput {
                input: TaskInput {
                    task_id: String::new(),
                    session_id: "s-1".to_string(),
                    input: "k82cn".to_string(),
                },
            }
        );

        let line = r#"{"op":"bind","executor":{"id":"exe-1","name":"exe-1"}}"#;
        let request = decode_request(line).unwrap();
        let Request::Bind { executor } = request else {
            panic!("expected bind");
        };
        assert_eq!(executor.id, "exe-1");
        assert_eq!(executor.owner_ref, None);
    }

    #[test]
    fn response_envelope_round_trips() {
        let ok = Response::ok(ResponsePayload::Task(Metadata {
            id: "t-1".to_string(),
            name: None,
            owner_ref: Some("s-1".to_string()),
        }));
        let encoded = serde_json::to_string(&ok).unwrap();
        assert!(encoded.starts_with(r#"{"ok":"#));
        assert_eq!(decode_response(&encoded).unwrap(), ok);

        let err = Response::err(ErrorPayload::new(ErrorCode::NotFound, "missing"));
        let encoded = serde_json::to_string(&err).unwrap();
        assert!(encoded.contains(r#""code":"not_found""#));
        assert_eq!(decode_response(&encoded).unwrap(), err);
    }

    #[test]
    fn done_payload_is_a_bare_tag() {
        let encoded = serde_json::to_string(&Response::ok(ResponsePayload::Done)).unwrap();
        assert_eq!(encoded, r#"{"ok":"done"}"#);
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let line = "x".repeat(MAX_FRAME_BYTES + 1);
        assert!(matches!(
            decode_request(&line),
            Err(IpcError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn send_frame_appends_newline() {
        let mut buf = Vec::new();
        send_frame(&mut buf, &Response::ok(ResponsePayload::Done)).unwrap();
        assert_eq!(buf, b"{\"ok\":\"done\"}\n");
    }

    #[test]
    fn error_codes_map_from_cache_errors() {
        use crate::core::SessionId;

        let err = CacheError::SessionNotFound(SessionId::generate());
        assert_eq!(ErrorPayload::from_cache(&err).code, ErrorCode::NotFound);

        let err = CacheError::State(StateError::SessionClosed(SessionId::generate()));
        assert_eq!(ErrorPayload::from_cache(&err).code, ErrorCode::SessionClosed);

        let err = CacheError::State(StateError::Cancelled);
        assert_eq!(ErrorPayload::from_cache(&err).code, ErrorCode::Cancelled);
    }
}
