//! Wire client for both manager surfaces, plus the connection/session
//! handles client programs work with.
//!
//! Each call opens its own TCP stream and exchanges one request/response
//! pair, so blocking calls (`recv_output`, `bind`) never head-of-line
//! block unrelated traffic, and an executor can complete tasks while its
//! `get_task` stream is live.

use std::io::{BufRead, BufReader};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;

use crate::daemon::ipc::{
    ErrorPayload, IpcError, Metadata, Request, Response, ResponsePayload, TaskInput, TaskOutput,
    decode_response, send_frame,
};

/// Poll interval for the stop flag while a blocking call is parked.
const BLOCKING_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Ipc(#[from] IpcError),

    #[error("manager rejected the call: {0}")]
    Remote(ErrorPayload),

    #[error("unexpected response payload for {operation}")]
    Unexpected { operation: &'static str },
}

/// Thin handle on the manager endpoint. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ManagerClient {
    addr: String,
}

/// A submitted task: the pair of ids needed to collect its output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRef {
    pub task_id: String,
    pub session_id: String,
}

impl ManagerClient {
    pub fn new(addr: impl Into<String>) -> Self {
        ManagerClient { addr: addr.into() }
    }

    fn call(&self, request: &Request) -> Result<ResponsePayload, ClientError> {
        let mut stream = TcpStream::connect(&self.addr).map_err(IpcError::Io)?;
        send_frame(&mut stream, request)?;
        let mut reader = BufReader::new(stream);
        into_payload(read_response(&mut reader)?)
    }

    // === Frontend surface ===

    pub fn new_connection(&self) -> Result<ConnectionHandle, ClientError> {
        match self.call(&Request::NewConnection { client: None })? {
            ResponsePayload::Connection(meta) => Ok(ConnectionHandle {
                client: self.clone(),
                meta,
            }),
            _ => Err(ClientError::Unexpected {
                operation: "new_connection",
            }),
        }
    }

    pub fn list_session(&self) -> Result<Vec<Metadata>, ClientError> {
        match self.call(&Request::ListSession { client: None })? {
            ResponsePayload::Sessions(sessions) => Ok(sessions),
            _ => Err(ClientError::Unexpected {
                operation: "list_session",
            }),
        }
    }

    // === Backend surface ===

    pub fn register(&self, executor: &Metadata) -> Result<Metadata, ClientError> {
        match self.call(&Request::Register {
            executor: executor.clone(),
        })? {
            ResponsePayload::Executor(meta) => Ok(meta),
            _ => Err(ClientError::Unexpected {
                operation: "register",
            }),
        }
    }

    pub fn unregister(&self, executor: &Metadata) -> Result<(), ClientError> {
        expect_done(
            self.call(&Request::Unregister {
                executor: executor.clone(),
            })?,
            "unregister",
        )
    }

    /// Park until the scheduler binds the executor. Returns `None` when
    /// the stop flag is raised while waiting.
    pub fn bind(
        &self,
        executor: &Metadata,
        stop: &AtomicBool,
    ) -> Result<Option<Metadata>, ClientError> {
        let mut stream = TcpStream::connect(&self.addr).map_err(IpcError::Io)?;
        send_frame(
            &mut stream,
            &Request::Bind {
                executor: executor.clone(),
            },
        )?;
        stream
            .set_read_timeout(Some(BLOCKING_POLL))
            .map_err(IpcError::Io)?;

        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        loop {
            if stop.load(Ordering::Relaxed) {
                // Dropping the stream releases the server-side wait.
                return Ok(None);
            }
            match reader.read_line(&mut line) {
                Ok(0) => return Err(IpcError::Disconnected.into()),
                Ok(_) => break,
                Err(err)
                    if err.kind() == std::io::ErrorKind::WouldBlock
                        || err.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(err) => return Err(IpcError::Io(err).into()),
            }
        }

        match into_payload(decode_response(line.trim_end())?)? {
            ResponsePayload::Session(meta) => Ok(Some(meta)),
            _ => Err(ClientError::Unexpected { operation: "bind" }),
        }
    }

    pub fn unbind(&self, executor: &Metadata) -> Result<(), ClientError> {
        expect_done(
            self.call(&Request::Unbind {
                executor: executor.clone(),
            })?,
            "unbind",
        )
    }

    /// Consume one `get_task` stream: `on_task` runs for every handed-out
    /// task; returns the drained session's reference when the stream ends.
    pub fn get_task(
        &self,
        executor: &Metadata,
        mut on_task: impl FnMut(TaskInput) -> Result<(), ClientError>,
    ) -> Result<Metadata, ClientError> {
        let mut stream = TcpStream::connect(&self.addr).map_err(IpcError::Io)?;
        send_frame(
            &mut stream,
            &Request::GetTask {
                executor: executor.clone(),
            },
        )?;

        let mut reader = BufReader::new(stream);
        loop {
            match into_payload(read_response(&mut reader)?)? {
                ResponsePayload::TaskInput(input) => on_task(input)?,
                ResponsePayload::Drained(session) => return Ok(session),
                _ => {
                    return Err(ClientError::Unexpected {
                        operation: "get_task",
                    });
                }
            }
        }
    }

    pub fn complete_task(&self, output: &TaskOutput) -> Result<(), ClientError> {
        expect_done(
            self.call(&Request::CompleteTask {
                output: output.clone(),
            })?,
            "complete_task",
        )
    }
}

/// One logical client connection on the manager.
#[derive(Debug)]
pub struct ConnectionHandle {
    client: ManagerClient,
    meta: Metadata,
}

impl ConnectionHandle {
    pub fn id(&self) -> &str {
        &self.meta.id
    }

    pub fn new_session(&self) -> Result<SessionHandle, ClientError> {
        match self.client.call(&Request::NewSession {
            connection: self.meta.clone(),
        })? {
            ResponsePayload::Session(meta) => Ok(SessionHandle {
                client: self.client.clone(),
                meta,
            }),
            _ => Err(ClientError::Unexpected {
                operation: "new_session",
            }),
        }
    }

    pub fn close(&self) -> Result<(), ClientError> {
        expect_done(
            self.client.call(&Request::CloseConnection {
                connection: self.meta.clone(),
            })?,
            "close_connection",
        )
    }
}

/// A session scope: submit inputs, collect outputs.
#[derive(Debug)]
pub struct SessionHandle {
    client: ManagerClient,
    meta: Metadata,
}

impl SessionHandle {
    /// Reattach to an existing session by reference, e.g. from another
    /// process that only holds the ids.
    pub fn attach(client: ManagerClient, meta: Metadata) -> Self {
        SessionHandle { client, meta }
    }

    pub fn id(&self) -> &str {
        &self.meta.id
    }

    pub fn send_input(&self, input: impl Into<String>) -> Result<TaskRef, ClientError> {
        let payload = self.client.call(&Request::SendInput {
            input: TaskInput {
                task_id: String::new(),
                session_id: self.meta.id.clone(),
                input: input.into(),
            },
        })?;
        match payload {
            ResponsePayload::Task(meta) => Ok(TaskRef {
                session_id: meta.owner_ref.unwrap_or_else(|| self.meta.id.clone()),
                task_id: meta.id,
            }),
            _ => Err(ClientError::Unexpected {
                operation: "send_input",
            }),
        }
    }

    /// Block until the task completes; returns its output.
    pub fn recv_output(&self, task: &TaskRef) -> Result<String, ClientError> {
        let payload = self.client.call(&Request::RecvOutput {
            task: Metadata {
                id: task.task_id.clone(),
                name: None,
                owner_ref: Some(task.session_id.clone()),
            },
        })?;
        match payload {
            ResponsePayload::Output(output) => Ok(output.output),
            _ => Err(ClientError::Unexpected {
                operation: "recv_output",
            }),
        }
    }

    pub fn close(&self) -> Result<(), ClientError> {
        expect_done(
            self.client.call(&Request::CloseSession {
                session: self.meta.clone(),
            })?,
            "close_session",
        )
    }
}

fn read_response(reader: &mut impl BufRead) -> Result<Response, ClientError> {
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).map_err(IpcError::Io)?;
        if n == 0 {
            return Err(IpcError::Disconnected.into());
        }
        if line.trim().is_empty() {
            continue;
        }
        return Ok(decode_response(line.trim_end())?);
    }
}

fn into_payload(response: Response) -> Result<ResponsePayload, ClientError> {
    match response {
        Response::Ok { ok } => Ok(ok),
        Response::Err { err } => Err(ClientError::Remote(err)),
    }
}

fn expect_done(payload: ResponsePayload, operation: &'static str) -> Result<(), ClientError> {
    match payload {
        ResponsePayload::Done => Ok(()),
        _ => Err(ClientError::Unexpected { operation }),
    }
}

impl ClientError {
    /// The remote error code, if the manager reported one.
    pub fn remote_code(&self) -> Option<crate::daemon::ipc::ErrorCode> {
        match self {
            ClientError::Remote(err) => Some(err.code),
            _ => None,
        }
    }
}
