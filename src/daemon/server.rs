//! Server thread loops.
//!
//! The acceptor spawns one handler thread per TCP connection. A handler
//! reads one request per line and answers with one response frame, except
//! `get_task`, which streams frames until the bound session drains. The
//! blocking operations (`recv_output`, `bind`, the in-stream completion
//! wait) park on entity condvars; a probe on the connection releases them
//! when the peer hangs up.

use std::io::{BufRead, BufReader};
use std::net::{TcpListener, TcpStream};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::core::{ConnectionId, ExecutorId, InvalidId, SessionId, TaskId};

use super::backend::{Backend, StreamError};
use super::cache::Cache;
use super::frontend::Frontend;
use super::ipc::{
    ErrorCode, ErrorPayload, Metadata, Request, Response, ResponsePayload, TaskOutput,
    decode_request, send_frame,
};

/// How long the acceptor sleeps between polls of the shutdown flag.
const ACCEPT_POLL: Duration = Duration::from_millis(10);

/// Run the accept loop until the shutdown flag is raised.
pub fn run_acceptor(listener: TcpListener, cache: Arc<Cache>, shutdown: Arc<AtomicBool>) {
    let frontend = Frontend::new(Arc::clone(&cache));
    let backend = Backend::new(cache);

    if let Err(err) = listener.set_nonblocking(true) {
        tracing::error!(error = %err, "failed to configure listener");
        return;
    }

    loop {
        if shutdown.load(Ordering::Relaxed) {
            tracing::info!("acceptor shutting down");
            return;
        }

        match listener.accept() {
            Ok((stream, addr)) => {
                tracing::debug!(%addr, "client connected");
                let frontend = frontend.clone();
                let backend = backend.clone();
                std::thread::spawn(move || {
                    let _ = stream.set_nonblocking(false);
                    handle_client(stream, frontend, backend);
                });
            }
            Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
            }
            Err(err) => {
                tracing::error!(error = %err, "accept error");
            }
        }
    }
}

/// Detects a peer that hung up while its handler is parked on a condvar.
/// Between a request and its response nothing should arrive, so a
/// successful zero-byte peek means EOF.
struct PeerProbe {
    stream: TcpStream,
}

impl PeerProbe {
    fn hung_up(&self) -> bool {
        if self.stream.set_nonblocking(true).is_err() {
            return true;
        }
        let mut buf = [0u8; 1];
        let result = self.stream.peek(&mut buf);
        let _ = self.stream.set_nonblocking(false);

        match result {
            Ok(0) => true,
            Ok(_) => false,
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => false,
            Err(_) => true,
        }
    }
}

/// Handle a single client connection: read a frame, dispatch, write the
/// response, repeat until the peer disconnects.
pub(super) fn handle_client(stream: TcpStream, frontend: Frontend, backend: Backend) {
    let probe = match stream.try_clone() {
        Ok(stream) => PeerProbe { stream },
        Err(err) => {
            tracing::error!(error = %err, "failed to clone stream");
            return;
        }
    };
    let reader = match stream.try_clone() {
        Ok(stream) => BufReader::new(stream),
        Err(err) => {
            tracing::error!(error = %err, "failed to clone stream");
            return;
        }
    };
    let mut writer = stream;

    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break, // client disconnected
        };
        if line.trim().is_empty() {
            continue;
        }

        let request = match decode_request(&line) {
            Ok(request) => request,
            Err(err) => {
                let response = Response::err(ErrorPayload::new(
                    ErrorCode::InvalidArgument,
                    err.to_string(),
                ));
                if send_frame(&mut writer, &response).is_err() {
                    break;
                }
                continue;
            }
        };

        match request {
            Request::GetTask { executor } => {
                if !stream_get_task(&backend, executor, &mut writer, &probe) {
                    break;
                }
            }
            other => {
                let response = dispatch(&frontend, &backend, other, &probe);
                if send_frame(&mut writer, &response).is_err() {
                    break;
                }
            }
        }
    }
}

/// Serve one `get_task` stream. Returns false when the wire is gone.
fn stream_get_task(
    backend: &Backend,
    executor: Metadata,
    writer: &mut TcpStream,
    probe: &PeerProbe,
) -> bool {
    let id = match executor_id(&executor) {
        Ok(id) => id,
        Err(err) => return send_frame(writer, &Response::err(err)).is_ok(),
    };

    let result = backend.stream_tasks(
        &id,
        |input| send_frame(writer, &Response::ok(ResponsePayload::TaskInput(input))),
        || probe.hung_up(),
    );

    match result {
        Ok(session) => {
            send_frame(writer, &Response::ok(ResponsePayload::Drained(session))).is_ok()
        }
        Err(StreamError::Cache(err)) => {
            send_frame(writer, &Response::err(ErrorPayload::from_cache(&err))).is_ok()
        }
        Err(StreamError::Ipc(_)) => false,
    }
}

fn dispatch(frontend: &Frontend, backend: &Backend, request: Request, probe: &PeerProbe) -> Response {
    match request {
        Request::NewConnection { client } => frontend
            .new_connection(client.as_ref())
            .map(ResponsePayload::Connection)
            .map_or_else(cache_err, Response::ok),

        Request::CloseConnection { connection } => match parse_id::<ConnectionId>(&connection.id) {
            Ok(id) => frontend
                .close_connection(id)
                .map(|()| ResponsePayload::Done)
                .map_or_else(cache_err, Response::ok),
            Err(err) => Response::err(err),
        },

        Request::NewSession { connection } => match parse_id::<ConnectionId>(&connection.id) {
            Ok(id) => frontend
                .new_session(id)
                .map(ResponsePayload::Session)
                .map_or_else(cache_err, Response::ok),
            Err(err) => Response::err(err),
        },

        Request::CloseSession { session } => match parse_id::<SessionId>(&session.id) {
            Ok(id) => frontend
                .close_session(id)
                .map(|()| ResponsePayload::Done)
                .map_or_else(cache_err, Response::ok),
            Err(err) => Response::err(err),
        },

        Request::SendInput { input } => match parse_id::<SessionId>(&input.session_id) {
            Ok(session) => frontend
                .send_input(session, input.input)
                .map(ResponsePayload::Task)
                .map_or_else(cache_err, Response::ok),
            Err(err) => Response::err(err),
        },

        Request::RecvOutput { task } => {
            let session = match task.owner_ref.as_deref() {
                Some(owner) => parse_id::<SessionId>(owner),
                None => Err(ErrorPayload::new(
                    ErrorCode::InvalidArgument,
                    "recv_output requires the owning session in owner_ref",
                )),
            };
            match (session, parse_id::<TaskId>(&task.id)) {
                (Ok(session), Ok(task)) => frontend
                    .recv_output(session, task, || probe.hung_up())
                    .map(ResponsePayload::Output)
                    .map_or_else(cache_err, Response::ok),
                (Err(err), _) | (_, Err(err)) => Response::err(err),
            }
        }

        Request::ListSession { client: _ } => frontend
            .list_session()
            .map(ResponsePayload::Sessions)
            .map_or_else(cache_err, Response::ok),

        Request::Run => Response::err(ErrorPayload::new(
            ErrorCode::InvalidArgument,
            "run is not implemented yet",
        )),

        Request::Register { executor } => match executor_id(&executor) {
            Ok(_) => backend
                .register(&executor)
                .map(ResponsePayload::Executor)
                .map_or_else(cache_err, Response::ok),
            Err(err) => Response::err(err),
        },

        Request::Unregister { executor } => match executor_id(&executor) {
            Ok(id) => backend
                .unregister(&id)
                .map(|()| ResponsePayload::Done)
                .map_or_else(cache_err, Response::ok),
            Err(err) => Response::err(err),
        },

        Request::Bind { executor } => match executor_id(&executor) {
            Ok(id) => backend
                .bind(&id, || probe.hung_up())
                .map(ResponsePayload::Session)
                .map_or_else(cache_err, Response::ok),
            Err(err) => Response::err(err),
        },

        Request::Unbind { executor } => match executor_id(&executor) {
            Ok(id) => backend
                .unbind(&id)
                .map(|()| ResponsePayload::Done)
                .map_or_else(cache_err, Response::ok),
            Err(err) => Response::err(err),
        },

        Request::CompleteTask { output } => complete_task(backend, output),

        // Streamed separately in handle_client.
        Request::GetTask { .. } => Response::err(ErrorPayload::new(
            ErrorCode::Internal,
            "get_task must be streamed",
        )),
    }
}

fn complete_task(backend: &Backend, output: TaskOutput) -> Response {
    let session = parse_id::<SessionId>(&output.session_id);
    let task = parse_id::<TaskId>(&output.task_id);
    match (session, task) {
        (Ok(session), Ok(task)) => backend
            .complete_task(session, task, output.output, output.error)
            .map(|()| ResponsePayload::Done)
            .map_or_else(cache_err, Response::ok),
        (Err(err), _) | (_, Err(err)) => Response::err(err),
    }
}

fn cache_err(err: super::cache::CacheError) -> Response {
    Response::err(ErrorPayload::from_cache(&err))
}

fn parse_id<T: FromStr<Err = InvalidId>>(value: &str) -> Result<T, ErrorPayload> {
    value
        .parse::<T>()
        .map_err(|err| ErrorPayload::new(ErrorCode::InvalidArgument, err.to_string()))
}

fn executor_id(meta: &Metadata) -> Result<ExecutorId, ErrorPayload> {
    if meta.id.is_empty() {
        return Err(ErrorPayload::new(
            ErrorCode::InvalidArgument,
            "executor id must not be empty",
        ));
    }
    Ok(ExecutorId::new(&meta.id))
}
