//! Executor-facing surface: registration, the blocking bind rendezvous,
//! task streaming and completion.

use std::sync::Arc;

use thiserror::Error;

use crate::core::{Executor, ExecutorId, SessionId, StateError, TaskId};

use super::cache::{Cache, CacheError};
use super::ipc::{IpcError, Metadata, TaskInput};

/// Failure of a `get_task` stream: either the state machine rejected the
/// executor, or the wire went away mid-stream.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Ipc(#[from] IpcError),
}

#[derive(Clone)]
pub struct Backend {
    cache: Arc<Cache>,
}

impl Backend {
    pub fn new(cache: Arc<Cache>) -> Self {
        Backend { cache }
    }

    /// Insert the executor in state idle. Ids collide with `Duplicate`.
    pub fn register(&self, meta: &Metadata) -> Result<Metadata, CacheError> {
        let exe = Arc::new(Executor::new(ExecutorId::new(&meta.id)));
        self.cache.add_executor(Arc::clone(&exe))?;
        tracing::info!(executor = %exe.id, "executor registered");
        Ok(meta.clone())
    }

    pub fn unregister(&self, id: &ExecutorId) -> Result<(), CacheError> {
        self.cache.remove_executor(id)?;
        tracing::info!(executor = %id, "executor unregistered");
        Ok(())
    }

    /// Park until the scheduler binds the executor; returns the bound
    /// session reference. Outlives any single scheduler iteration.
    pub fn bind(
        &self,
        id: &ExecutorId,
        cancelled: impl Fn() -> bool,
    ) -> Result<Metadata, CacheError> {
        let exe = self.cache.get_executor(id)?;
        let session = exe.wait_binding(cancelled)?;
        let ssn = self.cache.get_session(&session)?;
        tracing::debug!(executor = %id, session = %session, "bind observed");

        Ok(Metadata {
            id: ssn.id.to_string(),
            name: None,
            owner_ref: Some(ssn.connection_id.to_string()),
        })
    }

    pub fn unbind(&self, id: &ExecutorId) -> Result<(), CacheError> {
        let exe = self.cache.get_executor(id)?;
        exe.unbind()?;
        tracing::debug!(executor = %id, "executor unbound");
        Ok(())
    }

    /// Stream tasks from the executor's bound session: claim the oldest
    /// pending task, hand it over, park until it completes, repeat. Ends
    /// when the session is closed or out of pending tasks, returning the
    /// drained session's reference. A task is never handed out twice;
    /// losing a claim race just moves on to the next pending task.
    pub fn stream_tasks(
        &self,
        id: &ExecutorId,
        mut send: impl FnMut(TaskInput) -> Result<(), IpcError>,
        cancelled: impl Fn() -> bool,
    ) -> Result<Metadata, StreamError> {
        loop {
            let exe = self.cache.get_executor(id)?;
            let Some(session) = exe.bound_session().map_err(CacheError::from)? else {
                return Err(CacheError::from(StateError::NoBoundSession(id.clone())).into());
            };
            let ssn = self.cache.get_session(&session)?;

            if ssn.is_closed().map_err(CacheError::from)? {
                tracing::debug!(session = %session, "session closed, ending task stream");
                return Ok(drained(session, ssn.connection_id.to_string()));
            }

            let Some(task) = ssn.next_pending().map_err(CacheError::from)? else {
                tracing::debug!(session = %session, "no more pending tasks");
                return Ok(drained(session, ssn.connection_id.to_string()));
            };

            match ssn.claim_task(task.id) {
                Ok(()) => {}
                // Raced with another stream on the same session.
                Err(StateError::InvalidTransition { .. }) => continue,
                Err(err) => return Err(CacheError::from(err).into()),
            }
            tracing::debug!(session = %session, task = %task.id, "task handed to executor");

            send(TaskInput {
                task_id: task.id.to_string(),
                session_id: session.to_string(),
                input: task.input.clone(),
            })?;

            task.wait_completed(&cancelled)
                .map_err(CacheError::from)?;
        }
    }

    /// Transition the task out of running and wake its waiters. An output
    /// carrying an executor error fails the task instead.
    pub fn complete_task(
        &self,
        session: SessionId,
        task: TaskId,
        output: String,
        error: Option<String>,
    ) -> Result<(), CacheError> {
        let ssn = self.cache.get_session(&session)?;
        match error {
            None => {
                ssn.complete_task(task, output)?;
                tracing::debug!(session = %session, task = %task, "task succeeded");
            }
            Some(message) => {
                ssn.fail_task(task, message)?;
                tracing::debug!(session = %session, task = %task, "task failed");
            }
        }
        Ok(())
    }
}

fn drained(session: SessionId, owner: String) -> Metadata {
    Metadata {
        id: session.to_string(),
        name: None,
        owner_ref: Some(owner),
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;
    use crate::core::{Connection, Session};

    struct Fixture {
        cache: Arc<Cache>,
        backend: Backend,
    }

    impl Fixture {
        fn new() -> Self {
            let cache = Arc::new(Cache::new(10));
            let backend = Backend::new(Arc::clone(&cache));
            Fixture { cache, backend }
        }

        fn open_session(&self) -> Arc<Session> {
            let conn = Arc::new(Connection::new());
            self.cache.add_connection(Arc::clone(&conn)).unwrap();
            let ssn = Arc::new(Session::new(conn.id));
            self.cache.add_session(Arc::clone(&ssn)).unwrap();
            ssn
        }

        fn register(&self, name: &str) -> ExecutorId {
            self.backend
                .register(&Metadata::with_id(name))
                .unwrap();
            ExecutorId::new(name)
        }
    }

    #[test]
    fn reregistering_a_live_executor_collides() {
        let fx = Fixture::new();
        fx.register("e");
        let err = fx.backend.register(&Metadata::with_id("e")).unwrap_err();
        assert!(matches!(err, CacheError::DuplicateExecutor(_)));

        // Unregister then register again is a fresh start.
        fx.backend.unregister(&ExecutorId::new("e")).unwrap();
        fx.backend.register(&Metadata::with_id("e")).unwrap();
    }

    #[test]
    fn bind_returns_the_scheduled_session() {
        let fx = Fixture::new();
        let ssn = fx.open_session();
        let exe = fx.register("e");

        let (tx, rx) = mpsc::channel();
        let backend = fx.backend.clone();
        let exe_clone = exe.clone();
        std::thread::spawn(move || {
            let _ = tx.send(backend.bind(&exe_clone, || false));
        });

        // Parked until someone binds.
        assert!(rx.recv_timeout(Duration::from_millis(150)).is_err());

        fx.cache.bind(&exe, &ssn.id).unwrap();
        let meta = rx
            .recv_timeout(Duration::from_secs(2))
            .unwrap()
            .unwrap();
        assert_eq!(meta.id, ssn.id.to_string());
        assert_eq!(meta.owner_ref, Some(ssn.connection_id.to_string()));
    }

    #[test]
    fn stream_requires_a_bound_session() {
        let fx = Fixture::new();
        let exe = fx.register("e");

        let err = fx
            .backend
            .stream_tasks(&exe, |_| Ok(()), || false)
            .unwrap_err();
        assert!(matches!(
            err,
            StreamError::Cache(CacheError::State(StateError::NoBoundSession(_)))
        ));
    }

    #[test]
    fn stream_drains_pending_tasks_in_order() {
        let fx = Fixture::new();
        let ssn = fx.open_session();
        let first = ssn.add_task("a".to_string()).unwrap();
        let second = ssn.add_task("b".to_string()).unwrap();
        let exe = fx.register("e");
        fx.cache.bind(&exe, &ssn.id).unwrap();

        // Complete each task as soon as it is handed over, from a helper
        // thread, the way an executor process would.
        let (handed_tx, handed_rx) = mpsc::channel::<TaskInput>();
        let completer = {
            let backend = fx.backend.clone();
            std::thread::spawn(move || {
                for input in handed_rx {
                    let session = SessionId::from_str(&input.session_id).unwrap();
                    let task = TaskId::from_str(&input.task_id).unwrap();
                    backend
                        .complete_task(session, task, format!("{}!", input.input), None)
                        .unwrap();
                }
            })
        };

        let mut handed = Vec::new();
        let drained = fx
            .backend
            .stream_tasks(
                &exe,
                |input| {
                    handed.push(input.task_id.clone());
                    handed_tx.send(input).unwrap();
                    Ok(())
                },
                || false,
            )
            .unwrap();
        drop(handed_tx);
        completer.join().unwrap();

        assert_eq!(drained.id, ssn.id.to_string());
        assert_eq!(
            handed,
            vec![first.id.to_string(), second.id.to_string()]
        );
        assert_eq!(ssn.recv_output(first.id, || false).unwrap(), "a!");
        assert_eq!(ssn.recv_output(second.id, || false).unwrap(), "b!");
    }

    #[test]
    fn stream_ends_cleanly_on_closed_session() {
        let fx = Fixture::new();
        let ssn = fx.open_session();
        ssn.add_task("a".to_string()).unwrap();
        ssn.close().unwrap();
        let exe = fx.register("e");
        fx.cache.bind(&exe, &ssn.id).unwrap();

        let mut handed = 0;
        let drained = fx
            .backend
            .stream_tasks(
                &exe,
                |_| {
                    handed += 1;
                    Ok(())
                },
                || false,
            )
            .unwrap();
        assert_eq!(handed, 0);
        assert_eq!(drained.id, ssn.id.to_string());
    }

    #[test]
    fn executor_error_fails_the_task() {
        let fx = Fixture::new();
        let ssn = fx.open_session();
        let task = ssn.add_task("a".to_string()).unwrap();
        ssn.claim_task(task.id).unwrap();

        fx.backend
            .complete_task(ssn.id, task.id, String::new(), Some("boom".to_string()))
            .unwrap();

        let err = ssn.recv_output(task.id, || false).unwrap_err();
        assert!(matches!(err, StateError::TaskFailed { .. }));
    }
}
