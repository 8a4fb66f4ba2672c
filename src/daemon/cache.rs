//! Process-wide in-memory store.
//!
//! One coarse mutex guards the entity lists and indexes. Lookups hand out
//! `Arc` references whose own mutation methods are internally synchronised;
//! the cache lock is never held while calling into an entity, except during
//! `snapshot`, which nests entity locks under the cache lock to get a
//! consistent point-in-time view.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;

use crate::core::{
    Connection, ConnectionId, Executor, ExecutorId, ExecutorSnapshot, Session, SessionId,
    SessionSnapshot, StateError, Task, TaskId,
};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("connection <{0}> is not in the cache")]
    ConnectionNotFound(ConnectionId),

    #[error("session <{0}> is not in the cache")]
    SessionNotFound(SessionId),

    #[error("executor <{0}> is not in the cache")]
    ExecutorNotFound(ExecutorId),

    #[error("duplicated connection <{0}>")]
    DuplicateConnection(ConnectionId),

    #[error("duplicated session <{0}>")]
    DuplicateSession(SessionId),

    #[error("duplicated executor <{0}>")]
    DuplicateExecutor(ExecutorId),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("cache lock poisoned")]
    Poisoned,
}

/// Detached point-in-time view, consumed by the scheduler. Mutating live
/// state after the snapshot is taken does not show up here.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub sessions: Vec<SessionSnapshot>,
    pub executors: Vec<ExecutorSnapshot>,
}

pub struct Cache {
    state: Mutex<CacheState>,
    session_list_limit: usize,
}

#[derive(Default)]
struct CacheState {
    connections: Vec<Arc<Connection>>,
    conn_index: HashMap<ConnectionId, Arc<Connection>>,

    sessions: Vec<Arc<Session>>,
    ssn_index: HashMap<SessionId, Arc<Session>>,

    executors: Vec<Arc<Executor>>,
    exe_index: HashMap<ExecutorId, Arc<Executor>>,
}

impl Cache {
    pub fn new(session_list_limit: usize) -> Self {
        Cache {
            state: Mutex::new(CacheState::default()),
            session_list_limit,
        }
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, CacheState>, CacheError> {
        self.state.lock().map_err(|_| CacheError::Poisoned)
    }

    pub fn add_connection(&self, conn: Arc<Connection>) -> Result<(), CacheError> {
        let mut state = self.lock_state()?;
        if state.conn_index.contains_key(&conn.id) {
            return Err(CacheError::DuplicateConnection(conn.id));
        }
        state.conn_index.insert(conn.id, Arc::clone(&conn));
        state.connections.push(conn);
        Ok(())
    }

    pub fn get_connection(&self, id: &ConnectionId) -> Result<Arc<Connection>, CacheError> {
        self.lock_state()?
            .conn_index
            .get(id)
            .cloned()
            .ok_or(CacheError::ConnectionNotFound(*id))
    }

    pub fn add_session(&self, ssn: Arc<Session>) -> Result<(), CacheError> {
        let mut state = self.lock_state()?;
        if state.ssn_index.contains_key(&ssn.id) {
            return Err(CacheError::DuplicateSession(ssn.id));
        }
        state.ssn_index.insert(ssn.id, Arc::clone(&ssn));
        state.sessions.push(ssn);
        Ok(())
    }

    pub fn get_session(&self, id: &SessionId) -> Result<Arc<Session>, CacheError> {
        self.lock_state()?
            .ssn_index
            .get(id)
            .cloned()
            .ok_or(CacheError::SessionNotFound(*id))
    }

    /// Sessions owned by a connection, in insertion order.
    pub fn sessions_owned_by(&self, conn: &ConnectionId) -> Result<Vec<Arc<Session>>, CacheError> {
        let state = self.lock_state()?;
        Ok(state
            .sessions
            .iter()
            .filter(|ssn| ssn.connection_id == *conn)
            .cloned()
            .collect())
    }

    /// Append a pending task to the named session.
    pub fn add_task(&self, session: &SessionId, input: String) -> Result<Arc<Task>, CacheError> {
        let ssn = self.get_session(session)?;
        Ok(ssn.add_task(input)?)
    }

    pub fn get_task(&self, session: &SessionId, task: TaskId) -> Result<Arc<Task>, CacheError> {
        let ssn = self.get_session(session)?;
        Ok(ssn.task(task)?)
    }

    pub fn add_executor(&self, exe: Arc<Executor>) -> Result<(), CacheError> {
        let mut state = self.lock_state()?;
        if state.exe_index.contains_key(&exe.id) {
            return Err(CacheError::DuplicateExecutor(exe.id.clone()));
        }
        state.exe_index.insert(exe.id.clone(), Arc::clone(&exe));
        state.executors.push(exe);
        Ok(())
    }

    pub fn get_executor(&self, id: &ExecutorId) -> Result<Arc<Executor>, CacheError> {
        self.lock_state()?
            .exe_index
            .get(id)
            .cloned()
            .ok_or_else(|| CacheError::ExecutorNotFound(id.clone()))
    }

    pub fn remove_executor(&self, id: &ExecutorId) -> Result<(), CacheError> {
        let mut state = self.lock_state()?;
        if state.exe_index.remove(id).is_none() {
            return Err(CacheError::ExecutorNotFound(id.clone()));
        }
        if let Some(pos) = state.executors.iter().position(|e| e.id == *id) {
            state.executors.swap_remove(pos);
        }
        Ok(())
    }

    /// At most `session_list_limit` sessions, oldest first.
    pub fn list_sessions(&self) -> Result<Vec<Arc<Session>>, CacheError> {
        let state = self.lock_state()?;
        Ok(state
            .sessions
            .iter()
            .take(self.session_list_limit)
            .cloned()
            .collect())
    }

    /// Bind an executor to a session on behalf of the scheduler. Looks up
    /// both ids on the live state; a raced `AlreadyBound` is expected.
    pub fn bind(&self, executor: &ExecutorId, session: &SessionId) -> Result<(), CacheError> {
        let exe = self.get_executor(executor)?;
        let ssn = self.get_session(session)?;
        exe.bind(ssn.id)?;
        Ok(())
    }

    /// Consistent, detached view of sessions and executors. Entity locks
    /// are taken nested under the cache lock, one at a time.
    pub fn snapshot(&self) -> Result<Snapshot, CacheError> {
        let state = self.lock_state()?;

        let mut sessions = Vec::with_capacity(state.sessions.len());
        for ssn in &state.sessions {
            sessions.push(ssn.snapshot()?);
        }

        let mut executors = Vec::with_capacity(state.executors.len());
        for exe in &state.executors {
            executors.push(exe.snapshot()?);
        }

        Ok(Snapshot {
            sessions,
            executors,
        })
    }
}
