//! Client-facing surface: connections, sessions, task submission and the
//! blocking output rendezvous.

use std::sync::Arc;

use crate::core::{Connection, ConnectionId, Session, SessionId, TaskId};

use super::cache::{Cache, CacheError};
use super::ipc::{Metadata, TaskOutput};

#[derive(Clone)]
pub struct Frontend {
    cache: Arc<Cache>,
}

impl Frontend {
    pub fn new(cache: Arc<Cache>) -> Self {
        Frontend { cache }
    }

    pub fn new_connection(&self, client: Option<&Metadata>) -> Result<Metadata, CacheError> {
        let conn = Arc::new(Connection::new());
        self.cache.add_connection(Arc::clone(&conn))?;
        tracing::info!(connection = %conn.id, "connection opened");

        Ok(Metadata {
            id: conn.id.to_string(),
            name: client.and_then(|c| c.name.clone()),
            owner_ref: None,
        })
    }

    /// Close a connection and every open session it owns.
    pub fn close_connection(&self, id: ConnectionId) -> Result<(), CacheError> {
        let conn = self.cache.get_connection(&id)?;
        conn.close()?;

        for ssn in self.cache.sessions_owned_by(&id)? {
            if !ssn.is_closed()? {
                ssn.close()?;
                tracing::info!(connection = %id, session = %ssn.id, "session closed with its connection");
            }
        }

        tracing::info!(connection = %id, "connection closed");
        Ok(())
    }

    pub fn new_session(&self, conn: ConnectionId) -> Result<Metadata, CacheError> {
        let connection = self.cache.get_connection(&conn)?;
        if connection.is_closed()? {
            return Err(crate::core::StateError::ConnectionClosed(conn).into());
        }

        let ssn = Arc::new(Session::new(conn));
        self.cache.add_session(Arc::clone(&ssn))?;
        tracing::info!(session = %ssn.id, connection = %conn, "session opened");

        Ok(Metadata {
            id: ssn.id.to_string(),
            name: None,
            owner_ref: Some(conn.to_string()),
        })
    }

    pub fn close_session(&self, id: SessionId) -> Result<(), CacheError> {
        let ssn = self.cache.get_session(&id)?;
        ssn.close()?;
        tracing::info!(session = %id, "session closed");
        Ok(())
    }

    /// Insert a pending task; the scheduler picks it up from there.
    pub fn send_input(&self, session: SessionId, input: String) -> Result<Metadata, CacheError> {
        let task = self.cache.add_task(&session, input)?;
        tracing::debug!(session = %session, task = %task.id, "task submitted");

        Ok(Metadata {
            id: task.id.to_string(),
            name: None,
            owner_ref: Some(session.to_string()),
        })
    }

    /// Block until the task completes. Every concurrent caller on the same
    /// task receives the same result from the completion broadcast.
    pub fn recv_output(
        &self,
        session: SessionId,
        task: TaskId,
        cancelled: impl Fn() -> bool,
    ) -> Result<TaskOutput, CacheError> {
        let ssn = self.cache.get_session(&session)?;
        let output = ssn.recv_output(task, cancelled)?;

        Ok(TaskOutput {
            task_id: task.to_string(),
            session_id: session.to_string(),
            output,
            error: None,
        })
    }

    pub fn list_session(&self) -> Result<Vec<Metadata>, CacheError> {
        let sessions = self.cache.list_sessions()?;
        Ok(sessions
            .iter()
            .map(|ssn| Metadata {
                id: ssn.id.to_string(),
                name: None,
                owner_ref: Some(ssn.connection_id.to_string()),
            })
            .collect())
    }
}
