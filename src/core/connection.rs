//! Connection entity: one logical client over the wire.

use std::sync::{Mutex, MutexGuard};

use super::{ConnectionId, StateError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Closed,
}

/// A connection owns zero or more sessions; closing it closes them.
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    state: Mutex<ConnectionState>,
}

impl Connection {
    pub fn new() -> Self {
        Connection {
            id: ConnectionId::generate(),
            state: Mutex::new(ConnectionState::Open),
        }
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, ConnectionState>, StateError> {
        self.state.lock().map_err(|_| StateError::Poisoned)
    }

    pub fn state(&self) -> Result<ConnectionState, StateError> {
        Ok(*self.lock_state()?)
    }

    pub fn is_closed(&self) -> Result<bool, StateError> {
        Ok(*self.lock_state()? == ConnectionState::Closed)
    }

    /// Mark closed. Idempotent.
    pub fn close(&self) -> Result<(), StateError> {
        *self.lock_state()? = ConnectionState::Closed;
        Ok(())
    }
}

impl Default for Connection {
    fn default() -> Self {
        Connection::new()
    }
}
