//! Session entity: a named scope holding an ordered sequence of tasks.
//!
//! The session keeps a materialised `state → task ids` index next to the
//! ordered task list; every transition goes through a session method that
//! takes the session lock first and the task lock nested, so the index can
//! never disagree with a task's actual state.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use super::task::{Task, TaskSnapshot, TaskState};
use super::{ConnectionId, SessionId, StateError, TaskId, WAIT_POLL};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Closed,
}

#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub connection_id: ConnectionId,
    body: Mutex<SessionBody>,
}

#[derive(Debug)]
struct SessionBody {
    status: SessionState,
    tasks: Vec<Arc<Task>>,
    index: HashMap<TaskId, Arc<Task>>,
    by_state: HashMap<TaskState, HashSet<TaskId>>,
}

/// Detached copy without synchronisation primitives; consumed by the
/// scheduler, never shared with live state.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub connection_id: ConnectionId,
    pub status: SessionState,
    pub tasks: Vec<TaskSnapshot>,
    pub by_state: HashMap<TaskState, HashSet<TaskId>>,
}

impl SessionSnapshot {
    pub fn pending_tasks(&self) -> usize {
        self.by_state
            .get(&TaskState::Pending)
            .map_or(0, HashSet::len)
    }

    pub fn is_closed(&self) -> bool {
        self.status == SessionState::Closed
    }
}

impl Session {
    pub fn new(connection_id: ConnectionId) -> Self {
        Session {
            id: SessionId::generate(),
            connection_id,
            body: Mutex::new(SessionBody {
                status: SessionState::Open,
                tasks: Vec::new(),
                index: HashMap::new(),
                by_state: HashMap::new(),
            }),
        }
    }

    fn lock_body(&self) -> Result<MutexGuard<'_, SessionBody>, StateError> {
        self.body.lock().map_err(|_| StateError::Poisoned)
    }

    pub fn state(&self) -> Result<SessionState, StateError> {
        Ok(self.lock_body()?.status)
    }

    pub fn is_closed(&self) -> Result<bool, StateError> {
        Ok(self.lock_body()?.status == SessionState::Closed)
    }

    /// Append a new pending task. Fails once the session is closed.
    pub fn add_task(&self, input: String) -> Result<Arc<Task>, StateError> {
        let mut body = self.lock_body()?;
        if body.status == SessionState::Closed {
            return Err(StateError::SessionClosed(self.id));
        }

        let task = Arc::new(Task::new(self.id, input));
        body.tasks.push(Arc::clone(&task));
        body.index.insert(task.id, Arc::clone(&task));
        body.by_state
            .entry(TaskState::Pending)
            .or_default()
            .insert(task.id);

        Ok(task)
    }

    pub fn task(&self, id: TaskId) -> Result<Arc<Task>, StateError> {
        let body = self.lock_body()?;
        body.index
            .get(&id)
            .cloned()
            .ok_or(StateError::UnknownTask {
                task: id,
                session: self.id,
            })
    }

    /// The oldest pending task, if any. Insertion order.
    pub fn next_pending(&self) -> Result<Option<Arc<Task>>, StateError> {
        let body = self.lock_body()?;
        let Some(pending) = body.by_state.get(&TaskState::Pending) else {
            return Ok(None);
        };
        Ok(body
            .tasks
            .iter()
            .find(|task| pending.contains(&task.id))
            .cloned())
    }

    /// Move a pending task to running before it is handed to an executor.
    /// Racing claims lose with `InvalidTransition`.
    pub fn claim_task(&self, id: TaskId) -> Result<(), StateError> {
        let mut body = self.lock_body()?;
        let task = body
            .index
            .get(&id)
            .cloned()
            .ok_or(StateError::UnknownTask {
                task: id,
                session: self.id,
            })?;
        task.mark_running()?;
        reindex(&mut body, id, TaskState::Running);
        Ok(())
    }

    /// Transition running → succeed with the given output; wakes every
    /// waiter parked on the task.
    pub fn complete_task(&self, id: TaskId, output: String) -> Result<(), StateError> {
        let mut body = self.lock_body()?;
        let task = body
            .index
            .get(&id)
            .cloned()
            .ok_or(StateError::UnknownTask {
                task: id,
                session: self.id,
            })?;
        task.complete(output)?;
        reindex(&mut body, id, TaskState::Succeed);
        Ok(())
    }

    /// Transition running → failed.
    pub fn fail_task(&self, id: TaskId, message: String) -> Result<(), StateError> {
        let mut body = self.lock_body()?;
        let task = body
            .index
            .get(&id)
            .cloned()
            .ok_or(StateError::UnknownTask {
                task: id,
                session: self.id,
            })?;
        task.fail(message)?;
        reindex(&mut body, id, TaskState::Failed);
        Ok(())
    }

    /// Block until the task completes, the session closes, or the caller
    /// cancels. Closure only fails tasks that will never run: a pending
    /// task of a closed session reports `SessionClosed` promptly, while a
    /// running task is not preempted and its completion is still
    /// delivered.
    pub fn recv_output(
        &self,
        id: TaskId,
        cancelled: impl Fn() -> bool,
    ) -> Result<String, StateError> {
        let task = self.task(id)?;
        loop {
            if let Some(output) = task.try_output()? {
                return Ok(output);
            }
            if task.state()? == TaskState::Pending && self.is_closed()? {
                return Err(StateError::SessionClosed(self.id));
            }
            if cancelled() {
                return Err(StateError::Cancelled);
            }
            task.wait_completed_for(WAIT_POLL)?;
        }
    }

    /// Mark closed and wake everything parked on this session's tasks so
    /// blocked readers observe closure promptly. Tasks already handed to an
    /// executor are not preempted; their completion still lands.
    pub fn close(&self) -> Result<(), StateError> {
        let mut body = self.lock_body()?;
        body.status = SessionState::Closed;
        for task in &body.tasks {
            task.notify_waiters();
        }
        Ok(())
    }

    pub fn snapshot(&self) -> Result<SessionSnapshot, StateError> {
        let body = self.lock_body()?;
        let mut tasks = Vec::with_capacity(body.tasks.len());
        for task in &body.tasks {
            tasks.push(task.snapshot()?);
        }
        Ok(SessionSnapshot {
            id: self.id,
            connection_id: self.connection_id,
            status: body.status,
            tasks,
            by_state: body.by_state.clone(),
        })
    }
}

/// Re-home a task id under its new state in the materialised index.
fn reindex(body: &mut SessionBody, id: TaskId, to: TaskState) {
    for ids in body.by_state.values_mut() {
        ids.remove(&id);
    }
    body.by_state.entry(to).or_default().insert(id);
}
