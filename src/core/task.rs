//! Task entity: one unit of work moving pending → running → {succeed, failed}.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use super::{SessionId, StateError, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    Pending,
    Running,
    Failed,
    Succeed,
}

impl TaskState {
    pub fn is_completed(self) -> bool {
        matches!(self, TaskState::Failed | TaskState::Succeed)
    }
}

/// A task carries its own mutex + condvar: completion broadcasts so that
/// every waiter (clients blocked on output, the executor stream blocked on
/// the hand-off) observes the final state.
#[derive(Debug)]
pub struct Task {
    pub id: TaskId,
    pub session_id: SessionId,
    pub input: String,
    body: Mutex<TaskBody>,
    completed: Condvar,
}

#[derive(Debug)]
struct TaskBody {
    state: TaskState,
    output: Option<String>,
    failure: Option<String>,
}

/// Detached copy without synchronisation primitives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub session_id: SessionId,
    pub state: TaskState,
    pub input: String,
    pub output: Option<String>,
}

impl Task {
    pub fn new(session_id: SessionId, input: String) -> Self {
        Task {
            id: TaskId::generate(),
            session_id,
            input,
            body: Mutex::new(TaskBody {
                state: TaskState::Pending,
                output: None,
                failure: None,
            }),
            completed: Condvar::new(),
        }
    }

    fn lock_body(&self) -> Result<MutexGuard<'_, TaskBody>, StateError> {
        self.body.lock().map_err(|_| StateError::Poisoned)
    }

    pub fn state(&self) -> Result<TaskState, StateError> {
        Ok(self.lock_body()?.state)
    }

    /// Move pending → running. Called by the owning session with the
    /// session lock held, so the status index stays coherent.
    pub(crate) fn mark_running(&self) -> Result<(), StateError> {
        let mut body = self.lock_body()?;
        if body.state != TaskState::Pending {
            return Err(StateError::InvalidTransition {
                task: self.id,
                from: body.state,
                to: TaskState::Running,
            });
        }
        body.state = TaskState::Running;
        Ok(())
    }

    /// Move running → succeed with the given output and wake all waiters.
    pub(crate) fn complete(&self, output: String) -> Result<(), StateError> {
        let mut body = self.lock_body()?;
        if body.state != TaskState::Running {
            return Err(StateError::InvalidTransition {
                task: self.id,
                from: body.state,
                to: TaskState::Succeed,
            });
        }
        body.state = TaskState::Succeed;
        body.output = Some(output);
        self.completed.notify_all();
        Ok(())
    }

    /// Move running → failed and wake all waiters.
    pub(crate) fn fail(&self, message: String) -> Result<(), StateError> {
        let mut body = self.lock_body()?;
        if body.state != TaskState::Running {
            return Err(StateError::InvalidTransition {
                task: self.id,
                from: body.state,
                to: TaskState::Failed,
            });
        }
        body.state = TaskState::Failed;
        body.failure = Some(message);
        self.completed.notify_all();
        Ok(())
    }

    /// Wake every waiter parked on this task without changing its state.
    /// Used on session close so blocked output readers re-check promptly.
    pub(crate) fn notify_waiters(&self) {
        let _body = self.lock_body();
        self.completed.notify_all();
    }

    /// The completed task's output: `Some` on succeed, `TaskFailed` on
    /// failure, `None` while still pending or running.
    pub fn try_output(&self) -> Result<Option<String>, StateError> {
        let body = self.lock_body()?;
        match body.state {
            TaskState::Succeed => Ok(Some(body.output.clone().unwrap_or_default())),
            TaskState::Failed => Err(StateError::TaskFailed {
                task: self.id,
                message: body
                    .failure
                    .clone()
                    .unwrap_or_else(|| "no output".to_string()),
            }),
            TaskState::Pending | TaskState::Running => Ok(None),
        }
    }

    /// Park until the task completes. The probe is polled between wakeups
    /// so a caller whose peer vanished stops waiting.
    pub fn wait_completed(&self, cancelled: impl Fn() -> bool) -> Result<(), StateError> {
        let mut body = self.lock_body()?;
        while !body.state.is_completed() {
            if cancelled() {
                return Err(StateError::Cancelled);
            }
            body = self
                .completed
                .wait_timeout(body, super::WAIT_POLL)
                .map_err(|_| StateError::Poisoned)?
                .0;
        }
        Ok(())
    }

    /// Park for at most `dur`; returns whether the task is completed.
    pub fn wait_completed_for(&self, dur: Duration) -> Result<bool, StateError> {
        let body = self.lock_body()?;
        if body.state.is_completed() {
            return Ok(true);
        }
        let (body, _timeout) = self
            .completed
            .wait_timeout(body, dur)
            .map_err(|_| StateError::Poisoned)?;
        Ok(body.state.is_completed())
    }

    pub fn snapshot(&self) -> Result<TaskSnapshot, StateError> {
        let body = self.lock_body()?;
        Ok(TaskSnapshot {
            id: self.id,
            session_id: self.session_id,
            state: body.state,
            input: self.input.clone(),
            output: body.output.clone(),
        })
    }
}
