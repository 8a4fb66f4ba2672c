//! Executor entity: a registered worker and its binding rendezvous.

use std::sync::{Condvar, Mutex, MutexGuard};

use super::{ExecutorId, SessionId, StateError, WAIT_POLL};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    Idle,
    Bound,
}

/// The condvar parks the executor's `Bind` call until the scheduler
/// assigns it a session. Invariant: `status == Bound ⇔ session.is_some()`.
#[derive(Debug)]
pub struct Executor {
    pub id: ExecutorId,
    body: Mutex<ExecutorBody>,
    bound: Condvar,
}

#[derive(Debug)]
struct ExecutorBody {
    status: ExecutorState,
    session: Option<SessionId>,
}

/// Detached copy without synchronisation primitives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorSnapshot {
    pub id: ExecutorId,
    pub status: ExecutorState,
    pub session: Option<SessionId>,
}

impl ExecutorSnapshot {
    pub fn is_idle(&self) -> bool {
        self.session.is_none()
    }
}

impl Executor {
    pub fn new(id: ExecutorId) -> Self {
        Executor {
            id,
            body: Mutex::new(ExecutorBody {
                status: ExecutorState::Idle,
                session: None,
            }),
            bound: Condvar::new(),
        }
    }

    fn lock_body(&self) -> Result<MutexGuard<'_, ExecutorBody>, StateError> {
        self.body.lock().map_err(|_| StateError::Poisoned)
    }

    pub fn status(&self) -> Result<ExecutorState, StateError> {
        Ok(self.lock_body()?.status)
    }

    pub fn bound_session(&self) -> Result<Option<SessionId>, StateError> {
        Ok(self.lock_body()?.session)
    }

    /// Assign a session. At most one bind wins; a bound executor rejects
    /// further binds until `unbind`.
    pub fn bind(&self, session: SessionId) -> Result<(), StateError> {
        let mut body = self.lock_body()?;
        if let Some(existing) = body.session {
            return Err(StateError::AlreadyBound {
                executor: self.id.clone(),
                session: existing,
            });
        }
        body.session = Some(session);
        body.status = ExecutorState::Bound;
        self.bound.notify_all();
        Ok(())
    }

    /// Back to idle. Idempotent.
    pub fn unbind(&self) -> Result<(), StateError> {
        let mut body = self.lock_body()?;
        body.session = None;
        body.status = ExecutorState::Idle;
        self.bound.notify_all();
        Ok(())
    }

    /// Park until bound; returns the assigned session. Waking on unbind
    /// alone re-parks, so this returns exactly once per bind.
    pub fn wait_binding(&self, cancelled: impl Fn() -> bool) -> Result<SessionId, StateError> {
        let mut body = self.lock_body()?;
        loop {
            if body.status == ExecutorState::Bound
                && let Some(session) = body.session
            {
                return Ok(session);
            }
            if cancelled() {
                return Err(StateError::Cancelled);
            }
            body = self
                .bound
                .wait_timeout(body, WAIT_POLL)
                .map_err(|_| StateError::Poisoned)?
                .0;
        }
    }

    pub fn snapshot(&self) -> Result<ExecutorSnapshot, StateError> {
        let body = self.lock_body()?;
        Ok(ExecutorSnapshot {
            id: self.id.clone(),
            status: body.status,
            session: body.session,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;

    fn executor() -> Executor {
        Executor::new(ExecutorId::new("exe-1"))
    }

    #[test]
    fn bind_sets_state_and_session() {
        let exe = executor();
        let ssn = SessionId::generate();

        exe.bind(ssn).unwrap();
        assert_eq!(exe.status().unwrap(), ExecutorState::Bound);
        assert_eq!(exe.bound_session().unwrap(), Some(ssn));

        exe.unbind().unwrap();
        assert_eq!(exe.status().unwrap(), ExecutorState::Idle);
        assert_eq!(exe.bound_session().unwrap(), None);
    }

    #[test]
    fn second_bind_fails() {
        let exe = executor();
        let first = SessionId::generate();
        exe.bind(first).unwrap();

        let err = exe.bind(SessionId::generate()).unwrap_err();
        assert_eq!(
            err,
            StateError::AlreadyBound {
                executor: exe.id.clone(),
                session: first,
            }
        );
    }

    #[test]
    fn concurrent_binds_have_one_winner() {
        let exe = Arc::new(executor());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let exe = Arc::clone(&exe);
            handles.push(std::thread::spawn(move || {
                exe.bind(SessionId::generate()).is_ok()
            }));
        }

        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
    }

    #[test]
    fn wait_binding_returns_after_bind() {
        let exe = Arc::new(executor());
        let (tx, rx) = mpsc::channel();

        let waiter = {
            let exe = Arc::clone(&exe);
            std::thread::spawn(move || {
                let ssn = exe.wait_binding(|| false).unwrap();
                tx.send(ssn).unwrap();
            })
        };

        // Not bound yet: the waiter stays parked.
        assert!(rx.recv_timeout(Duration::from_millis(150)).is_err());

        let ssn = SessionId::generate();
        exe.bind(ssn).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), ssn);
        waiter.join().unwrap();
    }

    #[test]
    fn wait_binding_ignores_unbind() {
        let exe = Arc::new(executor());
        let (tx, rx) = mpsc::channel();

        let _waiter = {
            let exe = Arc::clone(&exe);
            std::thread::spawn(move || {
                let res = exe.wait_binding(|| false);
                let _ = tx.send(res);
            })
        };

        // Unbind broadcasts, but the waiter's predicate is "bound".
        exe.unbind().unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(150)).is_err());

        let ssn = SessionId::generate();
        exe.bind(ssn).unwrap();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap().unwrap(),
            ssn
        );
    }

    #[test]
    fn wait_binding_observes_cancellation() {
        let exe = executor();
        let err = exe.wait_binding(|| true).unwrap_err();
        assert_eq!(err, StateError::Cancelled);
    }
}
