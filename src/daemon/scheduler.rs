//! Scheduler: binds idle executors to sessions with unmet demand.
//!
//! A single background thread ticks on a short interval, takes a detached
//! cache snapshot, and binds on the live cache wherever a session's pending
//! tasks outnumber the executors already serving it. Per-pair failures are
//! logged and skipped; an `AlreadyBound` from a raced bind is benign.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::Sender;

use crate::core::SessionId;

use super::cache::{Cache, CacheError};

/// Stops the scheduler thread when dropped.
pub struct SchedulerHandle {
    stop_tx: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl SchedulerHandle {
    pub fn stop(self) {}
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

pub fn start(cache: Arc<Cache>, tick: Duration) -> SchedulerHandle {
    let (stop_tx, stop_rx) = crossbeam::channel::bounded(1);
    let thread = std::thread::spawn(move || {
        tracing::info!("scheduler started");
        let ticker = crossbeam::channel::tick(tick);
        loop {
            crossbeam::select! {
                recv(stop_rx) -> _ => break,
                recv(ticker) -> _ => {
                    if let Err(err) = schedule_once(&cache) {
                        tracing::error!(error = %err, "scheduling pass failed");
                    }
                }
            }
        }
        tracing::info!("scheduler stopped");
    });

    SchedulerHandle {
        stop_tx,
        thread: Some(thread),
    }
}

/// One scheduling pass over a snapshot. Exposed for direct use in tests.
pub fn schedule_once(cache: &Cache) -> Result<(), CacheError> {
    let snapshot = cache.snapshot()?;

    let mut busy: HashMap<SessionId, usize> = HashMap::new();
    let mut idle = Vec::new();
    for exe in &snapshot.executors {
        match exe.session {
            Some(session) => *busy.entry(session).or_default() += 1,
            None => idle.push(exe),
        }
    }

    if !idle.is_empty() {
        tracing::trace!(idle = idle.len(), "idle executors");
    }

    for exe in idle {
        for ssn in &snapshot.sessions {
            if ssn.is_closed() {
                continue;
            }
            let bound = busy.get(&ssn.id).copied().unwrap_or(0);
            if ssn.pending_tasks() <= bound {
                continue;
            }

            match cache.bind(&exe.id, &ssn.id) {
                Ok(()) => {
                    *busy.entry(ssn.id).or_default() += 1;
                    tracing::debug!(executor = %exe.id, session = %ssn.id, "executor bound");
                    break;
                }
                Err(err) => {
                    tracing::warn!(
                        executor = %exe.id,
                        session = %ssn.id,
                        error = %err,
                        "bind failed"
                    );
                    continue;
                }
            }
        }
    }

    Ok(())
}
