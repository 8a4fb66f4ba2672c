//! Executor-side SDK: implement `TaskService`, hand it to a
//! `ServiceRunner`, and the runner drives the backend protocol —
//! register, then bind → stream tasks → unbind until stopped, then
//! unregister.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::client::{ClientError, ManagerClient};
use crate::daemon::ipc::{Metadata, TaskInput, TaskOutput};

/// Application hooks invoked by the runner. Only `on_task_invoke` is
/// required; the lifecycle hooks default to no-ops.
pub trait TaskService {
    fn on_registered(&mut self) {}
    fn on_unregistered(&mut self) {}
    fn on_session_bound(&mut self, _session: &Metadata) {}
    fn on_session_unbound(&mut self, _session: &Metadata) {}

    /// Compute a task's output. `Err` fails the task with the given
    /// message instead of completing it.
    fn on_task_invoke(&mut self, input: &TaskInput) -> Result<String, String>;
}

pub struct ServiceRunner {
    client: ManagerClient,
    executor: Metadata,
    stop: Arc<AtomicBool>,
}

impl ServiceRunner {
    pub fn new(addr: impl Into<String>, name: impl Into<String>) -> Self {
        let name = name.into();
        ServiceRunner {
            client: ManagerClient::new(addr),
            executor: Metadata {
                id: name.clone(),
                name: Some(name),
                owner_ref: None,
            },
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that makes `run` return after the current bind cycle.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Drive the executor protocol until stopped or the wire fails.
    pub fn run(&self, service: &mut dyn TaskService) -> Result<(), ClientError> {
        let executor = self.client.register(&self.executor)?;
        service.on_registered();
        tracing::info!(executor = %executor.id, "executor serving");

        while !self.stop.load(Ordering::Relaxed) {
            let Some(session) = self.client.bind(&executor, &self.stop)? else {
                break;
            };
            service.on_session_bound(&session);

            let client = &self.client;
            let stream = client.get_task(&executor, |input| {
                let output = match service.on_task_invoke(&input) {
                    Ok(output) => TaskOutput {
                        task_id: input.task_id.clone(),
                        session_id: input.session_id.clone(),
                        output,
                        error: None,
                    },
                    Err(message) => TaskOutput {
                        task_id: input.task_id.clone(),
                        session_id: input.session_id.clone(),
                        output: String::new(),
                        error: Some(message),
                    },
                };
                client.complete_task(&output)
            });
            if let Err(err) = stream {
                tracing::error!(executor = %executor.id, error = %err, "task stream failed");
                let _ = self.client.unbind(&executor);
                service.on_session_unbound(&session);
                break;
            }

            service.on_session_unbound(&session);
            if let Err(err) = self.client.unbind(&executor) {
                tracing::error!(executor = %executor.id, error = %err, "unbind failed");
            }
        }

        service.on_unregistered();
        if let Err(err) = self.client.unregister(&executor) {
            tracing::error!(executor = %executor.id, error = %err, "unregister failed");
        }
        Ok(())
    }
}
