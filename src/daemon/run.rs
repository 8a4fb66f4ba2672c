//! Daemon wiring.
//!
//! `start` binds the listener and spawns the acceptor and scheduler
//! threads; `run` adds signal handling on top and blocks until shutdown.

use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::config::Config;
use crate::daemon::ipc::IpcError;

use super::cache::Cache;
use super::scheduler::{self, SchedulerHandle};
use super::server;

const SIGNAL_POLL: Duration = Duration::from_millis(200);

/// A running daemon. Dropping it stops the acceptor and the scheduler;
/// handler threads parked on client calls end when their peers disconnect.
pub struct DaemonHandle {
    addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    acceptor: Option<std::thread::JoinHandle<()>>,
    scheduler: Option<SchedulerHandle>,
}

impl DaemonHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn stop(self) {}
}

impl Drop for DaemonHandle {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(acceptor) = self.acceptor.take() {
            let _ = acceptor.join();
        }
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.stop();
        }
        tracing::info!("daemon stopped");
    }
}

/// Bind the endpoint and start serving in background threads.
pub fn start(config: &Config) -> crate::Result<DaemonHandle> {
    let listener = TcpListener::bind(&config.listen).map_err(IpcError::Io)?;
    let addr = listener.local_addr().map_err(IpcError::Io)?;
    tracing::info!(
        %addr,
        protocol = crate::daemon::ipc::PROTOCOL_VERSION,
        "task manager listening"
    );

    let cache = Arc::new(Cache::new(config.session_list_limit));
    let scheduler = scheduler::start(
        Arc::clone(&cache),
        Duration::from_millis(config.scheduler_tick_ms.max(1)),
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    let acceptor = {
        let shutdown = Arc::clone(&shutdown);
        std::thread::spawn(move || server::run_acceptor(listener, cache, shutdown))
    };

    Ok(DaemonHandle {
        addr,
        shutdown,
        acceptor: Some(acceptor),
        scheduler: Some(scheduler),
    })
}

/// Run the daemon in the current process until SIGINT/SIGTERM.
pub fn run(config: &Config) -> crate::Result<()> {
    let handle = start(config)?;

    let term = handle.shutdown_flag();
    let _ = signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&term));
    let _ = signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&term));

    while !term.load(Ordering::Relaxed) {
        std::thread::sleep(SIGNAL_POLL);
    }

    tracing::info!("shutdown signal received");
    handle.stop();
    Ok(())
}
