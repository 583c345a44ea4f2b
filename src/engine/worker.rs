//! Background sync worker.
//!
//! Discovery uses blocking HTTP, so each cycle runs on a dedicated thread:
//! host info first, then the structure. The worker wakes on requests from
//! the engine and, after each cycle, asks the [`SyncScheduler`] whether a
//! coalesced follow-up is due.

// Rust guideline compliant 2026-02

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use super::mirror::MirrorCore;
use crate::constants;
use crate::discovery::DiscoveryClient;
use crate::sync::SyncScheduler;

/// Thread running discovery cycles.
pub(crate) struct SyncWorker {
    request_tx: std_mpsc::Sender<()>,
    shutdown: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for SyncWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncWorker")
            .field("shutdown", &self.shutdown.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl SyncWorker {
    /// Create and start the worker.
    pub(crate) fn new(core: Arc<MirrorCore>, scheduler: Arc<SyncScheduler>) -> Result<Self> {
        let (request_tx, request_rx) = std_mpsc::channel();
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = Arc::clone(&shutdown);

        let thread_handle = thread::Builder::new()
            .name("sync-worker".to_string())
            .spawn(move || {
                Self::worker_loop(&core, &scheduler, &request_rx, &shutdown_clone);
            })
            .context("Failed to spawn sync worker thread")?;

        Ok(Self {
            request_tx,
            shutdown,
            thread_handle: Some(thread_handle),
        })
    }

    fn worker_loop(
        core: &Arc<MirrorCore>,
        scheduler: &SyncScheduler,
        request_rx: &std_mpsc::Receiver<()>,
        shutdown: &AtomicBool,
    ) {
        log::debug!("Sync worker started");

        loop {
            if shutdown.load(Ordering::SeqCst) {
                break;
            }

            match request_rx.recv_timeout(constants::WORKER_POLL_INTERVAL) {
                Ok(()) => loop {
                    Self::run_cycle(core, shutdown);
                    if shutdown.load(Ordering::SeqCst) || !scheduler.finish() {
                        break;
                    }
                    log::debug!("Running coalesced sync");
                },
                Err(std_mpsc::RecvTimeoutError::Timeout) => {}
                Err(std_mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }

        log::debug!("Sync worker shutting down");
    }

    /// One discovery cycle. Each phase fails on its own.
    fn run_cycle(core: &Arc<MirrorCore>, shutdown: &AtomicBool) {
        let (host, port) = core.discovery_target();
        let client = match DiscoveryClient::new(&host, port) {
            Ok(client) => client,
            Err(e) => {
                log::error!("Failed to create discovery client: {e:#}");
                return;
            }
        };

        log::debug!("Syncing with {}", client.base_url());
        match client.host_info() {
            Ok(info) => core.apply_host_info(info),
            Err(e) => log::warn!("Host info unavailable: {e:#}"),
        }

        if shutdown.load(Ordering::SeqCst) {
            return;
        }

        match client.structure() {
            Ok(structure) => core.apply_structure(structure),
            Err(e) => log::warn!("Structure unavailable: {e:#}"),
        }
    }

    /// Wake the worker for one cycle.
    pub(crate) fn request(&self) {
        let _ = self.request_tx.send(());
    }

    /// Request shutdown; an in-flight cycle stops between phases.
    pub(crate) fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

impl Drop for SyncWorker {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.thread_handle.take() {
            join_with_timeout(handle, "sync worker");
        }
    }
}

/// Join a background thread, detaching it if it has not stopped within
/// [`constants::SHUTDOWN_JOIN_TIMEOUT`].
pub(crate) fn join_with_timeout(handle: JoinHandle<()>, name: &str) {
    if handle.thread().id() == thread::current().id() {
        return;
    }

    let deadline = Instant::now() + constants::SHUTDOWN_JOIN_TIMEOUT;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            log::warn!("{name} thread did not stop in time, detaching");
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    let _ = handle.join();
}
