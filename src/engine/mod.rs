//! The mirror engine: one instance per remote.
//!
//! [`Engine`] owns the mirror tree, the UDP socket and its receiver thread,
//! the push channel and the sync worker. Hosts drive it through plain
//! method calls and observe it through the [`MirrorEvent`] receiver
//! returned by [`Engine::new`].
//!
//! # Example
//!
//! ```no_run
//! use oscquery_mirror::{Config, Engine, Value};
//!
//! let (engine, mut events) = Engine::new(Config::default())?;
//! engine.sync_now();
//! while let Some(event) = events.blocking_recv() {
//!     println!("{event:?}");
//!     # break;
//! }
//! engine.set_value("synth/volume", Value::Float(0.8));
//! # Ok::<(), anyhow::Error>(())
//! ```

// Rust guideline compliant 2026-02

mod events;
mod mirror;
mod worker;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;

pub use self::events::{MirrorEvent, Origin};
pub use self::mirror::EngineState;
pub(crate) use self::worker::join_with_timeout;

use self::mirror::MirrorCore;
use self::worker::SyncWorker;
use crate::codec::Value;
use crate::config::Config;
use crate::discovery::HostInfo;
use crate::route::{RouteId, RouteSource};
use crate::sync::{DatagramReceiver, OscSocket, SyncRequest, SyncScheduler};
use crate::tree::MirrorTree;

/// A live mirror of one OSCQuery remote.
#[derive(Debug)]
pub struct Engine {
    core: Arc<MirrorCore>,
    scheduler: Arc<SyncScheduler>,
    worker: Option<SyncWorker>,
    receiver: Option<DatagramReceiver>,
}

impl Engine {
    /// Bind the OSC socket and start the background threads.
    ///
    /// Nothing is fetched until [`sync_now`](Self::sync_now) is called.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound or a thread cannot
    /// be spawned.
    pub fn new(config: Config) -> Result<(Self, mpsc::UnboundedReceiver<MirrorEvent>)> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let socket = OscSocket::bind()?;
        let core = Arc::new(MirrorCore::new(config, socket, events_tx));

        let receiver_core = Arc::downgrade(&core);
        let receiver = core.socket().spawn_receiver(move |bytes, from| {
            if let Some(core) = receiver_core.upgrade() {
                core.handle_packet(bytes, Some(from));
            }
        })?;

        let scheduler = Arc::new(SyncScheduler::new());
        let worker = SyncWorker::new(Arc::clone(&core), Arc::clone(&scheduler))?;

        if let Some(addr) = core.socket().local_addr() {
            log::info!("OSC socket bound to {addr}");
        }

        Ok((
            Self {
                core,
                scheduler,
                worker: Some(worker),
                receiver: Some(receiver),
            },
            events_rx,
        ))
    }

    /// Request a discovery cycle.
    ///
    /// Requests made while a cycle runs collapse into one follow-up cycle.
    pub fn sync_now(&self) -> SyncRequest {
        let Some(worker) = &self.worker else {
            log::warn!("Engine is shut down, sync ignored");
            return SyncRequest::Coalesced;
        };

        let request = self.scheduler.request();
        match request {
            SyncRequest::Started => worker.request(),
            SyncRequest::Coalesced => log::debug!("Sync already running, coalesced"),
        }
        request
    }

    /// Snapshot of the current tree.
    pub fn tree(&self) -> Arc<MirrorTree> {
        self.core.tree()
    }

    /// Current value of the leaf at `path`.
    pub fn value(&self, path: &str) -> Option<Value> {
        self.core.tree().parameter(path).map(|p| p.value.clone())
    }

    /// Set a leaf value and send it to the remote.
    ///
    /// Returns whether the value changed. Unknown paths, read-only leaves
    /// and values that do not fit the leaf are rejected.
    pub fn set_value(&self, path: &str, value: Value) -> bool {
        self.core.set_value(path, &value, Origin::Local)
    }

    /// Fire a trigger leaf.
    pub fn trigger(&self, path: &str) -> bool {
        self.core.set_value(path, &Value::None, Origin::Local)
    }

    /// Enable or disable push notifications for a group's leaves.
    ///
    /// Returns whether the flag changed.
    pub fn set_listen(&self, path: &str, enabled: bool) -> bool {
        self.core.set_listen(path, enabled)
    }

    /// Enable push notifications on every group. Returns how many changed.
    pub fn listen_all(&self) -> usize {
        self.core.listen_all()
    }

    /// Set a group's expanded flag.
    pub fn set_expanded(&self, path: &str, expanded: bool) -> bool {
        self.core.set_expanded(path, expanded)
    }

    /// Send a free-form message; array arguments are flattened.
    pub fn send_message(&self, address: &str, args: &[Value]) -> bool {
        self.core.send_custom(address, args)
    }

    /// Route `source` into the leaf at `target`.
    pub fn bind_route(&self, source: &Arc<dyn RouteSource>, target: &str) -> RouteId {
        self.core.bind_route(source, target)
    }

    /// Remove a route.
    pub fn unbind_route(&self, id: RouteId) -> bool {
        self.core.unbind_route(id)
    }

    /// Push `source`'s current value into its routed leaves.
    ///
    /// Returns how many leaves changed.
    pub fn route_changed(&self, source: &Arc<dyn RouteSource>) -> usize {
        self.core.route_changed(source)
    }

    /// Apply a packet received by the host on another transport.
    pub fn handle_packet(&self, bytes: &[u8]) {
        self.core.handle_packet(bytes, None);
    }

    /// Local address of the OSC socket; remotes may reply to it.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.core.socket().local_addr()
    }

    /// Host and port outbound OSC goes to.
    pub fn outbound_target(&self) -> (String, u16) {
        self.core.outbound_target()
    }

    /// Last fetched host info.
    pub fn host_info(&self) -> Option<HostInfo> {
        self.core.host_info()
    }

    /// Whether the push channel is connected.
    pub fn is_push_connected(&self) -> bool {
        self.core.is_push_connected()
    }

    /// Current configuration.
    pub fn config(&self) -> Config {
        self.core.config()
    }

    /// Enable or disable the engine.
    ///
    /// Disabling closes the push channel and stops outbound traffic.
    /// Enabling triggers a sync, which reopens the push channel.
    pub fn set_enabled(&self, enabled: bool) {
        self.core.update_config(|c| c.enabled = enabled);
        if enabled {
            self.sync_now();
        } else {
            self.core.stop_push();
        }
    }

    /// Point the engine at a different remote and resync.
    pub fn set_remote(&self, host: &str, port: u16) {
        self.core.update_config(|c| {
            c.remote_host = host.to_string();
            c.remote_port = port;
            c.use_local = false;
        });
        self.core.stop_push();
        self.core.clear_remote();
        self.sync_now();
    }

    /// Snapshot structure, values and group flags for persistence.
    pub fn save_state(&self) -> EngineState {
        self.core.save_state()
    }

    /// Restore a saved state, then resync with the remote.
    pub fn load_state(&self, state: EngineState) {
        self.core.load_state(state);
        self.sync_now();
    }

    /// Stop all background activity. Idempotent.
    ///
    /// The push channel closes first so no inbound frames arrive while the
    /// worker and receiver are joined.
    pub fn shutdown(&mut self) {
        if self.worker.is_none() && self.receiver.is_none() {
            return;
        }

        self.core.close();
        if let Some(worker) = self.worker.take() {
            worker.shutdown();
            drop(worker);
        }
        self.receiver.take();
        // A cycle finishing during teardown may have reopened it
        self.core.stop_push();
        self.scheduler.reset();
        log::info!("Engine shut down");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
