//! Shared engine state and the single update path.
//!
//! Every tree mutation goes through [`MirrorCore`]: host edits, routed
//! values, inbound datagrams, push frames and reconciles. Only
//! [`Origin::Local`] changes produce outbound datagrams, so feedback from
//! the remote can never bounce back to it.
//!
//! The live tree is an `Arc<MirrorTree>` behind an `RwLock`. Edits go
//! through `Arc::make_mut`. Reconciles compile the new tree off-lock, then
//! carry state across and swap it in under the write lock, so no edit lands
//! between the two. Readers clone the `Arc` and keep a consistent snapshot.

// Rust guideline compliant 2026-02

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tokio::sync::mpsc;

use super::events::{MirrorEvent, Origin};
use crate::codec::{self, ParameterKind, TypeTag, Value};
use crate::config::Config;
use crate::discovery::HostInfo;
use crate::osc::{decode_packet, OscArg, OscMessage};
use crate::reconcile::carry_over;
use crate::route::{RouteBridge, RouteId, RouteSource};
use crate::schema;
use crate::sync::{ListenCommand, OscSocket, PushChannel, PushHandler};
use crate::tree::{normalize_path, osc_address, MirrorTree, TreeState};
use crate::ws;

/// Persistable engine state: the last structure plus values and flags.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineState {
    /// Last structure received from the remote.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structure: Option<Json>,
    /// Leaf values and group flags.
    #[serde(default)]
    pub tree: TreeState,
}

#[derive(Debug, Default)]
struct RemoteState {
    host_info: Option<HostInfo>,
    osc_port_override: Option<u16>,
}

pub(crate) struct MirrorCore {
    config: RwLock<Config>,
    tree: RwLock<Arc<MirrorTree>>,
    structure: Mutex<Option<Arc<Json>>>,
    remote: Mutex<RemoteState>,
    socket: OscSocket,
    push: Mutex<Option<PushChannel>>,
    routes: Mutex<RouteBridge>,
    events: mpsc::UnboundedSender<MirrorEvent>,
    closed: AtomicBool,
}

impl std::fmt::Debug for MirrorCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MirrorCore")
            .field("socket", &self.socket)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl MirrorCore {
    pub(crate) fn new(
        config: Config,
        socket: OscSocket,
        events: mpsc::UnboundedSender<MirrorEvent>,
    ) -> Self {
        Self {
            config: RwLock::new(config),
            tree: RwLock::new(Arc::new(MirrorTree::default())),
            structure: Mutex::new(None),
            remote: Mutex::new(RemoteState::default()),
            socket,
            push: Mutex::new(None),
            routes: Mutex::new(RouteBridge::new()),
            events,
            closed: AtomicBool::new(false),
        }
    }

    fn emit(&self, event: MirrorEvent) {
        // Host may have dropped the receiver; events are best-effort
        let _ = self.events.send(event);
    }

    pub(crate) fn socket(&self) -> &OscSocket {
        &self.socket
    }

    // ------------------------------------------------------------------
    // Configuration and targets
    // ------------------------------------------------------------------

    pub(crate) fn config(&self) -> Config {
        self.config.read().expect("config lock poisoned").clone()
    }

    pub(crate) fn update_config(&self, f: impl FnOnce(&mut Config)) {
        f(&mut self.config.write().expect("config lock poisoned"));
    }

    /// Host and HTTP port discovery talks to.
    pub(crate) fn discovery_target(&self) -> (String, u16) {
        let config = self.config.read().expect("config lock poisoned");
        (config.target_host().to_string(), config.remote_port)
    }

    /// Host and port outbound OSC goes to.
    pub(crate) fn outbound_target(&self) -> (String, u16) {
        let config = self.config();
        let override_port = self
            .remote
            .lock()
            .expect("remote state mutex poisoned")
            .osc_port_override;
        let port = override_port
            .or(config.osc_port)
            .unwrap_or(config.remote_port);
        (config.target_host().to_string(), port)
    }

    pub(crate) fn host_info(&self) -> Option<HostInfo> {
        self.remote
            .lock()
            .expect("remote state mutex poisoned")
            .host_info
            .clone()
    }

    pub(crate) fn clear_remote(&self) {
        *self.remote.lock().expect("remote state mutex poisoned") = RemoteState::default();
    }

    // ------------------------------------------------------------------
    // Tree access
    // ------------------------------------------------------------------

    pub(crate) fn tree(&self) -> Arc<MirrorTree> {
        Arc::clone(&self.tree.read().expect("mirror tree lock poisoned"))
    }

    /// Finish `tree` against the live one and swap it in, under one write lock.
    fn swap_tree(
        &self,
        mut tree: MirrorTree,
        finish: impl FnOnce(&mut MirrorTree, &MirrorTree),
    ) -> Arc<MirrorTree> {
        let mut guard = self.tree.write().expect("mirror tree lock poisoned");
        finish(&mut tree, &**guard);
        let tree = Arc::new(tree);
        *guard = Arc::clone(&tree);
        tree
    }

    /// Set a leaf value. Returns whether the stored value changed.
    ///
    /// Local changes are sent to the remote; remote ones never are.
    pub(crate) fn set_value(&self, path: &str, value: &Value, origin: Origin) -> bool {
        let path = normalize_path(path);
        let (tag, kind, new_value) = {
            let mut guard = self.tree.write().expect("mirror tree lock poisoned");
            let tree = Arc::make_mut(&mut guard);
            let Some(param) = tree.parameter_mut(&path) else {
                log::debug!("No parameter at '{path}'");
                return false;
            };
            if origin == Origin::Local && param.read_only() {
                log::warn!("'{path}' is read-only, ignoring local write");
                return false;
            }
            match param.set_value(value) {
                Some(new_value) => (param.tag, param.kind, new_value),
                None => return false,
            }
        };

        if origin == Origin::Local {
            self.send_leaf(&path, tag, &new_value);
        }

        if kind == ParameterKind::Trigger {
            self.emit(MirrorEvent::Triggered { path, origin });
        } else {
            self.emit(MirrorEvent::ValueChanged {
                path,
                value: new_value,
                origin,
            });
        }
        true
    }

    pub(crate) fn set_expanded(&self, path: &str, expanded: bool) -> bool {
        let path = normalize_path(path);
        let mut guard = self.tree.write().expect("mirror tree lock poisoned");
        if guard.group(&path).map(|g| g.expanded) != Some(!expanded) {
            return false;
        }
        match Arc::make_mut(&mut guard).group_mut(&path) {
            Some(group) => {
                group.expanded = expanded;
                true
            }
            None => false,
        }
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Decode a datagram or push frame and apply every message in it.
    pub(crate) fn handle_packet(&self, bytes: &[u8], from: Option<SocketAddr>) {
        match decode_packet(bytes) {
            Ok(packet) => {
                for message in packet.into_messages() {
                    self.handle_message(&message, from);
                }
            }
            Err(e) => log::warn!("Dropping invalid OSC packet ({} bytes): {e:#}", bytes.len()),
        }
    }

    pub(crate) fn handle_message(&self, message: &OscMessage, from: Option<SocketAddr>) {
        if self.config.read().expect("config lock poisoned").log_incoming {
            let source = from.map(|a| a.to_string()).unwrap_or_else(|| "push".to_string());
            log::info!("<- {source} {} {}", message.address, describe_args(&message.args));
        }

        let path = normalize_path(&message.address);
        let tag = self.tree().parameter(&path).map(|p| p.tag);
        let Some(tag) = tag else {
            log::debug!("No parameter for inbound address {}", message.address);
            return;
        };

        match codec::decode(tag, &message.args) {
            Some(value) => {
                self.set_value(&path, &value, Origin::Remote);
            }
            None => log::debug!(
                "Inbound {} ({}) does not fit <{tag}>",
                message.address,
                message.type_tags()
            ),
        }
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    fn send_leaf(&self, path: &str, tag: TypeTag, value: &Value) {
        let message = OscMessage::with_args(osc_address(path), codec::encode(tag, value));
        self.send_message(&message);
    }

    /// Send one message to the remote. Returns whether it was sent.
    pub(crate) fn send_message(&self, message: &OscMessage) -> bool {
        let config = self.config();
        if !config.enabled {
            log::debug!("Disabled, not sending {}", message.address);
            return false;
        }

        let (host, port) = self.outbound_target();
        if config.log_outgoing {
            log::info!("-> {host}:{port} {} {}", message.address, describe_args(&message.args));
        }

        match self.socket.send(message, &host, port) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("{e:#}");
                false
            }
        }
    }

    /// Free-form send; array arguments are flattened.
    pub(crate) fn send_custom(&self, address: &str, args: &[Value]) -> bool {
        let mut osc_args = Vec::new();
        for arg in args {
            flatten_arg(arg, &mut osc_args);
        }
        let address = if address.starts_with('/') {
            address.to_string()
        } else {
            format!("/{address}")
        };
        self.send_message(&OscMessage::with_args(address, osc_args))
    }

    // ------------------------------------------------------------------
    // Discovery results
    // ------------------------------------------------------------------

    /// Record host info, apply the OSC port override and (re)start the push channel.
    pub(crate) fn apply_host_info(self: &Arc<Self>, info: HostInfo) {
        let remote_port = self.config().remote_port;
        {
            let mut remote = self.remote.lock().expect("remote state mutex poisoned");
            remote.osc_port_override = match info.osc_port {
                Some(port) if port != remote_port => {
                    log::info!("Remote receives OSC on port {port}");
                    Some(port)
                }
                _ => None,
            };
            remote.host_info = Some(info.clone());
        }

        if let Some(name) = &info.name {
            log::info!("Connected to OSCQuery server '{name}'");
        }
        self.emit(MirrorEvent::HostInfo(info));
        self.restart_push();
    }

    /// Rebuild the tree from a fresh structure.
    pub(crate) fn apply_structure(&self, structure: Json) {
        let preserve = self.config().keep_values_on_sync;
        let compiled = schema::compile(&structure);
        let tree = self.swap_tree(compiled, |tree, live| carry_over(tree, live, preserve));
        let structure = Arc::new(structure);
        *self.structure.lock().expect("structure mutex poisoned") = Some(Arc::clone(&structure));

        log::info!("Mirror tree rebuilt with {} parameters", tree.parameters().len());
        self.emit(MirrorEvent::StructureChanged {
            root: tree,
            structure: Some(structure),
        });
        self.replay_subscriptions();
    }

    // ------------------------------------------------------------------
    // Push channel and subscriptions
    // ------------------------------------------------------------------

    pub(crate) fn restart_push(self: &Arc<Self>) {
        self.stop_push();
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        let config = self.config();
        let Some(info) = self.host_info() else {
            return;
        };
        if !config.enabled {
            return;
        }
        if !info.listen {
            log::debug!("Remote has no LISTEN extension, push channel not opened");
            return;
        }

        let url = ws::push_url(config.target_host(), info.ws_port.unwrap_or(config.remote_port));
        let weak: Weak<Self> = Arc::downgrade(self);
        let handler: Weak<dyn PushHandler> = weak;

        // Hold the slot while starting so the connect callback sees the channel
        let mut slot = self.push.lock().expect("push channel mutex poisoned");
        match PushChannel::start(url, handler) {
            Ok(channel) => *slot = Some(channel),
            Err(e) => log::warn!("{e:#}"),
        }
    }

    pub(crate) fn stop_push(&self) {
        let channel = self.push.lock().expect("push channel mutex poisoned").take();
        if let Some(channel) = channel {
            log::debug!("Closing push channel {}", channel.url());
            channel.close();
        }
    }

    /// Stop the push channel for good; later host info will not reopen it.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.stop_push();
    }

    pub(crate) fn is_push_connected(&self) -> bool {
        self.push
            .lock()
            .expect("push channel mutex poisoned")
            .as_ref()
            .is_some_and(PushChannel::is_connected)
    }

    /// Toggle a group's listen flag, sending LISTEN or IGNORE for its leaves.
    pub(crate) fn set_listen(&self, path: &str, enabled: bool) -> bool {
        let path = normalize_path(path);
        if path.is_empty() {
            return false;
        }

        let leaves = {
            let mut guard = self.tree.write().expect("mirror tree lock poisoned");
            if guard.group(&path).map(|g| g.listen_enabled) != Some(!enabled) {
                return false;
            }
            let Some(group) = Arc::make_mut(&mut guard).group_mut(&path) else {
                return false;
            };
            group.listen_enabled = enabled;
            group.parameter_paths(&path)
        };

        let command = if enabled {
            ListenCommand::Listen
        } else {
            ListenCommand::Ignore
        };
        self.send_subscriptions(command, &leaves);
        true
    }

    /// Enable listening on every group. Returns how many groups changed.
    pub(crate) fn listen_all(&self) -> usize {
        if !self.host_info().is_some_and(|i| i.listen) {
            log::warn!("Remote does not support LISTEN");
            return 0;
        }

        let (changed, leaves) = {
            let mut guard = self.tree.write().expect("mirror tree lock poisoned");
            let tree = Arc::make_mut(&mut guard);
            let paths: Vec<String> = tree
                .groups()
                .into_iter()
                .filter(|(_, g)| !g.listen_enabled)
                .map(|(path, _)| path)
                .collect();

            let mut seen = HashSet::new();
            let mut leaves = Vec::new();
            for path in &paths {
                if let Some(group) = tree.group_mut(path) {
                    group.listen_enabled = true;
                    leaves.extend(
                        group
                            .parameter_paths(path)
                            .into_iter()
                            .filter(|leaf| seen.insert(leaf.clone())),
                    );
                }
            }
            (paths.len(), leaves)
        };

        if !leaves.is_empty() {
            self.send_subscriptions(ListenCommand::Listen, &leaves);
        }
        changed
    }

    fn send_subscriptions(&self, command: ListenCommand, leaves: &[String]) -> usize {
        let push = self.push.lock().expect("push channel mutex poisoned");
        let Some(channel) = push.as_ref().filter(|c| c.is_connected()) else {
            log::warn!("Push channel not connected, can't send {command:?} for {} parameters", leaves.len());
            return 0;
        };
        leaves
            .iter()
            .filter(|leaf| channel.send_command(command, &osc_address(leaf)))
            .count()
    }

    /// Send LISTEN for every leaf under a listen-enabled group.
    pub(crate) fn replay_subscriptions(&self) -> usize {
        let leaves = listened_leaves(&self.tree());
        if leaves.is_empty() || !self.is_push_connected() {
            return 0;
        }
        let sent = self.send_subscriptions(ListenCommand::Listen, &leaves);
        log::info!("Subscribed to {sent} parameters");
        sent
    }

    // ------------------------------------------------------------------
    // Routes
    // ------------------------------------------------------------------

    pub(crate) fn bind_route(&self, source: &Arc<dyn RouteSource>, target: &str) -> RouteId {
        self.routes
            .lock()
            .expect("route bridge mutex poisoned")
            .bind(source, target)
    }

    pub(crate) fn unbind_route(&self, id: RouteId) -> bool {
        self.routes
            .lock()
            .expect("route bridge mutex poisoned")
            .unbind(id)
    }

    /// Copy the source's value into every target of the same shape.
    pub(crate) fn route_changed(&self, source: &Arc<dyn RouteSource>) -> usize {
        let targets = self
            .routes
            .lock()
            .expect("route bridge mutex poisoned")
            .targets(source);
        if targets.is_empty() {
            return 0;
        }

        let value = source.value();
        let tree = self.tree();
        let mut applied = 0;
        for target in targets {
            let Some(param) = tree.parameter(&target) else {
                log::debug!("Route target '{target}' not in tree");
                continue;
            };
            if param.kind == ParameterKind::Trigger || param.value.is_array() != value.is_array() {
                log::debug!("Route value {value} does not fit '{target}'");
                continue;
            }
            if self.set_value(&target, &value, Origin::Local) {
                applied += 1;
            }
        }
        applied
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    pub(crate) fn save_state(&self) -> EngineState {
        EngineState {
            structure: self
                .structure
                .lock()
                .expect("structure mutex poisoned")
                .as_deref()
                .cloned(),
            tree: self.tree().snapshot(),
        }
    }

    /// Restore a saved state: rebuild from its structure, then reapply
    /// values and flags. Values are not sent to the remote.
    pub(crate) fn load_state(&self, state: EngineState) {
        let compiled = state.structure.as_ref().map(schema::compile);
        let rebuilt = compiled.is_some();
        let tree = self.swap_tree(compiled.unwrap_or_default(), |tree, live| {
            if !rebuilt {
                tree.clone_from(live);
            }
            let values = tree.apply_values(&state.tree);
            let groups = tree.apply_flags(&state.tree);
            log::debug!("Restored {values} values and {groups} group flags");
        });

        let structure = {
            let mut stored = self.structure.lock().expect("structure mutex poisoned");
            if let Some(structure) = state.structure {
                *stored = Some(Arc::new(structure));
            }
            stored.clone()
        };
        if !rebuilt {
            log::debug!("Saved state has no structure, restored onto the live tree");
        }
        self.emit(MirrorEvent::StructureChanged { root: tree, structure });
        self.replay_subscriptions();
    }

    #[cfg(test)]
    pub(crate) fn install_push(&self, channel: PushChannel) {
        *self.push.lock().expect("push channel mutex poisoned") = Some(channel);
    }
}

impl PushHandler for MirrorCore {
    fn on_push_connected(&self) {
        self.emit(MirrorEvent::PushChannel { connected: true });
        self.replay_subscriptions();
    }

    fn on_push_packet(&self, bytes: &[u8]) {
        self.handle_packet(bytes, None);
    }

    fn on_push_text(&self, text: &str) {
        if self.config.read().expect("config lock poisoned").log_incoming {
            log::info!("<- push {text}");
        } else {
            log::debug!("Push channel text: {text}");
        }
    }

    fn on_push_disconnected(&self) {
        self.emit(MirrorEvent::PushChannel { connected: false });
    }
}

/// Leaves under listen-enabled groups, each once, depth first.
fn listened_leaves(tree: &MirrorTree) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for (path, group) in tree.groups() {
        if group.listen_enabled {
            for leaf in group.parameter_paths(&path) {
                if seen.insert(leaf.clone()) {
                    out.push(leaf);
                }
            }
        }
    }
    out
}

fn flatten_arg(value: &Value, out: &mut Vec<OscArg>) {
    match value {
        Value::None => {}
        Value::Bool(b) => out.push(OscArg::Int(i32::from(*b))),
        Value::Int(v) => out.push(OscArg::Int(*v)),
        Value::Float(v) => out.push(OscArg::Float(*v)),
        Value::String(s) => out.push(OscArg::String(s.clone())),
        Value::Array(items) => {
            for item in items {
                flatten_arg(item, out);
            }
        }
    }
}

fn describe_args(args: &[OscArg]) -> String {
    args.iter().map(OscArg::describe).collect::<Vec<_>>().join(" ")
}
