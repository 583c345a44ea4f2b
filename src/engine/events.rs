//! Events delivered from the engine to its host.
//!
//! Background threads (sync worker, UDP receiver, push channel) and host
//! calls all report through one `mpsc::UnboundedSender<MirrorEvent>`. The
//! host drains the receiver returned by [`Engine::new`](super::Engine::new).

// Rust guideline compliant 2026-02

use std::sync::Arc;

use crate::codec::Value;
use crate::discovery::HostInfo;
use crate::tree::MirrorTree;

/// Where a value change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Host edit, route, or restore. Sent to the remote.
    Local,
    /// Received from the remote. Never sent back.
    Remote,
}

/// Notification from the engine to its host.
#[derive(Debug, Clone)]
pub enum MirrorEvent {
    /// A new tree replaced the previous one.
    StructureChanged {
        /// Snapshot of the new tree.
        root: Arc<MirrorTree>,
        /// Raw structure document the tree was compiled from, if known.
        structure: Option<Arc<serde_json::Value>>,
    },

    /// A leaf value changed.
    ValueChanged {
        /// Leaf path.
        path: String,
        /// New value.
        value: Value,
        /// Local edit or remote feedback.
        origin: Origin,
    },

    /// A trigger leaf fired.
    Triggered {
        /// Leaf path.
        path: String,
        /// Local edit or remote feedback.
        origin: Origin,
    },

    /// Host info was fetched.
    HostInfo(HostInfo),

    /// The push channel connected or disconnected.
    PushChannel {
        /// Whether it is now connected.
        connected: bool,
    },
}
