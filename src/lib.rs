//! oscquery-mirror - typed local mirror of a remote OSCQuery parameter tree.
//!
//! The crate discovers a remote's parameters over HTTP, compiles them into a
//! typed tree, and keeps the two sides in sync: local edits go out as OSC
//! datagrams, remote changes come back over UDP or the websocket push
//! channel.
//!
//! # Architecture
//!
//! - **Engine** - Owns the tree, transports and worker threads for one remote
//! - **Discovery** - `?HOST_INFO` and structure requests
//! - **Schema / Reconcile** - JSON structure to tree, state carried across resyncs
//! - **Sync** - UDP socket, push channel, request coalescing
//!
//! # Modules
//!
//! - [`codec`] - Type tags, parameter kinds, values and OSC conversion
//! - [`osc`] - OSC 1.0 packet encoding and decoding
//! - [`tree`] - The mirror tree
//! - [`engine`] - Public engine API and events
//! - [`config`] - Configuration loading/saving

// Library modules
pub mod codec;
pub mod config;
pub mod constants;
pub mod discovery;
pub mod engine;
pub mod osc;
pub mod reconcile;
pub mod route;
pub mod schema;
pub mod sync;
pub mod tree;
pub mod ws;

// Re-export commonly used types
pub use codec::{ParameterKind, TypeTag, Value};
pub use config::Config;
pub use discovery::HostInfo;
pub use engine::{Engine, EngineState, MirrorEvent, Origin};
pub use route::{RouteId, RouteSource, SharedValue};
pub use sync::SyncRequest;
pub use tree::{Group, MirrorTree, Node, Parameter};
