//! Transports and scheduling for keeping the mirror in sync.
//!
//! - [`datagram`]: UDP socket for outbound OSC and its receiver thread.
//! - [`listen`]: websocket push channel carrying LISTEN/IGNORE.
//! - [`scheduler`]: coalescing of sync requests.

pub mod datagram;
pub mod listen;
pub mod scheduler;

pub use datagram::{DatagramReceiver, OscSocket};
pub use listen::{control_frame, ListenCommand, PushChannel, PushHandler};
pub use scheduler::{SyncRequest, SyncScheduler};
