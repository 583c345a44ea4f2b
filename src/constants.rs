//! Application-wide constants for oscquery-mirror.
//!
//! Timeouts and intervals live here so the network layers agree on them.

use std::time::Duration;

// ============================================================================
// Discovery
// ============================================================================

/// Timeout for each discovery request (`?HOST_INFO` and structure).
///
/// Both phases fail independently on expiry and are not retried; the host
/// decides when to request another sync.
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(2);

/// Default OSCQuery HTTP port of the remote.
pub const DEFAULT_REMOTE_PORT: u16 = 5678;

/// Loopback host used when `use_local` is set.
pub const LOCAL_HOST: &str = "127.0.0.1";

// ============================================================================
// Workers
// ============================================================================

/// How often background loops wake up to check their shutdown flag.
pub const WORKER_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long teardown waits for a background thread before detaching it.
pub const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

// ============================================================================
// Transport
// ============================================================================

/// Largest datagram the receiver accepts.
pub const MAX_DATAGRAM_SIZE: usize = 65_536;

/// First delay before reconnecting a dropped push channel.
pub const PUSH_RECONNECT_INITIAL: Duration = Duration::from_secs(1);

/// Upper bound for the push channel's exponential reconnect backoff.
pub const PUSH_RECONNECT_MAX: Duration = Duration::from_secs(30);

/// User agent sent with discovery requests.
pub fn user_agent() -> String {
    format!("oscquery-mirror/{}", env!("CARGO_PKG_VERSION"))
}
