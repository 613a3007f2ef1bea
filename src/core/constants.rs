//! Default values used when a [`ClientConfigBuilder`](crate::client::ClientConfigBuilder)
//! field is left unset.

use std::time::Duration;

// =============================================================================
// TIMEOUTS
// =============================================================================

/// TCP connect timeout.
pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(5000);

/// Socket read timeout (blocking engine) and read deadline floor.
pub const READ_TIMEOUT: Duration = Duration::from_millis(15000);

/// Socket write timeout.
pub const WRITE_TIMEOUT: Duration = Duration::from_millis(15000);

/// TLS handshake timeout.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(5000);

/// Default per-request timeout for `send_and_receive`.
pub const REQUEST_TIMEOUT: Duration = Duration::from_millis(10000);

// =============================================================================
// CONNECT RETRY
// =============================================================================

/// Maximum number of connect attempts (including the first).
pub const CONNECT_MAX_ATTEMPTS: u32 = 3;

/// First backoff delay.
pub const CONNECT_INITIAL_BACKOFF: Duration = Duration::from_millis(250);

/// Backoff ceiling.
pub const CONNECT_MAX_BACKOFF: Duration = Duration::from_millis(8000);

/// Symmetric jitter applied to each backoff delay.
pub const CONNECT_JITTER: f64 = 0.3;

// =============================================================================
// CONCURRENCY
// =============================================================================

/// Concurrently executing sends.
pub const MAX_IN_FLIGHT: usize = 1;

/// Requests admitted (queued or executing) at once.
pub const REQUEST_QUEUE_CAPACITY: usize = 1;

// =============================================================================
// BUFFERS
// =============================================================================

/// Largest inbound frame buffered before the request fails.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Size of a single socket read.
pub const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Largest TLS record on the wire (16 KiB plaintext + header + expansion).
pub const TLS_RECORD_CAPACITY: usize = 16 * 1024 + 2048;

/// Upper bound for the decrypted application buffer.
pub const TLS_APP_BUFFER_LIMIT: usize = 4 * 1024 * 1024;

/// Name of the designated event delivery thread.
pub const EVENT_THREAD_NAME: &str = "isosocket-events";
