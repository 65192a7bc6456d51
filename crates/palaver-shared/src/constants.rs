use std::time::Duration;

/// Chunk size for peer file transfers (16 KiB).
///
/// The practical sweet spot for DataChannel throughput without excessive
/// per-message overhead.
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Backpressure threshold as a multiple of the chunk size.
///
/// A sender defers the next chunk while the channel's buffered byte count
/// exceeds `BACKPRESSURE_FACTOR * CHUNK_SIZE`.
pub const BACKPRESSURE_FACTOR: usize = 10;

/// Delay before re-checking the buffered byte count while deferred.
pub const BACKPRESSURE_POLL: Duration = Duration::from_millis(50);

/// How long to wait for the authoritative echo of an optimistic message
/// before rolling it back.
pub const ECHO_TIMEOUT: Duration = Duration::from_secs(5);

/// Messages fetched per page; a full page implies more are available.
pub const MESSAGE_PAGE_SIZE: u32 = 50;

/// Credentials shorter than this are treated as absent and the channel
/// falls back to ambient (cookie) authentication.
pub const MIN_CREDENTIAL_LEN: usize = 16;

/// First retry delay after a lost signaling connection.
pub const RECONNECT_BASE: Duration = Duration::from_millis(500);

/// Upper bound on the reconnect backoff delay.
pub const RECONNECT_CAP: Duration = Duration::from_secs(30);

/// Maximum file transfer size in bytes (50 MiB).
pub const MAX_FILE_SIZE: u64 = 50 * 1024 * 1024;
