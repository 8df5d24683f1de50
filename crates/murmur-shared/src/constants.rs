/// Recipient token meaning "every connected participant"
pub const GROUP_RECIPIENT: &str = "group";

/// Default HTTP / WebSocket port (server)
pub const DEFAULT_HTTP_PORT: u16 = 5000;

/// Capacity of each connection's outbound queue (messages)
pub const OUTBOUND_QUEUE_SIZE: usize = 256;

/// Deadline for a single WebSocket write in seconds
pub const WRITE_TIMEOUT_SECS: u64 = 10;

/// How long a disconnected session stays resumable, in seconds
pub const SESSION_TIMEOUT_SECS: u64 = 300;

/// Interval between session reaper sweeps in seconds
pub const REAP_INTERVAL_SECS: u64 = 300;

/// Maximum accepted body of a single upload chunk (32 MiB)
pub const MAX_CHUNK_BYTES: usize = 32 * 1024 * 1024;

/// Suffix of an upload sink that has not been finalized yet
pub const PARTIAL_UPLOAD_SUFFIX: &str = "part";
