//! Shared protocol constants for the shuttle transport

// Envelope header constants
pub const MAGIC: u32 = 0x0134_DA75;
pub const MAGIC_BYTES: [u8; 4] = MAGIC.to_le_bytes();

/// magic | payload_len | crc32 | encrypted flag | 3 reserved
pub const ENVELOPE_PREFIX_LEN: usize = 16;

/// Eight little-endian i32 fields
pub const BLOCK_HEADER_LEN: usize = 32;

// Envelope payloads are streamed in chunks of this size with the magic
// repeated between chunks
pub const CHUNK_SIZE: usize = 64 * 1024;

// Maximum envelope payload (64MB) - prevents DoS via memory exhaustion
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

// Block transfer sizing
pub const DEFAULT_BLOCK_SIZE: u64 = 4096;
pub const MAX_BLOCK_SIZE: u64 = 16 * 1024 * 1024;
pub const DEFAULT_BLOCK_CHUNK: usize = 64 * 1024;
pub const MAX_BLOCK_CHUNK: usize = 4 * 1024 * 1024;

/// Sent by the receiver after every block chunk that has more to follow
pub const CONTINUE_TOKEN: [u8; 2] = [0, 0];

/// Arg2 value that turns a block header into a handle release
pub const RELEASE_INDEX: i32 = -1;

pub const DEFAULT_PORT: u16 = 9031;

// Maximum entries returned by one directory listing
pub const MAX_LIST_ENTRIES: usize = 100_000;

// Opcode values. Request/response pairs share the high byte; denials carry 0x90.
// No opcode may equal MAGIC: the server uses the first four bytes to tell the
// two message shapes apart.
pub mod opcode {
    pub const DIRECTORY_REQUEST: u32 = 0x0101;
    pub const DIRECTORY_RESPONSE: u32 = 0x0110;
    pub const DIRECTORY_DENIED: u32 = 0x0190;

    pub const DOWNLOAD_HANDLE_REQUEST: u32 = 0x0202;
    pub const DOWNLOAD_BLOCK_REQUEST: u32 = 0x0203;
    pub const DOWNLOAD_HANDLE_ALLOWED: u32 = 0x0210;
    pub const DOWNLOAD_BLOCK_RESPONSE: u32 = 0x0220;
    pub const DOWNLOAD_DENIED: u32 = 0x0290;

    pub const UPLOAD_HANDLE_REQUEST: u32 = 0x0302;
    pub const UPLOAD_BLOCK_REQUEST: u32 = 0x0303;
    pub const UPLOAD_HANDLE_ALLOWED: u32 = 0x0310;
    pub const UPLOAD_BLOCK_RESPONSE: u32 = 0x0320;
    pub const UPLOAD_DENIED: u32 = 0x0390;

    pub const CREATE_DIRECTORY_REQUEST: u32 = 0x0401;
    pub const CREATE_DIRECTORY_ALLOWED: u32 = 0x0410;
    pub const CREATE_DIRECTORY_DENIED: u32 = 0x0490;

    // Block-header shaped, Arg2 = -1
    pub const RELEASE_HANDLE: u32 = 0x0601;
    pub const RELEASE_HANDLE_RESPONSE: u32 = 0x0610;

    pub const HEARTBEAT: u32 = 0x0701;
    pub const HEARTBEAT_RESPONSE: u32 = 0x0710;

    pub const SESSION_REQUEST: u32 = 0x2001;
    pub const SESSION_RESPONSE: u32 = 0x2010;
    pub const SESSION_DENIED: u32 = 0x2090;

    pub const KEY_EXCHANGE_REQUEST: u32 = 0xFFAB;
    pub const KEY_EXCHANGE_RESPONSE: u32 = 0xFFAC;

    pub const DISCONNECT: u32 = 0x11_0000;
}

// Denial reasons, carried in Arg3 of a denied block header and in the
// `reason` field of an enveloped denial
pub mod deny {
    pub const HANDLE_NOT_FOUND: i32 = 1;
    pub const NOT_AUTHORIZED: i32 = 2;
    pub const IO: i32 = 3;
    pub const BAD_REQUEST: i32 = 4;
    pub const HANDLE_CONFLICT: i32 = 5;
    pub const HANDLE_SPACE_EXHAUSTED: i32 = 6;
}

// Centralized timeout constants
pub mod timeouts {
    // Connection establishment timeout (ms)
    pub const CONNECT_MS: u64 = 5_000;

    // Socket read/write timeout; bounds how long a stuck call can delay a pause (ms)
    pub const IO_MS: u64 = 30_000;

    // Server handle idle eviction (s)
    pub const HANDLE_IDLE_SECS: u64 = 60;

    // Background sweep of idle handles (s)
    pub const REAPER_INTERVAL_SECS: u64 = 30;

    // Resume-file checkpoint gating
    pub const CHECKPOINT_INTERVAL_MS: u64 = 2_000;
    pub const CHECKPOINT_BYTES: u64 = 8 * 1024 * 1024;

    // Granularity of cancellable sleeps (ms)
    pub const POLL_MS: u64 = 100;

    /// Delay before each successive reachability probe (s); the last value repeats
    pub const RETRY_SCHEDULE_SECS: [u64; 7] = [5, 5, 10, 10, 20, 60, 300];
}

/// Worker count for a file of `total_length` bytes, clamped to the pool size
pub fn parallelism_degree(total_length: u64, pool_size: usize) -> usize {
    let wanted = if total_length <= 64 * 1024 {
        1
    } else if total_length <= 4 * 1024 * 1024 {
        4
    } else {
        16
    };
    wanted.min(pool_size).max(1)
}
