//! Error types for the transfer engine.

use thiserror::Error;

use crate::protocol::deny;

/// Failure kinds surfaced by the codec, the registry and the worker pool.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Bad magic, CRC mismatch or inconsistent length fields.
    #[error("frame error: {0}")]
    Frame(String),

    /// Socket failure, timeout or peer closed the connection.
    #[error("connection error: {0}")]
    Connection(String),

    /// The server no longer knows this file handle.
    #[error("file handle {0} not found")]
    HandleNotFound(u16),

    #[error("not authorized: {0}")]
    Authorization(String),

    /// Local disk failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Disk failure reported by the server.
    #[error("remote I/O error: {0}")]
    RemoteIo(String),

    /// Unexpected opcode or malformed message body.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("decryption failed: {0}")]
    Decryption(String),

    /// The path is already open in the other access mode.
    #[error("handle conflict: {0}")]
    HandleConflict(String),

    #[error("file handle space exhausted")]
    HandleSpaceExhausted,

    #[error("configuration error: {0}")]
    Config(String),

    /// The transfer was paused before it finished.
    #[error("transfer cancelled")]
    Cancelled,
}

impl TransferError {
    /// Socket-level failures are always connection errors, never local I/O.
    pub fn from_socket(err: std::io::Error) -> Self {
        TransferError::Connection(err.to_string())
    }

    /// Returns true for kinds the worker loop absorbs (reconnect or re-acquire).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransferError::Connection(_) | TransferError::HandleNotFound(_)
        )
    }

    pub fn is_connection(&self) -> bool {
        matches!(self, TransferError::Connection(_))
    }

    /// Returns true when the stream can no longer be trusted to be in step
    /// with the peer. Server denials leave the connection usable.
    pub fn poisons_connection(&self) -> bool {
        matches!(
            self,
            TransferError::Connection(_)
                | TransferError::Frame(_)
                | TransferError::ProtocolViolation(_)
                | TransferError::Decryption(_)
        )
    }

    /// Wire reason code used when the server denies a request.
    pub fn deny_reason(&self) -> i32 {
        match self {
            TransferError::HandleNotFound(_) => deny::HANDLE_NOT_FOUND,
            TransferError::Authorization(_) => deny::NOT_AUTHORIZED,
            TransferError::Io(_) | TransferError::RemoteIo(_) => deny::IO,
            TransferError::HandleConflict(_) => deny::HANDLE_CONFLICT,
            TransferError::HandleSpaceExhausted => deny::HANDLE_SPACE_EXHAUSTED,
            _ => deny::BAD_REQUEST,
        }
    }

    /// Rebuild the client-side error from a server denial.
    pub fn from_denial(reason: i32, fsid: u16, message: &str) -> Self {
        match reason {
            deny::HANDLE_NOT_FOUND => TransferError::HandleNotFound(fsid),
            deny::NOT_AUTHORIZED => TransferError::Authorization(message.to_string()),
            deny::IO => TransferError::RemoteIo(message.to_string()),
            deny::HANDLE_CONFLICT => TransferError::HandleConflict(message.to_string()),
            deny::HANDLE_SPACE_EXHAUSTED => TransferError::HandleSpaceExhausted,
            _ => TransferError::ProtocolViolation(format!(
                "request denied (reason {reason}): {message}"
            )),
        }
    }
}

pub type Result<T> = std::result::Result<T, TransferError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_kinds() {
        assert!(TransferError::Connection("reset".into()).is_transient());
        assert!(TransferError::HandleNotFound(7).is_transient());
        assert!(!TransferError::Frame("crc".into()).is_transient());
        assert!(!TransferError::Authorization("no".into()).is_transient());
        assert!(!TransferError::ProtocolViolation("op".into()).is_transient());
    }

    #[test]
    fn broken_streams_are_not_reused() {
        assert!(TransferError::Frame("crc mismatch".into()).poisons_connection());
        assert!(TransferError::Decryption("padding".into()).poisons_connection());
        assert!(TransferError::ProtocolViolation("op".into()).poisons_connection());
        assert!(TransferError::Connection("reset".into()).poisons_connection());
        assert!(!TransferError::HandleNotFound(3).poisons_connection());
        assert!(!TransferError::Authorization("read".into()).poisons_connection());
        assert!(!TransferError::RemoteIo("disk".into()).poisons_connection());
        assert!(!TransferError::Io(std::io::Error::other("local")).poisons_connection());
    }

    #[test]
    fn denial_reason_maps_back() {
        for err in [
            TransferError::HandleNotFound(42),
            TransferError::Authorization("read".into()),
            TransferError::RemoteIo("disk".into()),
            TransferError::HandleConflict("/a".into()),
            TransferError::HandleSpaceExhausted,
        ] {
            let back = TransferError::from_denial(err.deny_reason(), 42, "x");
            assert_eq!(
                std::mem::discriminant(&back),
                std::mem::discriminant(&err),
                "{err}"
            );
        }
        let local = TransferError::Io(std::io::Error::other("full"));
        assert!(matches!(
            TransferError::from_denial(local.deny_reason(), 0, "full"),
            TransferError::RemoteIo(_)
        ));
    }

    #[test]
    fn unknown_reason_is_protocol_violation() {
        let err = TransferError::from_denial(99, 1, "what");
        assert!(matches!(err, TransferError::ProtocolViolation(_)));
        assert_eq!(
            err.to_string(),
            "protocol violation: request denied (reason 99): what"
        );
    }

    #[test]
    fn display_handle_not_found() {
        assert_eq!(
            TransferError::HandleNotFound(513).to_string(),
            "file handle 513 not found"
        );
    }
}
