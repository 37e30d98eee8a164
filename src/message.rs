//! Typed control messages carried inside envelopes
//!
//! Payload layout: opcode (u32 LE) followed by the bincode encoding of the
//! variant's body. Unit variants have an empty body.

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::{Result, TransferError};
use crate::protocol::opcode;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleRequest {
    pub path: String,
    /// Upload target length; ignored for downloads
    pub length: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleGrant {
    pub fsid: u16,
    pub length: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Denial {
    pub reason: i32,
    pub message: String,
}

impl Denial {
    pub fn from_error(err: &TransferError) -> Self {
        Self {
            reason: err.deny_reason(),
            message: err.to_string(),
        }
    }

    pub fn into_error(self) -> TransferError {
        TransferError::from_denial(self.reason, 0, &self.message)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
    pub length: u64,
}

/// Listing of a server path. A plain file comes back with `is_dir == false`,
/// its length and no entries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryListing {
    pub is_dir: bool,
    pub length: u64,
    pub entries: Vec<DirEntry>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    DirectoryRequest { path: String },
    DirectoryResponse(DirectoryListing),
    DirectoryDenied(Denial),
    DownloadHandleRequest(HandleRequest),
    DownloadHandleAllowed(HandleGrant),
    DownloadDenied(Denial),
    UploadHandleRequest(HandleRequest),
    UploadHandleAllowed(HandleGrant),
    UploadDenied(Denial),
    CreateDirectoryRequest { path: String },
    CreateDirectoryAllowed,
    CreateDirectoryDenied(Denial),
    Heartbeat,
    HeartbeatResponse,
    KeyExchangeRequest { public_key: [u8; 32] },
    KeyExchangeResponse { public_key: [u8; 32], salt: Vec<u8> },
    SessionRequest { credential: Vec<u8> },
    SessionResponse { permissions: u32 },
    SessionDenied(Denial),
    Disconnect,
}

fn body<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value)
        .map_err(|e| TransferError::ProtocolViolation(format!("encode message body: {e}")))
}

fn parse<T: DeserializeOwned>(op: u32, bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| {
        TransferError::ProtocolViolation(format!("malformed body for opcode 0x{op:04X}: {e}"))
    })
}

impl Message {
    pub fn opcode(&self) -> u32 {
        match self {
            Message::DirectoryRequest { .. } => opcode::DIRECTORY_REQUEST,
            Message::DirectoryResponse(_) => opcode::DIRECTORY_RESPONSE,
            Message::DirectoryDenied(_) => opcode::DIRECTORY_DENIED,
            Message::DownloadHandleRequest(_) => opcode::DOWNLOAD_HANDLE_REQUEST,
            Message::DownloadHandleAllowed(_) => opcode::DOWNLOAD_HANDLE_ALLOWED,
            Message::DownloadDenied(_) => opcode::DOWNLOAD_DENIED,
            Message::UploadHandleRequest(_) => opcode::UPLOAD_HANDLE_REQUEST,
            Message::UploadHandleAllowed(_) => opcode::UPLOAD_HANDLE_ALLOWED,
            Message::UploadDenied(_) => opcode::UPLOAD_DENIED,
            Message::CreateDirectoryRequest { .. } => opcode::CREATE_DIRECTORY_REQUEST,
            Message::CreateDirectoryAllowed => opcode::CREATE_DIRECTORY_ALLOWED,
            Message::CreateDirectoryDenied(_) => opcode::CREATE_DIRECTORY_DENIED,
            Message::Heartbeat => opcode::HEARTBEAT,
            Message::HeartbeatResponse => opcode::HEARTBEAT_RESPONSE,
            Message::KeyExchangeRequest { .. } => opcode::KEY_EXCHANGE_REQUEST,
            Message::KeyExchangeResponse { .. } => opcode::KEY_EXCHANGE_RESPONSE,
            Message::SessionRequest { .. } => opcode::SESSION_REQUEST,
            Message::SessionResponse { .. } => opcode::SESSION_RESPONSE,
            Message::SessionDenied(_) => opcode::SESSION_DENIED,
            Message::Disconnect => opcode::DISCONNECT,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = match self {
            Message::DirectoryRequest { path } | Message::CreateDirectoryRequest { path } => {
                body(path)?
            }
            Message::DirectoryResponse(listing) => body(listing)?,
            Message::DownloadHandleRequest(req) | Message::UploadHandleRequest(req) => body(req)?,
            Message::DownloadHandleAllowed(grant) | Message::UploadHandleAllowed(grant) => {
                body(grant)?
            }
            Message::DirectoryDenied(d)
            | Message::DownloadDenied(d)
            | Message::UploadDenied(d)
            | Message::CreateDirectoryDenied(d)
            | Message::SessionDenied(d) => body(d)?,
            Message::KeyExchangeRequest { public_key } => body(public_key)?,
            Message::KeyExchangeResponse { public_key, salt } => body(&(public_key, salt))?,
            Message::SessionRequest { credential } => body(credential)?,
            Message::SessionResponse { permissions } => body(permissions)?,
            Message::Heartbeat
            | Message::HeartbeatResponse
            | Message::CreateDirectoryAllowed
            | Message::Disconnect => Vec::new(),
        };
        let mut out = Vec::with_capacity(4 + payload.len());
        out.extend_from_slice(&self.opcode().to_le_bytes());
        out.extend_from_slice(&payload);
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 4 {
            return Err(TransferError::ProtocolViolation(format!(
                "control message too short: {} bytes",
                bytes.len()
            )));
        }
        let op = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let rest = &bytes[4..];
        let msg = match op {
            opcode::DIRECTORY_REQUEST => Message::DirectoryRequest {
                path: parse(op, rest)?,
            },
            opcode::DIRECTORY_RESPONSE => Message::DirectoryResponse(parse(op, rest)?),
            opcode::DIRECTORY_DENIED => Message::DirectoryDenied(parse(op, rest)?),
            opcode::DOWNLOAD_HANDLE_REQUEST => Message::DownloadHandleRequest(parse(op, rest)?),
            opcode::DOWNLOAD_HANDLE_ALLOWED => Message::DownloadHandleAllowed(parse(op, rest)?),
            opcode::DOWNLOAD_DENIED => Message::DownloadDenied(parse(op, rest)?),
            opcode::UPLOAD_HANDLE_REQUEST => Message::UploadHandleRequest(parse(op, rest)?),
            opcode::UPLOAD_HANDLE_ALLOWED => Message::UploadHandleAllowed(parse(op, rest)?),
            opcode::UPLOAD_DENIED => Message::UploadDenied(parse(op, rest)?),
            opcode::CREATE_DIRECTORY_REQUEST => Message::CreateDirectoryRequest {
                path: parse(op, rest)?,
            },
            opcode::CREATE_DIRECTORY_ALLOWED => Message::CreateDirectoryAllowed,
            opcode::CREATE_DIRECTORY_DENIED => Message::CreateDirectoryDenied(parse(op, rest)?),
            opcode::HEARTBEAT => Message::Heartbeat,
            opcode::HEARTBEAT_RESPONSE => Message::HeartbeatResponse,
            opcode::KEY_EXCHANGE_REQUEST => Message::KeyExchangeRequest {
                public_key: parse(op, rest)?,
            },
            opcode::KEY_EXCHANGE_RESPONSE => {
                let (public_key, salt): ([u8; 32], Vec<u8>) = parse(op, rest)?;
                Message::KeyExchangeResponse { public_key, salt }
            }
            opcode::SESSION_REQUEST => Message::SessionRequest {
                credential: parse(op, rest)?,
            },
            opcode::SESSION_RESPONSE => Message::SessionResponse {
                permissions: parse(op, rest)?,
            },
            opcode::SESSION_DENIED => Message::SessionDenied(parse(op, rest)?),
            opcode::DISCONNECT => Message::Disconnect,
            other => {
                return Err(TransferError::ProtocolViolation(format!(
                    "unknown control opcode 0x{other:04X}"
                )))
            }
        };
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_prefix_is_little_endian() {
        let bytes = Message::Heartbeat.encode().unwrap();
        assert_eq!(bytes, 0x0701u32.to_le_bytes());
    }

    #[test]
    fn handle_request_survives_encoding() {
        let msg = Message::UploadHandleRequest(HandleRequest {
            path: "/incoming/video.mkv".into(),
            length: 10_000_000,
        });
        assert_eq!(Message::decode(&msg.encode().unwrap()).unwrap(), msg);
    }

    #[test]
    fn listing_and_key_exchange_decode() {
        let listing = Message::DirectoryResponse(DirectoryListing {
            is_dir: true,
            length: 0,
            entries: vec![
                DirEntry {
                    name: "a.txt".into(),
                    is_dir: false,
                    length: 12,
                },
                DirEntry {
                    name: "sub".into(),
                    is_dir: true,
                    length: 0,
                },
            ],
        });
        assert_eq!(Message::decode(&listing.encode().unwrap()).unwrap(), listing);

        let kx = Message::KeyExchangeResponse {
            public_key: [9u8; 32],
            salt: vec![1, 2, 3],
        };
        assert_eq!(Message::decode(&kx.encode().unwrap()).unwrap(), kx);
    }

    #[test]
    fn create_directory_messages_decode() {
        let req = Message::CreateDirectoryRequest {
            path: "/incoming/empty".into(),
        };
        let bytes = req.encode().unwrap();
        assert_eq!(bytes[..4], 0x0401u32.to_le_bytes());
        assert_eq!(Message::decode(&bytes).unwrap(), req);
        assert_eq!(
            Message::decode(&Message::CreateDirectoryAllowed.encode().unwrap()).unwrap(),
            Message::CreateDirectoryAllowed
        );
    }

    #[test]
    fn unknown_opcode_is_violation() {
        let mut bytes = 0x4242u32.to_le_bytes().to_vec();
        bytes.push(0);
        assert!(matches!(
            Message::decode(&bytes),
            Err(TransferError::ProtocolViolation(_))
        ));
        assert!(Message::decode(&[1, 2]).is_err());
    }

    #[test]
    fn truncated_body_is_violation() {
        let bytes = Message::DownloadHandleAllowed(HandleGrant {
            fsid: 3,
            length: 99,
        })
        .encode()
        .unwrap();
        assert!(matches!(
            Message::decode(&bytes[..bytes.len() - 2]),
            Err(TransferError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn denial_maps_to_error() {
        let denial = Denial::from_error(&TransferError::Authorization("no write".into()));
        assert!(matches!(denial.into_error(), TransferError::Authorization(_)));
    }
}
