//! Client side of the transport: connection setup, handshake and the
//! request/response calls the transfer engine issues per block.

use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::debug;

use crate::auth::Permissions;
use crate::codec::{receive_block, receive_message, send_block, send_header, send_message};
use crate::crypto::{KeyAgreement, SessionCipher};
use crate::error::{Result, TransferError};
use crate::message::{DirEntry, DirectoryListing, HandleGrant, HandleRequest, Message};
use crate::protocol::{opcode, timeouts, DEFAULT_BLOCK_CHUNK};
use crate::protocol_core::BlockHeader;
use crate::task::Direction;

/// One authenticated connection to the daemon.
pub trait RemoteSession: Send {
    /// Ask the server for a file handle. Uploads pass the target length.
    fn open_handle(&mut self, direction: Direction, remote_path: &str, length: u64)
        -> Result<HandleGrant>;
    fn read_block(&mut self, fsid: u16, index: u64, block_size: u64) -> Result<Vec<u8>>;
    fn write_block(&mut self, fsid: u16, index: u64, block_size: u64, data: &[u8]) -> Result<()>;
    fn release_handle(&mut self, fsid: u16) -> Result<()>;
    fn heartbeat(&mut self) -> Result<()>;
    fn list_directory(&mut self, path: &str) -> Result<DirectoryListing>;
    /// Create `path` and any missing parents on the server.
    fn create_directory(&mut self, path: &str) -> Result<()>;
}

/// Builds sessions; shared by every worker.
pub trait Connector: Send + Sync + 'static {
    type Session: RemoteSession + 'static;
    fn connect(&self) -> Result<Self::Session>;
}

#[derive(Clone, Debug)]
pub struct ConnectOptions {
    pub connect_timeout: Duration,
    pub io_timeout: Duration,
    pub encrypt: bool,
    pub credential: Vec<u8>,
    pub block_chunk: usize,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(timeouts::CONNECT_MS),
            io_timeout: Duration::from_millis(timeouts::IO_MS),
            encrypt: true,
            credential: Vec::new(),
            block_chunk: DEFAULT_BLOCK_CHUNK,
        }
    }
}

#[derive(Clone, Debug)]
pub struct TcpConnector {
    addr: String,
    options: ConnectOptions,
}

impl TcpConnector {
    pub fn new(host: &str, port: u16, options: ConnectOptions) -> Self {
        Self {
            addr: format!("{host}:{port}"),
            options,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    fn resolve(&self) -> Result<Vec<SocketAddr>> {
        let addrs: Vec<SocketAddr> = self
            .addr
            .to_socket_addrs()
            .map_err(|e| TransferError::Connection(format!("resolve {}: {e}", self.addr)))?
            .collect();
        if addrs.is_empty() {
            return Err(TransferError::Connection(format!("{} has no address", self.addr)));
        }
        Ok(addrs)
    }
}

impl Connector for TcpConnector {
    type Session = TcpSession;

    fn connect(&self) -> Result<TcpSession> {
        let mut last = None;
        for addr in self.resolve()? {
            match TcpStream::connect_timeout(&addr, self.options.connect_timeout) {
                Ok(stream) => {
                    tune_socket(&stream);
                    let t = Some(self.options.io_timeout);
                    stream.set_read_timeout(t).map_err(TransferError::from_socket)?;
                    stream.set_write_timeout(t).map_err(TransferError::from_socket)?;
                    return TcpSession::handshake(stream, &self.options);
                }
                Err(e) => last = Some(e),
            }
        }
        Err(TransferError::Connection(format!(
            "connect {}: {}",
            self.addr,
            last.map(|e| e.to_string()).unwrap_or_default()
        )))
    }
}

pub struct TcpSession {
    stream: TcpStream,
    cipher: Option<SessionCipher>,
    permissions: Permissions,
    block_chunk: usize,
}

impl TcpSession {
    fn handshake(stream: TcpStream, options: &ConnectOptions) -> Result<Self> {
        let mut session = Self {
            stream,
            cipher: None,
            permissions: Permissions::NONE,
            block_chunk: options.block_chunk,
        };
        if options.encrypt {
            let agreement = KeyAgreement::new();
            match session.call(&Message::KeyExchangeRequest {
                public_key: agreement.public_key(),
            })? {
                Message::KeyExchangeResponse { public_key, salt } => {
                    session.cipher = Some(agreement.finish(public_key, &salt)?);
                }
                other => return Err(unexpected(&other)),
            }
        }
        match session.call(&Message::SessionRequest {
            credential: options.credential.clone(),
        })? {
            Message::SessionResponse { permissions } => {
                session.permissions = Permissions::from_bits(permissions);
            }
            Message::SessionDenied(d) => {
                return Err(TransferError::Authorization(d.message));
            }
            other => return Err(unexpected(&other)),
        }
        debug!(
            peer = ?session.stream.peer_addr().ok(),
            encrypted = session.cipher.is_some(),
            permissions = session.permissions.bits(),
            "session established"
        );
        Ok(session)
    }

    pub fn permissions(&self) -> Permissions {
        self.permissions
    }

    fn call(&mut self, msg: &Message) -> Result<Message> {
        send_message(&mut self.stream, &msg.encode()?, self.cipher.as_ref())?;
        let reply = receive_message(&mut self.stream, self.cipher.as_ref())?;
        Message::decode(&reply)
    }
}

impl Drop for TcpSession {
    fn drop(&mut self) {
        if let Ok(bytes) = Message::Disconnect.encode() {
            let _ = send_message(&mut self.stream, &bytes, self.cipher.as_ref());
        }
    }
}

fn unexpected(msg: &Message) -> TransferError {
    TransferError::ProtocolViolation(format!("unexpected reply opcode 0x{:04X}", msg.opcode()))
}

fn wire_index(index: u64) -> Result<i32> {
    i32::try_from(index).map_err(|_| {
        TransferError::ProtocolViolation(format!("block index {index} exceeds wire range"))
    })
}

fn wire_block_size(block_size: u64) -> Result<i32> {
    i32::try_from(block_size).map_err(|_| {
        TransferError::ProtocolViolation(format!("block size {block_size} exceeds wire range"))
    })
}

fn check_reply(reply: &BlockHeader, ok: u32, denied: u32, fsid: u16, index: i32) -> Result<()> {
    let op = reply.opcode();
    if op == denied {
        return Err(TransferError::from_denial(reply.arg3, fsid, "block request denied"));
    }
    if op != ok || reply.arg1 != i32::from(fsid) || reply.arg2 != index {
        return Err(TransferError::ProtocolViolation(format!(
            "unexpected block reply {reply:?} for handle {fsid} block {index}"
        )));
    }
    Ok(())
}

impl RemoteSession for TcpSession {
    fn open_handle(
        &mut self,
        direction: Direction,
        remote_path: &str,
        length: u64,
    ) -> Result<HandleGrant> {
        let req = HandleRequest {
            path: remote_path.to_string(),
            length,
        };
        let msg = match direction {
            Direction::Download => Message::DownloadHandleRequest(req),
            Direction::Upload => Message::UploadHandleRequest(req),
        };
        match (direction, self.call(&msg)?) {
            (Direction::Download, Message::DownloadHandleAllowed(g))
            | (Direction::Upload, Message::UploadHandleAllowed(g)) => Ok(g),
            (Direction::Download, Message::DownloadDenied(d))
            | (Direction::Upload, Message::UploadDenied(d)) => Err(d.into_error()),
            (_, other) => Err(unexpected(&other)),
        }
    }

    fn read_block(&mut self, fsid: u16, index: u64, block_size: u64) -> Result<Vec<u8>> {
        let idx = wire_index(index)?;
        let header =
            BlockHeader::new(opcode::DOWNLOAD_BLOCK_REQUEST, fsid, idx, wire_block_size(block_size)?);
        send_header(&mut self.stream, &header)?;
        let (reply, data) = receive_block(&mut self.stream)?;
        check_reply(
            &reply,
            opcode::DOWNLOAD_BLOCK_RESPONSE,
            opcode::DOWNLOAD_DENIED,
            fsid,
            idx,
        )?;
        Ok(data)
    }

    fn write_block(&mut self, fsid: u16, index: u64, block_size: u64, data: &[u8]) -> Result<()> {
        let idx = wire_index(index)?;
        let header =
            BlockHeader::new(opcode::UPLOAD_BLOCK_REQUEST, fsid, idx, wire_block_size(block_size)?);
        send_block(&mut self.stream, &header, data, self.block_chunk)?;
        let (reply, _) = receive_block(&mut self.stream)?;
        check_reply(
            &reply,
            opcode::UPLOAD_BLOCK_RESPONSE,
            opcode::UPLOAD_DENIED,
            fsid,
            idx,
        )
    }

    fn release_handle(&mut self, fsid: u16) -> Result<()> {
        send_header(&mut self.stream, &BlockHeader::release(opcode::RELEASE_HANDLE, fsid))?;
        let (reply, _) = receive_block(&mut self.stream)?;
        if reply.opcode() != opcode::RELEASE_HANDLE_RESPONSE {
            return Err(TransferError::ProtocolViolation(format!(
                "unexpected release reply {reply:?}"
            )));
        }
        Ok(())
    }

    fn heartbeat(&mut self) -> Result<()> {
        match self.call(&Message::Heartbeat)? {
            Message::HeartbeatResponse => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    fn list_directory(&mut self, path: &str) -> Result<DirectoryListing> {
        match self.call(&Message::DirectoryRequest {
            path: path.to_string(),
        })? {
            Message::DirectoryResponse(listing) => Ok(listing),
            Message::DirectoryDenied(d) => Err(d.into_error()),
            other => Err(unexpected(&other)),
        }
    }

    fn create_directory(&mut self, path: &str) -> Result<()> {
        match self.call(&Message::CreateDirectoryRequest {
            path: path.to_string(),
        })? {
            Message::CreateDirectoryAllowed => Ok(()),
            Message::CreateDirectoryDenied(d) => Err(d.into_error()),
            other => Err(unexpected(&other)),
        }
    }
}

/// Directory entries sorted so subdirectories follow files.
pub fn files_first(entries: &mut [DirEntry]) {
    entries.sort_by(|a, b| a.is_dir.cmp(&b.is_dir).then_with(|| a.name.cmp(&b.name)));
}

// Socket tuning: disable Nagle and keep idle connections probed
pub fn tune_socket(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    #[cfg(unix)]
    {
        use std::os::fd::AsRawFd;
        let fd = stream.as_raw_fd();
        let keepalive: libc::c_int = 1;
        // SAFETY: fd is a live socket owned by `stream`; the option value
        // points at a c_int of the size passed
        unsafe {
            let _ = libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_KEEPALIVE,
                &keepalive as *const _ as *const libc::c_void,
                std::mem::size_of_val(&keepalive) as libc::socklen_t,
            );
        }
        #[cfg(target_os = "linux")]
        {
            let keepidle: libc::c_int = 60; // Start probes after 60s idle
            let keepintvl: libc::c_int = 10; // 10s between probes
            // SAFETY: as above
            unsafe {
                let _ = libc::setsockopt(
                    fd,
                    libc::IPPROTO_TCP,
                    libc::TCP_KEEPIDLE,
                    &keepidle as *const _ as *const libc::c_void,
                    std::mem::size_of_val(&keepidle) as libc::socklen_t,
                );
                let _ = libc::setsockopt(
                    fd,
                    libc::IPPROTO_TCP,
                    libc::TCP_KEEPINTVL,
                    &keepintvl as *const _ as *const libc::c_void,
                    std::mem::size_of_val(&keepintvl) as libc::socklen_t,
                );
            }
        }
    }
}
