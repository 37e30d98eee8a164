//! Daemon side: accept loop and per-connection request dispatch
//!
//! Each accepted connection gets its own thread. A connection reads four
//! bytes at a time to decide the shape of the next message: the envelope
//! magic starts a control message, anything else is the opcode of a block
//! header.

use std::fs;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::auth::{AuthorizationProvider, PathTranslator, Permissions, SessionInfo};
use crate::codec::{
    read_lead, receive_block_after_opcode, receive_message_after_magic, send_block, send_header,
    send_message,
};
use crate::crypto::{random_salt, KeyAgreement, SessionCipher};
use crate::error::{Result, TransferError};
use crate::message::{Denial, DirEntry, DirectoryListing, HandleGrant, HandleRequest, Message};
use crate::net::tune_socket;
use crate::protocol::{opcode, timeouts, DEFAULT_BLOCK_CHUNK, MAGIC, MAX_BLOCK_SIZE, MAX_LIST_ENTRIES};
use crate::protocol_core::BlockHeader;
use crate::registry::{AccessMode, HandleRegistry};

#[derive(Clone, Debug)]
pub struct ServerOptions {
    pub idle_timeout: Duration,
    pub io_timeout: Duration,
    pub block_chunk: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(timeouts::HANDLE_IDLE_SECS),
            io_timeout: Duration::from_millis(timeouts::IO_MS),
            block_chunk: DEFAULT_BLOCK_CHUNK,
        }
    }
}

struct Shared {
    registry: Arc<HandleRegistry>,
    auth: Box<dyn AuthorizationProvider>,
    paths: Box<dyn PathTranslator>,
    options: ServerOptions,
}

pub struct Server {
    listener: TcpListener,
    shared: Arc<Shared>,
}

impl Server {
    pub fn bind(
        addr: &str,
        auth: Box<dyn AuthorizationProvider>,
        paths: Box<dyn PathTranslator>,
        options: ServerOptions,
    ) -> anyhow::Result<Self> {
        use anyhow::Context;
        let listener = TcpListener::bind(addr).with_context(|| format!("bind {addr}"))?;
        let registry = Arc::new(HandleRegistry::new(options.idle_timeout));
        Ok(Self {
            listener,
            shared: Arc::new(Shared {
                registry,
                auth,
                paths,
                options,
            }),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<HandleRegistry> {
        Arc::clone(&self.shared.registry)
    }

    /// Accept connections forever, one thread each.
    pub fn serve(self) -> anyhow::Result<()> {
        info!(addr = ?self.listener.local_addr().ok(), "shuttle daemon listening");
        for conn in self.listener.incoming() {
            match conn {
                Ok(stream) => {
                    let shared = Arc::clone(&self.shared);
                    let spawned = thread::Builder::new()
                        .name("shuttle-conn".into())
                        .spawn(move || handle_conn(stream, shared));
                    if let Err(e) = spawned {
                        warn!(error = %e, "failed to spawn connection thread");
                    }
                }
                Err(e) => warn!(error = %e, "accept error"),
            }
        }
        Ok(())
    }
}

fn handle_conn(stream: TcpStream, shared: Arc<Shared>) {
    let peer = stream.peer_addr().ok();
    debug!(?peer, "connection opened");
    let mut conn = Connection {
        stream,
        shared,
        cipher: None,
        session: None,
        peer,
    };
    if let Err(e) = conn.prepare().and_then(|_| conn.run()) {
        match e {
            TransferError::Connection(_) => debug!(?peer, error = %e, "connection closed"),
            _ => warn!(?peer, error = %e, "abandoning connection"),
        }
    }
    debug!(?peer, "connection finished");
}

struct Connection {
    stream: TcpStream,
    shared: Arc<Shared>,
    cipher: Option<SessionCipher>,
    session: Option<SessionInfo>,
    peer: Option<SocketAddr>,
}

enum Flow {
    Continue,
    Close,
}

impl Connection {
    fn prepare(&mut self) -> Result<()> {
        tune_socket(&self.stream);
        let t = Some(self.shared.options.io_timeout);
        self.stream.set_read_timeout(t).map_err(TransferError::from_socket)?;
        self.stream.set_write_timeout(t).map_err(TransferError::from_socket)
    }

    fn run(&mut self) -> Result<()> {
        loop {
            let lead = match read_lead(&mut self.stream) {
                Ok(lead) => lead,
                // idle clients are dropped at the read timeout; EOF is a normal close
                Err(TransferError::Connection(_)) => return Ok(()),
                Err(e) => return Err(e),
            };
            let flow = if u32::from_le_bytes(lead) == MAGIC {
                let payload =
                    receive_message_after_magic(&mut self.stream, lead, self.cipher.as_ref())?;
                self.on_message(Message::decode(&payload)?)?
            } else {
                let (header, data) = receive_block_after_opcode(&mut self.stream, lead)?;
                self.on_block(header, data)?
            };
            if let Flow::Close = flow {
                return Ok(());
            }
        }
    }

    fn reply(&mut self, msg: &Message) -> Result<()> {
        send_message(&mut self.stream, &msg.encode()?, self.cipher.as_ref())
    }

    fn permitted(&self, needed: Permissions) -> Result<&SessionInfo> {
        match &self.session {
            Some(s) if s.permissions.intersects(needed) => Ok(s),
            Some(_) => Err(TransferError::Authorization(format!(
                "session lacks permission 0x{:X}",
                needed.bits()
            ))),
            None => Err(TransferError::Authorization("no session".into())),
        }
    }

    fn on_message(&mut self, msg: Message) -> Result<Flow> {
        match msg {
            Message::Heartbeat => self.reply(&Message::HeartbeatResponse)?,
            Message::Disconnect => return Ok(Flow::Close),
            Message::KeyExchangeRequest { public_key } => {
                if self.cipher.is_some() {
                    return Err(TransferError::ProtocolViolation(
                        "second key exchange on one connection".into(),
                    ));
                }
                let agreement = KeyAgreement::new();
                let salt = random_salt();
                // sent in the clear; the peer has no key yet
                self.reply(&Message::KeyExchangeResponse {
                    public_key: agreement.public_key(),
                    salt: salt.to_vec(),
                })?;
                self.cipher = Some(agreement.finish(public_key, &salt)?);
            }
            Message::SessionRequest { credential } => {
                let permissions = self.shared.auth.check(&credential);
                if permissions.is_empty() {
                    info!(peer = ?self.peer, "session refused");
                    self.reply(&Message::SessionDenied(Denial::from_error(
                        &TransferError::Authorization("credential rejected".into()),
                    )))?;
                } else {
                    debug!(peer = ?self.peer, permissions = permissions.bits(), "session established");
                    self.session = Some(SessionInfo {
                        peer: self.peer,
                        permissions,
                    });
                    self.reply(&Message::SessionResponse {
                        permissions: permissions.bits(),
                    })?;
                }
            }
            Message::DirectoryRequest { path } => {
                let reply = match self.list_directory(&path) {
                    Ok(listing) => Message::DirectoryResponse(listing),
                    Err(e) => Message::DirectoryDenied(Denial::from_error(&e)),
                };
                self.reply(&reply)?;
            }
            Message::CreateDirectoryRequest { path } => {
                let reply = match self.create_directory(&path) {
                    Ok(()) => Message::CreateDirectoryAllowed,
                    Err(e) => Message::CreateDirectoryDenied(Denial::from_error(&e)),
                };
                self.reply(&reply)?;
            }
            Message::DownloadHandleRequest(req) => {
                let reply = match self.open_handle(&req, AccessMode::Read) {
                    Ok(grant) => Message::DownloadHandleAllowed(grant),
                    Err(e) => Message::DownloadDenied(Denial::from_error(&e)),
                };
                self.reply(&reply)?;
            }
            Message::UploadHandleRequest(req) => {
                let reply = match self.open_handle(&req, AccessMode::Write) {
                    Ok(grant) => Message::UploadHandleAllowed(grant),
                    Err(e) => Message::UploadDenied(Denial::from_error(&e)),
                };
                self.reply(&reply)?;
            }
            other => {
                return Err(TransferError::ProtocolViolation(format!(
                    "unexpected control opcode 0x{:04X} from client",
                    other.opcode()
                )))
            }
        }
        Ok(Flow::Continue)
    }

    fn open_handle(&self, req: &HandleRequest, mode: AccessMode) -> Result<HandleGrant> {
        let needed = match mode {
            AccessMode::Read => Permissions::READ,
            AccessMode::Write => Permissions::WRITE,
        };
        let session = self.permitted(needed)?;
        let path = self.shared.paths.resolve(&req.path, session)?;
        let (fsid, length) = self.shared.registry.acquire(&path, mode, req.length)?;
        debug!(fsid, path = %path.display(), ?mode, "handle granted");
        Ok(HandleGrant { fsid, length })
    }

    fn create_directory(&self, virtual_path: &str) -> Result<()> {
        let session = self.permitted(Permissions::WRITE)?;
        let path = self.shared.paths.resolve(virtual_path, session)?;
        fs::create_dir_all(&path)?;
        debug!(path = %path.display(), "directory created");
        Ok(())
    }

    fn list_directory(&self, virtual_path: &str) -> Result<DirectoryListing> {
        let session = self.permitted(Permissions::LIST | Permissions::READ)?;
        let path = self.shared.paths.resolve(virtual_path, session)?;
        let meta = fs::metadata(&path)?;
        if !meta.is_dir() {
            return Ok(DirectoryListing {
                is_dir: false,
                length: meta.len(),
                entries: Vec::new(),
            });
        }
        Ok(DirectoryListing {
            is_dir: true,
            length: 0,
            entries: read_entries(&path)?,
        })
    }

    fn on_block(&mut self, header: BlockHeader, data: Vec<u8>) -> Result<Flow> {
        match header.opcode() {
            opcode::DOWNLOAD_BLOCK_REQUEST => {
                match self.read_block(&header) {
                    Ok(block) => {
                        let reply = header.reply(opcode::DOWNLOAD_BLOCK_RESPONSE, header.arg3);
                        send_block(&mut self.stream, &reply, &block, self.shared.options.block_chunk)?;
                    }
                    Err(e) => self.deny_block(&header, opcode::DOWNLOAD_DENIED, &e)?,
                }
            }
            opcode::UPLOAD_BLOCK_REQUEST => match self.write_block(&header, &data) {
                Ok(()) => {
                    send_header(
                        &mut self.stream,
                        &header.reply(opcode::UPLOAD_BLOCK_RESPONSE, header.arg3),
                    )?;
                }
                Err(e) => self.deny_block(&header, opcode::UPLOAD_DENIED, &e)?,
            },
            opcode::RELEASE_HANDLE => {
                if !header.is_release() {
                    return Err(TransferError::ProtocolViolation(
                        "release without index -1".into(),
                    ));
                }
                // idempotent: an unknown id is already released
                let fsid = header.fsid()?;
                let released = self.session.is_some() && self.shared.registry.release(fsid);
                debug!(fsid, released, "release requested");
                send_header(
                    &mut self.stream,
                    &header.reply(opcode::RELEASE_HANDLE_RESPONSE, 0),
                )?;
            }
            other => {
                return Err(TransferError::ProtocolViolation(format!(
                    "unexpected block opcode 0x{other:04X}"
                )))
            }
        }
        Ok(Flow::Continue)
    }

    fn block_address(header: &BlockHeader) -> Result<(u16, u64, u64)> {
        let fsid = header.fsid()?;
        let index = u64::try_from(header.arg2).map_err(|_| {
            TransferError::ProtocolViolation(format!("negative block index {}", header.arg2))
        })?;
        let block_size = u64::try_from(header.arg3).unwrap_or(0);
        if block_size == 0 || block_size > MAX_BLOCK_SIZE {
            return Err(TransferError::ProtocolViolation(format!(
                "block size {} out of range",
                header.arg3
            )));
        }
        Ok((fsid, index, block_size))
    }

    fn read_block(&self, header: &BlockHeader) -> Result<Vec<u8>> {
        self.permitted(Permissions::READ)?;
        let (fsid, index, block_size) = Self::block_address(header)?;
        self.shared.registry.read_block(fsid, index, block_size)
    }

    fn write_block(&self, header: &BlockHeader, data: &[u8]) -> Result<()> {
        self.permitted(Permissions::WRITE)?;
        let (fsid, index, block_size) = Self::block_address(header)?;
        self.shared.registry.write_block(fsid, index, block_size, data)
    }

    fn deny_block(&mut self, header: &BlockHeader, op: u32, err: &TransferError) -> Result<()> {
        match err {
            TransferError::HandleNotFound(_) => debug!(fsid = header.arg1, "stale handle"),
            _ => warn!(fsid = header.arg1, index = header.arg2, error = %err, "block request denied"),
        }
        send_header(&mut self.stream, &header.reply(op, err.deny_reason()))
    }
}

fn read_entries(dir: &Path) -> Result<Vec<DirEntry>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let meta = match entry.metadata() {
            Ok(m) => m,
            Err(_) => continue,
        };
        if !(meta.is_dir() || meta.is_file()) {
            continue;
        }
        entries.push(DirEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            is_dir: meta.is_dir(),
            length: if meta.is_file() { meta.len() } else { 0 },
        });
        if entries.len() >= MAX_LIST_ENTRIES {
            warn!(dir = %dir.display(), "directory listing truncated");
            break;
        }
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}
