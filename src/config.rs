//! TOML configuration for the client and the daemon.
//!
//! Every field has a default, so a missing file or a partial file is fine.
//! Command-line flags are applied on top by the binaries.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::auth::{AllowAll, AuthorizationProvider, Permissions, StaticTokens};
use crate::engine::EngineOptions;
use crate::error::{Result, TransferError};
use crate::net::ConnectOptions;
use crate::protocol::{timeouts, DEFAULT_BLOCK_CHUNK, DEFAULT_BLOCK_SIZE, DEFAULT_PORT, MAX_BLOCK_CHUNK, MAX_BLOCK_SIZE};
use crate::resume::SavePolicy;
use crate::server::ServerOptions;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub pool_size: usize,
    pub block_size: u64,
    /// Largest payload chunk sent per stop-and-wait step.
    pub chunk_size: usize,
    pub encrypt: bool,
    pub credential: Option<String>,
    pub connect_timeout_ms: u64,
    pub io_timeout_ms: u64,
    pub retry_schedule_secs: Vec<u64>,
    pub checkpoint_interval_ms: u64,
    pub checkpoint_bytes: u64,
    pub resume_file: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            pool_size: 16,
            block_size: DEFAULT_BLOCK_SIZE,
            chunk_size: DEFAULT_BLOCK_CHUNK,
            encrypt: true,
            credential: None,
            connect_timeout_ms: timeouts::CONNECT_MS,
            io_timeout_ms: timeouts::IO_MS,
            retry_schedule_secs: timeouts::RETRY_SCHEDULE_SECS.to_vec(),
            checkpoint_interval_ms: timeouts::CHECKPOINT_INTERVAL_MS,
            checkpoint_bytes: timeouts::CHECKPOINT_BYTES,
            resume_file: None,
            log_file: None,
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(TransferError::Config("pool_size must be at least 1".into()));
        }
        if self.block_size == 0 || self.block_size > MAX_BLOCK_SIZE {
            return Err(TransferError::Config(format!(
                "block_size must be between 1 and {MAX_BLOCK_SIZE}"
            )));
        }
        check_chunk(self.chunk_size)?;
        if self.retry_schedule_secs.is_empty() {
            return Err(TransferError::Config("retry_schedule_secs is empty".into()));
        }
        Ok(())
    }

    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            io_timeout: Duration::from_millis(self.io_timeout_ms),
            encrypt: self.encrypt,
            credential: self.credential.clone().unwrap_or_default().into_bytes(),
            block_chunk: self.chunk_size,
        }
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            pool_size: self.pool_size,
            retry_schedule: self
                .retry_schedule_secs
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect(),
        }
    }

    pub fn save_policy(&self) -> SavePolicy {
        SavePolicy {
            interval: Duration::from_millis(self.checkpoint_interval_ms),
            bytes: self.checkpoint_bytes,
        }
    }
}

/// One accepted credential and the permission names it grants.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialEntry {
    pub token: String,
    pub permissions: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub root: PathBuf,
    pub idle_timeout_secs: u64,
    pub reaper_interval_secs: u64,
    pub io_timeout_ms: u64,
    pub chunk_size: usize,
    /// Empty means every client gets full access.
    pub credentials: BTreeMap<String, CredentialEntry>,
    pub log_file: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: format!("0.0.0.0:{DEFAULT_PORT}"),
            root: PathBuf::from("."),
            idle_timeout_secs: timeouts::HANDLE_IDLE_SECS,
            reaper_interval_secs: timeouts::REAPER_INTERVAL_SECS,
            io_timeout_ms: timeouts::IO_MS,
            chunk_size: DEFAULT_BLOCK_CHUNK,
            credentials: BTreeMap::new(),
            log_file: None,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.idle_timeout_secs == 0 {
            return Err(TransferError::Config("idle_timeout_secs must be positive".into()));
        }
        if self.reaper_interval_secs == 0 {
            return Err(TransferError::Config("reaper_interval_secs must be positive".into()));
        }
        check_chunk(self.chunk_size)?;
        for (name, entry) in &self.credentials {
            if entry.token.is_empty() {
                return Err(TransferError::Config(format!("credential {name} has an empty token")));
            }
        }
        Ok(())
    }

    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            io_timeout: Duration::from_millis(self.io_timeout_ms),
            block_chunk: self.chunk_size,
        }
    }

    /// The credential table as an authorization provider.
    pub fn authorization(&self) -> Result<Box<dyn AuthorizationProvider>> {
        if self.credentials.is_empty() {
            return Ok(Box::new(AllowAll));
        }
        let mut entries = Vec::with_capacity(self.credentials.len());
        for entry in self.credentials.values() {
            entries.push((entry.token.as_bytes().to_vec(), Permissions::parse(&entry.permissions)?));
        }
        Ok(Box::new(StaticTokens::new(entries)))
    }
}

fn check_chunk(chunk: usize) -> Result<()> {
    if chunk == 0 || chunk > MAX_BLOCK_CHUNK {
        return Err(TransferError::Config(format!(
            "chunk_size must be between 1 and {MAX_BLOCK_CHUNK}"
        )));
    }
    Ok(())
}

/// Read a TOML file into `T`; a missing file gives `T::default()`.
pub fn load<T>(path: &Path) -> Result<T>
where
    T: Default + for<'de> Deserialize<'de>,
{
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
        Err(e) => return Err(TransferError::Io(e)),
    };
    toml::from_str(&text)
        .map_err(|e| TransferError::Config(format!("{}: {e}", path.display())))
}

/// Default location: `$XDG_CONFIG_HOME/shuttle/<name>` or `~/.config/shuttle/<name>`.
pub fn default_path(name: &str) -> Option<PathBuf> {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
    Some(base.join("shuttle").join(name))
}
