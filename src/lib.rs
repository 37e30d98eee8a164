//! Shuttle library
//!
//! Resumable, parallel block-addressed file transfer over TCP: a small
//! threaded daemon serving a directory tree, and a client engine that moves
//! each file as fixed-size blocks over several connections at once.

pub mod allocator;
pub mod auth;
pub mod cli;
pub mod codec;
pub mod config;
pub mod coordinator;
pub mod crypto;
pub mod disk;
pub mod engine;
pub mod error;
pub mod fs_enum;
pub mod logger;
pub mod logging;
pub mod message;
pub mod net;
pub mod pool;
pub mod progress;
pub mod protocol;
pub mod protocol_core;
pub mod registry;
pub mod resume;
pub mod server;
pub mod task;
pub mod url;

pub use coordinator::{Coordinator, TransferSummary};
pub use engine::{EngineOptions, TransferEngine};
pub use error::{Result, TransferError};
pub use net::{ConnectOptions, TcpConnector};
pub use server::{Server, ServerOptions};
pub use task::{Direction, TransferStatus, TransferTask};
