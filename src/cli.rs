//! Clap option structs for `shuttle` and `shuttled`

use clap::{ArgAction, Parser};
use std::path::PathBuf;

use crate::config::{ClientConfig, ServerConfig};

/// Move files to or from a shuttle daemon, resumably.
#[derive(Clone, Debug, Parser)]
#[command(author, version, about)]
pub struct ClientArgs {
    /// Source: a local path or shuttle://host[:port]/path
    #[arg(required_unless_present = "resume")]
    pub source: Option<String>,

    /// Destination: a local path or shuttle://host[:port]/path
    #[arg(required_unless_present = "resume")]
    pub destination: Option<String>,

    /// Continue the unfinished transfers recorded in the resume file
    #[arg(long, conflicts_with_all = ["source", "destination"])]
    pub resume: bool,

    /// Daemon to use with --resume (shuttle://host[:port])
    #[arg(long, requires = "resume")]
    pub server: Option<String>,

    /// Client configuration file (TOML)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Worker connections per file
    #[arg(short = 'j', long)]
    pub workers: Option<usize>,

    /// Block size in bytes
    #[arg(long)]
    pub block_size: Option<u64>,

    /// Session credential
    #[arg(long, env = "SHUTTLE_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Send control traffic in the clear
    #[arg(long)]
    pub no_encrypt: bool,

    /// Resume file (default: shuttle-resume.json in the working directory)
    #[arg(long)]
    pub resume_file: Option<PathBuf>,

    /// Skip files and directories whose name matches (repeatable, `*` wildcard)
    #[arg(long = "exclude", action = ArgAction::Append)]
    pub exclude: Vec<String>,

    /// Append a line per transfer event to this file
    #[arg(long)]
    pub transfer_log: Option<PathBuf>,

    /// Write diagnostics to this file instead of stderr
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// More output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// No progress bar
    #[arg(short, long)]
    pub quiet: bool,
}

impl ClientArgs {
    /// Apply flags on top of the file configuration.
    pub fn apply(&self, cfg: &mut ClientConfig) {
        if let Some(w) = self.workers {
            cfg.pool_size = w;
        }
        if let Some(bs) = self.block_size {
            cfg.block_size = bs;
        }
        if let Some(t) = &self.token {
            cfg.credential = Some(t.clone());
        }
        if self.no_encrypt {
            cfg.encrypt = false;
        }
        if let Some(p) = &self.resume_file {
            cfg.resume_file = Some(p.clone());
        }
        if let Some(p) = &self.log_file {
            cfg.log_file = Some(p.clone());
        }
    }
}

/// Serve a directory tree to shuttle clients.
#[derive(Clone, Debug, Parser)]
#[command(author, version, about)]
pub struct DaemonOpts {
    /// Bind address (host:port)
    #[arg(long)]
    pub bind: Option<String>,

    /// Root directory to serve
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// Daemon configuration file (TOML)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Seconds before an unused file handle is evicted
    #[arg(long)]
    pub idle_timeout: Option<u64>,

    /// Write diagnostics to this file instead of stderr
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// More output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

impl DaemonOpts {
    pub fn apply(&self, cfg: &mut ServerConfig) {
        if let Some(b) = &self.bind {
            cfg.bind = b.clone();
        }
        if let Some(r) = &self.root {
            cfg.root = r.clone();
        }
        if let Some(t) = self.idle_timeout {
            cfg.idle_timeout_secs = t;
        }
        if let Some(p) = &self.log_file {
            cfg.log_file = Some(p.clone());
        }
    }
}
