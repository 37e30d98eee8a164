use anyhow::{Context, Result};
use clap::Parser;
use std::time::Duration;
use tracing::{info, warn};

use shuttle::auth::RootJail;
use shuttle::cli::DaemonOpts;
use shuttle::config::{self, ServerConfig};
use shuttle::logging::init_logging;
use shuttle::registry::Reaper;
use shuttle::server::Server;

fn main() -> Result<()> {
    let opts = DaemonOpts::parse();

    let mut cfg = match opts.config.clone().or_else(|| config::default_path("server.toml")) {
        Some(path) => config::load::<ServerConfig>(&path)
            .with_context(|| format!("load config {}", path.display()))?,
        None => ServerConfig::default(),
    };
    opts.apply(&mut cfg);
    cfg.validate()?;
    init_logging(opts.verbose.max(1), cfg.log_file.as_deref())?;

    // Validate root directory exists and is a directory
    if !cfg.root.exists() {
        anyhow::bail!("Error: Root directory does not exist: {}", cfg.root.display());
    }
    if !cfg.root.is_dir() {
        anyhow::bail!("Error: Root path is not a directory: {}", cfg.root.display());
    }
    let canonical_root = std::fs::canonicalize(&cfg.root)
        .with_context(|| format!("Failed to canonicalize root path: {}", cfg.root.display()))?;

    let auth = cfg.authorization()?;
    if cfg.credentials.is_empty() {
        warn!("no credentials configured; every client gets full access");
    }
    if cfg.bind.starts_with("0.0.0.0") {
        warn!(bind = %cfg.bind, "listening on all interfaces");
    }

    let server = Server::bind(
        &cfg.bind,
        auth,
        Box::new(RootJail::new(&canonical_root)?),
        cfg.server_options(),
    )?;
    let _reaper = Reaper::spawn(
        server.registry(),
        Duration::from_secs(cfg.reaper_interval_secs),
    )?;
    info!(
        root = %canonical_root.display(),
        bind = %server.local_addr()?,
        idle_timeout_secs = cfg.idle_timeout_secs,
        "shuttled listening"
    );
    server.serve()
}
