//! shuttle - resumable parallel file transfer client
//!
//! `shuttle <local> shuttle://host/path` pushes, `shuttle shuttle://host/path <local>`
//! pulls, and `shuttle --resume --server shuttle://host` continues whatever
//! the resume file still lists. Ctrl-C pauses cooperatively and keeps the
//! checkpoint.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use shuttle::cli::ClientArgs;
use shuttle::config::{self, ClientConfig};
use shuttle::coordinator::Coordinator;
use shuttle::engine::TransferEngine;
use shuttle::fs_enum::FileFilter;
use shuttle::logger::{FanoutSink, ProgressSink, TextLogger, TracingSink};
use shuttle::logging::init_logging;
use shuttle::net::TcpConnector;
use shuttle::progress::BarSink;
use shuttle::resume::ResumeStore;
use shuttle::url::{parse_remote_url, RemoteSpec};

const DEFAULT_RESUME_FILE: &str = "shuttle-resume.json";

enum Mode {
    Push { local: PathBuf, remote: RemoteSpec },
    Pull { remote: RemoteSpec, local: PathBuf },
    Resume { remote: RemoteSpec },
}

impl Mode {
    fn remote(&self) -> &RemoteSpec {
        match self {
            Mode::Push { remote, .. } | Mode::Pull { remote, .. } | Mode::Resume { remote } => remote,
        }
    }
}

fn resolve_mode(args: &ClientArgs) -> Result<Mode> {
    if args.resume {
        let server = args
            .server
            .as_deref()
            .context("--resume needs --server shuttle://host[:port]")?;
        let remote = parse_remote_url(server)
            .with_context(|| format!("not a shuttle:// address: {server}"))?;
        return Ok(Mode::Resume { remote });
    }
    let (Some(src), Some(dst)) = (args.source.as_deref(), args.destination.as_deref()) else {
        anyhow::bail!("source and destination are required");
    };
    match (parse_remote_url(src), parse_remote_url(dst)) {
        (None, Some(remote)) => {
            let local = PathBuf::from(src);
            if !local.exists() {
                anyhow::bail!("Source does not exist: {}", local.display());
            }
            Ok(Mode::Push { local, remote })
        }
        (Some(remote), None) => Ok(Mode::Pull {
            remote,
            local: PathBuf::from(dst),
        }),
        (Some(_), Some(_)) => anyhow::bail!("both sides are remote; one must be a local path"),
        (None, None) => anyhow::bail!("neither side is a shuttle:// address"),
    }
}

fn main() -> Result<()> {
    let args = ClientArgs::parse();

    let mut cfg = match args.config.clone().or_else(|| config::default_path("client.toml")) {
        Some(path) => config::load::<ClientConfig>(&path)
            .with_context(|| format!("load config {}", path.display()))?,
        None => ClientConfig::default(),
    };
    args.apply(&mut cfg);
    cfg.validate()?;
    init_logging(args.verbose, cfg.log_file.as_deref())?;

    let mode = resolve_mode(&args)?;
    let remote = mode.remote().clone();
    let connector = Arc::new(TcpConnector::new(&remote.host, remote.port, cfg.connect_options()));

    let resume_path = cfg
        .resume_file
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_RESUME_FILE));
    let journal = Arc::new(ResumeStore::open(&resume_path, cfg.save_policy())?);

    let bar = Arc::new(if args.quiet {
        BarSink::hidden(0)
    } else {
        BarSink::new(0, args.verbose > 0)
    });
    let mut sinks: Vec<Arc<dyn ProgressSink>> = Vec::new();
    sinks.push(bar.clone());
    sinks.push(Arc::new(TracingSink));
    if let Some(path) = &args.transfer_log {
        sinks.push(Arc::new(
            TextLogger::new(path).with_context(|| format!("open {}", path.display()))?,
        ));
    }

    let engine = TransferEngine::new(connector, cfg.engine_options(), Arc::new(FanoutSink(sinks)))?;
    let coordinator = Coordinator::new(engine, cfg.block_size, Some(Arc::clone(&journal)))
        .with_filter(FileFilter {
            exclude: args.exclude.clone(),
        });

    let pause = coordinator.pause_handle();
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupted; pausing and saving progress (Ctrl-C)...");
        pause.pause();
    })
    .context("Error setting Ctrl-C handler")?;

    let tasks = match &mode {
        Mode::Push { local, remote } => coordinator.plan_upload(local, &remote.path)?,
        Mode::Pull { remote, local } => coordinator.plan_download(&remote.path, local)?,
        Mode::Resume { .. } => journal.pending(),
    };
    let total: u64 = tasks.iter().map(|t| t.total_length).sum();
    bar.set_total(total);
    info!(files = tasks.len(), bytes = total, server = %remote.authority(), "starting");

    let start = Instant::now();
    let summary = coordinator.run_tasks(tasks)?;
    coordinator.disconnect();
    let elapsed = start.elapsed().as_secs_f64();

    if summary.is_clean() {
        journal.prune_succeeded()?;
    }
    bar.finish(&format!(
        "{} ok, {} failed, {} paused",
        summary.succeeded, summary.failed, summary.paused
    ));
    println!(
        "Transferred {} files ({:.1} MB) in {:.1}s ({:.1} MB/s)",
        summary.succeeded,
        summary.bytes as f64 / 1_048_576.0,
        elapsed,
        summary.bytes as f64 / elapsed.max(0.001) / 1_048_576.0
    );
    if summary.paused > 0 {
        println!(
            "{} file(s) not finished; continue with: shuttle --resume --server shuttle://{}",
            summary.paused,
            remote.authority()
        );
        std::process::exit(130);
    }
    if summary.failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}
