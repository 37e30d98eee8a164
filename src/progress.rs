//! Terminal progress for the client: one byte-level bar across the whole run,
//! with file events printed above it.

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

use crate::logger::ProgressSink;
use crate::task::{TransferStatus, TransferTask};

pub struct BarSink {
    bar: ProgressBar,
    verbose: bool,
}

impl BarSink {
    pub fn new(total_bytes: u64, verbose: bool) -> Self {
        let bar = ProgressBar::new(total_bytes);
        bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} [{elapsed_precise}] [{bar:30.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta}) {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
        );
        Self { bar, verbose }
    }

    /// A bar that draws nothing, for `--quiet` and tests.
    pub fn hidden(total_bytes: u64) -> Self {
        let bar = ProgressBar::with_draw_target(Some(total_bytes), ProgressDrawTarget::hidden());
        Self { bar, verbose: false }
    }

    pub fn set_total(&self, total_bytes: u64) {
        self.bar.set_length(total_bytes);
    }

    pub fn position(&self) -> u64 {
        self.bar.position()
    }

    pub fn finish(&self, message: &str) {
        self.bar.finish_with_message(message.to_string());
    }
}

impl ProgressSink for BarSink {
    fn on_bytes(&self, delta: u64) {
        self.bar.inc(delta);
    }

    fn on_status_changed(&self, task: &TransferTask) {
        let name = task.remote_path.rsplit('/').next().unwrap_or(&task.remote_path);
        match task.status {
            TransferStatus::Transferring => {
                // blocks below the checkpoint are not sent again
                if task.low_water_mark > 0 {
                    self.bar.inc(task.bytes_done());
                }
                self.bar.set_message(name.to_string());
            }
            TransferStatus::Failed => self.bar.println(format!(
                "  failed {} ({})",
                task.remote_path,
                task.error.as_deref().unwrap_or("unknown error")
            )),
            TransferStatus::Succeeded if self.verbose => {
                self.bar.println(format!("  done   {}", task.remote_path))
            }
            TransferStatus::Paused => self.bar.println(format!(
                "  paused {} at {}/{} bytes",
                task.remote_path,
                task.bytes_done(),
                task.total_length
            )),
            _ => {}
        }
    }
}
