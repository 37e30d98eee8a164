use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::allocator::block_count;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Upload,
    Download,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferStatus {
    Waiting,
    Transferring,
    Paused,
    Succeeded,
    Failed,
}

/// One file to move, plus its resumable checkpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferTask {
    pub id: Uuid,
    pub remote_path: String,
    pub local_path: PathBuf,
    pub direction: Direction,
    pub total_length: u64,
    pub block_size: u64,
    pub low_water_mark: u64,
    pub status: TransferStatus,
    #[serde(default)]
    pub error: Option<String>,
}

impl TransferTask {
    pub fn new(
        direction: Direction,
        remote_path: impl Into<String>,
        local_path: impl Into<PathBuf>,
        total_length: u64,
        block_size: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            remote_path: remote_path.into(),
            local_path: local_path.into(),
            direction,
            total_length,
            block_size,
            low_water_mark: 0,
            status: TransferStatus::Waiting,
            error: None,
        }
    }

    pub fn total_blocks(&self) -> u64 {
        block_count(self.total_length, self.block_size)
    }

    /// Bytes covered by the checkpoint.
    pub fn bytes_done(&self) -> u64 {
        self.low_water_mark
            .saturating_mul(self.block_size)
            .min(self.total_length)
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.status, TransferStatus::Succeeded | TransferStatus::Failed)
    }

    /// Discard progress, e.g. when the remote file changed size.
    pub fn restart(&mut self, total_length: u64) {
        self.total_length = total_length;
        self.low_water_mark = 0;
        self.error = None;
    }
}
