// PdfChunk - Encrypted PDF chunk download core
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! Download task model and state machine
//!
//! ```text
//! pending --(start)--> downloading --(batch ok, more remain)--> downloading
//! downloading --(all chunks + merge ok)--> completed
//! downloading --(pause)--> paused --(resume)--> downloading
//! pending|downloading --(unrecoverable error)--> failed
//! pending|downloading|paused --(cancel)--> cancelled
//! ```

use crate::api::PdfFileInfo;
use crate::crypto::chunk::DecryptMode;
use crate::error::{PdfDownloadError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Task shared between the downloader and in-flight chunk requests
pub type SharedTask = Arc<Mutex<DownloadTask>>;

/// Status of a download task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Downloading,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Downloading => "downloading",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "downloading" => Ok(TaskStatus::Downloading),
            "paused" => Ok(TaskStatus::Paused),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            _ => Err(PdfDownloadError::invalid_state(format!(
                "Invalid task status: {}",
                s
            ))),
        }
    }

    /// Completed, failed or cancelled
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether the state machine allows `self -> next`
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Downloading)
                | (Downloading, Completed)
                | (Downloading, Paused)
                | (Paused, Downloading)
                | (Pending, Failed)
                | (Downloading, Failed)
                | (Pending, Cancelled)
                | (Downloading, Cancelled)
                | (Paused, Cancelled)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the caller asks to download
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub file_id: String,
    pub filename: String,
    pub decrypt_mode: DecryptMode,
}

impl DownloadRequest {
    pub fn new<I: Into<String>, N: Into<String>>(file_id: I, filename: N) -> Self {
        Self {
            file_id: file_id.into(),
            filename: filename.into(),
            decrypt_mode: DecryptMode::Decrypt,
        }
    }

    /// Request plaintext chunks to be kept as delivered
    pub fn with_decrypt_mode(mut self, mode: DecryptMode) -> Self {
        self.decrypt_mode = mode;
        self
    }
}

/// One file download
pub struct DownloadTask {
    pub id: String,
    pub filename: String,
    pub status: TaskStatus,
    pub total_chunks: usize,
    pub downloaded_chunks: usize,

    /// Decrypted bytes by chunk index
    pub chunks: BTreeMap<usize, Vec<u8>>,

    /// Base key material from the server, never persisted
    pub encryption_key: String,
    pub file_size: u64,
    pub progress: u8,
    pub start_time: DateTime<Utc>,
    pub decrypt_mode: DecryptMode,
    pub file_path: Option<PathBuf>,
    pub error: Option<String>,

    /// Indices known complete, including evicted and resumed ones
    completed: BTreeSet<usize>,
}

impl DownloadTask {
    pub fn new(request: &DownloadRequest) -> Self {
        Self {
            id: request.file_id.clone(),
            filename: request.filename.clone(),
            status: TaskStatus::Pending,
            total_chunks: 0,
            downloaded_chunks: 0,
            chunks: BTreeMap::new(),
            encryption_key: String::new(),
            file_size: 0,
            progress: 0,
            start_time: Utc::now(),
            decrypt_mode: request.decrypt_mode,
            file_path: None,
            error: None,
            completed: BTreeSet::new(),
        }
    }

    /// Move to `next`, rejecting transitions the state machine forbids
    pub fn transition(&mut self, next: TaskStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(PdfDownloadError::invalid_state(format!(
                "Task '{}' cannot go from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }

    /// Take chunk count, key and size from the service's metadata
    pub fn apply_file_info(&mut self, info: PdfFileInfo) {
        self.total_chunks = info.total_chunks;
        self.encryption_key = info.encryption_key;
        self.file_size = info.file_size;
        self.refresh_progress();
    }

    /// Store a decrypted chunk and return the updated progress
    pub fn record_chunk(&mut self, index: usize, data: Vec<u8>) -> u8 {
        self.chunks.insert(index, data);
        if index < self.total_chunks {
            self.completed.insert(index);
        }
        self.refresh_progress();
        self.progress
    }

    /// Restore completed indices from a resume checkpoint
    ///
    /// Only the bookkeeping is restored; the bytes are fetched again.
    pub fn restore_completed<I: IntoIterator<Item = usize>>(&mut self, indices: I) {
        let total = self.total_chunks;
        self.completed
            .extend(indices.into_iter().filter(|&index| index < total));
        self.refresh_progress();
    }

    fn refresh_progress(&mut self) {
        self.downloaded_chunks = self.completed.len();
        self.progress = progress_percent(self.downloaded_chunks, self.total_chunks);
    }

    /// Indices known complete, sorted
    pub fn completed_indices(&self) -> Vec<usize> {
        self.completed.iter().copied().collect()
    }

    /// Indices whose bytes are not held in memory, sorted
    pub fn indices_to_fetch(&self) -> Vec<usize> {
        (0..self.total_chunks)
            .filter(|index| !self.chunks.contains_key(index))
            .collect()
    }

    /// Bytes currently held in the chunk map
    pub fn memory_usage(&self) -> usize {
        self.chunks.values().map(Vec::len).sum()
    }

    pub fn snapshot(&self) -> DownloadStatus {
        DownloadStatus {
            id: self.id.clone(),
            filename: self.filename.clone(),
            status: self.status,
            progress: self.progress,
            downloaded_chunks: self.downloaded_chunks,
            total_chunks: self.total_chunks,
            file_size: self.file_size,
            file_path: self.file_path.clone(),
            error: self.error.clone(),
            start_time: self.start_time,
        }
    }
}

impl fmt::Debug for DownloadTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadTask")
            .field("id", &self.id)
            .field("filename", &self.filename)
            .field("status", &self.status)
            .field("total_chunks", &self.total_chunks)
            .field("downloaded_chunks", &self.downloaded_chunks)
            .field("chunks_in_memory", &self.chunks.len())
            .field("encryption_key", &"<redacted>")
            .field("file_size", &self.file_size)
            .field("progress", &self.progress)
            .field("decrypt_mode", &self.decrypt_mode)
            .field("file_path", &self.file_path)
            .field("error", &self.error)
            .finish()
    }
}

/// `round(downloaded / total * 100)`, 0 for an empty file
pub fn progress_percent(downloaded: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    let percent = (downloaded.min(total) as f64 / total as f64 * 100.0).round();
    percent as u8
}

/// Point-in-time view of a task for the UI layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadStatus {
    pub id: String,
    pub filename: String,
    pub status: TaskStatus,
    pub progress: u8,
    pub downloaded_chunks: usize,
    pub total_chunks: usize,
    pub file_size: u64,
    pub file_path: Option<PathBuf>,
    pub error: Option<String>,
    pub start_time: DateTime<Utc>,
}
