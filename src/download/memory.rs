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


//! Memory guard for decrypted chunks
//!
//! Runs after every batch. When the bytes held by a task exceed the
//! threshold, all but the highest `keep_chunks` indices are dropped from
//! memory. Evicted indices stay counted as downloaded and are fetched again
//! before the merge.

use crate::config::DownloadConfig;
use crate::download::task::DownloadTask;
use tracing::{debug, warn};

/// Outcome of an eviction pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionReport {
    pub bytes_before: usize,
    pub bytes_after: usize,
    /// Evicted indices, ascending
    pub evicted: Vec<usize>,
}

#[derive(Debug, Clone, Copy)]
pub struct MemoryGuard {
    threshold_bytes: usize,
    keep_chunks: usize,
}

impl MemoryGuard {
    pub fn new(threshold_bytes: usize, keep_chunks: usize) -> Self {
        Self {
            threshold_bytes,
            keep_chunks,
        }
    }

    pub fn from_config(config: &DownloadConfig) -> Self {
        Self::new(config.memory_threshold_bytes, config.memory_keep_chunks)
    }

    pub fn threshold_bytes(&self) -> usize {
        self.threshold_bytes
    }

    /// Evict chunks if the task holds more than the threshold
    ///
    /// Returns `None` when nothing had to be evicted.
    pub fn enforce(&self, task: &mut DownloadTask) -> Option<EvictionReport> {
        let bytes_before = task.memory_usage();
        debug!(
            file_id = %task.id,
            bytes = bytes_before,
            threshold = self.threshold_bytes,
            "memory check"
        );

        if bytes_before <= self.threshold_bytes || task.chunks.len() <= self.keep_chunks {
            return None;
        }

        let evict_count = task.chunks.len() - self.keep_chunks;
        let evicted: Vec<usize> = task.chunks.keys().take(evict_count).copied().collect();
        for index in &evicted {
            task.chunks.remove(index);
        }

        let report = EvictionReport {
            bytes_before,
            bytes_after: task.memory_usage(),
            evicted,
        };
        warn!(
            file_id = %task.id,
            bytes_before = report.bytes_before,
            bytes_after = report.bytes_after,
            evicted = ?report.evicted,
            "chunk memory above threshold, evicted older chunks"
        );
        Some(report)
    }
}
