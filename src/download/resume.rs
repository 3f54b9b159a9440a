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


//! Resume checkpoints
//!
//! After every batch the downloader stores a small JSON checkpoint under
//! `pdf_download_{fileId}`. It never contains chunk bytes or the key; on
//! resume only the progress bookkeeping is restored and the bytes are fetched
//! again.
//!
//! Storage problems never fail a download: saving reports a [`SaveOutcome`]
//! and loading treats unreadable state as absent.

use crate::config::DownloadConfig;
use crate::download::task::DownloadTask;
use crate::error::{PdfDownloadError, Result};
use crate::storage::{PersistedDownloadState, StateStore};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Prefix of every checkpoint key
pub const STATE_KEY_PREFIX: &str = "pdf_download_";

/// Storage key of the checkpoint for `file_id`
pub fn state_key(file_id: &str) -> String {
    format!("{}{}", STATE_KEY_PREFIX, file_id)
}

/// Result of a checkpoint write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved { bytes: usize },
    /// Written on the second attempt, after old states were evicted
    SavedAfterEviction { bytes: usize, evicted: usize },
    /// Serialized state above the size limit
    SkippedTooLarge { bytes: usize },
    Failed { reason: String },
}

impl SaveOutcome {
    pub fn is_saved(&self) -> bool {
        matches!(
            self,
            SaveOutcome::Saved { .. } | SaveOutcome::SavedAfterEviction { .. }
        )
    }
}

pub struct ResumeManager {
    store: Arc<dyn StateStore>,
    max_age: Duration,
    max_state_bytes: usize,
    max_states: usize,
}

impl ResumeManager {
    pub fn new(store: Arc<dyn StateStore>, config: &DownloadConfig) -> Self {
        Self {
            store,
            max_age: config.resume_max_age(),
            max_state_bytes: config.max_state_bytes,
            max_states: config.max_persisted_states,
        }
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Checkpoint the task's progress
    pub async fn save_state(&self, task: &DownloadTask) -> SaveOutcome {
        let state = PersistedDownloadState {
            downloaded_chunks: task.downloaded_chunks,
            total_chunks: task.total_chunks,
            progress: task.progress,
            timestamp: Utc::now().timestamp_millis(),
            chunk_indices: task.completed_indices(),
        };

        let json = match serde_json::to_string(&state) {
            Ok(json) => json,
            Err(e) => {
                warn!(file_id = %task.id, error = %e, "failed to serialize download state");
                return SaveOutcome::Failed {
                    reason: e.to_string(),
                };
            }
        };

        let bytes = json.len();
        if bytes > self.max_state_bytes {
            warn!(file_id = %task.id, bytes, "download state too large, checkpoint skipped");
            return SaveOutcome::SkippedTooLarge { bytes };
        }

        let key = state_key(&task.id);
        match self.store.set(&key, &json).await {
            Ok(()) => {
                debug!(file_id = %task.id, bytes, "download state saved");
                SaveOutcome::Saved { bytes }
            }
            Err(PdfDownloadError::StorageQuotaExceeded { .. }) => {
                warn!(file_id = %task.id, "state storage full, evicting old states");
                let evicted = match self.cleanup_old_states().await {
                    Ok(evicted) => evicted,
                    Err(e) => {
                        warn!(error = %e, "failed to clean up old download states");
                        0
                    }
                };

                match self.store.set(&key, &json).await {
                    Ok(()) => SaveOutcome::SavedAfterEviction { bytes, evicted },
                    Err(e) => {
                        warn!(file_id = %task.id, error = %e, "checkpoint skipped after eviction");
                        SaveOutcome::Failed {
                            reason: e.to_string(),
                        }
                    }
                }
            }
            Err(e) => {
                warn!(file_id = %task.id, error = %e, "failed to save download state");
                SaveOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Read the checkpoint for `file_id`
    pub async fn load_state(&self, file_id: &str) -> Result<Option<PersistedDownloadState>> {
        match self.store.get(&state_key(file_id)).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Restore progress bookkeeping from a usable checkpoint
    ///
    /// Expects `task.total_chunks` to hold the server's current count. Stale
    /// (older than the max age) or mismatched checkpoints are deleted.
    /// Returns true if anything was restored.
    pub async fn check_resume(&self, task: &mut DownloadTask) -> bool {
        let state = match self.load_state(&task.id).await {
            Ok(Some(state)) => state,
            Ok(None) => return false,
            Err(e) => {
                warn!(file_id = %task.id, error = %e, "unreadable download state ignored");
                self.discard(&task.id).await;
                return false;
            }
        };

        let age_ms = state.age_ms(Utc::now().timestamp_millis());
        if age_ms > self.max_age.as_millis() as i64 {
            info!(file_id = %task.id, age_ms, "download state expired");
            self.discard(&task.id).await;
            return false;
        }

        if state.total_chunks != task.total_chunks {
            info!(
                file_id = %task.id,
                saved = state.total_chunks,
                current = task.total_chunks,
                "chunk count changed, download state dropped"
            );
            self.discard(&task.id).await;
            return false;
        }

        if state.downloaded_chunks == 0 && state.chunk_indices.is_empty() {
            return false;
        }

        task.restore_completed(state.chunk_indices);
        info!(
            file_id = %task.id,
            downloaded = task.downloaded_chunks,
            total = task.total_chunks,
            "resuming download, chunk data will be fetched again"
        );
        true
    }

    /// Delete the checkpoint for `file_id`
    pub async fn clear_state(&self, file_id: &str) -> Result<()> {
        self.store.remove(&state_key(file_id)).await
    }

    async fn discard(&self, file_id: &str) {
        if let Err(e) = self.clear_state(file_id).await {
            warn!(file_id, error = %e, "failed to remove download state");
        }
    }

    /// Keep only the newest checkpoints, returning how many were removed
    ///
    /// Unreadable checkpoints count as oldest.
    pub async fn cleanup_old_states(&self) -> Result<usize> {
        let keys: Vec<String> = self
            .store
            .keys()
            .await?
            .into_iter()
            .filter(|key| key.starts_with(STATE_KEY_PREFIX))
            .collect();

        if keys.len() <= self.max_states {
            return Ok(0);
        }

        let mut stamped = Vec::with_capacity(keys.len());
        for key in keys {
            let timestamp = match self.store.get(&key).await {
                Ok(Some(json)) => serde_json::from_str::<PersistedDownloadState>(&json)
                    .map(|state| state.timestamp)
                    .unwrap_or(0),
                _ => 0,
            };
            stamped.push((timestamp, key));
        }
        stamped.sort();

        let excess = stamped.len() - self.max_states;
        let mut removed = 0;
        for (_, key) in stamped.into_iter().take(excess) {
            match self.store.remove(&key).await {
                Ok(()) => {
                    debug!(key = %key, "old download state removed");
                    removed += 1;
                }
                Err(e) => warn!(key = %key, error = %e, "failed to remove download state"),
            }
        }

        Ok(removed)
    }
}
