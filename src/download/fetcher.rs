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


//! Chunk fetcher
//!
//! # Retry Policy
//! Each chunk gets `1 + max_retries` attempts with a fixed delay in between.
//! Transport errors, non-200 responses, empty payloads and empty decrypted
//! output are retried; a strict-policy decryption failure is not.
//!
//! # Batches
//! Chunks are requested in batches of `max_concurrent_downloads`. Every
//! request of a batch resolves before the batch returns; the first error (in
//! index order) is reported after that.

use crate::api::{PdfFileInfo, ReportApi};
use crate::config::DownloadConfig;
use crate::crypto::chunk::{ChunkDecryptor, DecryptMode};
use crate::download::progress::DownloadCallbacks;
use crate::download::task::{DownloadTask, SharedTask, TaskStatus};
use crate::error::{PdfDownloadError, Result};
use futures_util::future::join_all;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Per-run data every chunk request needs
#[derive(Clone)]
pub struct ChunkContext {
    pub file_id: String,
    pub encryption_key: String,
    pub decrypt_mode: DecryptMode,
}

impl ChunkContext {
    pub fn from_task(task: &DownloadTask) -> Self {
        Self {
            file_id: task.id.clone(),
            encryption_key: task.encryption_key.clone(),
            decrypt_mode: task.decrypt_mode,
        }
    }
}

impl fmt::Debug for ChunkContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkContext")
            .field("file_id", &self.file_id)
            .field("encryption_key", &"<redacted>")
            .field("decrypt_mode", &self.decrypt_mode)
            .finish()
    }
}

/// Fetches metadata and chunks from the report service
#[derive(Clone)]
pub struct ChunkFetcher {
    api: Arc<dyn ReportApi>,
    decryptor: ChunkDecryptor,
    max_retries: u32,
    retry_interval: Duration,
    batch_size: usize,
}

impl ChunkFetcher {
    pub fn new(api: Arc<dyn ReportApi>, config: &DownloadConfig) -> Self {
        Self {
            api,
            decryptor: ChunkDecryptor::new(config.decrypt_failure_policy),
            max_retries: config.max_retries,
            retry_interval: config.retry_interval(),
            batch_size: config.max_concurrent_downloads.max(1),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Fetch and check the file's metadata
    ///
    /// # Errors
    /// `Metadata` if the call fails, the envelope is not a success, or the
    /// file has no chunks.
    pub async fn fetch_file_info(&self, file_id: &str) -> Result<PdfFileInfo> {
        let envelope = self
            .api
            .get_pdf_file_info(file_id)
            .await
            .map_err(|e| PdfDownloadError::metadata(file_id, e.to_string()))?;

        if !envelope.is_success() {
            return Err(PdfDownloadError::metadata(file_id, envelope.failure_message()));
        }

        let info = envelope
            .data
            .ok_or_else(|| PdfDownloadError::metadata(file_id, "response carried no data"))?;

        if info.total_chunks == 0 {
            return Err(PdfDownloadError::metadata(file_id, "file has no chunks"));
        }

        debug!(
            file_id,
            total_chunks = info.total_chunks,
            file_size = info.file_size,
            chunk_size = ?info.chunk_size,
            "file info received"
        );
        Ok(info)
    }

    /// Populate the task's chunk count, key and size from the service
    pub async fn get_file_info(&self, task: &mut DownloadTask) -> Result<()> {
        let info = self.fetch_file_info(&task.id).await?;
        task.apply_file_info(info);
        Ok(())
    }

    /// Download and decrypt one chunk, retrying transient failures
    ///
    /// Only errors classified by [`PdfDownloadError::is_retryable`] are
    /// retried; anything else fails the chunk on the attempt it happened.
    ///
    /// # Errors
    /// - `ChunkDownload` once all attempts failed, or on a non-retryable error
    /// - `DecryptionFailed` under the strict decrypt policy, without retrying
    pub async fn download_chunk(&self, ctx: &ChunkContext, index: usize) -> Result<Vec<u8>> {
        let attempts = self.max_retries + 1;
        let mut attempt = 0;

        loop {
            attempt += 1;

            match self.fetch_once(ctx, index).await {
                Ok(data) => {
                    debug!(file_id = %ctx.file_id, chunk_index = index, bytes = data.len(), attempt, "chunk ready");
                    return Ok(data);
                }
                Err(e @ PdfDownloadError::DecryptionFailed { .. }) => return Err(e),
                Err(e) if !e.is_retryable() || attempt >= attempts => {
                    warn!(file_id = %ctx.file_id, chunk_index = index, attempts = attempt, error = %e, "chunk failed");
                    return Err(PdfDownloadError::ChunkDownload {
                        file_id: ctx.file_id.clone(),
                        index,
                        attempts: attempt,
                        message: e.to_string(),
                    });
                }
                Err(e) => {
                    warn!(
                        file_id = %ctx.file_id,
                        chunk_index = index,
                        attempt,
                        error = %e,
                        "chunk attempt failed, retrying"
                    );
                    sleep(self.retry_interval).await;
                }
            }
        }
    }

    async fn fetch_once(&self, ctx: &ChunkContext, index: usize) -> Result<Vec<u8>> {
        let response = self.api.get_pdf_chunk(&ctx.file_id, index).await?;

        if response.status != 200 {
            return Err(PdfDownloadError::UnexpectedStatusCode {
                status_code: response.status,
                endpoint: format!("/v1/pdf/chunk/{}/{}", ctx.file_id, index),
            });
        }
        if response.data.is_empty() {
            return Err(PdfDownloadError::EmptyChunk { index });
        }

        let content_length = response
            .headers
            .get("content-length")
            .and_then(|value| value.trim().parse::<usize>().ok());
        debug!(
            file_id = %ctx.file_id,
            chunk_index = index,
            bytes = response.data.len(),
            content_type = ?response.headers.get("content-type"),
            content_length = ?content_length,
            "chunk response"
        );
        if let Some(expected) = content_length {
            if expected != response.data.len() {
                return Err(PdfDownloadError::network_error(
                    format!(
                        "chunk {} body has {} bytes, Content-Length is {}",
                        index,
                        response.data.len(),
                        expected
                    ),
                    true,
                ));
            }
        }

        let decrypted =
            self.decryptor
                .decrypt(&response.data, &ctx.encryption_key, index, ctx.decrypt_mode)?;
        if decrypted.is_empty() {
            return Err(PdfDownloadError::EmptyChunk { index });
        }
        Ok(decrypted)
    }

    /// Download `indices` concurrently and record them in the task
    ///
    /// Every stored chunk fires the progress callback. Chunks that resolve
    /// after the task was cancelled are dropped.
    pub async fn download_batch(
        &self,
        task: &SharedTask,
        ctx: &ChunkContext,
        indices: &[usize],
        callbacks: &DownloadCallbacks,
    ) -> Result<()> {
        let requests = indices
            .iter()
            .map(|&index| self.fetch_and_record(task, ctx, index, callbacks));

        join_all(requests)
            .await
            .into_iter()
            .collect::<Result<Vec<()>>>()?;
        Ok(())
    }

    async fn fetch_and_record(
        &self,
        task: &SharedTask,
        ctx: &ChunkContext,
        index: usize,
        callbacks: &DownloadCallbacks,
    ) -> Result<()> {
        let data = self.download_chunk(ctx, index).await?;

        let mut guard = task.lock().await;
        if guard.status == TaskStatus::Cancelled {
            debug!(file_id = %ctx.file_id, chunk_index = index, "task cancelled, chunk discarded");
            return Ok(());
        }
        let progress = guard.record_chunk(index, data);
        drop(guard);

        callbacks.emit_progress(progress);
        Ok(())
    }
}

impl fmt::Debug for ChunkFetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkFetcher")
            .field("decryptor", &self.decryptor)
            .field("max_retries", &self.max_retries)
            .field("retry_interval", &self.retry_interval)
            .field("batch_size", &self.batch_size)
            .finish()
    }
}
