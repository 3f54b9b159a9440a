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


//! Download orchestration
//!
//! [`Downloader`] owns the task registry and drives each task through
//! metadata, batched chunk download, memory guarding, checkpointing and
//! reassembly.
//!
//! # Flow
//! 1. Fetch file info; restore resume hints for the reported chunk count
//! 2. Fetch missing chunks batch by batch; after each batch run the memory
//!    guard and save a checkpoint
//! 3. Re-fetch chunks the memory guard evicted
//! 4. Merge, validate, save; clear the checkpoint; fire `on_complete`
//!
//! # Control
//! Pause and cancel are observed at the top of every batch. A cancelled
//! task's late chunks are discarded; a paused task keeps its chunks and
//! continues from the first missing index on resume.
//!
//! At most one worker runs per task. The worker flag is only changed while
//! the task lock is held, so a resume racing with a worker that is about to
//! stop cannot leave the task without a worker.

use crate::api::ReportApi;
use crate::config::DownloadConfig;
use crate::download::fetcher::{ChunkContext, ChunkFetcher};
use crate::download::memory::MemoryGuard;
use crate::download::progress::DownloadCallbacks;
use crate::download::reassembler::Reassembler;
use crate::download::resume::ResumeManager;
use crate::download::task::{DownloadRequest, DownloadStatus, DownloadTask, SharedTask, TaskStatus};
use crate::error::{PdfDownloadError, Result};
use crate::file::output::OutputWriter;
use crate::storage::StateStore;
use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Leading bytes shown per chunk by [`Downloader::debug_chunk_data`]
const DEBUG_HEADER_LEN: usize = 8;

/// How a download run ended without an error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// Document saved at the given path
    Completed(PathBuf),
    Paused,
    Cancelled,
    /// Another worker is already running this task
    InProgress,
}

/// Per-chunk diagnostics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDebugInfo {
    pub index: usize,
    /// `None` when the chunk is not in memory
    pub size: Option<usize>,
    /// Hex of the first bytes, when the chunk holds at least 8 bytes
    pub header_hex: Option<String>,
}

struct TaskEntry {
    task: SharedTask,
    callbacks: DownloadCallbacks,
    /// Only written while `task` is locked
    worker_active: AtomicBool,
}

impl TaskEntry {
    fn new(task: DownloadTask, callbacks: DownloadCallbacks) -> Self {
        Self {
            task: Arc::new(Mutex::new(task)),
            callbacks,
            worker_active: AtomicBool::new(false),
        }
    }

    fn release_worker(&self) {
        self.worker_active.store(false, Ordering::SeqCst);
    }
}

struct DownloaderInner {
    config: DownloadConfig,
    api: Arc<dyn ReportApi>,
    fetcher: ChunkFetcher,
    memory: MemoryGuard,
    reassembler: Reassembler,
    resume: ResumeManager,
    tasks: RwLock<HashMap<String, Arc<TaskEntry>>>,
    sweep: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for DownloaderInner {
    fn drop(&mut self) {
        if let Some(handle) = self.sweep.get_mut().take() {
            handle.abort();
        }
    }
}

/// Chunked document downloader
///
/// Cheap to clone; clones share the registry.
#[derive(Clone)]
pub struct Downloader {
    inner: Arc<DownloaderInner>,
}

impl Downloader {
    /// Create a downloader talking to `api` and checkpointing into `store`
    ///
    /// # Errors
    /// `InvalidConfiguration` if `config` fails [`DownloadConfig::validate`].
    pub fn new(
        api: Arc<dyn ReportApi>,
        store: Arc<dyn StateStore>,
        config: DownloadConfig,
    ) -> Result<Self> {
        config.validate()?;

        let writer = OutputWriter::new(config.output_directory.clone());
        let inner = DownloaderInner {
            fetcher: ChunkFetcher::new(api.clone(), &config),
            memory: MemoryGuard::from_config(&config),
            reassembler: Reassembler::new(config.reassembly_policy, config.signature_bytes(), writer),
            resume: ResumeManager::new(store, &config),
            api,
            tasks: RwLock::new(HashMap::new()),
            sweep: Mutex::new(None),
            config,
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn config(&self) -> &DownloadConfig {
        &self.inner.config
    }

    pub fn resume_manager(&self) -> &ResumeManager {
        &self.inner.resume
    }

    /// Download a file and wait until the run ends
    ///
    /// Returns `Paused` or `Cancelled` if the task was paused or cancelled
    /// while running. `on_error` fires exactly once when this returns an
    /// error, except for a rejected request.
    ///
    /// # Errors
    /// - `InvalidState` if the id is empty or a run for it is still active
    /// - `Metadata`, `ChunkDownload`, `DecryptionFailed`, `MissingChunks`,
    ///   `Reassembly` or `FileIoError` when the run fails
    pub async fn start_download(
        &self,
        request: DownloadRequest,
        callbacks: DownloadCallbacks,
    ) -> Result<DownloadOutcome> {
        let entry = self.register(request, callbacks).await?;
        let file_id = entry.task.lock().await.id.clone();

        let info = match self.inner.fetcher.fetch_file_info(&file_id).await {
            Ok(info) => info,
            Err(e) => return self.fail(&entry, e).await,
        };

        {
            let mut task = entry.task.lock().await;
            if task.status == TaskStatus::Cancelled {
                return Ok(DownloadOutcome::Cancelled);
            }

            task.apply_file_info(info);
            if self.inner.resume.check_resume(&mut task).await {
                entry.callbacks.emit_progress(task.progress);
            }
            task.transition(TaskStatus::Downloading)?;

            info!(
                file_id = %task.id,
                filename = %task.filename,
                total_chunks = task.total_chunks,
                file_size = task.file_size,
                "download started"
            );
        }

        self.run_worker(&entry).await
    }

    async fn register(
        &self,
        request: DownloadRequest,
        callbacks: DownloadCallbacks,
    ) -> Result<Arc<TaskEntry>> {
        if request.file_id.trim().is_empty() {
            return Err(PdfDownloadError::invalid_state("file id must not be empty"));
        }

        let mut tasks = self.inner.tasks.write().await;
        if let Some(existing) = tasks.get(&request.file_id) {
            let status = existing.task.lock().await.status;
            if !status.is_terminal() {
                return Err(PdfDownloadError::invalid_state(format!(
                    "Download '{}' is already {}",
                    request.file_id, status
                )));
            }
        }

        let entry = Arc::new(TaskEntry::new(DownloadTask::new(&request), callbacks));
        tasks.insert(request.file_id, entry.clone());
        Ok(entry)
    }

    async fn entry(&self, file_id: &str) -> Result<Arc<TaskEntry>> {
        self.inner
            .tasks
            .read()
            .await
            .get(file_id)
            .cloned()
            .ok_or_else(|| PdfDownloadError::TaskNotFound(file_id.to_string()))
    }

    /// Pause a running download; chunks already in memory are kept
    pub async fn pause_download(&self, file_id: &str) -> Result<()> {
        let entry = self.entry(file_id).await?;
        let mut task = entry.task.lock().await;
        task.transition(TaskStatus::Paused)?;
        self.inner.resume.save_state(&task).await;

        info!(file_id, progress = task.progress, "download paused");
        Ok(())
    }

    /// Continue a paused download and wait until the run ends
    pub async fn resume_download(&self, file_id: &str) -> Result<DownloadOutcome> {
        let entry = self.entry(file_id).await?;
        {
            let mut task = entry.task.lock().await;
            task.transition(TaskStatus::Downloading)?;
            info!(file_id, progress = task.progress, "download resumed");
        }
        self.run_worker(&entry).await
    }

    /// Cancel a download, dropping its chunks and checkpoint
    pub async fn cancel_download(&self, file_id: &str) -> Result<()> {
        let entry = self.entry(file_id).await?;
        {
            let mut task = entry.task.lock().await;
            task.transition(TaskStatus::Cancelled)?;
            task.chunks.clear();
        }

        if let Err(e) = self.inner.resume.clear_state(file_id).await {
            warn!(file_id, error = %e, "failed to clear download state");
        }
        info!(file_id, "download cancelled");
        Ok(())
    }

    pub async fn get_download_status(&self, file_id: &str) -> Option<DownloadStatus> {
        let entry = self.entry(file_id).await.ok()?;
        let task = entry.task.lock().await;
        Some(task.snapshot())
    }

    /// Status of every registered task
    pub async fn list_downloads(&self) -> Vec<DownloadStatus> {
        let entries: Vec<Arc<TaskEntry>> =
            self.inner.tasks.read().await.values().cloned().collect();

        let mut statuses = Vec::with_capacity(entries.len());
        for entry in entries {
            statuses.push(entry.task.lock().await.snapshot());
        }
        statuses.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        statuses
    }

    async fn run_worker(&self, entry: &Arc<TaskEntry>) -> Result<DownloadOutcome> {
        {
            let _task = entry.task.lock().await;
            if entry.worker_active.swap(true, Ordering::SeqCst) {
                return Ok(DownloadOutcome::InProgress);
            }
        }

        match self.process(entry).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => self.fail(entry, e).await,
        }
    }

    /// Worker body; every `Ok` return releases the worker flag under the lock
    async fn process(&self, entry: &Arc<TaskEntry>) -> Result<DownloadOutcome> {
        let (ctx, pending) = {
            let task = entry.task.lock().await;
            (ChunkContext::from_task(&task), task.indices_to_fetch())
        };

        if let Some(outcome) = self.fetch_pass(entry, &ctx, &pending, true).await? {
            return Ok(outcome);
        }

        let evicted = entry.task.lock().await.indices_to_fetch();
        if !evicted.is_empty() {
            info!(file_id = %ctx.file_id, chunks = evicted.len(), "re-fetching evicted chunks before merge");
            if let Some(outcome) = self.fetch_pass(entry, &ctx, &evicted, false).await? {
                return Ok(outcome);
            }
        }

        self.finalize(entry).await
    }

    /// Fetch `indices` in batches
    ///
    /// Returns `Some` when the task was paused or cancelled.
    async fn fetch_pass(
        &self,
        entry: &Arc<TaskEntry>,
        ctx: &ChunkContext,
        indices: &[usize],
        guard_memory: bool,
    ) -> Result<Option<DownloadOutcome>> {
        let batch_size = self.inner.fetcher.batch_size();
        let total_batches = (indices.len() + batch_size - 1) / batch_size;

        for (batch_number, batch) in indices.chunks(batch_size).enumerate() {
            {
                let task = entry.task.lock().await;
                if let Some(outcome) = stop_outcome(task.status) {
                    entry.release_worker();
                    return Ok(Some(outcome));
                }
            }

            debug!(
                file_id = %ctx.file_id,
                batch = batch_number + 1,
                total_batches,
                chunks = ?batch,
                "fetching batch"
            );
            self.inner
                .fetcher
                .download_batch(&entry.task, ctx, batch, &entry.callbacks)
                .await?;

            let mut task = entry.task.lock().await;
            if task.status == TaskStatus::Cancelled {
                entry.release_worker();
                return Ok(Some(DownloadOutcome::Cancelled));
            }
            if guard_memory {
                self.inner.memory.enforce(&mut task);
            }
            self.inner.resume.save_state(&task).await;
        }

        Ok(None)
    }

    async fn finalize(&self, entry: &Arc<TaskEntry>) -> Result<DownloadOutcome> {
        let mut task = entry.task.lock().await;
        if let Some(outcome) = stop_outcome(task.status) {
            entry.release_worker();
            return Ok(outcome);
        }

        let saved = self
            .inner
            .reassembler
            .reassemble(&task.id, &task.filename, &task.chunks, task.total_chunks)
            .await?;

        task.chunks.clear();
        task.file_path = Some(saved.path.clone());
        task.transition(TaskStatus::Completed)?;
        entry.release_worker();

        let file_id = task.id.clone();
        drop(task);

        if let Err(e) = self.inner.resume.clear_state(&file_id).await {
            warn!(file_id = %file_id, error = %e, "failed to clear download state");
        }

        info!(
            file_id = %file_id,
            path = %saved.path.display(),
            bytes = saved.bytes,
            repaired_offset = ?saved.repaired_offset,
            "download completed"
        );
        entry.callbacks.emit_complete(&saved.path);
        Ok(DownloadOutcome::Completed(saved.path))
    }

    /// Mark the run failed and report the error once
    ///
    /// Transfer failures keep the checkpoint so a later start can resume;
    /// data-integrity failures drop it.
    async fn fail(&self, entry: &Arc<TaskEntry>, err: PdfDownloadError) -> Result<DownloadOutcome> {
        let mut task = entry.task.lock().await;
        entry.release_worker();

        match task.status {
            TaskStatus::Cancelled => {
                debug!(file_id = %task.id, error = %err, "error after cancellation ignored");
                return Ok(DownloadOutcome::Cancelled);
            }
            TaskStatus::Paused => {
                // missing chunks are fetched again on resume
                warn!(file_id = %task.id, error = %err, "batch failed while pausing");
                return Ok(DownloadOutcome::Paused);
            }
            _ => {}
        }

        if let Err(e) = task.transition(TaskStatus::Failed) {
            warn!(file_id = %task.id, error = %e, "unexpected state on failure");
            task.status = TaskStatus::Failed;
        }
        task.error = Some(err.to_string());
        task.chunks.clear();
        let file_id = task.id.clone();
        drop(task);

        error!(file_id = %file_id, error = %err, "download failed");

        // no checkpoint survives chunks that merged into an invalid document
        if err.is_data_integrity_error() {
            if let Err(e) = self.inner.resume.clear_state(&file_id).await {
                warn!(file_id = %file_id, error = %e, "failed to clear download state");
            }
        }
        entry.callbacks.emit_error(&err);
        Err(err)
    }

    /// Drop finished tasks from the registry
    ///
    /// Completed tasks go after `completed_task_ttl_secs`, failed and
    /// cancelled ones after `stale_task_ttl_secs`, both counted from the
    /// task's start time. Returns the number removed.
    pub async fn cleanup_expired(&self) -> usize {
        let now = Utc::now();
        let completed_ttl = chrono::Duration::seconds(self.inner.config.completed_task_ttl_secs as i64);
        let stale_ttl = chrono::Duration::seconds(self.inner.config.stale_task_ttl_secs as i64);

        let mut tasks = self.inner.tasks.write().await;
        let mut expired = Vec::new();
        for (file_id, entry) in tasks.iter() {
            let task = entry.task.lock().await;
            let ttl = match task.status {
                TaskStatus::Completed => completed_ttl,
                TaskStatus::Failed | TaskStatus::Cancelled => stale_ttl,
                _ => continue,
            };
            if now.signed_duration_since(task.start_time) > ttl {
                debug!(file_id = %file_id, filename = %task.filename, status = %task.status, "expired task removed");
                expired.push(file_id.clone());
            }
        }

        for file_id in &expired {
            tasks.remove(file_id);
        }
        expired.len()
    }

    /// Run [`cleanup_expired`](Self::cleanup_expired) periodically
    ///
    /// The sweep stops on [`shutdown`](Self::shutdown) or when the last
    /// clone of the downloader is dropped. Calling this twice is a no-op.
    pub async fn start_cleanup_sweep(&self) {
        let mut sweep = self.inner.sweep.lock().await;
        if sweep.is_some() {
            return;
        }

        let period = self.inner.config.cleanup_interval();
        let weak: Weak<DownloaderInner> = Arc::downgrade(&self.inner);
        info!(interval_secs = period.as_secs(), "cleanup sweep started");

        *sweep = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // the first tick completes immediately
            interval.tick().await;

            loop {
                interval.tick().await;
                let inner = match weak.upgrade() {
                    Some(inner) => inner,
                    None => break,
                };
                let removed = Downloader { inner }.cleanup_expired().await;
                if removed > 0 {
                    info!(removed, "expired downloads cleaned up");
                }
            }
        }));
    }

    /// Stop the sweep and clear the registry
    ///
    /// Running tasks are cancelled so their workers stop at the next batch.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.inner.sweep.lock().await.take() {
            handle.abort();
        }

        let entries: Vec<Arc<TaskEntry>> = self
            .inner
            .tasks
            .write()
            .await
            .drain()
            .map(|(_, entry)| entry)
            .collect();

        for entry in entries {
            let mut task = entry.task.lock().await;
            if task.status.can_transition_to(TaskStatus::Cancelled) {
                task.status = TaskStatus::Cancelled;
            }
            task.chunks.clear();
        }
        info!("downloader shut down");
    }

    /// Check that the chunk service answers its health endpoint
    pub async fn test_connection(&self) -> bool {
        match self.inner.api.get_pdf_health().await {
            Ok(envelope) if envelope.is_success() => {
                info!("chunk service reachable");
                true
            }
            Ok(envelope) => {
                warn!(code = envelope.code, reason = %envelope.failure_message(), "chunk service unhealthy");
                false
            }
            Err(e) => {
                warn!(error = %e, "chunk service health check failed");
                false
            }
        }
    }

    /// Size and leading bytes of every chunk held for `file_id`
    pub async fn debug_chunk_data(&self, file_id: &str) -> Result<Vec<ChunkDebugInfo>> {
        let entry = self.entry(file_id).await?;
        let task = entry.task.lock().await;

        debug!(
            file_id,
            filename = %task.filename,
            total_chunks = task.total_chunks,
            downloaded_chunks = task.downloaded_chunks,
            "chunk dump"
        );

        let report = (0..task.total_chunks)
            .map(|index| {
                let chunk = task.chunks.get(&index);
                let info = ChunkDebugInfo {
                    index,
                    size: chunk.map(Vec::len),
                    header_hex: chunk
                        .filter(|data| data.len() >= DEBUG_HEADER_LEN)
                        .map(|data| hex::encode(&data[..DEBUG_HEADER_LEN])),
                };
                match &info.size {
                    Some(size) => debug!(file_id, chunk_index = index, size, header = ?info.header_hex, "chunk"),
                    None => warn!(file_id, chunk_index = index, "chunk missing"),
                }
                info
            })
            .collect();

        Ok(report)
    }
}

/// Outcome for a worker that must stop, if any
fn stop_outcome(status: TaskStatus) -> Option<DownloadOutcome> {
    match status {
        TaskStatus::Paused => Some(DownloadOutcome::Paused),
        TaskStatus::Cancelled => Some(DownloadOutcome::Cancelled),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ApiEnvelope, ChunkResponse, PdfFileInfo};
    use crate::storage::MemoryStateStore;
    use async_trait::async_trait;

    struct HealthApi {
        code: i64,
    }

    #[async_trait]
    impl ReportApi for HealthApi {
        async fn get_pdf_file_info(&self, file_id: &str) -> Result<ApiEnvelope<PdfFileInfo>> {
            Err(PdfDownloadError::metadata(file_id, "unused"))
        }

        async fn get_pdf_chunk(&self, _file_id: &str, index: usize) -> Result<ChunkResponse> {
            Err(PdfDownloadError::EmptyChunk { index })
        }

        async fn get_pdf_health(&self) -> Result<ApiEnvelope<serde_json::Value>> {
            Ok(ApiEnvelope::error(self.code, "status"))
        }
    }

    fn downloader(code: i64) -> Downloader {
        Downloader::new(
            Arc::new(HealthApi { code }),
            Arc::new(MemoryStateStore::new()),
            DownloadConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = DownloadConfig {
            file_signature: String::new(),
            ..Default::default()
        };
        let result = Downloader::new(
            Arc::new(HealthApi { code: 200 }),
            Arc::new(MemoryStateStore::new()),
            config,
        );
        assert!(matches!(result, Err(PdfDownloadError::InvalidConfiguration(_))));
    }

    #[tokio::test]
    async fn test_connection_reflects_envelope_code() {
        assert!(downloader(200).test_connection().await);
        assert!(!downloader(503).test_connection().await);
    }

    #[tokio::test]
    async fn test_unknown_task_operations() {
        let downloader = downloader(200);
        assert!(downloader.get_download_status("nope").await.is_none());
        assert!(matches!(
            downloader.pause_download("nope").await,
            Err(PdfDownloadError::TaskNotFound(_))
        ));
        assert!(matches!(
            downloader.cancel_download("nope").await,
            Err(PdfDownloadError::TaskNotFound(_))
        ));
        assert!(matches!(
            downloader.debug_chunk_data("nope").await,
            Err(PdfDownloadError::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_file_id_rejected() {
        let err = downloader(200)
            .start_download(DownloadRequest::new("  ", "x.pdf"), DownloadCallbacks::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PdfDownloadError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_cleanup_expired_by_status_and_age() {
        let downloader = downloader(200);
        let hours_ago = |h: i64| Utc::now() - chrono::Duration::hours(h);

        for (id, status, started) in [
            ("done-old", TaskStatus::Completed, hours_ago(1)),
            ("done-new", TaskStatus::Completed, Utc::now()),
            ("failed-old", TaskStatus::Failed, hours_ago(2)),
            ("failed-recent", TaskStatus::Failed, hours_ago(0)),
            ("paused-old", TaskStatus::Paused, hours_ago(5)),
        ] {
            let mut task = DownloadTask::new(&DownloadRequest::new(id, "r.pdf"));
            task.status = status;
            task.start_time = started;
            downloader.inner.tasks.write().await.insert(
                id.to_string(),
                Arc::new(TaskEntry::new(task, DownloadCallbacks::new())),
            );
        }

        assert_eq!(downloader.cleanup_expired().await, 2);
        let mut left: Vec<String> = downloader
            .list_downloads()
            .await
            .into_iter()
            .map(|s| s.id)
            .collect();
        left.sort();
        assert_eq!(left, vec!["done-new", "failed-recent", "paused-old"]);
    }

    #[tokio::test]
    async fn test_sweep_start_is_idempotent_and_shutdown_stops_it() {
        let downloader = downloader(200);
        downloader.start_cleanup_sweep().await;
        downloader.start_cleanup_sweep().await;
        assert!(downloader.inner.sweep.lock().await.is_some());

        downloader.shutdown().await;
        assert!(downloader.inner.sweep.lock().await.is_none());
        assert!(downloader.list_downloads().await.is_empty());
    }
}
