//! End-to-end tests of the download pipeline
//!
//! Runs the [`Downloader`] against an in-process report service that
//! encrypts chunks the same way the real service does.

use async_trait::async_trait;
use pdf_chunk_core::api::{ApiEnvelope, ChunkResponse, PdfFileInfo};
use pdf_chunk_core::crypto::encrypt_chunk;
use pdf_chunk_core::download::resume::state_key;
use pdf_chunk_core::{
    DownloadCallbacks, DownloadConfig, DownloadOutcome, DownloadRequest, Downloader,
    MemoryStateStore, PdfDownloadError, ReportApi, Result, SqliteStateStore, StateStore,
    TaskStatus,
};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

const BASE_KEY: &str = "report-key";
const FILE_ID: &str = "rpt-2024-q3";

/// Blocks the first request for one chunk until released
struct Gate {
    index: usize,
    armed: AtomicBool,
    reached: Notify,
    release: Notify,
}

struct MockReportService {
    chunks: Vec<Vec<u8>>,
    info_code: i64,
    failing: HashSet<usize>,
    requests: Mutex<HashMap<usize, usize>>,
    gate: Option<Gate>,
}

impl MockReportService {
    fn new(chunks: Vec<Vec<u8>>) -> Self {
        Self {
            chunks,
            info_code: 200,
            failing: HashSet::new(),
            requests: Mutex::new(HashMap::new()),
            gate: None,
        }
    }

    fn failing(mut self, indices: &[usize]) -> Self {
        self.failing = indices.iter().copied().collect();
        self
    }

    fn with_info_code(mut self, code: i64) -> Self {
        self.info_code = code;
        self
    }

    fn gated_at(mut self, index: usize) -> Self {
        self.gate = Some(Gate {
            index,
            armed: AtomicBool::new(true),
            reached: Notify::new(),
            release: Notify::new(),
        });
        self
    }

    fn gate(&self) -> &Gate {
        self.gate.as_ref().unwrap()
    }

    fn requests_for(&self, index: usize) -> usize {
        self.requests.lock().unwrap().get(&index).copied().unwrap_or(0)
    }

    fn total_requests(&self) -> usize {
        self.requests.lock().unwrap().values().sum()
    }

    fn document(&self) -> Vec<u8> {
        self.chunks.concat()
    }
}

#[async_trait]
impl ReportApi for MockReportService {
    async fn get_pdf_file_info(&self, _file_id: &str) -> Result<ApiEnvelope<PdfFileInfo>> {
        if self.info_code != 200 {
            return Ok(ApiEnvelope::error(self.info_code, "file not found"));
        }
        Ok(ApiEnvelope::ok(PdfFileInfo {
            total_chunks: self.chunks.len(),
            encryption_key: BASE_KEY.to_string(),
            file_size: self.chunks.iter().map(|c| c.len() as u64).sum(),
            chunk_size: None,
        }))
    }

    async fn get_pdf_chunk(&self, _file_id: &str, chunk_index: usize) -> Result<ChunkResponse> {
        *self.requests.lock().unwrap().entry(chunk_index).or_insert(0) += 1;

        if self.failing.contains(&chunk_index) {
            return Ok(ChunkResponse {
                status: 500,
                headers: HashMap::new(),
                data: Vec::new(),
            });
        }

        if let Some(gate) = &self.gate {
            if gate.index == chunk_index && gate.armed.swap(false, Ordering::SeqCst) {
                gate.reached.notify_one();
                gate.release.notified().await;
            }
        }

        Ok(ChunkResponse::ok(encrypt_chunk(
            &self.chunks[chunk_index],
            BASE_KEY,
            chunk_index,
        )))
    }

    async fn get_pdf_health(&self) -> Result<ApiEnvelope<serde_json::Value>> {
        Ok(ApiEnvelope::ok(serde_json::json!({ "status": "UP" })))
    }
}

/// Plaintext chunks of the given sizes; chunk 0 opens with a PDF header
fn plaintext_chunks(sizes: &[usize]) -> Vec<Vec<u8>> {
    sizes
        .iter()
        .enumerate()
        .map(|(index, &size)| {
            let mut chunk: Vec<u8> = (0..size).map(|i| ((i * 31 + index * 7) % 251) as u8).collect();
            if index == 0 {
                let header = b"%PDF-1.7\n";
                chunk[..header.len()].copy_from_slice(header);
            }
            chunk
        })
        .collect()
}

fn test_config(output_dir: &Path) -> DownloadConfig {
    DownloadConfig {
        output_directory: output_dir.to_path_buf(),
        retry_interval_ms: 1,
        ..Default::default()
    }
}

#[derive(Default)]
struct Recorded {
    progress: Mutex<Vec<u8>>,
    completed: Mutex<Vec<PathBuf>>,
    errors: Mutex<Vec<String>>,
}

fn recording_callbacks() -> (DownloadCallbacks, Arc<Recorded>) {
    let recorded = Arc::new(Recorded::default());
    let (p, c, e) = (recorded.clone(), recorded.clone(), recorded.clone());
    let callbacks = DownloadCallbacks::new()
        .on_progress(move |percent| p.progress.lock().unwrap().push(percent))
        .on_complete(move |path| c.completed.lock().unwrap().push(path.to_path_buf()))
        .on_error(move |err| e.errors.lock().unwrap().push(err.to_string()));
    (callbacks, recorded)
}

fn pdf_files(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| path.to_string_lossy().ends_with(".pdf"))
        .collect()
}

fn assert_monotonic(progress: &[u8]) {
    assert!(
        progress.windows(2).all(|w| w[0] <= w[1]),
        "progress went backwards: {:?}",
        progress
    );
}

#[tokio::test]
async fn test_three_chunk_download_completes() {
    let dir = tempfile::tempdir().unwrap();
    let api = Arc::new(MockReportService::new(plaintext_chunks(&[
        1024 * 1024,
        1024 * 1024,
        512 * 1024,
    ])));
    let store = Arc::new(MemoryStateStore::new());
    let downloader = Downloader::new(api.clone(), store.clone(), test_config(dir.path())).unwrap();
    let (callbacks, recorded) = recording_callbacks();

    let outcome = downloader
        .start_download(DownloadRequest::new(FILE_ID, "quarterly.pdf"), callbacks)
        .await
        .unwrap();

    let path = match outcome {
        DownloadOutcome::Completed(path) => path,
        other => panic!("expected completion, got {:?}", other),
    };
    assert!(path.to_string_lossy().ends_with("_quarterly.pdf"));

    let saved = std::fs::read(&path).unwrap();
    assert!(saved.starts_with(b"%PDF-"));
    assert_eq!(saved, api.document());

    assert_eq!(*recorded.progress.lock().unwrap(), vec![33, 67, 100]);
    assert_eq!(*recorded.completed.lock().unwrap(), vec![path.clone()]);
    assert!(recorded.errors.lock().unwrap().is_empty());

    let status = downloader.get_download_status(FILE_ID).await.unwrap();
    assert_eq!(status.status, TaskStatus::Completed);
    assert_eq!(status.progress, 100);
    assert_eq!(status.downloaded_chunks, 3);
    assert_eq!(status.file_path, Some(path));

    // checkpoint removed once the document is saved
    assert!(store.get(&state_key(FILE_ID)).await.unwrap().is_none());
    assert_eq!(api.total_requests(), 3);
}

#[tokio::test]
async fn test_progress_is_monotonic_across_batches() {
    let dir = tempfile::tempdir().unwrap();
    let api = Arc::new(MockReportService::new(plaintext_chunks(&[4096; 7])));
    let config = DownloadConfig {
        max_concurrent_downloads: 2,
        ..test_config(dir.path())
    };
    let downloader = Downloader::new(api, Arc::new(MemoryStateStore::new()), config).unwrap();
    let (callbacks, recorded) = recording_callbacks();

    downloader
        .start_download(DownloadRequest::new(FILE_ID, "r.pdf"), callbacks)
        .await
        .unwrap();

    let progress = recorded.progress.lock().unwrap().clone();
    assert_eq!(progress.len(), 7);
    assert_monotonic(&progress);
    assert_eq!(progress.last(), Some(&100));
}

#[tokio::test]
async fn test_persistent_chunk_failures_fail_the_task() {
    let dir = tempfile::tempdir().unwrap();
    let api = Arc::new(MockReportService::new(plaintext_chunks(&[2048; 3])).failing(&[1, 2]));
    let downloader = Downloader::new(
        api.clone(),
        Arc::new(MemoryStateStore::new()),
        test_config(dir.path()),
    )
    .unwrap();
    let (callbacks, recorded) = recording_callbacks();

    let err = downloader
        .start_download(DownloadRequest::new(FILE_ID, "r.pdf"), callbacks)
        .await
        .unwrap_err();

    match err {
        PdfDownloadError::ChunkDownload { index, attempts, .. } => {
            assert_eq!(index, 1);
            assert_eq!(attempts, 4);
        }
        other => panic!("expected ChunkDownload, got {:?}", other),
    }
    assert_eq!(api.requests_for(1), 4);
    assert_eq!(api.requests_for(2), 4);

    assert_eq!(recorded.errors.lock().unwrap().len(), 1);
    assert!(recorded.completed.lock().unwrap().is_empty());
    assert!(pdf_files(dir.path()).is_empty());

    let status = downloader.get_download_status(FILE_ID).await.unwrap();
    assert_eq!(status.status, TaskStatus::Failed);
    assert!(status.error.is_some());

    // a failed task may be started again
    let retry = downloader
        .start_download(DownloadRequest::new(FILE_ID, "r.pdf"), DownloadCallbacks::new())
        .await;
    assert!(matches!(retry, Err(PdfDownloadError::ChunkDownload { .. })));
}

#[tokio::test]
async fn test_invalid_document_fails_with_debug_dump() {
    let dir = tempfile::tempdir().unwrap();
    let api = Arc::new(MockReportService::new(vec![vec![0x11; 700], vec![0x22; 300]]));
    let store = Arc::new(MemoryStateStore::new());
    let downloader = Downloader::new(api.clone(), store.clone(), test_config(dir.path())).unwrap();
    let (callbacks, recorded) = recording_callbacks();

    let err = downloader
        .start_download(DownloadRequest::new(FILE_ID, "broken.pdf"), callbacks)
        .await
        .unwrap_err();

    let debug_path = match err {
        PdfDownloadError::Reassembly { debug_path, .. } => debug_path.unwrap(),
        other => panic!("expected Reassembly, got {:?}", other),
    };
    assert!(debug_path.to_string_lossy().ends_with("_broken.pdf.debug"));
    assert_eq!(std::fs::read(&debug_path).unwrap(), api.document());
    assert!(pdf_files(dir.path()).is_empty());

    assert_eq!(recorded.errors.lock().unwrap().len(), 1);
    assert!(recorded.completed.lock().unwrap().is_empty());
    assert_eq!(
        downloader.get_download_status(FILE_ID).await.unwrap().status,
        TaskStatus::Failed
    );

    // the checkpoint written after the batch is dropped with the bad data
    assert!(store.get(&state_key(FILE_ID)).await.unwrap().is_none());
}

#[tokio::test]
async fn test_transfer_failure_keeps_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let api = Arc::new(MockReportService::new(plaintext_chunks(&[256; 4])).failing(&[3]));
    let store = Arc::new(MemoryStateStore::new());
    let config = DownloadConfig {
        max_concurrent_downloads: 2,
        ..test_config(dir.path())
    };
    let downloader = Downloader::new(api, store.clone(), config).unwrap();

    let err = downloader
        .start_download(DownloadRequest::new(FILE_ID, "r.pdf"), DownloadCallbacks::new())
        .await
        .unwrap_err();
    assert!(!err.is_data_integrity_error());
    assert!(store.get(&state_key(FILE_ID)).await.unwrap().is_some());
}

#[tokio::test]
async fn test_metadata_failure_reports_once() {
    let dir = tempfile::tempdir().unwrap();
    let api = Arc::new(MockReportService::new(plaintext_chunks(&[64])).with_info_code(404));
    let downloader = Downloader::new(
        api.clone(),
        Arc::new(MemoryStateStore::new()),
        test_config(dir.path()),
    )
    .unwrap();
    let (callbacks, recorded) = recording_callbacks();

    let err = downloader
        .start_download(DownloadRequest::new(FILE_ID, "r.pdf"), callbacks)
        .await
        .unwrap_err();

    assert!(matches!(err, PdfDownloadError::Metadata { .. }));
    assert_eq!(recorded.errors.lock().unwrap().len(), 1);
    assert_eq!(api.total_requests(), 0);
    assert_eq!(
        downloader.get_download_status(FILE_ID).await.unwrap().status,
        TaskStatus::Failed
    );
}

#[tokio::test]
async fn test_cancel_discards_late_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let api = Arc::new(MockReportService::new(plaintext_chunks(&[1024; 3])).gated_at(1));
    let store = Arc::new(MemoryStateStore::new());
    let config = DownloadConfig {
        max_concurrent_downloads: 1,
        ..test_config(dir.path())
    };
    let downloader = Downloader::new(api.clone(), store.clone(), config).unwrap();
    let (callbacks, recorded) = recording_callbacks();

    let worker = {
        let downloader = downloader.clone();
        tokio::spawn(async move {
            downloader
                .start_download(DownloadRequest::new(FILE_ID, "r.pdf"), callbacks)
                .await
        })
    };

    api.gate().reached.notified().await;
    downloader.cancel_download(FILE_ID).await.unwrap();
    api.gate().release.notify_one();

    let outcome = worker.await.unwrap().unwrap();
    assert_eq!(outcome, DownloadOutcome::Cancelled);

    let status = downloader.get_download_status(FILE_ID).await.unwrap();
    assert_eq!(status.status, TaskStatus::Cancelled);
    // chunk 1 arrived after the cancel and was dropped
    assert_eq!(status.downloaded_chunks, 1);
    assert_eq!(api.requests_for(2), 0);

    assert!(recorded.completed.lock().unwrap().is_empty());
    assert!(recorded.errors.lock().unwrap().is_empty());
    assert!(pdf_files(dir.path()).is_empty());
    assert!(store.get(&state_key(FILE_ID)).await.unwrap().is_none());

    let chunks = downloader.debug_chunk_data(FILE_ID).await.unwrap();
    assert!(chunks.iter().all(|c| c.size.is_none()));
}

#[tokio::test]
async fn test_pause_and_resume() {
    let dir = tempfile::tempdir().unwrap();
    let api = Arc::new(MockReportService::new(plaintext_chunks(&[1024; 3])).gated_at(1));
    let config = DownloadConfig {
        max_concurrent_downloads: 1,
        ..test_config(dir.path())
    };
    let downloader = Downloader::new(api.clone(), Arc::new(MemoryStateStore::new()), config).unwrap();
    let (callbacks, recorded) = recording_callbacks();

    let worker = {
        let downloader = downloader.clone();
        tokio::spawn(async move {
            downloader
                .start_download(DownloadRequest::new(FILE_ID, "r.pdf"), callbacks)
                .await
        })
    };

    api.gate().reached.notified().await;
    downloader.pause_download(FILE_ID).await.unwrap();
    api.gate().release.notify_one();

    assert_eq!(worker.await.unwrap().unwrap(), DownloadOutcome::Paused);

    let status = downloader.get_download_status(FILE_ID).await.unwrap();
    assert_eq!(status.status, TaskStatus::Paused);
    assert_eq!(status.progress, 67);

    let checkpoint = downloader
        .resume_manager()
        .load_state(FILE_ID)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(checkpoint.chunk_indices, vec![0, 1]);
    assert_eq!(checkpoint.total_chunks, 3);

    let chunks = downloader.debug_chunk_data(FILE_ID).await.unwrap();
    assert_eq!(chunks[0].header_hex.as_deref(), Some("255044462d312e37"));
    assert_eq!(chunks[1].size, Some(1024));
    assert_eq!(chunks[2].size, None);

    let outcome = downloader.resume_download(FILE_ID).await.unwrap();
    let path = match outcome {
        DownloadOutcome::Completed(path) => path,
        other => panic!("expected completion, got {:?}", other),
    };
    assert_eq!(std::fs::read(path).unwrap(), api.document());

    // chunks held in memory are not fetched again
    assert_eq!(api.total_requests(), 3);
    assert_eq!(*recorded.progress.lock().unwrap(), vec![33, 67, 100]);
    assert_eq!(recorded.completed.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_second_start_rejected_while_running() {
    let dir = tempfile::tempdir().unwrap();
    let api = Arc::new(MockReportService::new(plaintext_chunks(&[512; 2])).gated_at(0));
    let downloader = Downloader::new(
        api.clone(),
        Arc::new(MemoryStateStore::new()),
        test_config(dir.path()),
    )
    .unwrap();

    let worker = {
        let downloader = downloader.clone();
        tokio::spawn(async move {
            downloader
                .start_download(DownloadRequest::new(FILE_ID, "r.pdf"), DownloadCallbacks::new())
                .await
        })
    };

    api.gate().reached.notified().await;
    let (callbacks, recorded) = recording_callbacks();
    let second = downloader
        .start_download(DownloadRequest::new(FILE_ID, "r.pdf"), callbacks)
        .await;
    assert!(matches!(second, Err(PdfDownloadError::InvalidState(_))));
    assert!(recorded.errors.lock().unwrap().is_empty());

    api.gate().release.notify_one();
    assert!(matches!(
        worker.await.unwrap().unwrap(),
        DownloadOutcome::Completed(_)
    ));
}

#[tokio::test]
async fn test_evicted_chunks_are_refetched_before_merge() {
    let dir = tempfile::tempdir().unwrap();
    let api = Arc::new(MockReportService::new(plaintext_chunks(&[1000; 6])));
    let config = DownloadConfig {
        max_concurrent_downloads: 2,
        memory_threshold_bytes: 1500,
        memory_keep_chunks: 1,
        ..test_config(dir.path())
    };
    let downloader = Downloader::new(api.clone(), Arc::new(MemoryStateStore::new()), config).unwrap();
    let (callbacks, recorded) = recording_callbacks();

    let outcome = downloader
        .start_download(DownloadRequest::new(FILE_ID, "r.pdf"), callbacks)
        .await
        .unwrap();

    let path = match outcome {
        DownloadOutcome::Completed(path) => path,
        other => panic!("expected completion, got {:?}", other),
    };
    assert_eq!(std::fs::read(path).unwrap(), api.document());

    // everything but the last chunk was evicted once
    assert_eq!(api.requests_for(0), 2);
    assert_eq!(api.requests_for(5), 1);
    assert_eq!(api.total_requests(), 11);

    let progress = recorded.progress.lock().unwrap().clone();
    assert_monotonic(&progress);
    assert_eq!(progress.last(), Some(&100));
}

#[tokio::test]
async fn test_resume_after_restart_with_sqlite_store() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteStateStore::new_in_memory().await.unwrap());
    let config = DownloadConfig {
        max_concurrent_downloads: 1,
        ..test_config(dir.path())
    };

    let first_api = Arc::new(MockReportService::new(plaintext_chunks(&[800; 3])).gated_at(1));
    let first = Downloader::new(first_api.clone(), store.clone(), config.clone()).unwrap();
    let worker = {
        let first = first.clone();
        tokio::spawn(async move {
            first
                .start_download(DownloadRequest::new(FILE_ID, "r.pdf"), DownloadCallbacks::new())
                .await
        })
    };
    first_api.gate().reached.notified().await;
    first.pause_download(FILE_ID).await.unwrap();
    first_api.gate().release.notify_one();
    assert_eq!(worker.await.unwrap().unwrap(), DownloadOutcome::Paused);
    first.shutdown().await;

    assert!(store.get(&state_key(FILE_ID)).await.unwrap().is_some());

    let second_api = Arc::new(MockReportService::new(plaintext_chunks(&[800; 3])));
    let second = Downloader::new(second_api.clone(), store.clone(), config).unwrap();
    let (callbacks, recorded) = recording_callbacks();

    let outcome = second
        .start_download(DownloadRequest::new(FILE_ID, "r.pdf"), callbacks)
        .await
        .unwrap();
    assert!(matches!(outcome, DownloadOutcome::Completed(_)));

    let progress = recorded.progress.lock().unwrap().clone();
    assert_eq!(progress.first(), Some(&67));
    assert_eq!(progress.last(), Some(&100));
    assert_monotonic(&progress);

    // only indices were restored, so every chunk is fetched again
    assert_eq!(second_api.total_requests(), 3);
    assert!(store.get(&state_key(FILE_ID)).await.unwrap().is_none());
}

#[tokio::test]
async fn test_connection_check() {
    let dir = tempfile::tempdir().unwrap();
    let downloader = Downloader::new(
        Arc::new(MockReportService::new(Vec::new())),
        Arc::new(MemoryStateStore::new()),
        test_config(dir.path()),
    )
    .unwrap();
    assert!(downloader.test_connection().await);
}
