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


//! PdfChunk core
//!
//! Downloads PDF reports that the report service serves as individually
//! encrypted chunks: fetches metadata, pulls chunks in bounded batches with
//! retries, decrypts them, keeps memory in check, checkpoints progress for
//! resume, and writes the validated document to disk.
//!
//! ```no_run
//! use pdf_chunk_core::{DownloadConfig, DownloadRequest, Downloader, DownloadCallbacks};
//! use pdf_chunk_core::{ReportClient, SqliteStateStore};
//! use std::sync::Arc;
//!
//! # async fn run() -> pdf_chunk_core::Result<()> {
//! let config = DownloadConfig::default();
//! let api = Arc::new(ReportClient::from_config(&config)?);
//! let store = Arc::new(SqliteStateStore::new("states.db").await?);
//! let downloader = Downloader::new(api, store, config)?;
//!
//! let callbacks = DownloadCallbacks::new().on_progress(|p| println!("{}%", p));
//! downloader
//!     .start_download(DownloadRequest::new("f-123", "report.pdf"), callbacks)
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod config;
pub mod crypto;
pub mod download;
pub mod error;
pub mod file;
pub mod storage;

// Re-export commonly used types
pub use api::{ReportApi, ReportClient};
pub use config::DownloadConfig;
pub use download::{
    DownloadCallbacks, DownloadOutcome, DownloadRequest, DownloadStatus, Downloader, TaskStatus,
};
pub use error::{PdfDownloadError, Result};
pub use storage::{MemoryStateStore, SqliteStateStore, StateStore};
