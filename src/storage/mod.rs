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


//! Durable key/value storage for resume state
//!
//! # Architecture
//! - [`StateStore`]: async key/value trait the resume manager writes through
//! - [`SqliteStateStore`]: SQLite-backed store (WAL, runtime migrations)
//! - [`MemoryStateStore`]: process-local store for tests and ephemeral hosts
//!
//! Both stores accept an optional byte quota. Exceeding it yields
//! [`PdfDownloadError::StorageQuotaExceeded`](crate::error::PdfDownloadError::StorageQuotaExceeded),
//! which the resume manager recovers from by evicting old states.

pub mod database;
pub mod memory;
pub mod migrations;

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// Re-export commonly used types
pub use database::SqliteStateStore;
pub use memory::MemoryStateStore;

/// Async key/value store holding serialized resume states
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Read the value stored under `key`
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Insert or replace the value stored under `key`
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove `key`; removing an absent key is not an error
    async fn remove(&self, key: &str) -> Result<()>;

    /// All keys currently stored
    async fn keys(&self) -> Result<Vec<String>>;
}

/// Resume checkpoint of one download
///
/// Holds progress metadata only, never chunk bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedDownloadState {
    pub downloaded_chunks: usize,
    pub total_chunks: usize,
    pub progress: u8,

    /// Save time in milliseconds since the Unix epoch
    pub timestamp: i64,

    /// Indices of chunks that were complete at save time
    #[serde(default)]
    pub chunk_indices: Vec<usize>,
}

impl PersistedDownloadState {
    /// Age of the checkpoint relative to `now_ms`
    pub fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms.saturating_sub(self.timestamp)
    }
}
