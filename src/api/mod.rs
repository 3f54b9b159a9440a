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


//! Report service API
//!
//! The download pipeline only talks to the report service through the
//! [`ReportApi`] trait, so the HTTP client can be swapped for an in-process
//! implementation in tests or embedding hosts.
//!
//! # Endpoints
//! - `GET /v1/pdf/info/{fileId}` - chunk count, base key, file size
//! - `GET /v1/pdf/chunk/{fileId}/{chunkIndex}` - raw encrypted chunk bytes
//! - `GET /v1/pdf/health` - liveness of the chunk service

pub mod client;

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// Re-export commonly used types
pub use client::ReportClient;

/// Success code used by the report service envelope
pub const SUCCESS_CODE: i64 = 200;

/// Generic `{code, message, data}` response envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEnvelope<T> {
    pub code: i64,

    #[serde(default)]
    pub message: Option<String>,

    #[serde(default = "Option::default")]
    pub data: Option<T>,
}

impl<T> ApiEnvelope<T> {
    /// Build a successful envelope
    pub fn ok(data: T) -> Self {
        Self {
            code: SUCCESS_CODE,
            message: Some("success".to_string()),
            data: Some(data),
        }
    }

    /// Build a failed envelope
    pub fn error<S: Into<String>>(code: i64, message: S) -> Self {
        Self {
            code,
            message: Some(message.into()),
            data: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == SUCCESS_CODE
    }

    /// Message to show when the call did not succeed
    pub fn failure_message(&self) -> String {
        self.message
            .clone()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| format!("service returned code {}", self.code))
    }
}

/// Metadata of a chunked PDF
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PdfFileInfo {
    /// Number of chunks the file is split into
    pub total_chunks: usize,

    /// Base key material for per-chunk key derivation
    pub encryption_key: String,

    /// Size of the original file in bytes
    pub file_size: u64,

    /// Nominal chunk size, when reported
    #[serde(default)]
    pub chunk_size: Option<u64>,
}

/// Raw chunk payload with response metadata
#[derive(Debug, Clone)]
pub struct ChunkResponse {
    /// HTTP status code
    pub status: u16,

    /// Response headers (lower-cased names)
    pub headers: HashMap<String, String>,

    /// Encrypted chunk bytes
    pub data: Vec<u8>,
}

impl ChunkResponse {
    /// A 200 response carrying `data`
    pub fn ok(data: Vec<u8>) -> Self {
        Self {
            status: 200,
            headers: HashMap::new(),
            data,
        }
    }
}

/// Remote report service consumed by the downloader
#[async_trait]
pub trait ReportApi: Send + Sync {
    /// Fetch file metadata
    async fn get_pdf_file_info(&self, file_id: &str) -> Result<ApiEnvelope<PdfFileInfo>>;

    /// Fetch one encrypted chunk
    async fn get_pdf_chunk(&self, file_id: &str, chunk_index: usize) -> Result<ChunkResponse>;

    /// Liveness check of the chunk service
    async fn get_pdf_health(&self) -> Result<ApiEnvelope<serde_json::Value>>;
}
