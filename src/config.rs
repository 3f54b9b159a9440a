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


//! Download configuration
//!
//! All tunables of the pipeline live in [`DownloadConfig`]. Defaults match the
//! values the report service is deployed with; a JSON file may override any
//! subset of them, and a couple of environment variables override the file.

use crate::crypto::chunk::DecryptFailurePolicy;
use crate::download::reassembler::ReassemblyPolicy;
use crate::error::{PdfDownloadError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding [`DownloadConfig::api_base_url`]
pub const ENV_API_BASE_URL: &str = "PDF_API_BASE_URL";

/// Environment variable overriding [`DownloadConfig::output_directory`]
pub const ENV_OUTPUT_DIR: &str = "PDF_OUTPUT_DIR";

/// Download configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Base URL of the report service (without the `/v1/pdf` suffix)
    pub api_base_url: String,

    /// Per-request network timeout
    pub request_timeout_secs: u64,

    /// Chunks requested concurrently in one batch
    pub max_concurrent_downloads: usize,

    /// Retries per chunk after the first attempt
    pub max_retries: u32,

    /// Fixed delay between chunk retries
    pub retry_interval_ms: u64,

    /// Decrypted bytes held per task before the memory guard evicts
    pub memory_threshold_bytes: usize,

    /// Chunks kept in memory when the guard evicts
    pub memory_keep_chunks: usize,

    /// Directory the final (and debug) files are written to
    pub output_directory: PathBuf,

    /// Magic bytes expected at the start of the reassembled file
    pub file_signature: String,

    /// What to do when the merged file fails validation
    pub reassembly_policy: ReassemblyPolicy,

    /// What to do when a chunk fails to decrypt
    pub decrypt_failure_policy: DecryptFailurePolicy,

    /// Persisted resume state older than this is ignored
    pub resume_max_age_secs: u64,

    /// Serialized resume states above this size are not written
    pub max_state_bytes: usize,

    /// Persisted states kept when the store runs out of space
    pub max_persisted_states: usize,

    /// Interval of the registry cleanup sweep
    pub cleanup_interval_secs: u64,

    /// Completed tasks are dropped from the registry after this age
    pub completed_task_ttl_secs: u64,

    /// Failed and cancelled tasks are dropped from the registry after this age
    pub stale_task_ttl_secs: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8080".to_string(),
            request_timeout_secs: 300,
            max_concurrent_downloads: 3,
            max_retries: 3,
            retry_interval_ms: 1000,
            memory_threshold_bytes: 10 * 1024 * 1024,
            memory_keep_chunks: 3,
            output_directory: PathBuf::from("."),
            file_signature: "%PDF-".to_string(),
            reassembly_policy: ReassemblyPolicy::Strict,
            decrypt_failure_policy: DecryptFailurePolicy::Fallback,
            resume_max_age_secs: 60 * 60,
            max_state_bytes: 1024 * 1024,
            max_persisted_states: 5,
            cleanup_interval_secs: 5 * 60,
            completed_task_ttl_secs: 30 * 60,
            stale_task_ttl_secs: 60 * 60,
        }
    }
}

impl DownloadConfig {
    /// Load configuration from a JSON file
    ///
    /// Missing keys fall back to their defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            PdfDownloadError::FileIoError(format!(
                "Failed to read config {}: {}",
                path.display(),
                e
            ))
        })?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `PDF_API_BASE_URL` / `PDF_OUTPUT_DIR` when set
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var(ENV_API_BASE_URL) {
            if !url.trim().is_empty() {
                self.api_base_url = url.trim().to_string();
            }
        }
        if let Ok(dir) = std::env::var(ENV_OUTPUT_DIR) {
            if !dir.trim().is_empty() {
                self.output_directory = PathBuf::from(dir.trim());
            }
        }
    }

    /// Check that the values are usable
    pub fn validate(&self) -> Result<()> {
        url::Url::parse(&self.api_base_url)?;

        if self.max_concurrent_downloads == 0 {
            return Err(PdfDownloadError::InvalidConfiguration(
                "max_concurrent_downloads must be at least 1".to_string(),
            ));
        }
        if self.file_signature.is_empty() {
            return Err(PdfDownloadError::InvalidConfiguration(
                "file_signature must not be empty".to_string(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(PdfDownloadError::InvalidConfiguration(
                "request_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn resume_max_age(&self) -> Duration {
        Duration::from_secs(self.resume_max_age_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn signature_bytes(&self) -> &[u8] {
        self.file_signature.as_bytes()
    }
}
