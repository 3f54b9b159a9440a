//! Error types for the PDF chunk download core
//!
//! This module defines error types using thiserror for ergonomic error handling.
//! Errors are grouped by pipeline stage (metadata, chunk transfer, decryption,
//! reassembly, resume storage) so callers can decide what is fatal and what is
//! worth retrying.
//!
//! ## Propagation policy
//!
//! - Transient network failures are retried inside the fetcher and only
//!   surface as `ChunkDownload` once the retry budget is spent.
//! - Data-integrity failures (`MissingChunks`, `Reassembly`) are always fatal
//!   and reported; a corrupt file is never returned silently.
//! - `StorageQuotaExceeded` is recovered by the resume manager and never
//!   reaches the UI callbacks.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using our PdfDownloadError type
pub type Result<T> = std::result::Result<T, PdfDownloadError>;

/// Main error type for the download pipeline
#[derive(Error, Debug)]
pub enum PdfDownloadError {
    // ===== Metadata Errors =====

    /// The metadata endpoint did not report success; the task never starts
    #[error("Failed to fetch file info for '{file_id}': {message}")]
    Metadata {
        file_id: String,
        message: String,
    },

    // ===== Chunk Transfer Errors =====

    /// A chunk could not be fetched after exhausting all retries
    #[error("Chunk {index} of '{file_id}' failed after {attempts} attempts: {message}")]
    ChunkDownload {
        file_id: String,
        index: usize,
        /// Total attempts made, including the first one
        attempts: u32,
        message: String,
    },

    /// Server returned a chunk without any payload
    #[error("Empty payload for chunk {index}")]
    EmptyChunk {
        index: usize,
    },

    /// Network connectivity error
    #[error("Network error: {message}")]
    NetworkError {
        message: String,
        /// Whether this error might be transient
        is_transient: bool,
    },

    /// Server returned unexpected status code
    #[error("Server responded with unexpected status code {status_code} for {endpoint}")]
    UnexpectedStatusCode {
        status_code: u16,
        endpoint: String,
    },

    /// Response body did not match the expected envelope
    #[error("Invalid API response: {0}")]
    InvalidApiResponse(String),

    // ===== Crypto Errors =====

    /// Chunk decryption failed (only raised under the strict failure policy)
    #[error("Decryption of chunk {index} failed: {message}")]
    DecryptionFailed {
        index: usize,
        message: String,
    },

    // ===== Reassembly Errors =====

    /// Merge was attempted while chunks are absent
    #[error("Missing chunks for '{file_id}': {missing:?}")]
    MissingChunks {
        file_id: String,
        missing: Vec<usize>,
    },

    /// Merged data failed signature validation and could not be repaired
    #[error("Reassembled file for '{file_id}' is not a valid document")]
    Reassembly {
        file_id: String,
        /// Raw merged buffer saved for post-mortem, if the write succeeded
        debug_path: Option<PathBuf>,
    },

    // ===== Storage Errors =====

    /// The resume state store is out of space
    #[error("Storage quota exceeded while writing '{key}'")]
    StorageQuotaExceeded {
        key: String,
    },

    /// Generic file I/O error
    #[error("File I/O error: {0}")]
    FileIoError(String),

    // ===== Task/State Errors =====

    /// No task with the given file id is registered
    #[error("Download task not found: {0}")]
    TaskNotFound(String),

    /// Requested operation is not valid in the task's current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Configuration is invalid or incomplete
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    // ===== External Library Errors =====

    /// HTTP client error from reqwest
    #[error("HTTP client error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON serialization error: {0}")]
    SerdeJsonError(#[from] serde_json::Error),

    /// Database driver error from sqlx
    #[error("Database error: {0}")]
    SqlxError(#[from] sqlx::Error),

    /// Standard I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<url::ParseError> for PdfDownloadError {
    fn from(err: url::ParseError) -> Self {
        PdfDownloadError::InvalidConfiguration(format!("Invalid URL: {}", err))
    }
}

// Helper methods for creating common errors
impl PdfDownloadError {
    /// Create a Metadata error
    pub fn metadata<S: Into<String>>(file_id: &str, message: S) -> Self {
        PdfDownloadError::Metadata {
            file_id: file_id.to_string(),
            message: message.into(),
        }
    }

    /// Create a NetworkError
    pub fn network_error<S: Into<String>>(message: S, is_transient: bool) -> Self {
        PdfDownloadError::NetworkError {
            message: message.into(),
            is_transient,
        }
    }

    /// Create an InvalidState error
    pub fn invalid_state<S: Into<String>>(message: S) -> Self {
        PdfDownloadError::InvalidState(message.into())
    }

    /// Check if error is retryable at the chunk level
    ///
    /// Returns `true` for transient errors that might succeed on retry:
    /// - Network errors marked as transient and raw transport errors
    /// - Unexpected status codes (the chunk service answers 5xx under load)
    /// - Empty payloads
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PdfDownloadError::NetworkError { is_transient: true, .. }
                | PdfDownloadError::ReqwestError(_)
                | PdfDownloadError::UnexpectedStatusCode { .. }
                | PdfDownloadError::EmptyChunk { .. }
        )
    }

    /// Check if error means the downloaded data itself is unusable
    pub fn is_data_integrity_error(&self) -> bool {
        matches!(
            self,
            PdfDownloadError::MissingChunks { .. }
                | PdfDownloadError::Reassembly { .. }
                | PdfDownloadError::DecryptionFailed { .. }
        )
    }

    /// Get user-friendly error message suitable for display
    pub fn user_message(&self) -> String {
        match self {
            PdfDownloadError::Metadata { message, .. } => {
                format!("Could not load file information: {}", message)
            }
            PdfDownloadError::ChunkDownload { .. } => {
                "Download failed. Please check your network connection and try again.".to_string()
            }
            PdfDownloadError::MissingChunks { missing, .. } => {
                format!("Download incomplete: {} part(s) missing. Please try again.", missing.len())
            }
            PdfDownloadError::Reassembly { .. } => {
                "The downloaded file is damaged and cannot be opened.".to_string()
            }
            _ => self.to_string(),
        }
    }
}
