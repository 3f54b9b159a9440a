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


//! Chunk reassembly, validation and repair
//!
//! # Algorithm
//! 1. Require every index `0..total_chunks` and concatenate in index order
//! 2. Validate that the buffer starts with the expected signature
//! 3. If not, look for the first occurrence of the signature and drop the
//!    bytes in front of it
//! 4. Save the result, or apply the [`ReassemblyPolicy`] if it is still invalid

use crate::error::{PdfDownloadError, Result};
use crate::file::output::OutputWriter;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

/// Bytes of the merged buffer shown in debug logs
const HEADER_DUMP_LEN: usize = 16;

/// What to do with a merged buffer that fails validation after repair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReassemblyPolicy {
    /// Keep the raw buffer as a `.debug` file and fail the download
    #[default]
    Strict,
    /// Save the unvalidated buffer as the document and warn
    Lenient,
}

/// A document written to disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedDocument {
    pub path: PathBuf,
    pub bytes: usize,

    /// Offset the signature was found at when the buffer needed repair
    pub repaired_offset: Option<usize>,

    /// False only when the lenient policy saved an invalid buffer
    pub validated: bool,
}

/// Concatenate all chunks in index order
///
/// # Errors
/// `MissingChunks` naming every absent index in `0..total_chunks`.
pub fn merge_chunks(
    file_id: &str,
    chunks: &BTreeMap<usize, Vec<u8>>,
    total_chunks: usize,
) -> Result<Vec<u8>> {
    let missing: Vec<usize> = (0..total_chunks)
        .filter(|index| !chunks.contains_key(index))
        .collect();
    if !missing.is_empty() {
        return Err(PdfDownloadError::MissingChunks {
            file_id: file_id.to_string(),
            missing,
        });
    }

    let total_size: usize = (0..total_chunks)
        .filter_map(|index| chunks.get(&index))
        .map(Vec::len)
        .sum();

    let mut merged = Vec::with_capacity(total_size);
    for index in 0..total_chunks {
        if let Some(chunk) = chunks.get(&index) {
            merged.extend_from_slice(chunk);
        }
    }

    debug!(file_id, total_chunks, bytes = merged.len(), "chunks merged");
    Ok(merged)
}

pub fn validate_signature(data: &[u8], signature: &[u8]) -> bool {
    !signature.is_empty() && data.starts_with(signature)
}

/// Offset of the first occurrence of `signature`
pub fn find_signature(data: &[u8], signature: &[u8]) -> Option<usize> {
    if signature.is_empty() || data.len() < signature.len() {
        return None;
    }
    data.windows(signature.len()).position(|window| window == signature)
}

/// Drop the bytes in front of the first signature
///
/// Returns the repaired buffer and the offset it was cut at, or `None` when
/// no signature exists.
pub fn repair(data: &[u8], signature: &[u8]) -> Option<(Vec<u8>, usize)> {
    let offset = find_signature(data, signature)?;
    let repaired = data[offset..].to_vec();
    if validate_signature(&repaired, signature) {
        Some((repaired, offset))
    } else {
        None
    }
}

/// Merges, validates and saves a task's chunks
#[derive(Debug, Clone)]
pub struct Reassembler {
    policy: ReassemblyPolicy,
    signature: Vec<u8>,
    writer: OutputWriter,
}

impl Reassembler {
    pub fn new(policy: ReassemblyPolicy, signature: &[u8], writer: OutputWriter) -> Self {
        Self {
            policy,
            signature: signature.to_vec(),
            writer,
        }
    }

    pub fn policy(&self) -> ReassemblyPolicy {
        self.policy
    }

    pub fn writer(&self) -> &OutputWriter {
        &self.writer
    }

    /// Merge `chunks` and save the document for `filename`
    ///
    /// # Errors
    /// - `MissingChunks` if any index is absent
    /// - `Reassembly` if validation and repair fail under the strict policy
    /// - `FileIoError` if the output cannot be written
    pub async fn reassemble(
        &self,
        file_id: &str,
        filename: &str,
        chunks: &BTreeMap<usize, Vec<u8>>,
        total_chunks: usize,
    ) -> Result<SavedDocument> {
        let merged = merge_chunks(file_id, chunks, total_chunks)?;
        debug!(
            file_id,
            header = %hex::encode(&merged[..merged.len().min(HEADER_DUMP_LEN)]),
            "merged header"
        );

        if validate_signature(&merged, &self.signature) {
            return self.save(filename, &merged, None, true).await;
        }

        warn!(file_id, "signature check failed, attempting repair");
        if let Some((repaired, offset)) = repair(&merged, &self.signature) {
            info!(file_id, offset, "signature found, leading bytes dropped");
            return self.save(filename, &repaired, Some(offset), true).await;
        }

        match self.policy {
            ReassemblyPolicy::Lenient => {
                warn!(file_id, "saving document without a valid signature");
                self.save(filename, &merged, None, false).await
            }
            ReassemblyPolicy::Strict => {
                let debug_path = match self.writer.write_debug(filename, &merged).await {
                    Ok(path) => Some(path),
                    Err(e) => {
                        warn!(file_id, error = %e, "could not save debug buffer");
                        None
                    }
                };
                error!(file_id, debug_path = ?debug_path, "merged data is not a valid document");
                Err(PdfDownloadError::Reassembly {
                    file_id: file_id.to_string(),
                    debug_path,
                })
            }
        }
    }

    async fn save(
        &self,
        filename: &str,
        data: &[u8],
        repaired_offset: Option<usize>,
        validated: bool,
    ) -> Result<SavedDocument> {
        let path = self.writer.write_final(filename, data).await?;
        Ok(SavedDocument {
            path,
            bytes: data.len(),
            repaired_offset,
            validated,
        })
    }
}
