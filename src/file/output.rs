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


//! Output file writer
//!
//! # Naming
//! - Final file: `{timestamp_ms}_{sanitized name}.pdf`, with the `.pdf`
//!   extension normalised (never doubled) and ` (n)` appended on collision
//! - Debug dump: `{timestamp_ms}_{sanitized stem}.pdf.debug`
//!
//! # Atomicity
//! Data is written to `{target}.part` first and renamed into place, so a
//! crash never leaves a truncated file under the final name.

use crate::error::{PdfDownloadError, Result};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Extension of the final document
pub const PDF_EXTENSION: &str = "pdf";

/// Suffix of the raw merged buffer kept after a failed validation
pub const DEBUG_SUFFIX: &str = "debug";

/// Suffix of in-progress writes
const PART_SUFFIX: &str = "part";

/// Highest ` (n)` suffix tried before giving up
const MAX_COLLISION_SUFFIX: u32 = 9999;

/// Maximum filename length in bytes (common filesystem limit)
const MAX_FILENAME_BYTES: usize = 200;

/// Writes final and debug files into one output directory
#[derive(Debug, Clone)]
pub struct OutputWriter {
    output_dir: PathBuf,
}

impl OutputWriter {
    pub fn new<P: Into<PathBuf>>(output_dir: P) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Write the validated document and return its path
    pub async fn write_final(&self, filename: &str, data: &[u8]) -> Result<PathBuf> {
        self.ensure_output_dir().await?;

        let name = final_file_name(filename, timestamp_ms());
        let path = avoid_collision(&self.output_dir.join(name))?;
        write_atomic(&path, data).await?;

        info!(path = %path.display(), bytes = data.len(), "document saved");
        Ok(path)
    }

    /// Write the raw merged buffer for post-mortem inspection
    pub async fn write_debug(&self, filename: &str, data: &[u8]) -> Result<PathBuf> {
        self.ensure_output_dir().await?;

        let name = debug_file_name(filename, timestamp_ms());
        let path = avoid_collision(&self.output_dir.join(name))?;
        write_atomic(&path, data).await?;

        debug!(path = %path.display(), bytes = data.len(), "debug buffer saved");
        Ok(path)
    }

    async fn ensure_output_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.output_dir).await.map_err(|e| {
            PdfDownloadError::FileIoError(format!(
                "Failed to create output directory {}: {}",
                self.output_dir.display(),
                e
            ))
        })
    }
}

fn timestamp_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Name of the final file for `filename` saved at `timestamp_ms`
pub fn final_file_name(filename: &str, timestamp_ms: i64) -> String {
    format!("{}_{}.{}", timestamp_ms, document_stem(filename), PDF_EXTENSION)
}

/// Name of the debug dump for `filename` saved at `timestamp_ms`
pub fn debug_file_name(filename: &str, timestamp_ms: i64) -> String {
    format!(
        "{}_{}.{}.{}",
        timestamp_ms,
        document_stem(filename),
        PDF_EXTENSION,
        DEBUG_SUFFIX
    )
}

/// Sanitized filename without a trailing `.pdf`
fn document_stem(filename: &str) -> String {
    let sanitized = sanitize_filename(filename);
    let split = sanitized.len().saturating_sub(4);
    let has_pdf_suffix = sanitized
        .get(split..)
        .map_or(false, |tail| tail.eq_ignore_ascii_case(".pdf"));
    let stem = if has_pdf_suffix {
        sanitized[..split].trim_end_matches('.').to_string()
    } else {
        sanitized
    };

    if stem.is_empty() {
        "document".to_string()
    } else {
        truncate_component(&stem, MAX_FILENAME_BYTES)
    }
}

/// Replace characters that are invalid in filenames on common platforms
pub fn sanitize_filename(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    let trimmed = replaced.trim().trim_matches('.').trim();
    if trimmed.is_empty() {
        "document".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Truncate to at most `max_bytes` on a UTF-8 boundary
fn truncate_component(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }

    let mut index = max_bytes;
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    text[..index].to_string()
}

/// Avoid filename collision by appending (1), (2), etc.
///
/// # Errors
/// `FileIoError` if every suffix up to ` (9999)` is taken.
pub fn avoid_collision(path: &Path) -> Result<PathBuf> {
    avoid_collision_within(path, MAX_COLLISION_SUFFIX)
}

fn avoid_collision_within(path: &Path, max_suffix: u32) -> Result<PathBuf> {
    if !path.exists() {
        return Ok(path.to_path_buf());
    }

    let parent = path.parent().unwrap_or_else(|| Path::new(""));
    let file_name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("document");

    // keep `.pdf.debug` together
    let compound = format!(".{}.{}", PDF_EXTENSION, DEBUG_SUFFIX);
    let split_at = if file_name.ends_with(&compound) {
        Some(file_name.len() - compound.len())
    } else {
        file_name.rfind('.')
    };
    let (stem, extension) = match split_at {
        Some(dot) => (&file_name[..dot], &file_name[dot..]),
        None => (file_name, ""),
    };

    for counter in 1..=max_suffix {
        let candidate = parent.join(format!("{} ({}){}", stem, counter, extension));
        if !candidate.exists() {
            return Ok(candidate);
        }
    }

    Err(PdfDownloadError::FileIoError(format!(
        "No free file name for {} after {} attempts",
        path.display(),
        max_suffix
    )))
}

/// Write `data` to `{path}.part` and rename it to `path`
async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let mut part_name = path.as_os_str().to_os_string();
    part_name.push(".");
    part_name.push(PART_SUFFIX);
    let part_path = PathBuf::from(part_name);

    fs::write(&part_path, data).await.map_err(|e| {
        PdfDownloadError::FileIoError(format!(
            "Failed to write {}: {}",
            part_path.display(),
            e
        ))
    })?;

    if let Err(e) = fs::rename(&part_path, path).await {
        let _ = fs::remove_file(&part_path).await;
        return Err(PdfDownloadError::FileIoError(format!(
            "Move failed: {} -> {}: {}",
            part_path.display(),
            path.display(),
            e
        )));
    }

    Ok(())
}
