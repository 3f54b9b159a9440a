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


//! Chunked download pipeline
//!
//! # Modules
//! - [`task`]: task state machine and status snapshots
//! - [`fetcher`]: metadata and per-chunk fetch with retry and decryption
//! - [`memory`]: eviction of chunks above the memory threshold
//! - [`resume`]: checkpoints in the state store
//! - [`reassembler`]: merge, signature validation and repair
//! - [`manager`]: the [`Downloader`] driving all of the above

pub mod fetcher;
pub mod manager;
pub mod memory;
pub mod progress;
pub mod reassembler;
pub mod resume;
pub mod task;

// Re-export commonly used types
pub use fetcher::ChunkFetcher;
pub use manager::{ChunkDebugInfo, DownloadOutcome, Downloader};
pub use memory::MemoryGuard;
pub use progress::DownloadCallbacks;
pub use reassembler::{Reassembler, ReassemblyPolicy};
pub use resume::{ResumeManager, SaveOutcome};
pub use task::{DownloadRequest, DownloadStatus, DownloadTask, TaskStatus};
