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


//! Callbacks to the UI layer
//!
//! The downloader reports to its host through three optional callbacks:
//! - `on_progress(percent)` after every stored chunk
//! - `on_complete(path)` once, when the document is saved
//! - `on_error(error)` once, when a run fails
//!
//! Callbacks run on the downloader's task and should return quickly.

use crate::error::PdfDownloadError;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Progress callback, receives 0-100
pub type ProgressCallback = Arc<dyn Fn(u8) + Send + Sync>;

/// Completion callback, receives the saved file path
pub type CompleteCallback = Arc<dyn Fn(&Path) + Send + Sync>;

/// Error callback
pub type ErrorCallback = Arc<dyn Fn(&PdfDownloadError) + Send + Sync>;

/// Set of UI callbacks for one download
#[derive(Clone, Default)]
pub struct DownloadCallbacks {
    on_progress: Option<ProgressCallback>,
    on_complete: Option<CompleteCallback>,
    on_error: Option<ErrorCallback>,
}

impl DownloadCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(u8) + Send + Sync + 'static,
    {
        self.on_progress = Some(Arc::new(callback));
        self
    }

    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Path) + Send + Sync + 'static,
    {
        self.on_complete = Some(Arc::new(callback));
        self
    }

    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&PdfDownloadError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(callback));
        self
    }

    pub(crate) fn emit_progress(&self, percent: u8) {
        if let Some(callback) = &self.on_progress {
            callback(percent);
        }
    }

    pub(crate) fn emit_complete(&self, path: &Path) {
        if let Some(callback) = &self.on_complete {
            callback(path);
        }
    }

    pub(crate) fn emit_error(&self, error: &PdfDownloadError) {
        if let Some(callback) = &self.on_error {
            callback(error);
        }
    }
}

impl fmt::Debug for DownloadCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadCallbacks")
            .field("on_progress", &self.on_progress.is_some())
            .field("on_complete", &self.on_complete.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_callbacks_forward_values() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callbacks = DownloadCallbacks::new().on_progress(move |p| sink.lock().unwrap().push(p));

        callbacks.emit_progress(33);
        callbacks.emit_progress(67);
        assert_eq!(*seen.lock().unwrap(), vec![33, 67]);

        // unset callbacks are no-ops
        callbacks.emit_complete(Path::new("/tmp/x.pdf"));
        callbacks.emit_error(&PdfDownloadError::TaskNotFound("x".to_string()));
    }

    #[test]
    fn test_debug_lists_registered_callbacks() {
        let callbacks = DownloadCallbacks::new().on_error(|_| {});
        let rendered = format!("{:?}", callbacks);
        assert!(rendered.contains("on_error: true"));
        assert!(rendered.contains("on_progress: false"));
    }
}
