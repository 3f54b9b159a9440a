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


//! SQLite-backed state store
//!
//! # SQLite Configuration
//! - WAL mode for concurrent readers while a checkpoint is written
//! - Normal synchronous mode (balance safety/speed)
//! - Incremental auto-vacuum, so removed states give space back
//!
//! # Quota
//! An optional byte quota caps the summed size of all stored values. A write
//! that would exceed it, and SQLite's own "database or disk is full", are
//! reported as [`PdfDownloadError::StorageQuotaExceeded`].

use crate::error::{PdfDownloadError, Result};
use crate::storage::StateStore;
use async_trait::async_trait;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions},
    ConnectOptions,
};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// SQLite primary result code for SQLITE_FULL
const SQLITE_FULL: &str = "13";

/// Durable [`StateStore`] on top of an SQLite database
#[derive(Debug, Clone)]
pub struct SqliteStateStore {
    pool: SqlitePool,
    path: Option<PathBuf>, // None for in-memory databases
    quota_bytes: Option<usize>,
}

impl SqliteStateStore {
    /// Open (or create) the database at `database_path` and apply migrations
    ///
    /// # Errors
    /// Returns error if:
    /// - Parent directory doesn't exist and can't be created
    /// - Database file can't be opened
    /// - Migrations fail
    pub async fn new<P: AsRef<Path>>(database_path: P) -> Result<Self> {
        let path = database_path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    PdfDownloadError::FileIoError(format!(
                        "Failed to create database directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let connection_string = format!("sqlite://{}?mode=rwc", path.display());
        let connect_opts = SqliteConnectOptions::from_str(&connection_string)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(30))
            .disable_statement_logging();

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(connect_opts)
            .await?;

        Self::configure_database(&pool).await?;
        crate::storage::migrations::run_migrations(&pool).await?;

        Ok(Self {
            pool,
            path: Some(path.to_path_buf()),
            quota_bytes: None,
        })
    }

    /// Create an in-memory store for testing
    pub async fn new_in_memory() -> Result<Self> {
        let connect_opts = SqliteConnectOptions::from_str("sqlite::memory:")?
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .disable_statement_logging();

        let pool = SqlitePoolOptions::new()
            .max_connections(1) // every connection would get its own memory db
            .connect_with(connect_opts)
            .await?;

        Self::configure_database(&pool).await?;
        crate::storage::migrations::run_migrations(&pool).await?;

        Ok(Self {
            pool,
            path: None,
            quota_bytes: None,
        })
    }

    /// Cap the summed size of stored values
    pub fn with_quota(mut self, quota_bytes: usize) -> Self {
        self.quota_bytes = Some(quota_bytes);
        self
    }

    async fn configure_database(pool: &SqlitePool) -> Result<()> {
        sqlx::query("PRAGMA auto_vacuum = INCREMENTAL")
            .execute(pool)
            .await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Returns `None` for in-memory databases
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Close the pool and release all connections
    pub async fn close(self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }

    /// Summed size of all stored values, excluding `key`
    async fn used_bytes_excluding(&self, key: &str) -> Result<usize> {
        let used: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(LENGTH(CAST(state_value AS BLOB))), 0) FROM DownloadStates WHERE state_key != ?",
        )
        .bind(key)
        .fetch_one(&self.pool)
        .await?;
        Ok(used.max(0) as usize)
    }

    /// Default database location under the user's data directory
    pub fn get_default_path() -> PathBuf {
        #[cfg(target_os = "windows")]
        {
            let appdata = std::env::var("APPDATA").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(appdata).join("PdfChunk").join("states.db")
        }

        #[cfg(target_os = "macos")]
        {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("PdfChunk")
                .join("states.db")
        }

        #[cfg(not(any(target_os = "windows", target_os = "macos")))]
        {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home)
                .join(".local")
                .join("share")
                .join("PdfChunk")
                .join("states.db")
        }
    }
}

/// Map SQLite's "database or disk is full" onto the quota error
fn map_write_error(err: sqlx::Error, key: &str) -> PdfDownloadError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref() == Some(SQLITE_FULL) {
            return PdfDownloadError::StorageQuotaExceeded {
                key: key.to_string(),
            };
        }
    }
    PdfDownloadError::SqlxError(err)
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT state_value FROM DownloadStates WHERE state_key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        if let Some(quota) = self.quota_bytes {
            let used = self.used_bytes_excluding(key).await?;
            if used + value.len() > quota {
                debug!(key, used, incoming = value.len(), quota, "state store quota reached");
                return Err(PdfDownloadError::StorageQuotaExceeded {
                    key: key.to_string(),
                });
            }
        }

        sqlx::query(
            r#"
            INSERT INTO DownloadStates (state_key, state_value, updated_at)
            VALUES (?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(state_key) DO UPDATE SET
                state_value = excluded.state_value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(|e| map_write_error(e, key))?;

        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM DownloadStates WHERE state_key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let keys: Vec<String> =
            sqlx::query_scalar("SELECT state_key FROM DownloadStates ORDER BY state_key")
                .fetch_all(&self.pool)
                .await?;
        Ok(keys)
    }
}
