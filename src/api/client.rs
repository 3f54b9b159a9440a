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


//! HTTP client for the report service
//!
//! Thin `reqwest` wrapper implementing [`ReportApi`]. Retries are not done
//! here; the chunk fetcher owns the retry policy so it can count attempts per
//! chunk.
//!
//! # Timeouts
//! Chunk transfers can be large, so the default per-request timeout is
//! 300 seconds (see [`DownloadConfig::request_timeout_secs`]).

use crate::api::{ApiEnvelope, ChunkResponse, PdfFileInfo, ReportApi};
use crate::config::DownloadConfig;
use crate::error::{PdfDownloadError, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderValue, ACCEPT, USER_AGENT};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// User agent sent with every request
const CLIENT_USER_AGENT: &str = concat!("pdf-chunk-core/", env!("CARGO_PKG_VERSION"));

/// `reqwest`-backed report service client
#[derive(Debug, Clone)]
pub struct ReportClient {
    client: Client,
    base_url: String,
}

impl ReportClient {
    /// Create a client for `base_url`
    ///
    /// # Errors
    /// - `InvalidConfiguration` if the URL does not parse or is not http(s)
    /// - `ReqwestError` if the TLS backend cannot be initialised
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let parsed = Url::parse(base_url)?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(PdfDownloadError::InvalidConfiguration(format!(
                "Unsupported URL scheme: {}",
                parsed.scheme()
            )));
        }

        let client = Client::builder()
            .timeout(timeout)
            .user_agent(CLIENT_USER_AGENT)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Create a client from the download configuration
    pub fn from_config(config: &DownloadConfig) -> Result<Self> {
        Self::new(&config.api_base_url, config.request_timeout())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn info_url(&self, file_id: &str) -> String {
        format!("{}/v1/pdf/info/{}", self.base_url, urlencoding::encode(file_id))
    }

    fn chunk_url(&self, file_id: &str, chunk_index: usize) -> String {
        format!(
            "{}/v1/pdf/chunk/{}/{}",
            self.base_url,
            urlencoding::encode(file_id),
            chunk_index
        )
    }

    fn health_url(&self) -> String {
        format!("{}/v1/pdf/health", self.base_url)
    }

    /// GET a JSON envelope
    async fn get_envelope<T: DeserializeOwned>(&self, url: &str) -> Result<ApiEnvelope<T>> {
        debug!(url, "GET");

        let response = self
            .client
            .get(url)
            .header(ACCEPT, HeaderValue::from_static("application/json"))
            .send()
            .await
            .map_err(|e| {
                PdfDownloadError::network_error(format!("Request failed: {}", e), true)
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            PdfDownloadError::network_error(format!("Failed to read body: {}", e), true)
        })?;

        // The service reports errors in the envelope, often with a non-200 status
        match serde_json::from_str::<ApiEnvelope<T>>(&body) {
            Ok(envelope) => Ok(envelope),
            Err(_) if !status.is_success() => Err(PdfDownloadError::UnexpectedStatusCode {
                status_code: status.as_u16(),
                endpoint: url.to_string(),
            }),
            Err(e) => Err(PdfDownloadError::InvalidApiResponse(format!(
                "{}: {}",
                url, e
            ))),
        }
    }
}

#[async_trait]
impl ReportApi for ReportClient {
    async fn get_pdf_file_info(&self, file_id: &str) -> Result<ApiEnvelope<PdfFileInfo>> {
        self.get_envelope(&self.info_url(file_id)).await
    }

    async fn get_pdf_chunk(&self, file_id: &str, chunk_index: usize) -> Result<ChunkResponse> {
        let url = self.chunk_url(file_id, chunk_index);
        debug!(url = %url, "GET chunk");

        let response = self
            .client
            .get(&url)
            .header(USER_AGENT, HeaderValue::from_static(CLIENT_USER_AGENT))
            .send()
            .await
            .map_err(|e| {
                PdfDownloadError::network_error(format!("Request failed: {}", e), true)
            })?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(PdfDownloadError::UnexpectedStatusCode {
                status_code: status.as_u16(),
                endpoint: url,
            });
        }

        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        let data = response.bytes().await.map_err(|e| {
            PdfDownloadError::network_error(format!("Stream error: {}", e), true)
        })?;

        Ok(ChunkResponse {
            status: status.as_u16(),
            headers,
            data: data.to_vec(),
        })
    }

    async fn get_pdf_health(&self) -> Result<ApiEnvelope<serde_json::Value>> {
        self.get_envelope(&self.health_url()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_urls() {
        let client = ReportClient::new("https://reports.example.com/reader/", Duration::from_secs(5)).unwrap();
        assert_eq!(client.base_url(), "https://reports.example.com/reader");
        assert_eq!(
            client.info_url("abc"),
            "https://reports.example.com/reader/v1/pdf/info/abc"
        );
        assert_eq!(
            client.chunk_url("a b/c", 7),
            "https://reports.example.com/reader/v1/pdf/chunk/a%20b%2Fc/7"
        );
        assert_eq!(
            client.health_url(),
            "https://reports.example.com/reader/v1/pdf/health"
        );
    }

    #[test]
    fn test_rejects_non_http_scheme() {
        let result = ReportClient::new("ftp://example.com", Duration::from_secs(5));
        assert!(matches!(
            result,
            Err(PdfDownloadError::InvalidConfiguration(_))
        ));
        assert!(ReportClient::new("::", Duration::from_secs(5)).is_err());
    }
}
