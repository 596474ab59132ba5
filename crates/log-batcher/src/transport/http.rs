// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Remote endpoint transport.
//!
//! Each batch becomes a single `POST` whose body is the JSON array of its
//! records, optionally zstd-compressed:
//!
//! ```text
//! POST <endpoint>
//! Content-Type: application/json
//! Content-Encoding: zstd          (compression_level > 0)
//!
//! [{"sequence":0,"timestamp_ms":...,"level":"info","message":"..."}, ...]
//! ```
//!
//! Delivery is best effort. A network error or a non-2xx status fails the
//! send with a [`TransportError`]; the batch is not retried.

use std::io::Write;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_ENCODING, CONTENT_TYPE};
use tracing::debug;
use zstd::stream::write::Encoder;

use crate::constants;
use crate::error::{ConfigurationError, TransportError};
use crate::record::Batch;
use crate::transport::Transport;

pub(crate) const NAME: &str = "http";

#[derive(Clone, Debug, PartialEq)]
pub struct HttpConfig {
    pub endpoint: String,
    /// Extra request headers, e.g. an API key.
    pub headers: Vec<(String, String)>,
    pub timeout: Duration,
    /// zstd level; `0` disables compression.
    pub compression_level: i32,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            headers: Vec::new(),
            timeout: constants::DEFAULT_HTTP_TIMEOUT,
            compression_level: 0,
        }
    }
}

impl HttpConfig {
    /// # Errors
    ///
    /// Returns [`ConfigurationError::InvalidConfig`] if the endpoint is not an
    /// `http`/`https` URL, a header is malformed, the timeout is zero or the
    /// compression level is out of zstd's range.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let url = reqwest::Url::parse(&self.endpoint).map_err(|e| {
            ConfigurationError::InvalidConfig(format!("invalid endpoint '{}': {e}", self.endpoint))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigurationError::InvalidConfig(format!(
                "unsupported endpoint scheme '{}'",
                url.scheme()
            )));
        }
        if self.timeout.is_zero() {
            return Err(ConfigurationError::InvalidConfig(
                "HTTP timeout must be greater than zero".to_string(),
            ));
        }
        if self.compression_level < 0
            || self.compression_level > *zstd::compression_level_range().end()
        {
            return Err(ConfigurationError::InvalidConfig(format!(
                "compression level {} is out of range",
                self.compression_level
            )));
        }
        self.header_map().map(|_| ())
    }

    fn header_map(&self) -> Result<HeaderMap, ConfigurationError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if self.compression_level > 0 {
            headers.insert(CONTENT_ENCODING, HeaderValue::from_static("zstd"));
        }
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                ConfigurationError::InvalidConfig(format!("invalid header name '{name}': {e}"))
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| {
                ConfigurationError::InvalidConfig(format!("invalid value for header '{name}': {e}"))
            })?;
            headers.insert(name, value);
        }
        Ok(headers)
    }
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    config: HttpConfig,
    headers: HeaderMap,
}

impl HttpTransport {
    /// # Errors
    ///
    /// Fails when `config` does not validate.
    pub fn new(client: reqwest::Client, config: HttpConfig) -> Result<Self, ConfigurationError> {
        config.validate()?;
        let headers = config.header_map()?;
        Ok(Self {
            client,
            config,
            headers,
        })
    }

    fn body(&self, batch: &Batch) -> Result<Vec<u8>, TransportError> {
        let json = batch
            .to_json_bytes()
            .map_err(|e| TransportError::new(NAME, format!("failed to serialize batch: {e}")))?;
        if self.config.compression_level <= 0 {
            return Ok(json);
        }
        self.encode(&json)
            .map_err(|e| TransportError::new(NAME, format!("failed to compress batch: {e}")))
    }

    fn encode(&self, data: &[u8]) -> Result<Vec<u8>, std::io::Error> {
        let mut encoder = Encoder::new(Vec::new(), self.config.compression_level)?;
        encoder.write_all(data)?;
        encoder.finish()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn name(&self) -> &str {
        NAME
    }

    async fn send(&self, batch: &Batch) -> Result<(), TransportError> {
        let body = self.body(batch)?;
        let start = Instant::now();
        let response = self
            .client
            .post(&self.config.endpoint)
            .timeout(self.config.timeout)
            .headers(self.headers.clone())
            .body(body)
            .send()
            .await
            .map_err(|e| TransportError::new(NAME, format!("request failed: {e}")))?;

        let status = response.status();
        debug!(
            "LOGS | HTTP transport sent batch {} ({} records) in {}ms: {status}",
            batch.id,
            batch.len(),
            start.elapsed().as_millis()
        );
        if status.is_success() {
            Ok(())
        } else {
            Err(TransportError::new(NAME, format!("endpoint responded {status}")))
        }
    }
}
