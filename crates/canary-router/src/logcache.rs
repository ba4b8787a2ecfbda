//! HTTP reader client for the metric store.
//!
//! Implements [`MetricReader`] over the store's read API:
//! `GET {addr}/api/v1/read/{source_id}?start_time=<ns>&end_time=<ns>`, with a
//! bearer token from the configured [`TokenProvider`]. The response decoding
//! lives with the envelope model; this client only moves bytes and maps
//! transport failures onto [`ReadError`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header;
use serde::Deserialize;
use url::Url;

use canary_core::timeseries::{Envelope, MetricReader, ReadError, ReadOptions};

use crate::uaa::TokenProvider;

/// Timeout for a single read request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// A [`MetricReader`] backed by the metric store's HTTP API.
pub struct LogCacheClient {
    base: Url,
    http: reqwest::Client,
    token_provider: Arc<dyn TokenProvider>,
}

#[derive(Deserialize)]
struct ReadResponse {
    #[serde(default)]
    envelopes: EnvelopeBatch,
}

#[derive(Deserialize, Default)]
struct EnvelopeBatch {
    #[serde(default)]
    batch: Vec<Envelope>,
}

impl LogCacheClient {
    /// Builds a client against the store at `base`.
    ///
    /// # Errors
    ///
    /// Returns a [`ReadError`] when the HTTP client cannot be constructed.
    pub fn new(
        base: Url,
        token_provider: Arc<dyn TokenProvider>,
        skip_tls_verify: bool,
    ) -> Result<Self, ReadError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(skip_tls_verify)
            .build()
            .map_err(|err| ReadError::Transport(err.to_string()))?;

        Ok(Self {
            base,
            http,
            token_provider,
        })
    }
}

#[async_trait]
impl MetricReader for LogCacheClient {
    async fn read(
        &self,
        source_id: &str,
        start: DateTime<Utc>,
        options: ReadOptions,
    ) -> Result<Vec<Envelope>, ReadError> {
        let mut url = self.base.clone();
        url.set_path(&format!("/api/v1/read/{source_id}"));
        {
            let mut query = url.query_pairs_mut();
            query.append_pair(
                "start_time",
                &start.timestamp_nanos_opt().unwrap_or(0).to_string(),
            );
            if let Some(end) = options.end_time {
                query.append_pair(
                    "end_time",
                    &end.timestamp_nanos_opt().unwrap_or(i64::MAX).to_string(),
                );
            }
        }

        let token = self
            .token_provider
            .token()
            .await
            .map_err(|err| ReadError::Transport(err.to_string()))?;

        let response = self
            .http
            .get(url)
            .header(header::AUTHORIZATION, token)
            .send()
            .await
            .map_err(|err| ReadError::Transport(err.to_string()))?;

        if !response.status().is_success() {
            return Err(ReadError::Status(response.status().as_u16()));
        }

        let body: ReadResponse = response
            .json()
            .await
            .map_err(|err| ReadError::Decode(err.to_string()))?;

        Ok(body.envelopes.batch)
    }
}
