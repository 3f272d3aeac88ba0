//! HTTP collector exporter
//!
//! POSTs each batch as JSON to `{endpoint}/v1/{logs|metrics|traces}`. Any 2xx
//! is an ack; every other status is reported as a retryable endpoint error.
//! Retries themselves belong to the exporter loop.

use ampyobs_core::config::CollectorSettings;
use ampyobs_core::export::{ExportBatch, ExportError, ExportResult, Exporter};
use async_trait::async_trait;
use reqwest::Client;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

/// HTTP collector configuration
#[derive(Debug, Clone)]
pub struct HttpCollectorConfig {
    /// Base URL, without the `/v1/...` suffix
    pub endpoint: String,

    /// Per-request timeout
    pub timeout: Duration,

    /// Accept gzip-compressed responses
    pub gzip: bool,

    /// Static headers to include in all requests
    pub headers: BTreeMap<String, String>,

    pub user_agent: String,
}

impl Default for HttpCollectorConfig {
    fn default() -> Self {
        Self {
            endpoint: ampyobs_core::config::DEFAULT_COLLECTOR_ENDPOINT.to_string(),
            timeout: Duration::from_secs(10),
            gzip: false,
            headers: BTreeMap::new(),
            user_agent: format!("ampyobs/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl HttpCollectorConfig {
    pub fn from_settings(settings: &CollectorSettings) -> Self {
        Self {
            endpoint: settings.normalized_endpoint(),
            timeout: settings.timeout(),
            gzip: settings.gzip,
            headers: settings.headers.clone(),
            ..Default::default()
        }
    }
}

pub struct HttpCollectorExporter {
    config: HttpCollectorConfig,
    client: Client,
}

impl HttpCollectorExporter {
    pub fn new(config: HttpCollectorConfig) -> ExportResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .gzip(config.gzip)
            .build()
            .map_err(|e| ExportError::Transport(format!("Failed to create HTTP client: {}", e)))?;

        info!(endpoint = %config.endpoint, "HTTP collector exporter initialized");
        Ok(Self { config, client })
    }

    /// Ingestion URL for a batch's signal
    pub fn url_for(&self, batch: &ExportBatch) -> String {
        format!(
            "{}/v1/{}",
            self.config.endpoint.trim_end_matches('/'),
            batch.signal.as_str()
        )
    }
}

#[async_trait]
impl Exporter for HttpCollectorExporter {
    fn name(&self) -> &str {
        "http"
    }

    async fn export(&self, batch: &ExportBatch) -> ExportResult<()> {
        let body = serde_json::to_vec(batch)?;
        let url = self.url_for(batch);

        let mut request = self
            .client
            .post(&url)
            .header("Content-Type", "application/json");
        for (key, value) in &self.config.headers {
            request = request.header(key.as_str(), value.as_str());
        }

        let response = request.body(body).send().await.map_err(|e| {
            if e.is_timeout() {
                ExportError::Timeout
            } else {
                ExportError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        if status.is_success() {
            debug!(url = %url, records = batch.len(), "Collector accepted batch");
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(ExportError::Endpoint {
                status: status.as_u16(),
                body,
            })
        }
    }
}
