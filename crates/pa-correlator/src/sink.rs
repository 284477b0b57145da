//! Audit sinks
//!
//! `LogAuditSink` writes a structured log line per record (the secret value is
//! never logged). `HttpAuditSink` POSTs the record as JSON to a webhook; any
//! non-2xx response counts as a rejection.

use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use pa_common::AuditRecord;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Record rejected: {0}")]
    Rejected(String),

    #[error("Sink unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid sink configuration: {0}")]
    Config(String),
}

/// Receiver of finished audit records
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn emit(&self, record: &AuditRecord) -> Result<(), SinkError>;

    fn name(&self) -> &str;
}

#[derive(Debug, Default)]
pub struct LogAuditSink;

impl LogAuditSink {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AuditSink for LogAuditSink {
    async fn emit(&self, record: &AuditRecord) -> Result<(), SinkError> {
        info!(
            record_id = %record.record_id,
            principal = %record.principal_name,
            contact_email = %record.contact_email,
            emitted_at = %record.emitted_at,
            "Audit record"
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}

pub struct HttpAuditSink {
    client: Client,
    url: String,
}

impl HttpAuditSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, SinkError> {
        let url = url.into();
        if url.is_empty() {
            return Err(SinkError::Config("webhook url is required".to_string()));
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SinkError::Config(format!("Failed to build HTTP client: {}", e)))?;

        info!(url = %url, timeout_ms = timeout.as_millis() as u64, "HttpAuditSink initialized");
        Ok(Self { client, url })
    }
}

#[async_trait]
impl AuditSink for HttpAuditSink {
    async fn emit(&self, record: &AuditRecord) -> Result<(), SinkError> {
        let response = self.client
            .post(&self.url)
            .json(record)
            .send()
            .await
            .map_err(|e| {
                warn!(url = %self.url, record_id = %record.record_id, error = %e, "Audit webhook request failed");
                SinkError::Unavailable(e.to_string())
            })?;

        let status = response.status();
        if status.is_success() {
            debug!(record_id = %record.record_id, status = status.as_u16(), "Audit webhook accepted record");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        warn!(
            record_id = %record.record_id,
            status = status.as_u16(),
            "Audit webhook rejected record"
        );
        Err(SinkError::Rejected(format!("HTTP {}: {}", status.as_u16(), body)))
    }

    fn name(&self) -> &str {
        "http"
    }
}

/// Build the sink named by `kind` ("log" or "http")
pub fn create_sink(kind: &str, webhook_url: &str, timeout: Duration) -> Result<Arc<dyn AuditSink>, SinkError> {
    match kind {
        "log" => Ok(Arc::new(LogAuditSink::new())),
        "http" => Ok(Arc::new(HttpAuditSink::new(webhook_url, timeout)?)),
        other => Err(SinkError::Config(format!("Unknown audit sink: {}", other))),
    }
}
