//! Certificate-Status Collaborator
//!
//! The one networked call on the ingestion path. The engine only ever asks
//! "is this certificate serial still good?"; `unknown` answers, timeouts and
//! transport failures all degrade to an unverifiable chain and never to a
//! revocation.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;

use crate::error::StatusError;

/// Answer from the certification authority's status service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertificateStatus {
    Valid,
    Revoked,
    Unknown,
}

/// Certificate-status lookup contract.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CertificateStatusProvider: Send + Sync {
    async fn check(&self, serial: &str) -> Result<CertificateStatus, StatusError>;
}

/// Fixed provider backed by an in-memory table. Serials not in the table
/// answer with the configured default.
#[derive(Debug, Clone, Default)]
pub struct StaticStatusProvider {
    statuses: HashMap<String, CertificateStatus>,
    default: Option<CertificateStatus>,
}

impl StaticStatusProvider {
    /// All serials answer `valid` unless overridden.
    pub fn all_valid() -> Self {
        Self {
            statuses: HashMap::new(),
            default: Some(CertificateStatus::Valid),
        }
    }

    pub fn with_status(mut self, serial: impl Into<String>, status: CertificateStatus) -> Self {
        self.statuses.insert(serial.into(), status);
        self
    }
}

#[async_trait]
impl CertificateStatusProvider for StaticStatusProvider {
    async fn check(&self, serial: &str) -> Result<CertificateStatus, StatusError> {
        Ok(self
            .statuses
            .get(serial)
            .copied()
            .or(self.default)
            .unwrap_or(CertificateStatus::Unknown))
    }
}

/// Configuration for the HTTP status client
#[derive(Debug, Clone)]
pub struct StatusClientConfig {
    /// Status service endpoint; the serial is appended as a path segment
    pub base_url: String,
    /// Request timeout in seconds
    pub timeout_seconds: u64,
    /// Number of retry attempts
    pub retry_attempts: u32,
    /// Initial retry delay in milliseconds
    pub retry_delay_ms: u64,
    /// Maximum retry delay in milliseconds (for exponential backoff cap)
    pub max_retry_delay_ms: u64,
    /// Maximum cached serials
    pub cache_capacity: u64,
    /// Cache TTL in seconds
    pub cache_ttl_seconds: u64,
    /// User agent string
    pub user_agent: String,
}

impl Default for StatusClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://localhost/certificates/status".to_string(),
            timeout_seconds: 5,
            retry_attempts: 2,
            retry_delay_ms: 250,
            max_retry_delay_ms: 2000,
            cache_capacity: 10_000,
            cache_ttl_seconds: 3600,
            user_agent: format!("cfdi-engine/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Expected JSON payload of the status service.
#[derive(Debug, Deserialize)]
struct StatusPayload {
    status: String,
}

pub(crate) fn parse_status_payload(payload: &str) -> Result<CertificateStatus, StatusError> {
    let parsed: StatusPayload =
        serde_json::from_str(payload).map_err(|e| StatusError::UnexpectedPayload {
            detail: e.to_string(),
        })?;
    match parsed.status.as_str() {
        "valid" => Ok(CertificateStatus::Valid),
        "revoked" => Ok(CertificateStatus::Revoked),
        "unknown" => Ok(CertificateStatus::Unknown),
        other => Err(StatusError::UnexpectedPayload {
            detail: format!("unrecognized status value: {:?}", other),
        }),
    }
}

/// HTTP implementation of [`CertificateStatusProvider`] with retry,
/// exponential backoff, and a moka cache of definitive answers.
pub struct HttpStatusClient {
    client: Client,
    config: StatusClientConfig,
    cache: Cache<String, CertificateStatus>,
}

impl HttpStatusClient {
    pub fn new(config: StatusClientConfig) -> Result<Self, StatusError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .user_agent(&config.user_agent)
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            .build()
            .map_err(StatusError::Http)?;

        let cache = Cache::builder()
            .max_capacity(config.cache_capacity)
            .time_to_live(Duration::from_secs(config.cache_ttl_seconds))
            .build();

        Ok(Self {
            client,
            config,
            cache,
        })
    }

    pub fn config(&self) -> &StatusClientConfig {
        &self.config
    }

    async fn fetch_with_retry(&self, serial: &str) -> Result<CertificateStatus, StatusError> {
        let url = format!("{}/{}", self.config.base_url.trim_end_matches('/'), serial);
        let mut attempt = 0;

        loop {
            match self.fetch_once(&url).await {
                Ok(status) => return Ok(status),
                Err(error) => {
                    if attempt < self.config.retry_attempts && is_retryable(&error) {
                        self.wait_before_retry(attempt).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(error);
                }
            }
        }
    }

    async fn fetch_once(&self, url: &str) -> Result<CertificateStatus, StatusError> {
        let response = self.client.get(url).send().await.map_err(StatusError::Http)?;
        if !response.status().is_success() {
            return Err(StatusError::UnexpectedPayload {
                detail: format!("HTTP {}", response.status().as_u16()),
            });
        }
        let body = response.text().await.map_err(StatusError::Http)?;
        parse_status_payload(&body)
    }

    async fn wait_before_retry(&self, attempt: u32) {
        let delay_ms = self.config.retry_delay_ms * 2_u64.pow(attempt);
        let capped = delay_ms.min(self.config.max_retry_delay_ms);
        sleep(Duration::from_millis(capped)).await;
    }
}

fn is_retryable(error: &StatusError) -> bool {
    match error {
        StatusError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
        StatusError::Timeout { .. } => true,
        StatusError::UnexpectedPayload { .. } => false,
    }
}

#[async_trait]
impl CertificateStatusProvider for HttpStatusClient {
    async fn check(&self, serial: &str) -> Result<CertificateStatus, StatusError> {
        if let Some(cached) = self.cache.get(serial).await {
            return Ok(cached);
        }
        let status = self.fetch_with_retry(serial).await?;
        // `unknown` is a transient answer; only definitive verdicts are
        // worth caching.
        if status != CertificateStatus::Unknown {
            self.cache.insert(serial.to_string(), status).await;
        }
        Ok(status)
    }
}
