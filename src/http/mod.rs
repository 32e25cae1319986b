use crate::config::{ApiKey, ClientConfig};
use crate::types::{Dimension, DimensionReading};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, RETRY_AFTER, USER_AGENT};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const RATE_LIMIT_HEADER_PREFIX: &str = "anthropic-ratelimit-";
const MESSAGES_PATH: &str = "/v1/messages";
const MAX_ERROR_MESSAGE_CHARS: usize = 200;

/// Readings for the dimensions one probe response reported.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeReport {
    readings: BTreeMap<Dimension, DimensionReading>,
}

impl ProbeReport {
    pub fn insert(&mut self, dim: Dimension, reading: DimensionReading) {
        self.readings.insert(dim, reading);
    }

    pub fn get(&self, dim: Dimension) -> Option<&DimensionReading> {
        self.readings.get(&dim)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Dimension, &DimensionReading)> {
        self.readings.iter().map(|(d, r)| (*d, r))
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Auth,
    RateLimited,
    Network,
    Parse,
    Api,
}

impl ErrorKind {
    // Only a rejected credential stops the poll loop.
    pub fn is_fatal(self) -> bool {
        matches!(self, ErrorKind::Auth)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Auth => "auth",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Network => "network",
            ErrorKind::Parse => "parse",
            ErrorKind::Api => "api",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProbeError {
    #[error("authentication failed (HTTP {status}): {message}")]
    Auth { status: u16, message: String },
    #[error("rate limited by provider")]
    RateLimited {
        retry_after_secs: Option<u64>,
        /// Whatever rate-limit metadata the 429 response carried.
        partial: ProbeReport,
    },
    #[error("network error: {0}")]
    Network(String),
    #[error("unexpected response: {0}")]
    Parse(String),
    #[error("provider error (HTTP {status}): {message}")]
    Api { status: u16, message: String },
}

impl ProbeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProbeError::Auth { .. } => ErrorKind::Auth,
            ProbeError::RateLimited { .. } => ErrorKind::RateLimited,
            ProbeError::Network(_) => ErrorKind::Network,
            ProbeError::Parse(_) => ErrorKind::Parse,
            ProbeError::Api { .. } => ErrorKind::Api,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind().is_fatal()
    }
}

#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, api_key: &ApiKey) -> Result<ProbeReport, ProbeError>;
}

pub fn build_client(cfg: &ClientConfig) -> reqwest::Result<Client> {
    let mut default_headers = HeaderMap::new();
    if let Ok(ua) = HeaderValue::from_str(&cfg.user_agent) {
        default_headers.insert(USER_AGENT, ua);
    }
    Client::builder()
        .default_headers(default_headers)
        .timeout(cfg.timeout())
        .use_rustls_tls()
        .build()
}

/// Probes the Messages endpoint with a one-token request and reads the
/// `anthropic-ratelimit-*` response headers.
#[derive(Debug, Clone)]
pub struct LimitClient {
    client: Client,
    cfg: ClientConfig,
}

impl LimitClient {
    pub fn new(cfg: ClientConfig) -> reqwest::Result<Self> {
        let client = build_client(&cfg)?;
        Ok(Self { client, cfg })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.cfg
    }

    fn probe_body(&self) -> serde_json::Value {
        serde_json::json!({
            "model": self.cfg.model,
            "max_tokens": 1,
            "messages": [{ "role": "user", "content": "h" }],
        })
    }
}

#[async_trait]
impl Probe for LimitClient {
    async fn probe(&self, api_key: &ApiKey) -> Result<ProbeReport, ProbeError> {
        let url = format!("{}{}", self.cfg.api_url, MESSAGES_PATH);
        let key = HeaderValue::from_str(api_key.expose()).map_err(|_| ProbeError::Auth {
            status: 0,
            message: "API key contains invalid characters".into(),
        })?;
        debug!("probe POST {}", url);
        let res = self
            .client
            .post(&url)
            .header("x-api-key", key)
            .header("anthropic-version", &self.cfg.api_version)
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .json(&self.probe_body())
            .send()
            .await
            .map_err(|e| {
                warn!("probe request failed: {}", e);
                map_send_error(&e)
            })?;

        let status = res.status();
        let headers = res.headers().clone();
        info!("probe response status={}", status.as_u16());

        if status.is_success() {
            let report = extract_rate_limits(&headers)?;
            if report.is_empty() {
                return Err(ProbeError::Parse(
                    "response carried no rate-limit headers".into(),
                ));
            }
            debug!("probe parsed dimensions={}", report.len());
            return Ok(report);
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ProbeError::RateLimited {
                retry_after_secs: retry_after_secs(&headers),
                partial: extract_rate_limits_lenient(&headers),
            });
        }

        let body = res.text().await.unwrap_or_default();
        Err(map_status_to_error(status, &body))
    }
}

fn map_send_error(e: &reqwest::Error) -> ProbeError {
    if e.is_timeout() {
        ProbeError::Network("request timed out".into())
    } else if e.is_connect() {
        ProbeError::Network(format!("connection failed: {}", e))
    } else {
        ProbeError::Network(e.to_string())
    }
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

/// Provider's `error.message` when the body has one, else `HTTP <code>`.
pub fn error_message_from_body(status: StatusCode, body: &str) -> String {
    let msg = serde_json::from_str::<ErrorEnvelope>(body)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| format!("HTTP {}", status.as_u16()));
    msg.chars().take(MAX_ERROR_MESSAGE_CHARS).collect()
}

/// Maps a non-success, non-429 status to a probe error.
pub fn map_status_to_error(status: StatusCode, body: &str) -> ProbeError {
    let message = error_message_from_body(status, body);
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProbeError::Auth {
            status: status.as_u16(),
            message,
        },
        StatusCode::TOO_MANY_REQUESTS => ProbeError::RateLimited {
            retry_after_secs: None,
            partial: ProbeReport::default(),
        },
        s => ProbeError::Api {
            status: s.as_u16(),
            message,
        },
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

fn parse_count(headers: &HeaderMap, name: &str) -> Result<Option<i64>, ProbeError> {
    match header_str(headers, name) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<i64>()
            .map(Some)
            .map_err(|_| ProbeError::Parse(format!("{} is not an integer: {:?}", name, raw))),
    }
}

fn parse_reset(headers: &HeaderMap, name: &str) -> Option<DateTime<Utc>> {
    let raw = header_str(headers, name)?;
    match DateTime::parse_from_rfc3339(raw) {
        Ok(t) => Some(t.with_timezone(&Utc)),
        Err(e) => {
            debug!("ignoring unparseable {}={:?}: {}", name, raw, e);
            None
        }
    }
}

fn read_dimension(
    headers: &HeaderMap,
    dim: Dimension,
) -> Result<Option<DimensionReading>, ProbeError> {
    let prefix = format!("{}{}", RATE_LIMIT_HEADER_PREFIX, dim.header_prefix());
    let limit = parse_count(headers, &format!("{}-limit", prefix))?;
    let remaining = parse_count(headers, &format!("{}-remaining", prefix))?;
    // A dimension counts as reported only with both numbers present.
    let (Some(limit), Some(remaining)) = (limit, remaining) else {
        return Ok(None);
    };
    let reset_at = parse_reset(headers, &format!("{}-reset", prefix));
    Ok(Some(DimensionReading::new(limit, remaining, reset_at)))
}

/// Extracts every dimension the headers report. A present but non-numeric
/// limit/remaining value is a parse error for the whole response.
pub fn extract_rate_limits(headers: &HeaderMap) -> Result<ProbeReport, ProbeError> {
    let mut report = ProbeReport::default();
    for dim in Dimension::ALL {
        if let Some(reading) = read_dimension(headers, dim)? {
            report.insert(dim, reading);
        }
    }
    Ok(report)
}

/// Like [`extract_rate_limits`] but skips malformed dimensions; used for 429s
/// where any metadata is a bonus.
pub fn extract_rate_limits_lenient(headers: &HeaderMap) -> ProbeReport {
    let mut report = ProbeReport::default();
    for dim in Dimension::ALL {
        match read_dimension(headers, dim) {
            Ok(Some(reading)) => report.insert(dim, reading),
            Ok(None) => {}
            Err(e) => debug!("skipping dimension={}: {}", dim, e),
        }
    }
    report
}

pub fn retry_after_secs(headers: &HeaderMap) -> Option<u64> {
    header_str(headers, RETRY_AFTER.as_str()).and_then(|s| s.parse::<u64>().ok())
}
