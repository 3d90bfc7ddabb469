//! Admin dashboard API client.
//!
//! Provides authenticated JSON communication with the admin dashboard and
//! classifies every failure into a [`BackendError`] so callers never see raw
//! transport errors.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::error::BackendError;

/// Error code the dashboard returns with HTTP 409 on a duplicate idempotency key.
pub const UNIQUE_VIOLATION_CODE: &str = "unique_violation";

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the admin dashboard URL:
/// - strip trailing slashes
/// - strip a trailing `/api` segment
/// - ensure a scheme is present (https, or http for localhost)
pub fn normalize_admin_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }

    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }

    // Again, in case "/api/" was present
    while url.ends_with('/') {
        url.pop();
    }

    url
}

// ---------------------------------------------------------------------------
// Connection strings
// ---------------------------------------------------------------------------

/// Onboarding hands out a single base64 (or raw JSON) connection string
/// carrying `key`, `url`, and `tid`.
fn decode_connection_string_payload(raw: &str) -> Option<Value> {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.starts_with('{') {
        return serde_json::from_str::<Value>(&compact).ok();
    }
    if compact.len() < 20 {
        return None;
    }

    let base64 = compact.replace('-', "+").replace('_', "/");
    let padded = format!(
        "{}{}",
        base64,
        "=".repeat((4usize.wrapping_sub(base64.len() % 4)) % 4)
    );
    let decoded = BASE64_STANDARD.decode(padded).ok()?;
    serde_json::from_slice::<Value>(&decoded).ok()
}

fn connection_string_field(raw: &str, keys: &[&str]) -> Option<String> {
    let payload = decode_connection_string_payload(raw)?;
    keys.iter()
        .find_map(|key| payload.get(*key).and_then(Value::as_str))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn extract_api_key_from_connection_string(raw: &str) -> Option<String> {
    connection_string_field(raw, &["key"])
}

pub fn extract_admin_url_from_connection_string(raw: &str) -> Option<String> {
    connection_string_field(raw, &["url"]).map(|url| normalize_admin_url(&url))
}

pub fn extract_terminal_id_from_connection_string(raw: &str) -> Option<String> {
    connection_string_field(raw, &["tid", "terminalId"])
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Classify a transport-level failure.
fn classify_transport_error(url: &str, err: &reqwest::Error) -> BackendError {
    if err.is_timeout() {
        return BackendError::Timeout;
    }
    if err.is_connect() {
        return BackendError::Transient(format!("Cannot reach admin dashboard at {url}"));
    }
    if err.is_builder() {
        return BackendError::Rejected(format!("Invalid admin dashboard URL: {url}"));
    }
    BackendError::Transient(format!("Network error communicating with {url}: {err}"))
}

fn status_message(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "API key is invalid or expired".to_string(),
        403 => "Terminal not authorized".to_string(),
        404 => "Admin dashboard endpoint not found".to_string(),
        s if s >= 500 => format!("Admin dashboard server error (HTTP {s})"),
        s => format!("Unexpected response from admin dashboard (HTTP {s})"),
    }
}

/// Classify a non-success HTTP response. `body` is the parsed error body when
/// the server sent JSON.
pub fn classify_status(status: StatusCode, body: Option<&Value>) -> BackendError {
    let field = |key: &str| {
        body.and_then(|b| b.get(key))
            .and_then(Value::as_str)
            .map(str::to_string)
    };
    let message = field("error")
        .or_else(|| field("message"))
        .unwrap_or_else(|| status_message(status));

    match status {
        StatusCode::CONFLICT if field("code").as_deref() == Some(UNIQUE_VIOLATION_CODE) => {
            BackendError::UniqueViolation {
                submission_id: field("submissionId").unwrap_or_default(),
            }
        }
        StatusCode::NOT_FOUND => BackendError::NotFound(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => BackendError::Timeout,
        StatusCode::TOO_MANY_REQUESTS => BackendError::Transient(message),
        s if s.is_server_error() => BackendError::Transient(message),
        s => BackendError::Rejected(format!("{message} (HTTP {})", s.as_u16())),
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Authenticated JSON client for the admin dashboard.
pub struct ApiClient {
    client: Client,
    base_url: String,
    api_key: Zeroizing<String>,
    terminal_id: Option<String>,
}

impl ApiClient {
    /// `api_key` may be a bare key or an onboarding connection string; the
    /// terminal id embedded in a connection string wins over `terminal_id`.
    pub fn new(
        admin_url: &str,
        api_key: &str,
        terminal_id: Option<String>,
        timeout: Duration,
    ) -> Result<Self, BackendError> {
        let resolved_key =
            extract_api_key_from_connection_string(api_key).unwrap_or_else(|| api_key.to_string());
        let mut terminal_id = terminal_id.filter(|t| !t.trim().is_empty());
        if let Some(decoded_tid) = extract_terminal_id_from_connection_string(api_key) {
            if let Some(existing) = terminal_id.as_deref() {
                if existing != decoded_tid {
                    warn!(
                        stored_terminal_id = existing,
                        decoded_terminal_id = %decoded_tid,
                        "terminal_id mismatch detected, preferring decoded terminal id from connection string"
                    );
                }
            }
            terminal_id = Some(decoded_tid);
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Rejected(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: normalize_admin_url(admin_url),
            api_key: Zeroizing::new(resolved_key),
            terminal_id,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Perform an authenticated request. `path` includes the leading slash.
    /// Returns `Value::Null` for empty (204) bodies.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<Value, BackendError> {
        let full_url = format!("{}{path}", self.base_url);
        debug!(%method, url = %full_url, "admin request");

        let mut req = self
            .client
            .request(method, &full_url)
            .header("X-POS-API-Key", self.api_key.as_str());
        if let Some(tid) = self.terminal_id.as_deref() {
            req = req.header("x-terminal-id", tid);
        }
        if !query.is_empty() {
            req = req.query(query);
        }
        if let Some(b) = body {
            req = req.json(b);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| classify_transport_error(&self.base_url, &e))?;
        let status = resp.status();
        let body_text = resp
            .text()
            .await
            .map_err(|e| classify_transport_error(&self.base_url, &e))?;

        if !status.is_success() {
            let parsed = serde_json::from_str::<Value>(&body_text).ok();
            let err = classify_status(status, parsed.as_ref());
            warn!(
                status = status.as_u16(),
                path,
                error = %err,
                "Admin dashboard request failed"
            );
            return Err(err);
        }

        if body_text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body_text)
            .map_err(|e| BackendError::Transient(format!("Invalid JSON from admin dashboard: {e}")))
    }
}
