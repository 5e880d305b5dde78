use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use uuid::Uuid;

use keel_common::error::AppError;
use keel_common::types::WebhookEndpoint;

use crate::signer::{SignedHeaders, is_reserved_header};

const USER_AGENT: &str = concat!("keel-webhooks/", env!("CARGO_PKG_VERSION"));

/// What happened on the wire during one attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptResult {
    /// HTTP status, if a response arrived
    pub response_status: Option<i32>,
    pub error_message: Option<String>,
    pub duration_ms: i64,
    pub attempted_at: DateTime<Utc>,
    pub timed_out: bool,
}

impl AttemptResult {
    pub fn is_success(&self) -> bool {
        matches!(self.response_status, Some(status) if (200..300).contains(&status))
    }
}

/// Outbound HTTP client for webhook attempts.
///
/// Redirects are not followed: a 3xx is reported as the final status.
#[derive(Clone)]
pub struct WebhookClient {
    http: reqwest::Client,
}

impl WebhookClient {
    pub fn new() -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { http })
    }

    /// Sign and POST `payload` to the endpoint once, bounded by the
    /// endpoint's timeout. Never fails: every outcome is an [`AttemptResult`].
    pub async fn deliver(
        &self,
        endpoint: &WebhookEndpoint,
        secret: &str,
        delivery_id: Uuid,
        event_type: &str,
        payload: &[u8],
    ) -> AttemptResult {
        let attempted_at = Utc::now();
        let signed = SignedHeaders::new(
            secret,
            delivery_id,
            event_type,
            attempted_at.timestamp(),
            payload,
        );
        let headers = build_headers(endpoint, &signed);
        let timeout_seconds = u64::try_from(endpoint.timeout_seconds.max(1)).unwrap_or(1);

        let start = Instant::now();
        let result = self
            .http
            .post(&endpoint.url)
            .headers(headers)
            .timeout(Duration::from_secs(timeout_seconds))
            .body(payload.to_vec())
            .send()
            .await;
        let duration_ms = start.elapsed().as_millis() as i64;

        match result {
            Ok(response) => {
                let status = i32::from(response.status().as_u16());
                let error_message =
                    (!(200..300).contains(&status)).then(|| format!("HTTP {}", status));
                AttemptResult {
                    response_status: Some(status),
                    error_message,
                    duration_ms,
                    attempted_at,
                    timed_out: false,
                }
            }
            Err(e) => {
                let error_message = if e.is_timeout() {
                    format!("Request timed out after {}s", timeout_seconds)
                } else if e.is_connect() {
                    format!("Connection failed: {}", e)
                } else {
                    format!("Request error: {}", e)
                };
                AttemptResult {
                    response_status: None,
                    error_message: Some(error_message),
                    duration_ms,
                    attempted_at,
                    timed_out: e.is_timeout(),
                }
            }
        }
    }
}

/// Content type, then the endpoint's custom headers, then the reserved
/// signing headers. Custom headers that collide with a reserved name are
/// dropped.
pub fn build_headers(endpoint: &WebhookEndpoint, signed: &SignedHeaders) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    for (name, value) in &endpoint.custom_headers {
        if is_reserved_header(name) {
            tracing::debug!(
                endpoint_id = %endpoint.id,
                header = %name,
                "Dropping custom header that collides with a reserved header"
            );
            continue;
        }
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => {
                tracing::warn!(
                    endpoint_id = %endpoint.id,
                    header = %name,
                    "Skipping invalid custom header"
                );
            }
        }
    }

    for (name, value) in signed.pairs() {
        // Header values built from a UUID, an event type and digits are ASCII
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(name, value);
        }
    }

    headers
}
