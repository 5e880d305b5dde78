//! Endpoint registry: CRUD and validation for tenant webhook endpoints.
//!
//! Secrets are sealed with the organization's key before they reach the
//! store and are never handed back; reads return an [`EndpointView`].

use std::collections::HashMap;
use std::sync::Arc;

use reqwest::header::{HeaderName, HeaderValue};
use serde::Deserialize;
use uuid::Uuid;

use keel_common::config::AppConfig;
use keel_common::crypto::KeyManager;
use keel_common::error::AppError;
use keel_common::store::{EndpointChanges, NewEndpoint, WebhookStore};
use keel_common::types::{EndpointView, WebhookEndpoint};

/// Minimum secret length, in characters.
pub const MIN_SECRET_LENGTH: usize = 16;

const MAX_NAME_LENGTH: usize = 255;
const MAX_URL_LENGTH: usize = 2048;

/// Values used when a create request leaves them out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointDefaults {
    pub retry_count: i32,
    pub timeout_seconds: i32,
}

impl Default for EndpointDefaults {
    fn default() -> Self {
        Self {
            retry_count: 5,
            timeout_seconds: 30,
        }
    }
}

impl EndpointDefaults {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            retry_count: config.webhook_default_retry_count,
            timeout_seconds: config.webhook_default_timeout_seconds,
        }
    }
}

/// Parameters for creating an endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateEndpointParams {
    pub name: String,
    pub url: String,
    pub secret: String,
    pub event_types: Vec<String>,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    pub retry_count: Option<i32>,
    pub timeout_seconds: Option<i32>,
    pub enabled: Option<bool>,
}

/// Partial update. Omitted fields keep their current value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateEndpointParams {
    pub name: Option<String>,
    pub url: Option<String>,
    pub secret: Option<String>,
    pub event_types: Option<Vec<String>>,
    pub headers: Option<HashMap<String, String>>,
    pub retry_count: Option<i32>,
    pub timeout_seconds: Option<i32>,
    pub enabled: Option<bool>,
}

pub struct EndpointRegistry {
    store: Arc<dyn WebhookStore>,
    keys: Arc<dyn KeyManager>,
    defaults: EndpointDefaults,
}

impl EndpointRegistry {
    pub fn new(
        store: Arc<dyn WebhookStore>,
        keys: Arc<dyn KeyManager>,
        defaults: EndpointDefaults,
    ) -> Self {
        Self {
            store,
            keys,
            defaults,
        }
    }

    pub async fn create(
        &self,
        org_id: Uuid,
        params: CreateEndpointParams,
    ) -> Result<EndpointView, AppError> {
        let name = validate_name(&params.name)?;
        validate_url(&params.url)?;
        validate_secret(&params.secret)?;
        let event_types = validate_event_types(&params.event_types)?;
        let custom_headers = params.headers.unwrap_or_default();
        validate_headers(&custom_headers)?;
        let retry_count = params.retry_count.unwrap_or(self.defaults.retry_count);
        validate_retry_count(retry_count)?;
        let timeout_seconds = params
            .timeout_seconds
            .unwrap_or(self.defaults.timeout_seconds);
        validate_timeout(timeout_seconds)?;

        let secret_encrypted = self.keys.encrypt(org_id, &params.secret)?;

        let endpoint = self
            .store
            .insert_endpoint(NewEndpoint {
                org_id,
                name,
                url: params.url.trim().to_string(),
                secret_encrypted,
                event_types,
                enabled: params.enabled.unwrap_or(true),
                custom_headers,
                retry_count,
                timeout_seconds,
            })
            .await?;

        tracing::info!(
            endpoint_id = %endpoint.id,
            org_id = %org_id,
            event_types = ?endpoint.event_types,
            "Webhook endpoint created"
        );

        Ok(EndpointView::from(&endpoint))
    }

    pub async fn get(&self, org_id: Uuid, endpoint_id: Uuid) -> Result<EndpointView, AppError> {
        let endpoint = self.load(org_id, endpoint_id).await?;
        Ok(EndpointView::from(&endpoint))
    }

    /// The stored endpoint, secret still sealed. Another organization's
    /// endpoint is reported exactly like a missing one.
    pub async fn load(&self, org_id: Uuid, endpoint_id: Uuid) -> Result<WebhookEndpoint, AppError> {
        self.store
            .get_endpoint(org_id, endpoint_id)
            .await?
            .ok_or_else(|| not_found(endpoint_id))
    }

    /// Newest first.
    pub async fn list(&self, org_id: Uuid) -> Result<Vec<EndpointView>, AppError> {
        let endpoints = self.store.list_endpoints(org_id).await?;
        Ok(endpoints.iter().map(EndpointView::from).collect())
    }

    pub async fn update(
        &self,
        org_id: Uuid,
        endpoint_id: Uuid,
        params: UpdateEndpointParams,
    ) -> Result<EndpointView, AppError> {
        let mut changes = EndpointChanges {
            enabled: params.enabled,
            ..Default::default()
        };

        if let Some(name) = &params.name {
            changes.name = Some(validate_name(name)?);
        }
        if let Some(url) = &params.url {
            validate_url(url)?;
            changes.url = Some(url.trim().to_string());
        }
        if let Some(event_types) = &params.event_types {
            changes.event_types = Some(validate_event_types(event_types)?);
        }
        if let Some(headers) = params.headers {
            validate_headers(&headers)?;
            changes.custom_headers = Some(headers);
        }
        if let Some(retry_count) = params.retry_count {
            validate_retry_count(retry_count)?;
            changes.retry_count = Some(retry_count);
        }
        if let Some(timeout) = params.timeout_seconds {
            validate_timeout(timeout)?;
            changes.timeout_seconds = Some(timeout);
        }
        if let Some(secret) = &params.secret {
            validate_secret(secret)?;
            changes.secret_encrypted = Some(self.keys.encrypt(org_id, secret)?);
        }

        let rotated = changes.secret_encrypted.is_some();
        let endpoint = self
            .store
            .update_endpoint(org_id, endpoint_id, changes)
            .await?
            .ok_or_else(|| not_found(endpoint_id))?;

        tracing::info!(
            endpoint_id = %endpoint.id,
            org_id = %org_id,
            enabled = endpoint.enabled,
            secret_rotated = rotated,
            "Webhook endpoint updated"
        );

        Ok(EndpointView::from(&endpoint))
    }

    /// Delete an endpoint. Its delivery history is kept.
    pub async fn delete(&self, org_id: Uuid, endpoint_id: Uuid) -> Result<(), AppError> {
        if !self.store.delete_endpoint(org_id, endpoint_id).await? {
            return Err(not_found(endpoint_id));
        }

        tracing::info!(endpoint_id = %endpoint_id, org_id = %org_id, "Webhook endpoint deleted");
        Ok(())
    }
}

fn not_found(endpoint_id: Uuid) -> AppError {
    AppError::NotFound(format!("Webhook endpoint {} not found", endpoint_id))
}

fn validate_name(name: &str) -> Result<String, AppError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(AppError::Validation("name must not be empty".to_string()));
    }
    if name.chars().count() > MAX_NAME_LENGTH {
        return Err(AppError::Validation(format!(
            "name must be at most {} characters",
            MAX_NAME_LENGTH
        )));
    }
    Ok(name.to_string())
}

/// Absolute `http`/`https` URL with a host.
pub fn validate_url(raw: &str) -> Result<(), AppError> {
    let raw = raw.trim();
    if raw.len() > MAX_URL_LENGTH {
        return Err(AppError::Validation(format!(
            "url must be at most {} characters",
            MAX_URL_LENGTH
        )));
    }

    let url = url::Url::parse(raw)
        .map_err(|e| AppError::Validation(format!("Invalid url '{}': {}", raw, e)))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(AppError::Validation(format!(
            "url scheme must be http or https, got '{}'",
            url.scheme()
        )));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(AppError::Validation("url must include a host".to_string()));
    }

    Ok(())
}

pub fn validate_secret(secret: &str) -> Result<(), AppError> {
    if secret.chars().count() < MIN_SECRET_LENGTH {
        return Err(AppError::Validation(format!(
            "secret must be at least {} characters",
            MIN_SECRET_LENGTH
        )));
    }
    Ok(())
}

/// `backup.completed`-style names: lowercase `[a-z0-9_]` segments joined
/// by dots. Types outside the advertised catalogue are accepted.
pub fn is_valid_event_type(event_type: &str) -> bool {
    let segments: Vec<&str> = event_type.split('.').collect();
    segments.len() >= 2
        && segments.iter().all(|segment| {
            !segment.is_empty()
                && segment
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        })
}

/// Non-empty, well-formed, deduplicated in first-seen order.
pub fn validate_event_types(event_types: &[String]) -> Result<Vec<String>, AppError> {
    if event_types.is_empty() {
        return Err(AppError::Validation(
            "event_types must contain at least one event type".to_string(),
        ));
    }

    let mut unique: Vec<String> = Vec::with_capacity(event_types.len());
    for event_type in event_types {
        let event_type = event_type.trim();
        if !is_valid_event_type(event_type) {
            return Err(AppError::Validation(format!(
                "Invalid event type '{}'",
                event_type
            )));
        }
        if !unique.iter().any(|existing| existing == event_type) {
            unique.push(event_type.to_string());
        }
    }
    Ok(unique)
}

fn validate_headers(headers: &HashMap<String, String>) -> Result<(), AppError> {
    for (name, value) in headers {
        HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| AppError::Validation(format!("Invalid header name '{}'", name)))?;
        HeaderValue::from_str(value)
            .map_err(|_| AppError::Validation(format!("Invalid value for header '{}'", name)))?;
    }
    Ok(())
}

fn validate_retry_count(retry_count: i32) -> Result<(), AppError> {
    if retry_count < 1 {
        return Err(AppError::Validation(
            "retry_count must be at least 1".to_string(),
        ));
    }
    Ok(())
}

fn validate_timeout(timeout_seconds: i32) -> Result<(), AppError> {
    if timeout_seconds <= 0 {
        return Err(AppError::Validation(
            "timeout_seconds must be greater than 0".to_string(),
        ));
    }
    Ok(())
}
