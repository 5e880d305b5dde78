use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use uuid::Uuid;

/// Event types the platform currently emits.
///
/// Endpoints may subscribe to types outside this list so producers and
/// consumers can evolve independently; this is the advertised catalogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WebhookEventType {
    #[serde(rename = "backup.started")]
    BackupStarted,
    #[serde(rename = "backup.completed")]
    BackupCompleted,
    #[serde(rename = "backup.failed")]
    BackupFailed,
    #[serde(rename = "restore.completed")]
    RestoreCompleted,
    #[serde(rename = "restore.failed")]
    RestoreFailed,
    #[serde(rename = "dr_test.completed")]
    DrTestCompleted,
    #[serde(rename = "dr_test.failed")]
    DrTestFailed,
    #[serde(rename = "registry.health_changed")]
    RegistryHealthChanged,
    #[serde(rename = "webhook.test")]
    WebhookTest,
}

impl WebhookEventType {
    pub const fn all() -> &'static [WebhookEventType] {
        &[
            WebhookEventType::BackupStarted,
            WebhookEventType::BackupCompleted,
            WebhookEventType::BackupFailed,
            WebhookEventType::RestoreCompleted,
            WebhookEventType::RestoreFailed,
            WebhookEventType::DrTestCompleted,
            WebhookEventType::DrTestFailed,
            WebhookEventType::RegistryHealthChanged,
            WebhookEventType::WebhookTest,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookEventType::BackupStarted => "backup.started",
            WebhookEventType::BackupCompleted => "backup.completed",
            WebhookEventType::BackupFailed => "backup.failed",
            WebhookEventType::RestoreCompleted => "restore.completed",
            WebhookEventType::RestoreFailed => "restore.failed",
            WebhookEventType::DrTestCompleted => "dr_test.completed",
            WebhookEventType::DrTestFailed => "dr_test.failed",
            WebhookEventType::RegistryHealthChanged => "registry.health_changed",
            WebhookEventType::WebhookTest => "webhook.test",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            WebhookEventType::BackupStarted => "A backup job started",
            WebhookEventType::BackupCompleted => "A backup job finished successfully",
            WebhookEventType::BackupFailed => "A backup job failed",
            WebhookEventType::RestoreCompleted => "A restore finished successfully",
            WebhookEventType::RestoreFailed => "A restore failed",
            WebhookEventType::DrTestCompleted => "A disaster-recovery test passed",
            WebhookEventType::DrTestFailed => "A disaster-recovery test failed",
            WebhookEventType::RegistryHealthChanged => "A backup registry changed health state",
            WebhookEventType::WebhookTest => "Connectivity test sent from the admin UI",
        }
    }
}

impl std::fmt::Display for WebhookEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery lifecycle state.
///
/// `Delivered` and `Failed` are terminal; only a manual retry reopens `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Delivering,
    Delivered,
    Failed,
}

impl DeliveryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryStatus::Delivered | DeliveryStatus::Failed)
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryStatus::Pending => write!(f, "pending"),
            DeliveryStatus::Delivering => write!(f, "delivering"),
            DeliveryStatus::Delivered => write!(f, "delivered"),
            DeliveryStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A tenant-configured webhook destination, as stored.
///
/// Holds the encrypted secret and is never serialized to API callers;
/// see [`EndpointView`].
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WebhookEndpoint {
    pub id: Uuid,
    pub org_id: Uuid,
    pub name: String,
    pub url: String,
    pub secret_encrypted: String,
    pub event_types: Vec<String>,
    pub enabled: bool,
    #[sqlx(json)]
    pub custom_headers: HashMap<String, String>,
    pub retry_count: i32,
    pub timeout_seconds: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WebhookEndpoint {
    pub fn subscribes_to(&self, event_type: &str) -> bool {
        self.event_types.iter().any(|et| et == event_type)
    }
}

/// Read-side projection of an endpoint. The secret is reduced to a flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointView {
    pub id: Uuid,
    pub org_id: Uuid,
    pub name: String,
    pub url: String,
    pub secret_configured: bool,
    pub event_types: Vec<String>,
    pub enabled: bool,
    pub custom_headers: HashMap<String, String>,
    pub retry_count: i32,
    pub timeout_seconds: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&WebhookEndpoint> for EndpointView {
    fn from(endpoint: &WebhookEndpoint) -> Self {
        Self {
            id: endpoint.id,
            org_id: endpoint.org_id,
            name: endpoint.name.clone(),
            url: endpoint.url.clone(),
            secret_configured: !endpoint.secret_encrypted.is_empty(),
            event_types: endpoint.event_types.clone(),
            enabled: endpoint.enabled,
            custom_headers: endpoint.custom_headers.clone(),
            retry_count: endpoint.retry_count,
            timeout_seconds: endpoint.timeout_seconds,
            created_at: endpoint.created_at,
            updated_at: endpoint.updated_at,
        }
    }
}

/// One attempt-series of sending an event to an endpoint.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct WebhookDelivery {
    pub id: Uuid,
    pub org_id: Uuid,
    pub endpoint_id: Uuid,
    pub event_type: String,
    /// Immutable copy of the payload sent on every attempt
    #[serde(serialize_with = "serialize_payload")]
    pub payload: Vec<u8>,
    pub status: DeliveryStatus,
    pub attempt_number: i32,
    /// Copied from the endpoint's `retry_count` when the delivery was created
    pub max_attempts: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub response_status: Option<i32>,
    pub error_message: Option<String>,
    pub duration_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    /// When the current `Delivering` lease was taken
    pub claimed_at: Option<DateTime<Utc>>,
    /// Fencing token of the current lease; only its holder records the attempt
    #[serde(skip_serializing)]
    pub lease_id: Option<Uuid>,
    /// Fixed at claim time; the sweep reclaims the lease only after this
    pub lease_expires_at: Option<DateTime<Utc>>,
}

impl WebhookDelivery {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == DeliveryStatus::Pending && self.next_retry_at.is_none_or(|at| at <= now)
    }
}

/// Audit record of a single executed attempt.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct WebhookDeliveryAttempt {
    pub id: Uuid,
    pub delivery_id: Uuid,
    pub org_id: Uuid,
    pub attempt_number: i32,
    pub response_status: Option<i32>,
    pub error_message: Option<String>,
    pub duration_ms: i64,
    pub attempted_at: DateTime<Utc>,
}

fn serialize_payload<S: Serializer>(payload: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    match serde_json::from_slice::<serde_json::Value>(payload) {
        Ok(value) => value.serialize(serializer),
        Err(_) => serializer.serialize_str(&String::from_utf8_lossy(payload)),
    }
}
