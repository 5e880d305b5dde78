//! Domain events and their webhook wire envelope.
//!
//! Each event type has its own struct so the payload schema is fixed at
//! compile time. Producers build a [`DomainEvent`] and hand the dispatcher a
//! [`WebhookEvent`], which carries the already-serialized bytes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::types::WebhookEventType;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupStarted {
    pub backup_id: Uuid,
    pub policy_id: Uuid,
    pub source: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupCompleted {
    pub backup_id: Uuid,
    pub policy_id: Uuid,
    pub source: String,
    pub size_bytes: u64,
    pub duration_seconds: u64,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupFailed {
    pub backup_id: Uuid,
    pub policy_id: Uuid,
    pub source: String,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreFinished {
    pub restore_id: Uuid,
    pub backup_id: Uuid,
    pub target: String,
    pub reason: Option<String>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrTestFinished {
    pub test_id: Uuid,
    pub plan_id: Uuid,
    pub rto_seconds: Option<u64>,
    pub rpo_seconds: Option<u64>,
    pub findings: Vec<String>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryHealth {
    Healthy,
    Degraded,
    Unreachable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryHealthChanged {
    pub registry_id: Uuid,
    pub previous: RegistryHealth,
    pub current: RegistryHealth,
    pub detail: Option<String>,
    pub changed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookTest {
    pub endpoint_id: Uuid,
    pub message: String,
}

/// Every event the platform can publish to webhooks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum DomainEvent {
    #[serde(rename = "backup.started")]
    BackupStarted(BackupStarted),
    #[serde(rename = "backup.completed")]
    BackupCompleted(BackupCompleted),
    #[serde(rename = "backup.failed")]
    BackupFailed(BackupFailed),
    #[serde(rename = "restore.completed")]
    RestoreCompleted(RestoreFinished),
    #[serde(rename = "restore.failed")]
    RestoreFailed(RestoreFinished),
    #[serde(rename = "dr_test.completed")]
    DrTestCompleted(DrTestFinished),
    #[serde(rename = "dr_test.failed")]
    DrTestFailed(DrTestFinished),
    #[serde(rename = "registry.health_changed")]
    RegistryHealthChanged(RegistryHealthChanged),
    #[serde(rename = "webhook.test")]
    WebhookTest(WebhookTest),
}

impl DomainEvent {
    pub fn event_type(&self) -> WebhookEventType {
        match self {
            DomainEvent::BackupStarted(_) => WebhookEventType::BackupStarted,
            DomainEvent::BackupCompleted(_) => WebhookEventType::BackupCompleted,
            DomainEvent::BackupFailed(_) => WebhookEventType::BackupFailed,
            DomainEvent::RestoreCompleted(_) => WebhookEventType::RestoreCompleted,
            DomainEvent::RestoreFailed(_) => WebhookEventType::RestoreFailed,
            DomainEvent::DrTestCompleted(_) => WebhookEventType::DrTestCompleted,
            DomainEvent::DrTestFailed(_) => WebhookEventType::DrTestFailed,
            DomainEvent::RegistryHealthChanged(_) => WebhookEventType::RegistryHealthChanged,
            DomainEvent::WebhookTest(_) => WebhookEventType::WebhookTest,
        }
    }
}

/// Wire body sent to receivers: `{ "id", "created_at", "type", "data" }`.
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: DomainEvent,
}

/// An event handed to the dispatcher. The payload is opaque from here on.
#[derive(Debug, Clone)]
pub struct WebhookEvent {
    pub org_id: Uuid,
    pub event_type: String,
    pub payload: Vec<u8>,
}

impl WebhookEvent {
    pub fn new(org_id: Uuid, event_type: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            org_id,
            event_type: event_type.into(),
            payload,
        }
    }

    /// Serialize a domain event into its envelope.
    pub fn from_domain(org_id: Uuid, event: DomainEvent) -> Result<Self, AppError> {
        let event_type = event.event_type().as_str().to_string();
        let envelope = EventEnvelope {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            event,
        };
        let payload = serde_json::to_vec(&envelope)
            .map_err(|e| AppError::Internal(format!("Failed to serialize event: {}", e)))?;

        Ok(Self {
            org_id,
            event_type,
            payload,
        })
    }
}
