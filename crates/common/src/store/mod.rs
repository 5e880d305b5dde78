//! Persistence seam for endpoints and deliveries.
//!
//! All cross-worker coordination goes through the conditional updates on
//! [`DeliveryStore`]: `claim` only moves `Pending` rows whose retry time has
//! come, `complete_attempt` only touches `Delivering` rows, and
//! `reopen_failed` only touches `Failed` rows. Two workers therefore never
//! hold the same delivery.

pub mod memory;
pub mod postgres;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::AppError;
use crate::types::{DeliveryStatus, WebhookDelivery, WebhookDeliveryAttempt, WebhookEndpoint};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Fields for a new endpoint. The secret is already encrypted.
#[derive(Debug, Clone)]
pub struct NewEndpoint {
    pub org_id: Uuid,
    pub name: String,
    pub url: String,
    pub secret_encrypted: String,
    pub event_types: Vec<String>,
    pub enabled: bool,
    pub custom_headers: HashMap<String, String>,
    pub retry_count: i32,
    pub timeout_seconds: i32,
}

/// Partial update; `None` leaves the stored value untouched.
#[derive(Debug, Clone, Default)]
pub struct EndpointChanges {
    pub name: Option<String>,
    pub url: Option<String>,
    pub secret_encrypted: Option<String>,
    pub event_types: Option<Vec<String>>,
    pub enabled: Option<bool>,
    pub custom_headers: Option<HashMap<String, String>>,
    pub retry_count: Option<i32>,
    pub timeout_seconds: Option<i32>,
}

/// Fields for a new delivery row.
#[derive(Debug, Clone)]
pub struct NewDelivery {
    /// Chosen up front so a synchronous attempt can sign with it
    pub id: Uuid,
    pub org_id: Uuid,
    pub endpoint_id: Uuid,
    pub event_type: String,
    pub payload: Vec<u8>,
    pub max_attempts: i32,
    pub created_at: DateTime<Utc>,
    /// Present for deliveries that were resolved synchronously (test sends).
    pub resolved: Option<AttemptResolution>,
}

impl NewDelivery {
    /// A delivery queued for the worker pool, due immediately.
    pub fn pending(endpoint: &WebhookEndpoint, event_type: &str, payload: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4(),
            org_id: endpoint.org_id,
            endpoint_id: endpoint.id,
            event_type: event_type.to_string(),
            payload,
            max_attempts: endpoint.retry_count.max(1),
            created_at: Utc::now(),
            resolved: None,
        }
    }
}

/// Where a delivery goes after an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextState {
    Delivered,
    Failed,
    Retry {
        attempt_number: i32,
        next_retry_at: DateTime<Utc>,
    },
}

/// Outcome of one executed attempt, ready to persist.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptResolution {
    /// The attempt that just ran
    pub attempt_number: i32,
    pub response_status: Option<i32>,
    pub error_message: Option<String>,
    pub duration_ms: i64,
    pub attempted_at: DateTime<Utc>,
    pub next: NextState,
}

impl AttemptResolution {
    /// Delivery status after this attempt.
    pub fn status(&self) -> DeliveryStatus {
        match self.next {
            NextState::Delivered => DeliveryStatus::Delivered,
            NextState::Failed => DeliveryStatus::Failed,
            NextState::Retry { .. } => DeliveryStatus::Pending,
        }
    }

    /// `attempt_number` stored on the delivery: the attempt that ran for
    /// terminal states, the upcoming one for retries.
    pub fn stored_attempt_number(&self) -> i32 {
        match self.next {
            NextState::Retry { attempt_number, .. } => attempt_number,
            _ => self.attempt_number,
        }
    }

    pub fn next_retry_at(&self) -> Option<DateTime<Utc>> {
        match self.next {
            NextState::Retry { next_retry_at, .. } => Some(next_retry_at),
            _ => None,
        }
    }

    pub fn delivered_at(&self) -> Option<DateTime<Utc>> {
        (self.next == NextState::Delivered).then_some(self.attempted_at)
    }
}

#[async_trait]
pub trait EndpointStore: Send + Sync {
    async fn insert_endpoint(&self, endpoint: NewEndpoint) -> Result<WebhookEndpoint, AppError>;

    /// Org-scoped lookup. Another tenant's endpoint is reported as absent.
    async fn get_endpoint(
        &self,
        org_id: Uuid,
        endpoint_id: Uuid,
    ) -> Result<Option<WebhookEndpoint>, AppError>;

    async fn list_endpoints(&self, org_id: Uuid) -> Result<Vec<WebhookEndpoint>, AppError>;

    /// Enabled endpoints of `org_id` subscribed to `event_type`.
    async fn list_subscribed_endpoints(
        &self,
        org_id: Uuid,
        event_type: &str,
    ) -> Result<Vec<WebhookEndpoint>, AppError>;

    async fn update_endpoint(
        &self,
        org_id: Uuid,
        endpoint_id: Uuid,
        changes: EndpointChanges,
    ) -> Result<Option<WebhookEndpoint>, AppError>;

    /// Returns true if a row was deleted. Delivery history is kept.
    async fn delete_endpoint(&self, org_id: Uuid, endpoint_id: Uuid) -> Result<bool, AppError>;
}

#[async_trait]
pub trait DeliveryStore: Send + Sync {
    async fn insert_delivery(&self, delivery: NewDelivery) -> Result<WebhookDelivery, AppError>;

    async fn get_delivery(
        &self,
        org_id: Uuid,
        delivery_id: Uuid,
    ) -> Result<Option<WebhookDelivery>, AppError>;

    /// Newest first.
    async fn list_deliveries(
        &self,
        org_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<WebhookDelivery>, AppError>;

    /// Newest first.
    async fn list_endpoint_deliveries(
        &self,
        org_id: Uuid,
        endpoint_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<WebhookDelivery>, AppError>;

    /// Attempt log of a delivery, oldest first.
    async fn list_attempts(
        &self,
        org_id: Uuid,
        delivery_id: Uuid,
    ) -> Result<Vec<WebhookDeliveryAttempt>, AppError>;

    /// Compare-and-set a single due `Pending` delivery to `Delivering`.
    ///
    /// The claim takes a fresh lease: a new `lease_id` and a deadline of twice
    /// the endpoint's timeout as it stands now. Deliveries whose endpoint no
    /// longer exists use `fallback_timeout_seconds`.
    ///
    /// Returns `None` if the row is not due, not pending, or already claimed.
    async fn claim(
        &self,
        delivery_id: Uuid,
        now: DateTime<Utc>,
        fallback_timeout_seconds: i32,
    ) -> Result<Option<WebhookDelivery>, AppError>;

    /// Claim up to `limit` due deliveries, oldest due first. Leases are
    /// taken as in [`DeliveryStore::claim`].
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: i64,
        fallback_timeout_seconds: i32,
    ) -> Result<Vec<WebhookDelivery>, AppError>;

    /// Persist an attempt's outcome and append it to the attempt log.
    ///
    /// Only applies while the delivery is `Delivering` under `lease_id`;
    /// returns `None` if the lease was lost (e.g. reclaimed by the sweep and
    /// claimed again).
    async fn complete_attempt(
        &self,
        delivery_id: Uuid,
        lease_id: Uuid,
        resolution: AttemptResolution,
    ) -> Result<Option<WebhookDelivery>, AppError>;

    /// Move `Delivering` rows whose lease deadline has passed back to
    /// `Pending`. Returns the reclaimed delivery ids.
    async fn reclaim_orphaned(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, AppError>;

    /// Reopen a `Failed` delivery: attempt 1, `Pending`, immediately due.
    ///
    /// Returns `None` if the delivery is missing or not `Failed`.
    async fn reopen_failed(
        &self,
        org_id: Uuid,
        delivery_id: Uuid,
    ) -> Result<Option<WebhookDelivery>, AppError>;
}

/// Both halves of the store, as used by the services.
pub trait WebhookStore: EndpointStore + DeliveryStore {}

impl<T: EndpointStore + DeliveryStore> WebhookStore for T {}
