//! Event fan-out.
//!
//! `dispatch` turns one event into one `Pending` delivery per subscribed,
//! enabled endpoint and returns without any network I/O; the worker pool
//! does the sending. `test_deliver` is the one synchronous path: a single
//! signed attempt whose outcome goes straight back to the caller.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use keel_common::crypto::KeyManager;
use keel_common::error::AppError;
use keel_common::events::{DomainEvent, WebhookEvent, WebhookTest};
use keel_common::store::{NewDelivery, WebhookStore};
use keel_common::types::{WebhookDelivery, WebhookEventType};
use keel_notifier::retry;
use keel_notifier::WebhookClient;

use crate::endpoints::is_valid_event_type;

/// Outcome of a synchronous test delivery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestDeliveryResult {
    pub delivery_id: Uuid,
    pub success: bool,
    pub response_status: Option<i32>,
    pub duration_ms: i64,
    pub error_message: Option<String>,
}

pub struct Dispatcher {
    store: Arc<dyn WebhookStore>,
    keys: Arc<dyn KeyManager>,
    client: WebhookClient,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn WebhookStore>,
        keys: Arc<dyn KeyManager>,
        client: WebhookClient,
    ) -> Self {
        Self {
            store,
            keys,
            client,
        }
    }

    /// Queue one delivery per enabled endpoint of the event's organization
    /// that subscribes to its type. Returns the created deliveries.
    pub async fn dispatch(&self, event: &WebhookEvent) -> Result<Vec<WebhookDelivery>, AppError> {
        if !is_valid_event_type(&event.event_type) {
            return Err(AppError::Validation(format!(
                "Invalid event type '{}'",
                event.event_type
            )));
        }

        let endpoints = self
            .store
            .list_subscribed_endpoints(event.org_id, &event.event_type)
            .await?;

        let mut deliveries = Vec::with_capacity(endpoints.len());
        for endpoint in &endpoints {
            let delivery = self
                .store
                .insert_delivery(NewDelivery::pending(
                    endpoint,
                    &event.event_type,
                    event.payload.clone(),
                ))
                .await?;

            tracing::debug!(
                delivery_id = %delivery.id,
                endpoint_id = %endpoint.id,
                max_attempts = delivery.max_attempts,
                "Delivery queued"
            );
            deliveries.push(delivery);
        }

        tracing::info!(
            org_id = %event.org_id,
            event_type = %event.event_type,
            deliveries = deliveries.len(),
            "Event dispatched"
        );

        Ok(deliveries)
    }

    /// Serialize a typed event and dispatch it.
    pub async fn dispatch_domain(
        &self,
        org_id: Uuid,
        event: DomainEvent,
    ) -> Result<Vec<WebhookDelivery>, AppError> {
        let event = WebhookEvent::from_domain(org_id, event)?;
        self.dispatch(&event).await
    }

    /// Send one signed `webhook.test` envelope to the endpoint right now.
    ///
    /// Works on disabled endpoints too. The attempt is recorded as a delivery
    /// that is already terminal, so it never enters the retry queue.
    /// `event_type` only sets the `X-Webhook-Event` header, letting receivers
    /// exercise their routing; the body is always the test envelope.
    pub async fn test_deliver(
        &self,
        org_id: Uuid,
        endpoint_id: Uuid,
        event_type: Option<&str>,
    ) -> Result<TestDeliveryResult, AppError> {
        let event_type = event_type.unwrap_or(WebhookEventType::WebhookTest.as_str());
        if !is_valid_event_type(event_type) {
            return Err(AppError::Validation(format!(
                "Invalid event type '{}'",
                event_type
            )));
        }

        let endpoint = self
            .store
            .get_endpoint(org_id, endpoint_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("Webhook endpoint {} not found", endpoint_id))
            })?;

        let secret = self.keys.decrypt(org_id, &endpoint.secret_encrypted)?;
        let event = WebhookEvent::from_domain(
            org_id,
            DomainEvent::WebhookTest(WebhookTest {
                endpoint_id,
                message: format!("Test delivery to endpoint '{}'", endpoint.name),
            }),
        )?;

        let delivery_id = Uuid::new_v4();
        let result = self
            .client
            .deliver(&endpoint, &secret, delivery_id, event_type, &event.payload)
            .await;

        self.store
            .insert_delivery(NewDelivery {
                id: delivery_id,
                org_id,
                endpoint_id,
                event_type: event_type.to_string(),
                payload: event.payload,
                max_attempts: 1,
                created_at: Utc::now(),
                resolved: Some(retry::settle(1, &result)),
            })
            .await?;

        tracing::info!(
            delivery_id = %delivery_id,
            endpoint_id = %endpoint_id,
            org_id = %org_id,
            success = result.is_success(),
            response_status = ?result.response_status,
            duration_ms = result.duration_ms,
            "Test delivery sent"
        );

        Ok(TestDeliveryResult {
            delivery_id,
            success: result.is_success(),
            response_status: result.response_status,
            duration_ms: result.duration_ms,
            error_message: result.error_message,
        })
    }
}
