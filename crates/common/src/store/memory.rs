//! In-process store with the same conditional-update semantics as Postgres.
//!
//! Used by tests and local development. A single mutex serializes every
//! operation, which makes each compare-and-set trivially atomic.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use super::{
    AttemptResolution, DeliveryStore, EndpointChanges, EndpointStore, NewDelivery, NewEndpoint,
};
use crate::error::AppError;
use crate::types::{DeliveryStatus, WebhookDelivery, WebhookDeliveryAttempt, WebhookEndpoint};

#[derive(Default)]
struct Inner {
    seq: u64,
    endpoints: HashMap<Uuid, (u64, WebhookEndpoint)>,
    deliveries: HashMap<Uuid, (u64, WebhookDelivery)>,
    attempts: Vec<WebhookDeliveryAttempt>,
}

impl Inner {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, AppError> {
        self.inner
            .lock()
            .map_err(|_| AppError::Internal("memory store lock poisoned".to_string()))
    }

    /// Overwrite a delivery as-is. Lets tests stage states such as a stale lease.
    pub fn put_delivery(&self, delivery: WebhookDelivery) -> Result<(), AppError> {
        let mut inner = self.lock()?;
        let seq = match inner.deliveries.get(&delivery.id) {
            Some((seq, _)) => *seq,
            None => inner.next_seq(),
        };
        inner.deliveries.insert(delivery.id, (seq, delivery));
        Ok(())
    }
}

fn newest_first<T: Clone>(
    mut rows: Vec<&(u64, T)>,
    created: impl Fn(&T) -> DateTime<Utc>,
) -> Vec<T> {
    rows.sort_by(|(sa, a), (sb, b)| created(b).cmp(&created(a)).then(sb.cmp(sa)));
    rows.into_iter().map(|(_, row)| row.clone()).collect()
}

fn page<T>(rows: Vec<T>, limit: i64, offset: i64) -> Vec<T> {
    rows.into_iter()
        .skip(offset.max(0) as usize)
        .take(limit.max(0) as usize)
        .collect()
}

#[async_trait]
impl EndpointStore for MemoryStore {
    async fn insert_endpoint(&self, endpoint: NewEndpoint) -> Result<WebhookEndpoint, AppError> {
        let now = Utc::now();
        let row = WebhookEndpoint {
            id: Uuid::new_v4(),
            org_id: endpoint.org_id,
            name: endpoint.name,
            url: endpoint.url,
            secret_encrypted: endpoint.secret_encrypted,
            event_types: endpoint.event_types,
            enabled: endpoint.enabled,
            custom_headers: endpoint.custom_headers,
            retry_count: endpoint.retry_count,
            timeout_seconds: endpoint.timeout_seconds,
            created_at: now,
            updated_at: now,
        };

        let mut inner = self.lock()?;
        let seq = inner.next_seq();
        inner.endpoints.insert(row.id, (seq, row.clone()));
        Ok(row)
    }

    async fn get_endpoint(
        &self,
        org_id: Uuid,
        endpoint_id: Uuid,
    ) -> Result<Option<WebhookEndpoint>, AppError> {
        let inner = self.lock()?;
        Ok(inner
            .endpoints
            .get(&endpoint_id)
            .map(|(_, e)| e)
            .filter(|e| e.org_id == org_id)
            .cloned())
    }

    async fn list_endpoints(&self, org_id: Uuid) -> Result<Vec<WebhookEndpoint>, AppError> {
        let inner = self.lock()?;
        let rows = inner
            .endpoints
            .values()
            .filter(|(_, e)| e.org_id == org_id)
            .collect();
        Ok(newest_first(rows, |e| e.created_at))
    }

    async fn list_subscribed_endpoints(
        &self,
        org_id: Uuid,
        event_type: &str,
    ) -> Result<Vec<WebhookEndpoint>, AppError> {
        let inner = self.lock()?;
        let rows = inner
            .endpoints
            .values()
            .filter(|(_, e)| e.org_id == org_id && e.enabled && e.subscribes_to(event_type))
            .collect();
        Ok(newest_first(rows, |e| e.created_at))
    }

    async fn update_endpoint(
        &self,
        org_id: Uuid,
        endpoint_id: Uuid,
        changes: EndpointChanges,
    ) -> Result<Option<WebhookEndpoint>, AppError> {
        let mut inner = self.lock()?;
        let Some((_, endpoint)) = inner
            .endpoints
            .get_mut(&endpoint_id)
            .filter(|(_, e)| e.org_id == org_id)
        else {
            return Ok(None);
        };

        if let Some(name) = changes.name {
            endpoint.name = name;
        }
        if let Some(url) = changes.url {
            endpoint.url = url;
        }
        if let Some(secret) = changes.secret_encrypted {
            endpoint.secret_encrypted = secret;
        }
        if let Some(event_types) = changes.event_types {
            endpoint.event_types = event_types;
        }
        if let Some(enabled) = changes.enabled {
            endpoint.enabled = enabled;
        }
        if let Some(headers) = changes.custom_headers {
            endpoint.custom_headers = headers;
        }
        if let Some(retry_count) = changes.retry_count {
            endpoint.retry_count = retry_count;
        }
        if let Some(timeout) = changes.timeout_seconds {
            endpoint.timeout_seconds = timeout;
        }
        endpoint.updated_at = Utc::now();

        Ok(Some(endpoint.clone()))
    }

    async fn delete_endpoint(&self, org_id: Uuid, endpoint_id: Uuid) -> Result<bool, AppError> {
        let mut inner = self.lock()?;
        let owned = inner
            .endpoints
            .get(&endpoint_id)
            .is_some_and(|(_, e)| e.org_id == org_id);
        if owned {
            inner.endpoints.remove(&endpoint_id);
        }
        Ok(owned)
    }
}

#[async_trait]
impl DeliveryStore for MemoryStore {
    async fn insert_delivery(&self, delivery: NewDelivery) -> Result<WebhookDelivery, AppError> {
        let mut row = WebhookDelivery {
            id: delivery.id,
            org_id: delivery.org_id,
            endpoint_id: delivery.endpoint_id,
            event_type: delivery.event_type,
            payload: delivery.payload,
            status: DeliveryStatus::Pending,
            attempt_number: 1,
            max_attempts: delivery.max_attempts,
            next_retry_at: Some(delivery.created_at),
            response_status: None,
            error_message: None,
            duration_ms: None,
            created_at: delivery.created_at,
            delivered_at: None,
            claimed_at: None,
            lease_id: None,
            lease_expires_at: None,
        };

        let mut inner = self.lock()?;
        if let Some(resolution) = delivery.resolved {
            apply_resolution(&mut row, &resolution);
            inner.attempts.push(attempt_row(&row, &resolution));
        }
        let seq = inner.next_seq();
        inner.deliveries.insert(row.id, (seq, row.clone()));
        Ok(row)
    }

    async fn get_delivery(
        &self,
        org_id: Uuid,
        delivery_id: Uuid,
    ) -> Result<Option<WebhookDelivery>, AppError> {
        let inner = self.lock()?;
        Ok(inner
            .deliveries
            .get(&delivery_id)
            .map(|(_, d)| d)
            .filter(|d| d.org_id == org_id)
            .cloned())
    }

    async fn list_deliveries(
        &self,
        org_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<WebhookDelivery>, AppError> {
        let inner = self.lock()?;
        let rows = inner
            .deliveries
            .values()
            .filter(|(_, d)| d.org_id == org_id)
            .collect();
        Ok(page(newest_first(rows, |d| d.created_at), limit, offset))
    }

    async fn list_endpoint_deliveries(
        &self,
        org_id: Uuid,
        endpoint_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<WebhookDelivery>, AppError> {
        let inner = self.lock()?;
        let rows = inner
            .deliveries
            .values()
            .filter(|(_, d)| d.org_id == org_id && d.endpoint_id == endpoint_id)
            .collect();
        Ok(page(newest_first(rows, |d| d.created_at), limit, offset))
    }

    async fn list_attempts(
        &self,
        org_id: Uuid,
        delivery_id: Uuid,
    ) -> Result<Vec<WebhookDeliveryAttempt>, AppError> {
        let inner = self.lock()?;
        Ok(inner
            .attempts
            .iter()
            .filter(|a| a.org_id == org_id && a.delivery_id == delivery_id)
            .cloned()
            .collect())
    }

    async fn claim(
        &self,
        delivery_id: Uuid,
        now: DateTime<Utc>,
        fallback_timeout_seconds: i32,
    ) -> Result<Option<WebhookDelivery>, AppError> {
        let mut guard = self.lock()?;
        let inner = &mut *guard;
        let Some((_, delivery)) = inner.deliveries.get_mut(&delivery_id) else {
            return Ok(None);
        };
        if !delivery.is_due(now) {
            return Ok(None);
        }

        let timeout = lease_timeout(&inner.endpoints, delivery, fallback_timeout_seconds);
        take_lease(delivery, now, timeout);
        Ok(Some(delivery.clone()))
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: i64,
        fallback_timeout_seconds: i32,
    ) -> Result<Vec<WebhookDelivery>, AppError> {
        let mut guard = self.lock()?;
        let inner = &mut *guard;
        let mut due: Vec<(Option<DateTime<Utc>>, u64, Uuid)> = inner
            .deliveries
            .values()
            .filter(|(_, d)| d.is_due(now))
            .map(|(seq, d)| (d.next_retry_at, *seq, d.id))
            .collect();
        // NULLS FIRST, like the Postgres ordering
        due.sort();
        due.truncate(limit.max(0) as usize);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, _, id) in due {
            if let Some((_, delivery)) = inner.deliveries.get_mut(&id) {
                let timeout = lease_timeout(&inner.endpoints, delivery, fallback_timeout_seconds);
                take_lease(delivery, now, timeout);
                claimed.push(delivery.clone());
            }
        }
        Ok(claimed)
    }

    async fn complete_attempt(
        &self,
        delivery_id: Uuid,
        lease_id: Uuid,
        resolution: AttemptResolution,
    ) -> Result<Option<WebhookDelivery>, AppError> {
        let mut inner = self.lock()?;
        let Some((_, delivery)) = inner.deliveries.get_mut(&delivery_id).filter(|(_, d)| {
            d.status == DeliveryStatus::Delivering && d.lease_id == Some(lease_id)
        }) else {
            return Ok(None);
        };

        apply_resolution(delivery, &resolution);
        let updated = delivery.clone();
        inner.attempts.push(attempt_row(&updated, &resolution));
        Ok(Some(updated))
    }

    async fn reclaim_orphaned(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, AppError> {
        let mut inner = self.lock()?;
        let mut reclaimed = Vec::new();

        for (_, delivery) in inner.deliveries.values_mut() {
            if delivery.status != DeliveryStatus::Delivering {
                continue;
            }
            if delivery.lease_expires_at.is_none_or(|deadline| deadline < now) {
                delivery.status = DeliveryStatus::Pending;
                delivery.next_retry_at = Some(now);
                release_lease(delivery);
                reclaimed.push(delivery.id);
            }
        }
        Ok(reclaimed)
    }

    async fn reopen_failed(
        &self,
        org_id: Uuid,
        delivery_id: Uuid,
    ) -> Result<Option<WebhookDelivery>, AppError> {
        let mut inner = self.lock()?;
        let Some((_, delivery)) = inner
            .deliveries
            .get_mut(&delivery_id)
            .filter(|(_, d)| d.org_id == org_id && d.status == DeliveryStatus::Failed)
        else {
            return Ok(None);
        };

        delivery.status = DeliveryStatus::Pending;
        delivery.attempt_number = 1;
        delivery.next_retry_at = None;
        delivery.error_message = None;
        release_lease(delivery);
        Ok(Some(delivery.clone()))
    }
}

/// Timeout a new lease is sized from, read once at claim time.
fn lease_timeout(
    endpoints: &HashMap<Uuid, (u64, WebhookEndpoint)>,
    delivery: &WebhookDelivery,
    fallback_timeout_seconds: i32,
) -> i32 {
    endpoints
        .get(&delivery.endpoint_id)
        .map(|(_, e)| e.timeout_seconds)
        .unwrap_or(fallback_timeout_seconds)
}

fn take_lease(delivery: &mut WebhookDelivery, now: DateTime<Utc>, timeout_seconds: i32) {
    delivery.status = DeliveryStatus::Delivering;
    delivery.claimed_at = Some(now);
    delivery.lease_id = Some(Uuid::new_v4());
    delivery.lease_expires_at = Some(now + Duration::seconds(2 * i64::from(timeout_seconds)));
}

fn release_lease(delivery: &mut WebhookDelivery) {
    delivery.claimed_at = None;
    delivery.lease_id = None;
    delivery.lease_expires_at = None;
}

fn apply_resolution(delivery: &mut WebhookDelivery, resolution: &AttemptResolution) {
    delivery.status = resolution.status();
    delivery.attempt_number = resolution.stored_attempt_number();
    delivery.next_retry_at = resolution.next_retry_at();
    delivery.response_status = resolution.response_status;
    delivery.error_message = resolution.error_message.clone();
    delivery.duration_ms = Some(resolution.duration_ms);
    release_lease(delivery);
    if let Some(at) = resolution.delivered_at() {
        delivery.delivered_at = Some(at);
    }
}

fn attempt_row(delivery: &WebhookDelivery, resolution: &AttemptResolution) -> WebhookDeliveryAttempt {
    WebhookDeliveryAttempt {
        id: Uuid::new_v4(),
        delivery_id: delivery.id,
        org_id: delivery.org_id,
        attempt_number: resolution.attempt_number,
        response_status: resolution.response_status,
        error_message: resolution.error_message.clone(),
        duration_ms: resolution.duration_ms,
        attempted_at: resolution.attempted_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NextState;

    fn new_endpoint(org_id: Uuid) -> NewEndpoint {
        NewEndpoint {
            org_id,
            name: "ops".to_string(),
            url: "https://hooks.example.com/keel".to_string(),
            secret_encrypted: "sealed".to_string(),
            event_types: vec!["backup.completed".to_string()],
            enabled: true,
            custom_headers: HashMap::new(),
            retry_count: 3,
            timeout_seconds: 10,
        }
    }

    #[tokio::test]
    async fn test_endpoint_scoped_to_org() {
        let store = MemoryStore::new();
        let org = Uuid::new_v4();
        let endpoint = store.insert_endpoint(new_endpoint(org)).await.unwrap();

        assert!(store.get_endpoint(org, endpoint.id).await.unwrap().is_some());
        assert!(
            store
                .get_endpoint(Uuid::new_v4(), endpoint.id)
                .await
                .unwrap()
                .is_none()
        );
        assert!(!store.delete_endpoint(Uuid::new_v4(), endpoint.id).await.unwrap());
        assert!(store.delete_endpoint(org, endpoint.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let store = MemoryStore::new();
        let endpoint = store.insert_endpoint(new_endpoint(Uuid::new_v4())).await.unwrap();
        let delivery = store
            .insert_delivery(NewDelivery::pending(&endpoint, "backup.completed", b"{}".to_vec()))
            .await
            .unwrap();

        let now = Utc::now();
        assert!(store.claim(delivery.id, now, 30).await.unwrap().is_some());
        assert!(store.claim(delivery.id, now, 30).await.unwrap().is_none());
        assert!(store.claim_due(now, 10, 30).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_future_retry_not_claimed() {
        let store = MemoryStore::new();
        let endpoint = store.insert_endpoint(new_endpoint(Uuid::new_v4())).await.unwrap();
        let mut new = NewDelivery::pending(&endpoint, "backup.completed", b"{}".to_vec());
        new.created_at = Utc::now() + Duration::minutes(5);
        store.insert_delivery(new).await.unwrap();

        assert!(store.claim_due(Utc::now(), 10, 30).await.unwrap().is_empty());
        assert_eq!(
            store
                .claim_due(Utc::now() + Duration::minutes(6), 10, 30)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_lease_sized_from_endpoint_timeout() {
        let store = MemoryStore::new();
        let endpoint = store.insert_endpoint(new_endpoint(Uuid::new_v4())).await.unwrap();
        let delivery = store
            .insert_delivery(NewDelivery::pending(&endpoint, "backup.completed", b"{}".to_vec()))
            .await
            .unwrap();

        let now = Utc::now();
        let claimed = store.claim(delivery.id, now, 30).await.unwrap().unwrap();
        assert!(claimed.lease_id.is_some());
        assert_eq!(claimed.claimed_at, Some(now));
        assert_eq!(claimed.lease_expires_at, Some(now + Duration::seconds(20)));
    }

    #[tokio::test]
    async fn test_stale_lease_cannot_complete() {
        let store = MemoryStore::new();
        let endpoint = store.insert_endpoint(new_endpoint(Uuid::new_v4())).await.unwrap();
        let delivery = store
            .insert_delivery(NewDelivery::pending(&endpoint, "backup.completed", b"{}".to_vec()))
            .await
            .unwrap();

        let now = Utc::now();
        let first = store.claim(delivery.id, now, 30).await.unwrap().unwrap();
        let swept = now + Duration::seconds(21);
        assert_eq!(store.reclaim_orphaned(swept).await.unwrap(), vec![delivery.id]);
        let second = store.claim(delivery.id, swept, 30).await.unwrap().unwrap();
        assert_ne!(first.lease_id, second.lease_id);

        let resolution = |next| AttemptResolution {
            attempt_number: 1,
            response_status: Some(200),
            error_message: None,
            duration_ms: 5,
            attempted_at: swept,
            next,
        };
        let stale = store
            .complete_attempt(delivery.id, first.lease_id.unwrap(), resolution(NextState::Failed))
            .await
            .unwrap();
        assert!(stale.is_none());

        let done = store
            .complete_attempt(
                delivery.id,
                second.lease_id.unwrap(),
                resolution(NextState::Delivered),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.status, DeliveryStatus::Delivered);
        assert_eq!(done.lease_id, None);
        assert_eq!(store.list_attempts(endpoint.org_id, delivery.id).await.unwrap().len(), 1);
    }
}
