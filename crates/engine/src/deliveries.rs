//! Delivery history and manual re-delivery.

use std::sync::Arc;

use uuid::Uuid;

use keel_common::error::AppError;
use keel_common::store::WebhookStore;
use keel_common::types::{DeliveryStatus, WebhookDelivery, WebhookDeliveryAttempt};

pub const DEFAULT_PAGE_LIMIT: i64 = 50;
pub const MAX_PAGE_LIMIT: i64 = 200;

/// Validated `limit`/`offset` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: i64,
    pub offset: i64,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: DEFAULT_PAGE_LIMIT,
            offset: 0,
        }
    }
}

impl Page {
    /// Limits above the maximum are clamped; zero or negative values are
    /// rejected.
    pub fn new(limit: Option<i64>, offset: Option<i64>) -> Result<Self, AppError> {
        let limit = limit.unwrap_or(DEFAULT_PAGE_LIMIT);
        let offset = offset.unwrap_or(0);

        if limit < 1 {
            return Err(AppError::Validation(
                "limit must be at least 1".to_string(),
            ));
        }
        if offset < 0 {
            return Err(AppError::Validation(
                "offset must not be negative".to_string(),
            ));
        }

        Ok(Self {
            limit: limit.min(MAX_PAGE_LIMIT),
            offset,
        })
    }
}

pub struct DeliveryService {
    store: Arc<dyn WebhookStore>,
}

impl DeliveryService {
    pub fn new(store: Arc<dyn WebhookStore>) -> Self {
        Self { store }
    }

    pub async fn list(&self, org_id: Uuid, page: Page) -> Result<Vec<WebhookDelivery>, AppError> {
        self.store
            .list_deliveries(org_id, page.limit, page.offset)
            .await
    }

    /// History of one endpoint. Still readable after the endpoint is deleted.
    pub async fn list_for_endpoint(
        &self,
        org_id: Uuid,
        endpoint_id: Uuid,
        page: Page,
    ) -> Result<Vec<WebhookDelivery>, AppError> {
        self.store
            .list_endpoint_deliveries(org_id, endpoint_id, page.limit, page.offset)
            .await
    }

    pub async fn get(&self, org_id: Uuid, delivery_id: Uuid) -> Result<WebhookDelivery, AppError> {
        self.store
            .get_delivery(org_id, delivery_id)
            .await?
            .ok_or_else(|| not_found(delivery_id))
    }

    /// Attempt log of a delivery, oldest first.
    pub async fn attempts(
        &self,
        org_id: Uuid,
        delivery_id: Uuid,
    ) -> Result<Vec<WebhookDeliveryAttempt>, AppError> {
        // 404 rather than an empty list for unknown or foreign deliveries
        self.get(org_id, delivery_id).await?;
        self.store.list_attempts(org_id, delivery_id).await
    }

    /// Reopen a `Failed` delivery so the worker pool sends it again from
    /// attempt 1.
    pub async fn retry(&self, org_id: Uuid, delivery_id: Uuid) -> Result<WebhookDelivery, AppError> {
        if let Some(reopened) = self.store.reopen_failed(org_id, delivery_id).await? {
            tracing::info!(
                delivery_id = %delivery_id,
                org_id = %org_id,
                endpoint_id = %reopened.endpoint_id,
                "Delivery manually re-queued"
            );
            return Ok(reopened);
        }

        let current = self.get(org_id, delivery_id).await?;
        match current.status {
            DeliveryStatus::Delivered => Err(AppError::Conflict(
                "Delivery already successful".to_string(),
            )),
            status => Err(AppError::Conflict(format!(
                "Delivery is {}; only failed deliveries can be retried",
                status
            ))),
        }
    }
}

fn not_found(delivery_id: Uuid) -> AppError {
    AppError::NotFound(format!("Delivery {} not found", delivery_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_defaults() {
        assert_eq!(Page::new(None, None).unwrap(), Page::default());
        assert_eq!(Page::default().limit, 50);
    }

    #[test]
    fn test_page_clamps_limit() {
        assert_eq!(Page::new(Some(1000), Some(5)).unwrap(), Page { limit: 200, offset: 5 });
    }

    #[test]
    fn test_page_rejects_bad_values() {
        assert!(Page::new(Some(0), None).is_err());
        assert!(Page::new(Some(-1), None).is_err());
        assert!(Page::new(None, Some(-10)).is_err());
    }
}
