//! PostgreSQL-backed store.
//!
//! Claims are single `UPDATE ... WHERE status = 'pending'` statements, so the
//! row lock taken by Postgres is the compare-and-set. Batch claims select
//! with `FOR UPDATE SKIP LOCKED` so concurrent workers split the backlog
//! instead of queueing behind each other.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

use super::{
    AttemptResolution, DeliveryStore, EndpointChanges, EndpointStore, NewDelivery, NewEndpoint,
};
use crate::error::AppError;
use crate::types::{DeliveryStatus, WebhookDelivery, WebhookDeliveryAttempt, WebhookEndpoint};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

async fn insert_attempt_row(
    tx: &mut sqlx::PgConnection,
    delivery: &WebhookDelivery,
    resolution: &AttemptResolution,
) -> Result<(), AppError> {
    sqlx::query(
        r#"
        INSERT INTO webhook_delivery_attempts
            (id, delivery_id, org_id, attempt_number, response_status, error_message, duration_ms, attempted_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(delivery.id)
    .bind(delivery.org_id)
    .bind(resolution.attempt_number)
    .bind(resolution.response_status)
    .bind(&resolution.error_message)
    .bind(resolution.duration_ms)
    .bind(resolution.attempted_at)
    .execute(tx)
    .await?;

    Ok(())
}

#[async_trait]
impl EndpointStore for PgStore {
    async fn insert_endpoint(&self, endpoint: NewEndpoint) -> Result<WebhookEndpoint, AppError> {
        let row: WebhookEndpoint = sqlx::query_as(
            r#"
            INSERT INTO webhook_endpoints
                (id, org_id, name, url, secret_encrypted, event_types, enabled, custom_headers, retry_count, timeout_seconds)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(endpoint.org_id)
        .bind(&endpoint.name)
        .bind(&endpoint.url)
        .bind(&endpoint.secret_encrypted)
        .bind(&endpoint.event_types)
        .bind(endpoint.enabled)
        .bind(Json(&endpoint.custom_headers))
        .bind(endpoint.retry_count)
        .bind(endpoint.timeout_seconds)
        .fetch_one(&self.pool)
        .await?;

        Ok(row)
    }

    async fn get_endpoint(
        &self,
        org_id: Uuid,
        endpoint_id: Uuid,
    ) -> Result<Option<WebhookEndpoint>, AppError> {
        let row = sqlx::query_as("SELECT * FROM webhook_endpoints WHERE id = $1 AND org_id = $2")
            .bind(endpoint_id)
            .bind(org_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row)
    }

    async fn list_endpoints(&self, org_id: Uuid) -> Result<Vec<WebhookEndpoint>, AppError> {
        let rows = sqlx::query_as(
            "SELECT * FROM webhook_endpoints WHERE org_id = $1 ORDER BY created_at DESC",
        )
        .bind(org_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn list_subscribed_endpoints(
        &self,
        org_id: Uuid,
        event_type: &str,
    ) -> Result<Vec<WebhookEndpoint>, AppError> {
        let rows = sqlx::query_as(
            r#"
            SELECT * FROM webhook_endpoints
            WHERE org_id = $1
              AND enabled = true
              AND $2 = ANY(event_types)
            ORDER BY created_at DESC
            "#,
        )
        .bind(org_id)
        .bind(event_type)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn update_endpoint(
        &self,
        org_id: Uuid,
        endpoint_id: Uuid,
        changes: EndpointChanges,
    ) -> Result<Option<WebhookEndpoint>, AppError> {
        let row = sqlx::query_as(
            r#"
            UPDATE webhook_endpoints
            SET name = COALESCE($3, name),
                url = COALESCE($4, url),
                secret_encrypted = COALESCE($5, secret_encrypted),
                event_types = COALESCE($6, event_types),
                enabled = COALESCE($7, enabled),
                custom_headers = COALESCE($8, custom_headers),
                retry_count = COALESCE($9, retry_count),
                timeout_seconds = COALESCE($10, timeout_seconds),
                updated_at = NOW()
            WHERE id = $1 AND org_id = $2
            RETURNING *
            "#,
        )
        .bind(endpoint_id)
        .bind(org_id)
        .bind(changes.name)
        .bind(changes.url)
        .bind(changes.secret_encrypted)
        .bind(changes.event_types)
        .bind(changes.enabled)
        .bind(changes.custom_headers.map(Json))
        .bind(changes.retry_count)
        .bind(changes.timeout_seconds)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn delete_endpoint(&self, org_id: Uuid, endpoint_id: Uuid) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM webhook_endpoints WHERE id = $1 AND org_id = $2")
            .bind(endpoint_id)
            .bind(org_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl DeliveryStore for PgStore {
    async fn insert_delivery(&self, delivery: NewDelivery) -> Result<WebhookDelivery, AppError> {
        let mut tx = self.pool.begin().await?;

        let (status, attempt_number, next_retry_at, response_status, error_message, duration_ms, delivered_at) =
            match &delivery.resolved {
                Some(r) => (
                    r.status(),
                    r.stored_attempt_number(),
                    r.next_retry_at(),
                    r.response_status,
                    r.error_message.clone(),
                    Some(r.duration_ms),
                    r.delivered_at(),
                ),
                None => (
                    DeliveryStatus::Pending,
                    1,
                    Some(delivery.created_at),
                    None,
                    None,
                    None,
                    None,
                ),
            };

        let row: WebhookDelivery = sqlx::query_as(
            r#"
            INSERT INTO webhook_deliveries
                (id, org_id, endpoint_id, event_type, payload, status, attempt_number, max_attempts,
                 next_retry_at, response_status, error_message, duration_ms, created_at, delivered_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            RETURNING *
            "#,
        )
        .bind(delivery.id)
        .bind(delivery.org_id)
        .bind(delivery.endpoint_id)
        .bind(&delivery.event_type)
        .bind(&delivery.payload)
        .bind(status.to_string())
        .bind(attempt_number)
        .bind(delivery.max_attempts)
        .bind(next_retry_at)
        .bind(response_status)
        .bind(error_message)
        .bind(duration_ms)
        .bind(delivery.created_at)
        .bind(delivered_at)
        .fetch_one(&mut *tx)
        .await?;

        if let Some(resolution) = &delivery.resolved {
            insert_attempt_row(&mut tx, &row, resolution).await?;
        }

        tx.commit().await?;
        Ok(row)
    }

    async fn get_delivery(
        &self,
        org_id: Uuid,
        delivery_id: Uuid,
    ) -> Result<Option<WebhookDelivery>, AppError> {
        let row = sqlx::query_as("SELECT * FROM webhook_deliveries WHERE id = $1 AND org_id = $2")
            .bind(delivery_id)
            .bind(org_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row)
    }

    async fn list_deliveries(
        &self,
        org_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<WebhookDelivery>, AppError> {
        let rows = sqlx::query_as(
            r#"
            SELECT * FROM webhook_deliveries
            WHERE org_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(org_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn list_endpoint_deliveries(
        &self,
        org_id: Uuid,
        endpoint_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<WebhookDelivery>, AppError> {
        let rows = sqlx::query_as(
            r#"
            SELECT * FROM webhook_deliveries
            WHERE org_id = $1 AND endpoint_id = $2
            ORDER BY created_at DESC, id DESC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(org_id)
        .bind(endpoint_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn list_attempts(
        &self,
        org_id: Uuid,
        delivery_id: Uuid,
    ) -> Result<Vec<WebhookDeliveryAttempt>, AppError> {
        let rows = sqlx::query_as(
            r#"
            SELECT * FROM webhook_delivery_attempts
            WHERE org_id = $1 AND delivery_id = $2
            ORDER BY attempted_at ASC, attempt_number ASC
            "#,
        )
        .bind(org_id)
        .bind(delivery_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn claim(
        &self,
        delivery_id: Uuid,
        now: DateTime<Utc>,
        fallback_timeout_seconds: i32,
    ) -> Result<Option<WebhookDelivery>, AppError> {
        let row = sqlx::query_as(
            r#"
            UPDATE webhook_deliveries d
            SET status = 'delivering',
                claimed_at = $2,
                lease_id = gen_random_uuid(),
                lease_expires_at = $2 + 2 * COALESCE(
                    (SELECT e.timeout_seconds FROM webhook_endpoints e WHERE e.id = d.endpoint_id),
                    $3
                ) * INTERVAL '1 second'
            WHERE d.id = $1
              AND d.status = 'pending'
              AND (d.next_retry_at IS NULL OR d.next_retry_at <= $2)
            RETURNING d.*
            "#,
        )
        .bind(delivery_id)
        .bind(now)
        .bind(fallback_timeout_seconds)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: i64,
        fallback_timeout_seconds: i32,
    ) -> Result<Vec<WebhookDelivery>, AppError> {
        let rows = sqlx::query_as(
            r#"
            UPDATE webhook_deliveries d
            SET status = 'delivering',
                claimed_at = $1,
                lease_id = gen_random_uuid(),
                lease_expires_at = $1 + 2 * COALESCE(
                    (SELECT e.timeout_seconds FROM webhook_endpoints e WHERE e.id = d.endpoint_id),
                    $3
                ) * INTERVAL '1 second'
            WHERE d.status = 'pending'
              AND d.id IN (
                SELECT id FROM webhook_deliveries
                WHERE status = 'pending'
                  AND (next_retry_at IS NULL OR next_retry_at <= $1)
                ORDER BY next_retry_at ASC NULLS FIRST, created_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
              )
            RETURNING d.*
            "#,
        )
        .bind(now)
        .bind(limit)
        .bind(fallback_timeout_seconds)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn complete_attempt(
        &self,
        delivery_id: Uuid,
        lease_id: Uuid,
        resolution: AttemptResolution,
    ) -> Result<Option<WebhookDelivery>, AppError> {
        let mut tx = self.pool.begin().await?;

        let row: Option<WebhookDelivery> = sqlx::query_as(
            r#"
            UPDATE webhook_deliveries
            SET status = $3,
                attempt_number = $4,
                next_retry_at = $5,
                response_status = $6,
                error_message = $7,
                duration_ms = $8,
                delivered_at = COALESCE($9, delivered_at),
                claimed_at = NULL,
                lease_id = NULL,
                lease_expires_at = NULL
            WHERE id = $1 AND status = 'delivering' AND lease_id = $2
            RETURNING *
            "#,
        )
        .bind(delivery_id)
        .bind(lease_id)
        .bind(resolution.status().to_string())
        .bind(resolution.stored_attempt_number())
        .bind(resolution.next_retry_at())
        .bind(resolution.response_status)
        .bind(&resolution.error_message)
        .bind(resolution.duration_ms)
        .bind(resolution.delivered_at())
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };

        insert_attempt_row(&mut tx, &row, &resolution).await?;
        tx.commit().await?;

        Ok(Some(row))
    }

    async fn reclaim_orphaned(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, AppError> {
        let ids: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE webhook_deliveries
            SET status = 'pending',
                next_retry_at = $1,
                claimed_at = NULL,
                lease_id = NULL,
                lease_expires_at = NULL
            WHERE status = 'delivering'
              AND (lease_expires_at IS NULL OR lease_expires_at < $1)
            RETURNING id
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    async fn reopen_failed(
        &self,
        org_id: Uuid,
        delivery_id: Uuid,
    ) -> Result<Option<WebhookDelivery>, AppError> {
        let row = sqlx::query_as(
            r#"
            UPDATE webhook_deliveries
            SET status = 'pending',
                attempt_number = 1,
                next_retry_at = NULL,
                error_message = NULL,
                claimed_at = NULL,
                lease_id = NULL,
                lease_expires_at = NULL
            WHERE id = $1 AND org_id = $2 AND status = 'failed'
            RETURNING *
            "#,
        )
        .bind(delivery_id)
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }
}
