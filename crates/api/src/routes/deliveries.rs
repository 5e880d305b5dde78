//! Delivery history, attempt log and manual retry.

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use keel_common::error::AppError;
use keel_common::types::{WebhookDelivery, WebhookDeliveryAttempt};
use keel_engine::Page;

use super::parse_id;
use crate::middleware::auth::AuthOrg;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/webhooks/deliveries", get(list_deliveries))
        .route("/webhooks/deliveries/{id}", get(get_delivery))
        .route("/webhooks/deliveries/{id}/retry", post(retry_delivery))
        .route("/webhooks/deliveries/{id}/attempts", get(list_attempts))
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct PageQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// GET /webhooks/deliveries?limit&offset: Newest first.
async fn list_deliveries(
    State(state): State<AppState>,
    auth: AuthOrg,
    Query(query): Query<PageQuery>,
) -> Result<Json<Vec<WebhookDelivery>>, AppError> {
    let page = Page::new(query.limit, query.offset)?;
    Ok(Json(state.deliveries.list(auth.org_id, page).await?))
}

/// GET /webhooks/deliveries/:id
async fn get_delivery(
    State(state): State<AppState>,
    auth: AuthOrg,
    Path(id): Path<String>,
) -> Result<Json<WebhookDelivery>, AppError> {
    let id = parse_id(&id, "delivery")?;
    Ok(Json(state.deliveries.get(auth.org_id, id).await?))
}

/// POST /webhooks/deliveries/:id/retry: Re-queue a failed delivery.
async fn retry_delivery(
    State(state): State<AppState>,
    auth: AuthOrg,
    Path(id): Path<String>,
) -> Result<Json<WebhookDelivery>, AppError> {
    let id = parse_id(&id, "delivery")?;
    Ok(Json(state.deliveries.retry(auth.org_id, id).await?))
}

/// GET /webhooks/deliveries/:id/attempts: Attempt log, oldest first.
async fn list_attempts(
    State(state): State<AppState>,
    auth: AuthOrg,
    Path(id): Path<String>,
) -> Result<Json<Vec<WebhookDeliveryAttempt>>, AppError> {
    let id = parse_id(&id, "delivery")?;
    Ok(Json(state.deliveries.attempts(auth.org_id, id).await?))
}
