//! Webhook endpoint CRUD, test delivery and per-endpoint history.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use keel_common::error::AppError;
use keel_common::types::{EndpointView, WebhookDelivery};
use keel_engine::endpoints::{CreateEndpointParams, UpdateEndpointParams};
use keel_engine::{Page, TestDeliveryResult};

use super::deliveries::PageQuery;
use super::parse_id;
use crate::middleware::auth::AuthOrg;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/webhooks/endpoints",
            get(list_endpoints).post(create_endpoint),
        )
        .route(
            "/webhooks/endpoints/{id}",
            get(get_endpoint).put(update_endpoint).delete(delete_endpoint),
        )
        .route("/webhooks/endpoints/{id}/test", post(test_endpoint))
        .route("/webhooks/endpoints/{id}/deliveries", get(list_endpoint_deliveries))
}

#[derive(Debug, Default, Deserialize)]
struct TestDeliveryRequest {
    event_type: Option<String>,
}

/// POST /webhooks/endpoints: Register an endpoint.
async fn create_endpoint(
    State(state): State<AppState>,
    auth: AuthOrg,
    Json(params): Json<CreateEndpointParams>,
) -> Result<(StatusCode, Json<EndpointView>), AppError> {
    let endpoint = state.registry.create(auth.org_id, params).await?;
    Ok((StatusCode::CREATED, Json(endpoint)))
}

/// GET /webhooks/endpoints: List the organization's endpoints.
async fn list_endpoints(
    State(state): State<AppState>,
    auth: AuthOrg,
) -> Result<Json<Vec<EndpointView>>, AppError> {
    Ok(Json(state.registry.list(auth.org_id).await?))
}

/// GET /webhooks/endpoints/:id
async fn get_endpoint(
    State(state): State<AppState>,
    auth: AuthOrg,
    Path(id): Path<String>,
) -> Result<Json<EndpointView>, AppError> {
    let id = parse_id(&id, "endpoint")?;
    Ok(Json(state.registry.get(auth.org_id, id).await?))
}

/// PUT /webhooks/endpoints/:id: Partial update; omitted fields are kept.
async fn update_endpoint(
    State(state): State<AppState>,
    auth: AuthOrg,
    Path(id): Path<String>,
    Json(params): Json<UpdateEndpointParams>,
) -> Result<Json<EndpointView>, AppError> {
    let id = parse_id(&id, "endpoint")?;
    Ok(Json(state.registry.update(auth.org_id, id, params).await?))
}

/// DELETE /webhooks/endpoints/:id: Delivery history is kept.
async fn delete_endpoint(
    State(state): State<AppState>,
    auth: AuthOrg,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let id = parse_id(&id, "endpoint")?;
    state.registry.delete(auth.org_id, id).await?;
    Ok(Json(serde_json::json!({"deleted": true})))
}

/// POST /webhooks/endpoints/:id/test: Send a signed test event and report
/// the outcome. The body is optional: `{"event_type": "backup.completed"}`.
async fn test_endpoint(
    State(state): State<AppState>,
    auth: AuthOrg,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<TestDeliveryResult>, AppError> {
    let id = parse_id(&id, "endpoint")?;
    let request: TestDeliveryRequest = if body.is_empty() {
        TestDeliveryRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| AppError::Validation(format!("Invalid request body: {}", e)))?
    };

    let result = state
        .dispatcher
        .test_deliver(auth.org_id, id, request.event_type.as_deref())
        .await?;
    Ok(Json(result))
}

/// GET /webhooks/endpoints/:id/deliveries?limit&offset
async fn list_endpoint_deliveries(
    State(state): State<AppState>,
    auth: AuthOrg,
    Path(id): Path<String>,
    Query(query): Query<PageQuery>,
) -> Result<Json<Vec<WebhookDelivery>>, AppError> {
    let id = parse_id(&id, "endpoint")?;
    let page = Page::new(query.limit, query.offset)?;
    Ok(Json(
        state
            .deliveries
            .list_for_endpoint(auth.org_id, id, page)
            .await?,
    ))
}
