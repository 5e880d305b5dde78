//! Event type catalogue.

use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use keel_common::types::WebhookEventType;

use crate::middleware::auth::AuthOrg;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/webhooks/event-types", get(list_event_types))
}

#[derive(Debug, Serialize)]
struct EventTypeInfo {
    #[serde(rename = "type")]
    event_type: &'static str,
    description: &'static str,
}

/// GET /webhooks/event-types: Event types endpoints can subscribe to.
async fn list_event_types(_auth: AuthOrg) -> Json<Vec<EventTypeInfo>> {
    Json(
        WebhookEventType::all()
            .iter()
            .map(|t| EventTypeInfo {
                event_type: t.as_str(),
                description: t.description(),
            })
            .collect(),
    )
}
