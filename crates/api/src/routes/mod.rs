pub mod deliveries;
pub mod endpoints;
pub mod event_types;
pub mod health;

use axum::Router;
use uuid::Uuid;

use keel_common::error::AppError;

use crate::state::AppState;

/// Build the complete API router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .merge(event_types::router())
        .merge(endpoints::router())
        .merge(deliveries::router())
        .with_state(state)
}

/// Path IDs are taken as strings so a malformed one is a 400 with the usual
/// error body.
fn parse_id(raw: &str, what: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw).map_err(|_| AppError::Validation(format!("Invalid {} ID '{}'", what, raw)))
}
