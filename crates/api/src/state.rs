//! Shared application state for the Axum API server.

use std::sync::Arc;

use keel_common::config::AppConfig;
use keel_common::crypto::KeyManager;
use keel_common::error::AppError;
use keel_common::store::WebhookStore;
use keel_engine::{DeliveryService, Dispatcher, EndpointDefaults, EndpointRegistry};
use keel_notifier::WebhookClient;

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<EndpointRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub deliveries: Arc<DeliveryService>,
    pub config: AppConfig,
}

impl AppState {
    pub fn new(
        store: Arc<dyn WebhookStore>,
        keys: Arc<dyn KeyManager>,
        config: AppConfig,
    ) -> Result<Self, AppError> {
        let registry = EndpointRegistry::new(
            store.clone(),
            keys.clone(),
            EndpointDefaults::from_config(&config),
        );
        let dispatcher = Dispatcher::new(store.clone(), keys, WebhookClient::new()?);

        Ok(Self {
            registry: Arc::new(registry),
            dispatcher: Arc::new(dispatcher),
            deliveries: Arc::new(DeliveryService::new(store)),
            config,
        })
    }
}
