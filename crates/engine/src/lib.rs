//! Webhook services behind the REST surface: the endpoint registry, the
//! dispatcher and delivery history.

pub mod deliveries;
pub mod dispatcher;
pub mod endpoints;

pub use deliveries::{DeliveryService, Page};
pub use dispatcher::{Dispatcher, TestDeliveryResult};
pub use endpoints::{EndpointDefaults, EndpointRegistry};
