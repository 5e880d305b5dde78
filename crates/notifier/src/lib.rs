//! Outbound side of webhook delivery: signing, the HTTP client, the retry
//! policy and the worker pool that drives deliveries to a terminal state.

pub mod client;
pub mod retry;
pub mod signer;
pub mod worker;

pub use client::{AttemptResult, WebhookClient};
pub use retry::RetryPolicy;
pub use worker::{DeliveryWorkerPool, WorkerConfig};
