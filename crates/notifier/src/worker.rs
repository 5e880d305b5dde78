//! Delivery worker pool.
//!
//! The pool polls the store for due deliveries, claims at most as many as it
//! has free permits, and runs each attempt as its own task. A delivery is
//! only ever touched by the task holding its claim, so attempt N+1 cannot
//! start before attempt N has been persisted. Deliveries whose worker died
//! mid-attempt are returned to `Pending` by the periodic sweep.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use keel_common::config::AppConfig;
use keel_common::crypto::KeyManager;
use keel_common::error::AppError;
use keel_common::store::{AttemptResolution, WebhookStore};
use keel_common::types::{DeliveryStatus, WebhookDelivery};

use crate::client::WebhookClient;
use crate::retry::{self, RetryPolicy};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum attempts in flight at once
    pub concurrency: usize,
    /// Maximum deliveries claimed per poll
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub sweep_interval: Duration,
    pub shutdown_timeout: Duration,
    /// Timeout a lease is sized from when the delivery's endpoint was deleted
    pub fallback_timeout_seconds: i32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 16,
            batch_size: 32,
            poll_interval: Duration::from_millis(2000),
            sweep_interval: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
            fallback_timeout_seconds: 30,
        }
    }
}

impl WorkerConfig {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            concurrency: config.worker_concurrency.max(1),
            batch_size: config.worker_batch_size.max(1),
            poll_interval: Duration::from_millis(config.worker_poll_interval_ms),
            sweep_interval: Duration::from_secs(config.worker_sweep_interval_seconds),
            shutdown_timeout: Duration::from_secs(config.worker_shutdown_timeout_seconds),
            fallback_timeout_seconds: config.webhook_default_timeout_seconds,
        }
    }
}

/// Executes claimed deliveries. Shared by every spawned attempt task.
struct AttemptRunner {
    store: Arc<dyn WebhookStore>,
    keys: Arc<dyn KeyManager>,
    client: WebhookClient,
    policy: RetryPolicy,
}

impl AttemptRunner {
    async fn process(&self, delivery: WebhookDelivery) {
        let delivery_id = delivery.id;
        if let Err(e) = self.try_process(delivery).await {
            // The row stays `Delivering` and is picked up again by the sweep
            tracing::error!(
                delivery_id = %delivery_id,
                error = %e,
                "Failed to record delivery attempt"
            );
        }
    }

    async fn try_process(&self, delivery: WebhookDelivery) -> Result<(), AppError> {
        let Some(lease_id) = delivery.lease_id else {
            return Err(AppError::Internal(format!(
                "Delivery {} was handed to a worker without a lease",
                delivery.id
            )));
        };
        let resolution = self.attempt(&delivery).await?;

        let recorded = self
            .store
            .complete_attempt(delivery.id, lease_id, resolution)
            .await?;
        let Some(updated) = recorded else {
            tracing::warn!(
                delivery_id = %delivery.id,
                "Delivery lease lost before the attempt was recorded"
            );
            return Ok(());
        };

        match updated.status {
            DeliveryStatus::Delivered => tracing::info!(
                delivery_id = %updated.id,
                endpoint_id = %updated.endpoint_id,
                org_id = %updated.org_id,
                event_type = %updated.event_type,
                attempt_number = updated.attempt_number,
                response_status = ?updated.response_status,
                duration_ms = ?updated.duration_ms,
                "Webhook delivered"
            ),
            DeliveryStatus::Pending => tracing::info!(
                delivery_id = %updated.id,
                endpoint_id = %updated.endpoint_id,
                org_id = %updated.org_id,
                attempt_number = updated.attempt_number,
                next_retry_at = ?updated.next_retry_at,
                error = ?updated.error_message,
                "Webhook attempt failed, retry scheduled"
            ),
            _ => tracing::warn!(
                delivery_id = %updated.id,
                endpoint_id = %updated.endpoint_id,
                org_id = %updated.org_id,
                attempt_number = updated.attempt_number,
                max_attempts = updated.max_attempts,
                error = ?updated.error_message,
                "Webhook delivery failed"
            ),
        }

        Ok(())
    }

    /// Run one attempt and decide the next state. Conditions that no retry
    /// can fix fail the delivery without contacting the receiver.
    async fn attempt(&self, delivery: &WebhookDelivery) -> Result<AttemptResolution, AppError> {
        let endpoint = self
            .store
            .get_endpoint(delivery.org_id, delivery.endpoint_id)
            .await?;

        let Some(endpoint) = endpoint else {
            return Ok(retry::abandon(delivery, "Endpoint no longer exists"));
        };
        if !endpoint.enabled {
            return Ok(retry::abandon(delivery, "Endpoint is disabled"));
        }

        let secret = match self.keys.decrypt(endpoint.org_id, &endpoint.secret_encrypted) {
            Ok(secret) => secret,
            Err(e) => {
                tracing::error!(
                    delivery_id = %delivery.id,
                    endpoint_id = %endpoint.id,
                    error = %e,
                    "Failed to decrypt endpoint secret"
                );
                return Ok(retry::abandon(delivery, "Failed to decrypt endpoint secret"));
            }
        };

        tracing::debug!(
            delivery_id = %delivery.id,
            endpoint_id = %endpoint.id,
            attempt_number = delivery.attempt_number,
            "Sending webhook"
        );

        let result = self
            .client
            .deliver(
                &endpoint,
                &secret,
                delivery.id,
                &delivery.event_type,
                &delivery.payload,
            )
            .await;

        if result.timed_out {
            tracing::debug!(
                delivery_id = %delivery.id,
                timeout_seconds = endpoint.timeout_seconds,
                "Webhook attempt timed out"
            );
        }

        Ok(self.policy.resolve(delivery, &result))
    }
}

/// Bounded pool of concurrent delivery attempts fed from the store.
pub struct DeliveryWorkerPool {
    runner: Arc<AttemptRunner>,
    config: WorkerConfig,
    permits: Arc<Semaphore>,
}

impl DeliveryWorkerPool {
    pub fn new(
        store: Arc<dyn WebhookStore>,
        keys: Arc<dyn KeyManager>,
        client: WebhookClient,
        policy: RetryPolicy,
        config: WorkerConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Self {
            runner: Arc::new(AttemptRunner {
                store,
                keys,
                client,
                policy,
            }),
            config,
            permits,
        }
    }

    /// Poll, process and sweep until `shutdown` fires, then drain in-flight
    /// attempts for up to the configured shutdown timeout.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut poll = tokio::time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut tasks = JoinSet::new();

        tracing::info!(
            concurrency = self.config.concurrency,
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Delivery worker pool started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => reap(joined),
                _ = sweep.tick() => {
                    if let Err(e) = self.sweep(Utc::now()).await {
                        tracing::error!(error = %e, "Orphaned delivery sweep failed");
                    }
                }
                _ = poll.tick() => {
                    if let Err(e) = self.poll(&mut tasks).await {
                        tracing::error!(error = %e, "Failed to claim due deliveries");
                    }
                }
            }
        }

        tracing::info!(in_flight = tasks.len(), "Shutting down, draining in-flight attempts");

        let drained = tokio::time::timeout(self.config.shutdown_timeout, async {
            while let Some(joined) = tasks.join_next().await {
                reap(joined);
            }
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                abandoned = tasks.len(),
                "Shutdown timeout reached; remaining deliveries will be reclaimed by the sweep"
            );
            tasks.abort_all();
        }

        tracing::info!("Delivery worker pool stopped");
    }

    /// Claim what fits in the free permits and spawn an attempt for each.
    async fn poll(&self, tasks: &mut JoinSet<()>) -> Result<(), AppError> {
        let available = self.permits.available_permits().min(self.config.batch_size);
        if available == 0 {
            return Ok(());
        }

        let claimed = self
            .runner
            .store
            .claim_due(
                Utc::now(),
                available as i64,
                self.config.fallback_timeout_seconds,
            )
            .await?;
        if !claimed.is_empty() {
            tracing::debug!(claimed = claimed.len(), "Claimed due deliveries");
        }

        self.spawn_all(claimed, tasks).await
    }

    async fn spawn_all(
        &self,
        claimed: Vec<WebhookDelivery>,
        tasks: &mut JoinSet<()>,
    ) -> Result<(), AppError> {
        for delivery in claimed {
            let permit = self
                .permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| AppError::Internal(format!("Worker semaphore closed: {}", e)))?;
            let runner = self.runner.clone();
            tasks.spawn(async move {
                let _permit = permit;
                runner.process(delivery).await;
            });
        }
        Ok(())
    }

    /// One claim-and-process cycle as of `now`, awaited to completion.
    /// Returns the number of deliveries attempted.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<usize, AppError> {
        let claimed = self
            .runner
            .store
            .claim_due(
                now,
                self.config.batch_size as i64,
                self.config.fallback_timeout_seconds,
            )
            .await?;
        let count = claimed.len();

        let mut tasks = JoinSet::new();
        self.spawn_all(claimed, &mut tasks).await?;
        while let Some(joined) = tasks.join_next().await {
            reap(joined);
        }

        Ok(count)
    }

    /// Return deliveries whose lease deadline (twice the endpoint timeout
    /// in force when they were claimed) has passed to `Pending`.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, AppError> {
        let reclaimed = self.runner.store.reclaim_orphaned(now).await?;

        if !reclaimed.is_empty() {
            tracing::warn!(
                count = reclaimed.len(),
                delivery_ids = ?reclaimed,
                "Reclaimed orphaned deliveries"
            );
        }
        Ok(reclaimed)
    }
}

fn reap(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            tracing::error!(error = %e, "Delivery task panicked");
        } else if !e.is_cancelled() {
            tracing::error!(error = %e, "Delivery task failed");
        }
    }
}
