use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use keel_common::config::AppConfig;
use keel_common::crypto::{AesKeyManager, KeyManager};
use keel_common::db;
use keel_common::store::{PgStore, WebhookStore};
use keel_notifier::{DeliveryWorkerPool, RetryPolicy, WebhookClient, WorkerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "keel_notifier=info,keel_common=info".into()),
        )
        .json()
        .init();

    tracing::info!("Keel webhook worker starting...");

    let config = AppConfig::from_env()?;

    let pool = db::create_pool(&config.database_url, config.db_max_connections).await?;
    db::run_migrations(&pool).await?;

    let store: Arc<dyn WebhookStore> = Arc::new(PgStore::new(pool));
    let keys: Arc<dyn KeyManager> = Arc::new(AesKeyManager::new(config.encryption_key_bytes()?));

    let workers = DeliveryWorkerPool::new(
        store,
        keys,
        WebhookClient::new()?,
        RetryPolicy::from_config(&config),
        WorkerConfig::from_config(&config),
    );

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
            return;
        }
        tracing::info!("Received shutdown signal, stopping gracefully...");
        signal.cancel();
    });

    workers.run(shutdown).await;

    tracing::info!("Keel webhook worker stopped.");
    Ok(())
}
