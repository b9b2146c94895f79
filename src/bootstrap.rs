use sqlx::{postgres::PgPoolOptions, PgPool};
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};

use crate::{
    api::handler::AppState,
    config::{mask_url_password, Config},
    error::AppResult,
    handlers::HandlerContext,
    ledger::{PgLedgerRepository, SettlementStore},
    notifications::{LogNotifier, Notifier, ResendNotifier},
    reconcile::{ConsistencyReconciler, ReconcileScheduler},
    webhook::{EventRouter, WebhookIngestionGate, WebhookVerifier},
};

pub async fn initialize_app_state(config: &Config) -> AppResult<AppState> {
    info!("Initializing application components ...");

    // Database pool
    let pool = initialize_database(&config.database_url).await?;
    let store: Arc<dyn SettlementStore> = Arc::new(PgLedgerRepository::new(pool));

    let notifier: Arc<dyn Notifier> = match config.resend() {
        Some((api_key, from, ops)) => {
            info!("✅ Resend notifier configured, operator alerts go to {}", ops);
            Arc::new(ResendNotifier::new(
                api_key.to_string(),
                from.to_string(),
                ops.to_string(),
            ))
        }
        None => {
            warn!("⚠️  RESEND_API_KEY/RESEND_FROM_EMAIL/OPS_ALERT_EMAIL not set - notifications are log-only");
            Arc::new(LogNotifier)
        }
    };

    // Event handlers share the escrow manager and milestone synchronizer
    let ctx = HandlerContext::new(store.clone(), notifier.clone(), config.escrow_max_retries);
    let router = Arc::new(EventRouter::with_default_handlers(ctx));
    info!("🔗 Event router initialized for: {:?}", router.registered_kinds());

    let gate = Arc::new(WebhookIngestionGate::new(
        WebhookVerifier::new(&config.webhook_secret, config.webhook_tolerance_secs),
        store.clone(),
        router,
        notifier,
    ));

    let reconciler = Arc::new(ConsistencyReconciler::new(store.clone()));

    let scheduler = ReconcileScheduler::new(config.schedule()?, reconciler.clone());
    if scheduler.start().is_some() {
        info!("✅ Reconciliation scheduler started ({})", config.reconcile_schedule);
    }

    Ok(AppState {
        store,
        gate,
        reconciler,
    })
}

pub async fn initialize_database(database_url: &str) -> AppResult<PgPool> {
    info!("📊 Connecting to database at {}", mask_url_password(database_url));

    let pool = PgPoolOptions::new()
        .max_connections(50)
        .min_connections(5)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await?;

    info!("✓ Database pool configured: 50 max connections");

    info!("🔄 Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("✓ Database initialized");
    Ok(pool)
}
