use std::sync::Arc;

use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use payment_recon_rs::config::{
    BusType, CardHostedConfig, Config, GatewayMode, MobileMoneyConfig, OrderSignatureConfig,
    StoreBackend,
};
use payment_recon_rs::coordinator::{CoordinatorConfig, PaymentCoordinator};
use payment_recon_rs::db;
use payment_recon_rs::events::{EventPublisher, InMemoryEventPublisher, NatsEventPublisher};
use payment_recon_rs::gateways::{
    GatewayAdapter, HostedCheckoutGateway, MobileMoneyGateway, MockGateway, OrderSignatureGateway,
};
use payment_recon_rs::idempotency::{IdempotencyStore, MemoryIdempotencyStore};
use payment_recon_rs::metrics::Metrics;
use payment_recon_rs::models::{AmountPolicy, Gateway};
use payment_recon_rs::reconciler::LedgerReconciler;
use payment_recon_rs::routes::{payments_router, AppState};
use payment_recon_rs::store::postgres::PgIdempotencyStore;
use payment_recon_rs::store::{LedgerStore, MemoryLedgerStore, PgLedgerStore};
use payment_recon_rs::tasks;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,payment_recon_rs=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let cfg = Config::from_env()?;
    tracing::info!("config loaded");

    let metrics = Arc::new(Metrics::new());

    let (ledger_store, idempotency_store): (Arc<dyn LedgerStore>, Arc<dyn IdempotencyStore>) =
        match cfg.store_backend {
            StoreBackend::Memory => {
                tracing::info!("Using in-memory store backend");
                (
                    Arc::new(MemoryLedgerStore::new()),
                    Arc::new(MemoryIdempotencyStore::new(
                        cfg.idempotency_lease,
                        chrono::Duration::days(cfg.idempotency_retention_days),
                    )),
                )
            }
            StoreBackend::Postgres => {
                let url = cfg
                    .database_url
                    .clone()
                    .ok_or("DATABASE_URL must be set for the postgres backend")?;
                let pool = db::create_pool(&url).await?;
                db::run_migrations(&pool).await?;
                tracing::info!("db connected + migrations applied");
                (
                    Arc::new(PgLedgerStore::new(pool.clone())),
                    Arc::new(PgIdempotencyStore::new(
                        pool,
                        cfg.idempotency_lease,
                        cfg.idempotency_retention_days as i32,
                    )),
                )
            }
        };

    let publisher: Arc<dyn EventPublisher> = match cfg.bus_type {
        BusType::Nats => {
            tracing::info!("Connecting to NATS at {}", cfg.nats_url);
            let client = async_nats::connect(&cfg.nats_url).await?;
            Arc::new(NatsEventPublisher::new(client))
        }
        BusType::InMemory => {
            tracing::info!("Using in-memory event publisher");
            Arc::new(InMemoryEventPublisher::new())
        }
    };

    let adapters: Vec<Arc<dyn GatewayAdapter>> = match cfg.gateway_mode {
        GatewayMode::Mock => {
            tracing::info!("Using mock gateway adapters");
            vec![
                Arc::new(MockGateway::new(Gateway::CardHosted, AmountPolicy::ExactMatch)),
                Arc::new(MockGateway::new(
                    Gateway::OrderSignature,
                    AmountPolicy::ExactMatch,
                )),
                Arc::new(MockGateway::new(
                    Gateway::MobileMoney,
                    AmountPolicy::AcceptPartial,
                )),
            ]
        }
        GatewayMode::Live => {
            let mut adapters: Vec<Arc<dyn GatewayAdapter>> = Vec::new();
            match CardHostedConfig::from_env() {
                Ok(c) => adapters.push(Arc::new(HostedCheckoutGateway::new(c)?)),
                Err(e) => tracing::warn!("card-hosted gateway disabled: {e}"),
            }
            match OrderSignatureConfig::from_env() {
                Ok(c) => adapters.push(Arc::new(OrderSignatureGateway::new(c)?)),
                Err(e) => tracing::warn!("order-signature gateway disabled: {e}"),
            }
            match MobileMoneyConfig::from_env() {
                Ok(c) => adapters.push(Arc::new(MobileMoneyGateway::new(c)?)),
                Err(e) => tracing::warn!("mobile-money gateway disabled: {e}"),
            }
            if adapters.is_empty() {
                return Err("GATEWAY_MODE=live but no gateway is configured".into());
            }
            adapters
        }
    };

    let reconciler = Arc::new(LedgerReconciler::new(
        ledger_store.clone(),
        cfg.allow_overpayment,
    ));

    let coordinator = Arc::new(PaymentCoordinator::new(
        ledger_store.clone(),
        idempotency_store.clone(),
        reconciler,
        publisher,
        adapters,
        metrics.clone(),
        CoordinatorConfig::from_config(&cfg),
    ));

    // Background tasks
    tokio::spawn(tasks::run_expiry_sweeper(
        coordinator.clone(),
        cfg.expiry_sweep_interval,
    ));
    tokio::spawn(tasks::run_idempotency_gc(
        idempotency_store,
        cfg.idempotency_gc_interval,
    ));

    let state = AppState {
        coordinator,
        store: ledger_store,
        metrics,
    };

    let app = payments_router(state)
        .layer(
            CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
        .layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", cfg.host, cfg.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "listening");
    axum::serve(listener, app).await?;

    Ok(())
}
