//! Group Buy Engine Service
//!
//! Main entry point for the group purchase coordination engine.
//! This service provides:
//! - WebSocket relay of group and settlement events
//! - Background sweeper that finalizes groups whose window has closed

use group_buy_engine::catalog::{CatalogPriceLookup, HttpCatalog, StaticCatalog};
use group_buy_engine::config::{AppConfig, GatewayMode, StorageBackend};
use group_buy_engine::database::{create_pool, run_migrations};
use group_buy_engine::gateway::{HttpPaymentGateway, PaymentGateway, SimulatedGateway};
use group_buy_engine::repositories::InMemoryStore;
use group_buy_engine::services::AuditTrailService;
use group_buy_engine::sweeper::Sweeper;
use group_buy_engine::websocket::WebSocketServer;
use group_buy_engine::{AppError, AppResult, GroupPurchaseEngine, Stores};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

fn init_tracing(config: &AppConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("group_buy_engine={},sqlx=warn", config.log_level).into());

    if config.json_logs() {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> AppResult<()> {
    // Load environment variables first
    dotenv::dotenv().ok();

    let config = AppConfig::from_env().map_err(|e| {
        eprintln!("Configuration error: {}", e);
        AppError::Config(e)
    })?;

    init_tracing(&config);

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║           Group Buy Engine Starting                      ║");
    info!("╚══════════════════════════════════════════════════════════╝");
    info!("Environment: {}", config.environment);
    info!("Log level: {}", config.log_level);
    if let Some(http_port) = config.http_port {
        info!("WebSocket port: {}", http_port);
    }

    // =========================================================================
    // STORAGE
    // =========================================================================
    let stores = match config.engine.storage {
        StorageBackend::Postgres => {
            info!("Connecting to database...");
            let pool = create_pool(&config.database).await.map_err(|e| {
                error!("Failed to create database pool: {}", e);
                AppError::Database(e)
            })?;
            info!("Max connections: {}", config.database.max_connections);

            info!("Running database migrations...");
            run_migrations(&pool, None).await.map_err(|e| {
                error!("Database migration failed: {}", e);
                AppError::Database(e)
            })?;
            info!("✓ Database ready");

            Stores::postgres(pool)
        }
        StorageBackend::Memory => {
            warn!("STORAGE=memory: state is lost on restart");
            Stores::in_memory(Arc::new(InMemoryStore::new()))
        }
    };

    // =========================================================================
    // COLLABORATORS
    // =========================================================================
    let catalog: Arc<dyn CatalogPriceLookup> = match &config.engine.catalog_service_url {
        Some(url) => {
            info!("Catalog service: {}", url);
            Arc::new(HttpCatalog::new(url.clone())?)
        }
        None => {
            warn!("CATALOG_SERVICE_URL not set - using an empty static catalog");
            Arc::new(StaticCatalog::new())
        }
    };

    let gateway: Arc<dyn PaymentGateway> = match config.engine.gateway_mode {
        GatewayMode::Http => {
            info!("Payment gateway: {}", config.engine.gateway_base_url);
            Arc::new(HttpPaymentGateway::new(
                config.engine.gateway_base_url.clone(),
                config.engine.gateway_merchant_id.clone(),
                config.engine.gateway_callback_url.clone(),
            )?)
        }
        GatewayMode::Simulated if config.is_production() => {
            return Err(AppError::Config(
                "GATEWAY_MODE=simulated is not allowed in production".to_string(),
            ));
        }
        GatewayMode::Simulated => {
            warn!("GATEWAY_MODE=simulated - charges never leave this process");
            Arc::new(SimulatedGateway::new())
        }
    };

    let audit = Arc::new(AuditTrailService::new(config.engine.audit_log_dir.clone()).map_err(|e| {
        error!("Failed to initialize audit trail: {}", e);
        e
    })?);
    info!("✓ Audit trail writing to {}", audit.path().display());

    let engine = Arc::new(
        GroupPurchaseEngine::builder(stores, catalog, gateway)
            .audit(audit)
            .config(config.engine.clone())
            .build(),
    );
    info!("✓ Engine initialized");

    // =========================================================================
    // BACKGROUND TASKS
    // =========================================================================
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sweeper = Sweeper::new(engine.clone(), config.engine.sweep_interval());
    let mut sweeper_handle = tokio::spawn(sweeper.start(shutdown_rx));
    info!("✓ Sweeper started ({:?} interval)", config.engine.sweep_interval());

    let ws_server = Arc::new(WebSocketServer::new());
    let relay_handle = ws_server.relay_events(&engine.events());
    info!("✓ Event relay started");

    // =========================================================================
    // WEBSOCKET SERVER
    // =========================================================================
    let ws_handle = if let Some(http_port) = config.http_port {
        let ws_addr: SocketAddr = format!("0.0.0.0:{}", http_port)
            .parse()
            .map_err(|e| AppError::Config(format!("Invalid WebSocket address: {}", e)))?;

        let listener = TcpListener::bind(ws_addr)
            .await
            .map_err(|e| AppError::Message(format!("Failed to bind WebSocket server: {}", e)))?;

        let ws_server_clone = ws_server.clone();
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        info!("New WebSocket connection from {}", addr);
                        let ws = ws_server_clone.clone();
                        tokio::spawn(async move {
                            if let Err(e) = ws.handle_connection(stream).await {
                                error!("WebSocket connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("WebSocket accept error: {}", e);
                    }
                }
            }
        });

        info!("✓ WebSocket server started on {}", ws_addr);
        Some(handle)
    } else {
        warn!("HTTP_PORT not configured - WebSocket server not started");
        None
    };

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║           Group Buy Engine Ready                         ║");
    info!("╚══════════════════════════════════════════════════════════╝");
    info!("Press Ctrl+C to shutdown gracefully");

    // =========================================================================
    // SHUTDOWN HANDLING
    // =========================================================================
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, shutting down gracefully...");
        }
        _ = &mut sweeper_handle => {
            error!("Sweeper task exited unexpectedly");
        }
        _ = async {
            if let Some(handle) = ws_handle {
                handle.await.ok();
            } else {
                futures::future::pending::<()>().await;
            }
        } => {
            error!("WebSocket server exited unexpectedly");
        }
    }

    // Let an in-flight sweep finish before exiting
    if shutdown_tx.send(true).is_ok() {
        if let Err(e) = sweeper_handle.await {
            warn!("Sweeper did not stop cleanly: {}", e);
        }
    }
    relay_handle.abort();

    info!("Group buy engine shutdown complete");
    Ok(())
}
