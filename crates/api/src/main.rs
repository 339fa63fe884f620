#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Upshift API Server

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::{header, HeaderName, HeaderValue, Method};
use tokio::signal;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use upshift_api::{create_router, AppState, Config};
use upshift_billing::{QueueConfig, QueueSupervisor, ReconciliationService};
use upshift_shared::{create_migration_pool, create_pool, run_migrations};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let config = Config::from_env()?;

    let (plain_layer, json_layer) = if config.json_logs {
        (None, Some(tracing_subscriber::fmt::layer().json()))
    } else {
        (Some(tracing_subscriber::fmt::layer()), None)
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,upshift_api=debug,upshift_billing=debug".into()),
        )
        .with(plain_layer)
        .with(json_layer)
        .init();

    tracing::info!("Starting Upshift API Server v{}", env!("CARGO_PKG_VERSION"));

    tracing::info!("Connecting to database...");
    let pool = create_pool(&config.database_url).await?;
    tracing::info!("Database connection established");

    // Migrations run over a dedicated direct connection
    let migration_pool = create_migration_pool(&config.database_url).await?;
    run_migrations(&migration_pool).await?;
    migration_pool.close().await;
    tracing::info!("Migrations applied");

    let service = ReconciliationService::from_env(pool)?;

    let supervisor = QueueSupervisor::start(
        Arc::new(service.executor.clone()),
        QueueConfig {
            capacity: config.queue_capacity,
            max_concurrency: config.queue_max_concurrency,
        },
    );

    let state = AppState::new(config.clone(), &service, supervisor.queue());

    let allowed_origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect();
    tracing::info!(
        allowed_origins = ?allowed_origins,
        "CORS configured with {} allowed origins",
        allowed_origins.len()
    );

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed_origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::ACCEPT,
            header::ORIGIN,
            HeaderName::from_static("x-user-token"),
        ])
        .expose_headers([header::CONTENT_TYPE]);

    let app = create_router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = config.bind_address.parse()?;
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("HTTP server stopped, draining reconciliation queue");
    let stats = supervisor.shutdown(config.shutdown_grace).await;
    tracing::info!(
        completed = stats.completed,
        failed = stats.failed,
        in_flight = stats.in_flight,
        "Shutdown complete"
    );

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
