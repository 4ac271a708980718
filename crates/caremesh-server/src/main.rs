mod config;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use caremesh_api::AppStateInner;
use caremesh_gateway::audit::TracingAuditSink;
use caremesh_gateway::auth::JwtVerifier;
use caremesh_gateway::connection;
use caremesh_gateway::{Gateway, GatewayConfig};

use crate::config::RelayConfig;

/// Used when `RUST_LOG` is unset. `audit` is the target of the audit sink.
const DEFAULT_LOG_FILTER: &str = "caremesh=debug,tower_http=debug,audit=info";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .init();

    let config = RelayConfig::from_env();

    // Init database
    let db = caremesh_db::Database::open(&config.db_path)?;

    let gateway_config: GatewayConfig = config.gateway.clone();
    let gateway = Gateway::new(
        Arc::new(db),
        Arc::new(JwtVerifier::new(&config.jwt_secret)),
        Arc::new(TracingAuditSink),
        gateway_config.clone(),
    );

    let shutdown = CancellationToken::new();
    let sweeper = gateway
        .registry()
        .spawn_sweeper(gateway_config.heartbeat_interval, shutdown.clone());

    let api_state = Arc::new(AppStateInner {
        gateway: gateway.clone(),
    });

    // Routes
    let ws_route = Router::new()
        .route("/ws", get(ws_upgrade))
        .with_state(gateway);

    let app = Router::new()
        .route("/health", get(|| async { "ok" }))
        .merge(caremesh_api::routes(api_state))
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = config.listen_addr().parse()?;
    info!("caremesh relay listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    let _ = sweeper.await;
    info!("caremesh relay stopped");
    Ok(())
}

async fn ws_upgrade(State(gateway): State<Gateway>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| connection::serve(socket, gateway))
}

async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
    shutdown.cancel();
}
