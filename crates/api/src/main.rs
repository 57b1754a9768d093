// API server clippy configuration
#![allow(clippy::useless_vec)]
#![allow(clippy::single_match)]
#![allow(clippy::needless_borrows_for_generic_args)]
#![allow(clippy::format_in_format_args)]
#![allow(clippy::inconsistent_digit_grouping)]
#![allow(clippy::expect_fun_call)]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! PlexMCP API Server
//!
//! The gateway's HTTP ingress: authentication, tenant-scoped MCP registry
//! and proxy, quota admission, and the admin surface. A configuration error
//! (missing/insecure secret) exits `1`; an unrecoverable dependency failure
//! at startup (database unreachable) exits `2`, matching spec §6's exit
//! code contract.

use std::net::SocketAddr;
use std::process::ExitCode;

use axum::http::{header, HeaderValue, Method};
use axum::middleware as axum_middleware;
use plexmcp_api::config::Config;
use plexmcp_api::security::security_headers_middleware;
use plexmcp_api::{create_router, AppState};
use plexmcp_shared::create_pool;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,plexmcp_api=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("starting plexmcp api server v{}", env!("CARGO_PKG_VERSION"));

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, "configuration rejected");
            return ExitCode::from(1);
        }
    };
    tracing::info!("configuration loaded");

    let pool = match create_pool(&config.database_url, config.database_max_connections).await {
        Ok(pool) => pool,
        Err(err) => {
            tracing::error!(error = %err, "failed to connect to database");
            return ExitCode::from(2);
        }
    };
    tracing::info!("database connection established");

    let state = AppState::new(pool, config.clone());

    let allowed_origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect();
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed_origins))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::ACCEPT,
            axum::http::HeaderName::from_static("x-api-key"),
        ])
        .allow_credentials(true);

    let app = create_router(state)
        .layer(axum_middleware::from_fn(security_headers_middleware))
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = match config.bind_addr.parse() {
        Ok(addr) => addr,
        Err(err) => {
            tracing::error!(error = %err, bind_addr = %config.bind_addr, "invalid bind address");
            return ExitCode::from(1);
        }
    };

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(error = %err, %addr, "failed to bind listener");
            return ExitCode::from(2);
        }
    };

    tracing::info!(%addr, "listening");
    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!(error = %err, "server exited with error");
        return ExitCode::from(2);
    }

    tracing::info!("shutdown complete");
    ExitCode::SUCCESS
}

/// Waits for SIGINT/SIGTERM so in-flight requests get axum's graceful-
/// shutdown drain instead of being cut off mid-response.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received, draining in-flight requests");
}
