//! Shared application state.
//!
//! Adapted from the teacher's file of the same name. Supabase-JWT
//! fallback/token-coalescing, GeoIP, Fly.io SSL provisioning, WebSocket
//! real-time state, security email, and Stripe-billing fields are dropped —
//! none are named by any gateway component. Kept and generalized: the JWT
//! and API key managers, the shared MCP client (now holding a connection
//! pool and health checker alongside it), the in-memory rate limiter, and
//! the audit log.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::FromRef;
use sqlx::PgPool;

use plexmcp_quota::{SpendCap, UsageMeter};
use plexmcp_shared::RateLimiter;

use crate::audit::AuditLog;
use crate::auth::{ApiKeyManager, AuthState, JwtManager};
use crate::config::Config;
use crate::mcp::{ConnectionPool, HealthChecker, McpClient};

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<Config>,
    pub jwt_manager: JwtManager,
    pub api_key_manager: ApiKeyManager,
    pub rate_limiter: Arc<RateLimiter>,
    pub audit: AuditLog,
    pub mcp_client: Arc<McpClient>,
    pub connection_pool: Arc<ConnectionPool>,
    pub usage_meter: Arc<UsageMeter>,
    pub spend_cap: Arc<SpendCap>,
    /// Built once and shared with the router's auth middleware layer, so
    /// brute-force lockout tracking (`AuthState::login_failures`) sees every
    /// attempt against both the login endpoint and the authenticated
    /// request path rather than keeping two independent counters.
    auth_state: AuthState,
}

impl AppState {
    /// Builds state and spawns the two background tasks every instance of
    /// the gateway runs for its lifetime: the health checker's probe loop
    /// and a periodic sweep of idle connection-pool/rate-limiter entries.
    pub fn new(pool: PgPool, config: Config) -> Self {
        let config = Arc::new(config);

        let jwt_manager = JwtManager::new(
            &config.jwt_secret,
            config.jwt_access_expiry_minutes,
            config.jwt_refresh_expiry_days,
        );
        let api_key_manager = ApiKeyManager::new(&config.api_key_hmac_secret);
        let rate_limiter = Arc::new(RateLimiter::new_in_memory());
        let audit = AuditLog::spawn(pool.clone(), config.audit_channel_capacity);
        let mcp_client = Arc::new(McpClient::new(config.mcp_max_response_bytes));
        let connection_pool = Arc::new(ConnectionPool::new());
        let usage_meter = Arc::new(UsageMeter::new(pool.clone()));
        let spend_cap = Arc::new(SpendCap::new(pool.clone()));

        let health_checker = Arc::new(HealthChecker::new(
            pool.clone(),
            mcp_client.clone(),
            audit.clone(),
            config.health_check_failure_threshold,
            config.health_check_interval_secs,
            config.totp_encryption_key.clone(),
        ));
        health_checker.spawn();

        let auth_state = AuthState::new(jwt_manager.clone(), api_key_manager.clone(), pool.clone());

        let sweep_pool = connection_pool.clone();
        let sweep_limiter = rate_limiter.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(300));
            loop {
                interval.tick().await;
                sweep_pool.sweep_idle();
                sweep_limiter.sweep_idle();
            }
        });

        Self {
            pool,
            config,
            jwt_manager,
            api_key_manager,
            rate_limiter,
            audit,
            mcp_client,
            connection_pool,
            usage_meter,
            spend_cap,
            auth_state,
        }
    }

    pub fn auth_state(&self) -> AuthState {
        self.auth_state.clone()
    }
}

/// Lets Axum's `State` extractor hand the auth middleware its narrower
/// `AuthState` out of the same `AppState` every handler already runs on, so
/// `middleware::from_fn_with_state` doesn't need a separately-built router.
impl FromRef<AppState> for AuthState {
    fn from_ref(state: &AppState) -> Self {
        state.auth_state()
    }
}
