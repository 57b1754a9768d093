//! HTTP surface composition.
//!
//! Grounded on the teacher's `main.rs::create_router` call site — the
//! binary constructs `AppState` once and hands it to a single router
//! builder, rather than each route module standing up its own state. Routes
//! that need an authenticated caller run behind [`require_auth`]; the
//! handful that don't (registration, login, password reset, token refresh)
//! are mounted unguarded since they are exactly the endpoints a caller
//! without a session/API key needs to reach.

pub mod admin;
pub mod api_keys;
pub mod auth;
pub mod mcp_proxy;
pub mod mcp_registry;
pub mod tickets;

use axum::middleware;
use axum::routing::{delete, get, patch, post};
use axum::Router;

use crate::auth::require_auth;
use crate::state::AppState;

async fn healthz() -> &'static str {
    "ok"
}

pub fn create_router(state: AppState) -> Router {
    let public = Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/auth/register", post(auth::register))
        .route("/v1/auth/login", post(auth::login))
        .route("/v1/auth/2fa", post(auth::verify_two_factor))
        .route("/v1/auth/refresh", post(auth::refresh))
        .route("/v1/auth/password-reset", post(auth::request_password_reset))
        .route(
            "/v1/auth/password-reset/confirm",
            post(auth::complete_password_reset),
        );

    let protected = Router::new()
        .route("/v1/auth/logout", post(auth::logout))
        .route("/v1/auth/sessions", get(auth::list_sessions))
        .route("/v1/auth/sessions/:jti", delete(auth::revoke_session))
        .route("/v1/auth/2fa/enable", post(auth::enable_two_factor))
        .route("/v1/auth/2fa/confirm", post(auth::confirm_two_factor))
        .route("/v1/auth/2fa/disable", post(auth::disable_two_factor))
        .route("/v1/api-keys", get(api_keys::list).post(api_keys::create))
        .route("/v1/api-keys/:id", delete(api_keys::revoke))
        .route("/v1/mcps", get(mcp_registry::list).post(mcp_registry::create))
        .route(
            "/v1/mcps/:id",
            get(mcp_registry::get)
                .patch(mcp_registry::update)
                .delete(mcp_registry::delete),
        )
        .route("/v1/mcp", post(mcp_proxy::proxy))
        .route("/v1/tickets", get(tickets::list).post(tickets::create))
        .route("/v1/tickets/:id/assign", post(tickets::assign))
        .route("/v1/admin/users/:id/role", patch(admin::change_role))
        .route("/v1/admin/users/:id/suspend", post(admin::suspend_user))
        .route("/v1/admin/users/:id/unsuspend", post(admin::unsuspend_user))
        .route("/v1/admin/users/:id", delete(admin::delete_user))
        .route(
            "/v1/admin/users/:id/sessions",
            delete(admin::revoke_user_sessions),
        )
        .route(
            "/v1/admin/users/:id/force-password-reset",
            post(admin::force_password_reset),
        )
        .route(
            "/v1/admin/users/:id/2fa",
            delete(admin::disable_user_two_factor),
        )
        .route("/v1/admin/api-keys/:id", delete(admin::revoke_api_key))
        .route("/v1/admin/mcps/:id", patch(admin::update_mcp))
        .route("/v1/admin/orgs/:org_id/limits", post(admin::set_limits).delete(admin::clear_limits))
        .route("/v1/admin/orgs/:org_id/limits/history", get(admin::limits_history))
        .route("/v1/admin/tickets/:id/assign", post(admin::assign_ticket))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    public.merge(protected).with_state(state)
}
