//! String constants used as `action`/`target_type`/`severity` values in
//! audit events, kept in one place so call sites can't typo a value that a
//! downstream consumer matches on.

pub mod action {
    pub const LOGIN_SUCCEEDED: &str = "login_succeeded";
    pub const LOGIN_FAILED: &str = "login_failed";
    pub const TWO_FACTOR_ENABLED: &str = "two_factor_enabled";
    pub const TWO_FACTOR_DISABLED: &str = "two_factor_disabled";
    pub const SESSION_REVOKED: &str = "session_revoked";
    pub const API_KEY_CREATED: &str = "api_key_created";
    pub const API_KEY_REVOKED: &str = "api_key_revoked";
    pub const MCP_REGISTERED: &str = "mcp_registered";
    pub const MCP_UPDATED: &str = "mcp_updated";
    pub const MCP_DELETED: &str = "mcp_deleted";
    pub const MCP_REQUEST_PROXIED: &str = "mcp_request_proxied";
    pub const ROLE_CHANGED: &str = "role_changed";
    pub const ORG_SUSPENDED: &str = "org_suspended";
    pub const ORG_UNSUSPENDED: &str = "org_unsuspended";
    pub const ORG_SOFT_DELETED: &str = "org_soft_deleted";
    pub const CUSTOM_LIMIT_SET: &str = "custom_limit_set";
    pub const CUSTOM_LIMIT_CLEARED: &str = "custom_limit_cleared";
    pub const ELEVATION_GRANTED: &str = "elevation_granted";
    pub const PERMISSION_DENIED: &str = "permission_denied";
    pub const TICKET_ASSIGNED: &str = "ticket_assigned";
    pub const MCP_HEALTH_STATE_CHANGED: &str = "mcp_health_state_changed";
    pub const TOKEN_REFRESHED: &str = "token_refreshed";
    pub const LOGOUT: &str = "logout";
    pub const PASSWORD_RESET_REQUESTED: &str = "password_reset_requested";
    pub const PASSWORD_RESET_COMPLETED: &str = "password_reset_completed";
    pub const ACCOUNT_LOCKED: &str = "account_locked";
}

pub mod target_type {
    pub const USER: &str = "user";
    pub const ORGANIZATION: &str = "organization";
    pub const SESSION: &str = "session";
    pub const API_KEY: &str = "api_key";
    pub const MCP_DESCRIPTOR: &str = "mcp_descriptor";
    pub const SUPPORT_TICKET: &str = "support_ticket";
}

pub mod severity {
    pub const INFO: &str = "info";
    pub const WARNING: &str = "warning";
    pub const HIGH: &str = "high";
    pub const CRITICAL: &str = "critical";
}
