//! Tenant Context & Policy Engine (component C1).
//!
//! Every tenant-scoped storage access in this codebase takes a
//! `&TenantContext` as its first argument rather than a bare `org_id`, so the
//! scoping check lives in one place instead of being re-derived at each call
//! site the way the teacher's handlers do it ad hoc (`WHERE org_id = $1`
//! repeated across `mcp_proxy.rs` and `admin_legacy.rs`). Postgres row-level
//! security is still the storage-layer backstop; this type is the
//! application-level enforcement point that is authoritative even when RLS
//! is misconfigured or bypassed by a superuser connection.

use std::fmt;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformRole {
    Member,
    Admin,
    Staff,
    Superadmin,
}

impl PlatformRole {
    pub fn from_str_lenient(s: &str) -> Self {
        match s {
            "superadmin" => PlatformRole::Superadmin,
            "admin" => PlatformRole::Admin,
            "staff" => PlatformRole::Staff,
            _ => PlatformRole::Member,
        }
    }

    fn rank(self) -> u8 {
        match self {
            PlatformRole::Member => 0,
            PlatformRole::Staff => 1,
            PlatformRole::Admin => 2,
            PlatformRole::Superadmin => 3,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("request has no resolved organization context")]
    ContextMissing,
    #[error("role {required:?} or higher is required for this operation")]
    PermissionDenied { required: String },
    #[error("elevation to organization {target} was not authorized")]
    ElevationDenied { target: Uuid },
}

/// Identifies the organization and acting principal for one request, plus
/// whatever elevation state the request has been granted.
///
/// `org_id` is `None` only for requests that have not yet resolved a tenant
/// (e.g. platform-admin listing endpoints before a target org is chosen);
/// `require_role`/tenant-scoped queries reject a missing context rather than
/// silently defaulting to "no filter".
#[derive(Debug, Clone)]
pub struct TenantContext {
    pub user_id: Uuid,
    org_id: Option<Uuid>,
    pub platform_role: PlatformRole,
    elevated_for: Option<Uuid>,
    pub correlation_id: Uuid,
}

impl TenantContext {
    pub fn new(user_id: Uuid, org_id: Uuid, platform_role: PlatformRole) -> Self {
        Self {
            user_id,
            org_id: Some(org_id),
            platform_role,
            elevated_for: None,
            correlation_id: Uuid::new_v4(),
        }
    }

    /// A context for a principal that has not yet resolved an org (e.g. a
    /// platform operator browsing across tenants before picking one).
    pub fn without_org(user_id: Uuid, platform_role: PlatformRole) -> Self {
        Self {
            user_id,
            org_id: None,
            platform_role,
            elevated_for: None,
            correlation_id: Uuid::new_v4(),
        }
    }

    /// The org this context is currently scoped to: the elevation target if
    /// elevated, otherwise the context's own org.
    pub fn org_id(&self) -> Result<Uuid, PolicyError> {
        self.elevated_for.or(self.org_id).ok_or(PolicyError::ContextMissing)
    }

    pub fn is_elevated(&self) -> bool {
        self.elevated_for.is_some()
    }

    /// Return a context scoped to a different organization than the one the
    /// principal belongs to. Only platform staff and above may elevate; the
    /// caller is responsible for auditing every successful elevation
    /// (see `crates/api/src/audit.rs`).
    pub fn with_elevation(&self, target_org: Uuid) -> Result<Self, PolicyError> {
        if self.platform_role.rank() < PlatformRole::Staff.rank() {
            return Err(PolicyError::ElevationDenied { target: target_org });
        }
        Ok(Self {
            elevated_for: Some(target_org),
            ..self.clone()
        })
    }

    /// Return a context scoped to a specific org without requiring
    /// elevation privileges; used when a principal's own membership already
    /// grants access (e.g. a member acting within their own org).
    pub fn with_org(&self, org_id: Uuid) -> Self {
        Self {
            org_id: Some(org_id),
            ..self.clone()
        }
    }

    /// Assert the acting principal holds at least `required`. Elevation does
    /// not raise `platform_role` itself, so an elevated staff member still
    /// can't pass an `Admin` check meant to gate destructive operations.
    pub fn require_role(&self, required: PlatformRole) -> Result<(), PolicyError> {
        if self.platform_role.rank() >= required.rank() {
            Ok(())
        } else {
            Err(PolicyError::PermissionDenied {
                required: format!("{required:?}"),
            })
        }
    }

    /// Assert a row's `org_id` matches this context's scope. The single
    /// enforcement point every tenant-scoped repository method calls before
    /// returning a row to a handler.
    pub fn assert_scope(&self, row_org_id: Uuid) -> Result<(), PolicyError> {
        let scope = self.org_id()?;
        if scope == row_org_id {
            Ok(())
        } else {
            Err(PolicyError::PermissionDenied {
                required: "matching organization scope".to_string(),
            })
        }
    }
}

impl fmt::Display for PlatformRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PlatformRole::Member => "member",
            PlatformRole::Staff => "staff",
            PlatformRole::Admin => "admin",
            PlatformRole::Superadmin => "superadmin",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(role: PlatformRole) -> TenantContext {
        TenantContext::new(Uuid::new_v4(), Uuid::new_v4(), role)
    }

    #[test]
    fn member_cannot_elevate() {
        let c = ctx(PlatformRole::Member);
        let target = Uuid::new_v4();
        assert_eq!(
            c.with_elevation(target).unwrap_err(),
            PolicyError::ElevationDenied { target }
        );
    }

    #[test]
    fn staff_can_elevate_and_scope_follows_target() {
        let c = ctx(PlatformRole::Staff);
        let target = Uuid::new_v4();
        let elevated = c.with_elevation(target).expect("staff may elevate");
        assert!(elevated.is_elevated());
        assert_eq!(elevated.org_id().unwrap(), target);
    }

    #[test]
    fn require_role_respects_rank_ordering() {
        let c = ctx(PlatformRole::Admin);
        assert!(c.require_role(PlatformRole::Staff).is_ok());
        assert!(c.require_role(PlatformRole::Superadmin).is_err());
    }

    #[test]
    fn assert_scope_rejects_foreign_org() {
        let c = ctx(PlatformRole::Member);
        assert!(c.assert_scope(Uuid::new_v4()).is_err());
    }

    #[test]
    fn context_without_org_requires_elevation_before_scoping() {
        let c = TenantContext::without_org(Uuid::new_v4(), PlatformRole::Staff);
        assert_eq!(c.org_id().unwrap_err(), PolicyError::ContextMissing);
        let elevated = c.with_elevation(Uuid::new_v4()).unwrap();
        assert!(elevated.org_id().is_ok());
    }
}
