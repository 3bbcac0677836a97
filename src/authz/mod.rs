//! Authorization engine.
//!
//! Request flow: operator bypass -> permission cache -> resolver -> check
//! evaluator. Lifecycle transitions that can strip administrative coverage
//! additionally consult the guard inside their own transaction.

pub mod cache;
pub mod evaluator;
pub mod guard;
pub mod resolver;

pub use cache::{CacheConfig, PermissionCache, PermissionSet};
pub use evaluator::{evaluate, Denial, PermissionCheck};
pub use resolver::{PermissionResolver, SqlPermissionResolver};

use std::sync::Arc;

use sqlx::SqlitePool;
use uuid::Uuid;

use crate::errors::AppError;
use crate::jwt::AuthUser;

/// Well-known global role names. Custom roles may not use these.
pub mod roles {
    pub const ADMINISTRATOR: &str = "Administrator";
    pub const USER: &str = "User";
    pub const PUBLISHER: &str = "Publisher";
    pub const BILLING_MANAGER: &str = "Billing Manager";
    pub const ORGANIZATION_MANAGER: &str = "Organization Manager";

    pub const RESTRICTED_NAMES: [&str; 5] =
        [ADMINISTRATOR, USER, PUBLISHER, BILLING_MANAGER, ORGANIZATION_MANAGER];
}

/// The closed permission catalog: `admin` plus `{read|write}:{resource}`.
pub mod tokens {
    pub const ADMIN: &str = "admin";

    pub const READ_ORGANIZATION: &str = "read:organization";
    pub const WRITE_ORGANIZATION: &str = "write:organization";
    pub const READ_MEMBERS: &str = "read:members";
    pub const WRITE_MEMBERS: &str = "write:members";
    pub const READ_ROLES: &str = "read:roles";
    pub const WRITE_ROLES: &str = "write:roles";
    pub const READ_PACKAGES: &str = "read:packages";
    pub const WRITE_PACKAGES: &str = "write:packages";
    pub const READ_VERSIONS: &str = "read:versions";
    pub const WRITE_VERSIONS: &str = "write:versions";
    pub const READ_DOWNLOADS: &str = "read:downloads";
    pub const WRITE_DOWNLOADS: &str = "write:downloads";
    pub const READ_BILLING: &str = "read:billing";
    pub const WRITE_BILLING: &str = "write:billing";

    const RESOURCES: [&str; 7] = [
        "organization",
        "members",
        "roles",
        "packages",
        "versions",
        "downloads",
        "billing",
    ];

    pub fn is_valid(token: &str) -> bool {
        if token == ADMIN {
            return true;
        }

        match token.split_once(':') {
            Some(("read", resource)) | Some(("write", resource)) => RESOURCES.contains(&resource),
            _ => false,
        }
    }
}

/// Front door for organization-scoped permission checks.
///
/// The system-operator bypass is decided from the request context before any
/// cache or store work happens.
#[derive(Clone)]
pub struct Authorizer {
    cache: Arc<PermissionCache>,
}

impl Authorizer {
    pub fn new(cache: Arc<PermissionCache>) -> Self {
        Self { cache }
    }

    pub fn from_pool(pool: SqlitePool, config: CacheConfig) -> Self {
        let resolver = Arc::new(SqlPermissionResolver::new(pool));
        Self::new(Arc::new(PermissionCache::new(config, resolver)))
    }

    pub async fn authorize(
        &self,
        caller: &AuthUser,
        organization_id: Uuid,
        check: &PermissionCheck,
    ) -> Result<(), AppError> {
        if caller.is_operator {
            return Ok(());
        }

        let permissions = self.cache.get(caller.user_id, organization_id).await?;

        evaluate(&permissions, check).map_err(|denial| match denial {
            Denial::NoMembership => AppError::no_membership("caller has no privileges in this organization"),
            Denial::MissingRequired(token) => {
                AppError::missing_permission(format!("requires {token}"))
            }
            Denial::MissingAnyOf(tokens) => {
                AppError::missing_permission(format!("requires one of: {}", tokens.join(", ")))
            }
        })
    }

    pub async fn invalidate(&self, user_id: Uuid, organization_id: Uuid) {
        self.cache.invalidate(user_id, organization_id).await;
    }
}
