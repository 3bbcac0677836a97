use std::collections::HashSet;

use async_trait::async_trait;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::errors::AppError;

/// Computes the effective permission set for a (user, organization) pair.
///
/// The trait seam exists so the cache can be exercised with a fake resolver
/// in tests.
#[async_trait]
pub trait PermissionResolver: Send + Sync {
    /// Follows active membership -> role -> permissions. No active membership
    /// resolves to the empty set, never an error. Pure read.
    async fn resolve(&self, user_id: Uuid, organization_id: Uuid) -> Result<HashSet<String>, AppError>;
}

pub struct SqlPermissionResolver {
    pool: SqlitePool,
}

impl SqlPermissionResolver {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PermissionResolver for SqlPermissionResolver {
    async fn resolve(&self, user_id: Uuid, organization_id: Uuid) -> Result<HashSet<String>, AppError> {
        let permissions: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT rp.permission
            FROM memberships m
            INNER JOIN role_permissions rp ON rp.role_id = m.role_id
            WHERE m.user_id = ? AND m.organization_id = ? AND m.deleted_at IS NULL
            "#,
        )
        .bind(user_id)
        .bind(organization_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(permissions.into_iter().collect())
    }
}
