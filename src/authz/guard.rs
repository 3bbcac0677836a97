//! Administrator-preservation guard.
//!
//! Every live non-unitary organization must keep at least one active
//! Administrator membership. The checks here run on the caller's own
//! connection so they share the transaction with the write they protect;
//! two concurrent last-admin removals cannot both pass.

use sqlx::SqliteConnection;
use uuid::Uuid;

use crate::errors::AppError;

use super::roles;

/// Would revoking (or reassigning away from Administrator) this membership
/// leave its organization without an active Administrator?
///
/// Counts sibling active Administrator memberships, excluding the membership
/// under mutation. Callers invoke this only when the current role is
/// Administrator and the organization is live and non-unitary.
pub async fn membership_would_orphan(
    conn: &mut SqliteConnection,
    organization_id: Uuid,
    membership_id: Uuid,
) -> Result<bool, AppError> {
    let siblings: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(1)
        FROM memberships m
        INNER JOIN roles r ON r.id = m.role_id
        WHERE m.organization_id = ?
          AND m.id != ?
          AND m.deleted_at IS NULL
          AND r.name = ?
        "#,
    )
    .bind(organization_id)
    .bind(membership_id)
    .bind(roles::ADMINISTRATOR)
    .fetch_one(conn)
    .await?;

    Ok(siblings == 0)
}

/// Organizations that would lose their last active Administrator if every
/// membership of this user were revoked. Used by user deactivation, which
/// must reject before any write when the result is non-empty.
pub async fn orgs_orphaned_by_user(
    conn: &mut SqliteConnection,
    user_id: Uuid,
) -> Result<Vec<Uuid>, AppError> {
    let orphaned: Vec<Uuid> = sqlx::query_scalar(
        r#"
        SELECT m.organization_id
        FROM memberships m
        INNER JOIN roles r ON r.id = m.role_id
        INNER JOIN organizations o ON o.id = m.organization_id
        WHERE m.user_id = ?
          AND m.deleted_at IS NULL
          AND r.name = ?
          AND o.is_unitary = 0
          AND o.deleted_at IS NULL
          AND NOT EXISTS (
              SELECT 1
              FROM memberships s
              INNER JOIN roles sr ON sr.id = s.role_id
              WHERE s.organization_id = m.organization_id
                AND s.user_id != m.user_id
                AND s.deleted_at IS NULL
                AND sr.name = ?
          )
        "#,
    )
    .bind(user_id)
    .bind(roles::ADMINISTRATOR)
    .bind(roles::ADMINISTRATOR)
    .fetch_all(conn)
    .await?;

    Ok(orphaned)
}
