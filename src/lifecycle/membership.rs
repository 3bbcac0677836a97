use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::authz::{guard, roles};
use crate::errors::AppError;
use crate::models::membership::{DbMembership, Membership, MembershipCreateRequest, MembershipDeltaRequest};
use crate::models::role::DbRole;
use crate::utils::utc_now;

pub(crate) async fn fetch_membership(
    conn: &mut SqliteConnection,
    organization_id: Uuid,
    membership_id: Uuid,
) -> Result<DbMembership, AppError> {
    // LEFT JOIN: a revoked membership may reference a physically removed role.
    sqlx::query_as::<_, DbMembership>(
        r#"
        SELECT m.id, m.user_id, m.organization_id, m.role_id, r.name AS role_name,
               m.created_at, m.updated_at, m.deleted_at
        FROM memberships m
        LEFT JOIN roles r ON r.id = m.role_id
        WHERE m.id = ? AND m.organization_id = ?
        "#,
    )
    .bind(membership_id)
    .bind(organization_id)
    .fetch_optional(conn)
    .await?
    .ok_or_else(|| AppError::not_found("membership not found"))
}

async fn fetch_assignable_role(
    conn: &mut SqliteConnection,
    organization_id: Uuid,
    role_id: Uuid,
) -> Result<DbRole, AppError> {
    let role = sqlx::query_as::<_, DbRole>(
        "SELECT id, organization_id, name, description, created_at, updated_at FROM roles WHERE id = ?",
    )
    .bind(role_id)
    .fetch_optional(conn)
    .await?
    .ok_or_else(|| AppError::not_found("role does not exist"))?;

    if let Some(role_org) = role.organization_id {
        if role_org != organization_id {
            return Err(AppError::constraint_violation(
                "role belongs to a different organization",
            ));
        }
    }

    Ok(role)
}

async fn ensure_no_active_sibling(
    conn: &mut SqliteConnection,
    user_id: Uuid,
    organization_id: Uuid,
    exclude_membership: Uuid,
) -> Result<(), AppError> {
    let clash: i64 = sqlx::query_scalar(
        "SELECT COUNT(1) FROM memberships WHERE user_id = ? AND organization_id = ? AND deleted_at IS NULL AND id != ?",
    )
    .bind(user_id)
    .bind(organization_id)
    .bind(exclude_membership)
    .fetch_one(conn)
    .await?;

    if clash > 0 {
        return Err(AppError::conflict(
            "user already has an active membership in this organization",
        ));
    }

    Ok(())
}

/// Adds a user to an organization. Revoked history rows are left alone; a
/// new join always creates a fresh row.
pub async fn create_membership(
    pool: &SqlitePool,
    organization_id: Uuid,
    request: &MembershipCreateRequest,
) -> Result<Membership, AppError> {
    let mut tx = pool.begin().await?;

    let organization = super::organization::fetch_organization(&mut tx, organization_id).await?;
    if organization.deleted_at.is_some() {
        return Err(AppError::invalid_transition("organization is deactivated"));
    }

    let user_deleted: Option<Option<chrono::DateTime<chrono::Utc>>> =
        sqlx::query_scalar("SELECT deleted_at FROM users WHERE id = ?")
            .bind(request.user_id)
            .fetch_optional(&mut *tx)
            .await?;
    match user_deleted {
        None => return Err(AppError::not_found("user not found")),
        Some(Some(_)) => return Err(AppError::invalid_transition("user is deactivated")),
        Some(None) => {}
    }

    fetch_assignable_role(&mut tx, organization_id, request.role_id).await?;
    ensure_no_active_sibling(&mut tx, request.user_id, organization_id, Uuid::nil()).await?;

    let now = utc_now();
    let membership_id = Uuid::new_v4();

    sqlx::query(
        "INSERT INTO memberships (id, user_id, organization_id, role_id, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(membership_id)
    .bind(request.user_id)
    .bind(organization_id)
    .bind(request.role_id)
    .bind(now)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    let created = fetch_membership(&mut tx, organization_id, membership_id).await?;
    tx.commit().await?;

    Ok(created.into())
}

/// Applies `{role_id?, revoked?}` to a membership.
///
/// State machine: Active -> Revoked ("remove"), Revoked -> Active
/// ("reactivate", resets `created_at`), Active -> Active with a role change
/// ("reassign"). Removal and reassignment away from Administrator consult
/// the guard inside this transaction; an empty delta is an idempotent no-op.
pub async fn apply_membership_delta(
    pool: &SqlitePool,
    organization_id: Uuid,
    membership_id: Uuid,
    delta: &MembershipDeltaRequest,
) -> Result<Membership, AppError> {
    let mut tx = pool.begin().await?;

    let current = fetch_membership(&mut tx, organization_id, membership_id).await?;

    let wants_revoke = delta.revoked == Some(true) && current.is_active();
    let wants_reactivate = delta.revoked == Some(false) && !current.is_active();
    let target_role_id = delta.role_id.unwrap_or(current.role_id);
    let role_changes = target_role_id != current.role_id;

    if !wants_revoke && !wants_reactivate && !role_changes {
        return Ok(current.into());
    }

    if wants_revoke && role_changes {
        return Err(AppError::bad_request(
            "cannot reassign and revoke in the same delta",
        ));
    }

    if !current.is_active() && !wants_reactivate {
        return Err(AppError::invalid_transition(
            "cannot change the role of a revoked membership",
        ));
    }

    let organization = super::organization::fetch_organization(&mut tx, organization_id).await?;
    let now = utc_now();

    // The guard protects live non-unitary organizations whose membership
    // under mutation currently carries the Administrator role.
    let guard_applies = current.role_name.as_deref() == Some(roles::ADMINISTRATOR)
        && !organization.is_unitary
        && organization.deleted_at.is_none();

    if wants_revoke {
        if guard_applies && guard::membership_would_orphan(&mut tx, organization_id, membership_id).await? {
            return Err(AppError::constraint_violation(
                "organization would be left without an Administrator",
            ));
        }

        sqlx::query("UPDATE memberships SET deleted_at = ?, updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(now)
            .bind(membership_id)
            .execute(&mut *tx)
            .await?;
    } else if wants_reactivate {
        if organization.deleted_at.is_some() {
            return Err(AppError::invalid_transition("organization is deactivated"));
        }

        let user_deleted: Option<chrono::DateTime<chrono::Utc>> =
            sqlx::query_scalar("SELECT deleted_at FROM users WHERE id = ?")
                .bind(current.user_id)
                .fetch_one(&mut *tx)
                .await?;
        if user_deleted.is_some() {
            return Err(AppError::invalid_transition("user is deactivated"));
        }

        fetch_assignable_role(&mut tx, organization_id, target_role_id).await?;
        ensure_no_active_sibling(&mut tx, current.user_id, organization_id, membership_id).await?;

        // Reactivation starts a new join: created_at is reset, the original
        // join date is not preserved.
        sqlx::query(
            "UPDATE memberships SET deleted_at = NULL, role_id = ?, created_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(target_role_id)
        .bind(now)
        .bind(now)
        .bind(membership_id)
        .execute(&mut *tx)
        .await?;
    } else {
        // Reassign: the guard check depends on the current role alone.
        fetch_assignable_role(&mut tx, organization_id, target_role_id).await?;

        if guard_applies && guard::membership_would_orphan(&mut tx, organization_id, membership_id).await? {
            return Err(AppError::constraint_violation(
                "organization would be left without an Administrator",
            ));
        }

        sqlx::query("UPDATE memberships SET role_id = ?, updated_at = ? WHERE id = ?")
            .bind(target_role_id)
            .bind(now)
            .bind(membership_id)
            .execute(&mut *tx)
            .await?;
    }

    let updated = fetch_membership(&mut tx, organization_id, membership_id).await?;
    tx.commit().await?;

    Ok(updated.into())
}
