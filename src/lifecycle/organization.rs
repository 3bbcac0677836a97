use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::authz::roles;
use crate::errors::AppError;
use crate::models::membership::{DbMembership, Membership};
use crate::models::organization::{DbOrganization, Organization, OrganizationDeltaRequest};
use crate::utils::utc_now;

pub(crate) async fn fetch_organization(
    conn: &mut SqliteConnection,
    organization_id: Uuid,
) -> Result<DbOrganization, AppError> {
    sqlx::query_as::<_, DbOrganization>(
        "SELECT id, name, is_unitary, created_at, updated_at, deleted_at FROM organizations WHERE id = ?",
    )
    .bind(organization_id)
    .fetch_optional(conn)
    .await?
    .ok_or_else(|| AppError::not_found("organization not found"))
}

/// Creates a non-unitary organization with the creator as its first
/// Administrator, in one transaction.
pub async fn create_organization(
    pool: &SqlitePool,
    creator_id: Uuid,
    name: &str,
) -> Result<(Organization, Membership), AppError> {
    let now = utc_now();
    let organization_id = Uuid::new_v4();
    let membership_id = Uuid::new_v4();

    let mut tx = pool.begin().await?;

    sqlx::query(
        "INSERT INTO organizations (id, name, is_unitary, created_at, updated_at) VALUES (?, ?, 0, ?, ?)",
    )
    .bind(organization_id)
    .bind(name)
    .bind(now)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    let admin_role_id: Uuid = sqlx::query_scalar(
        "SELECT id FROM roles WHERE organization_id IS NULL AND name = ?",
    )
    .bind(roles::ADMINISTRATOR)
    .fetch_one(&mut *tx)
    .await?;

    sqlx::query(
        "INSERT INTO memberships (id, user_id, organization_id, role_id, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(membership_id)
    .bind(creator_id)
    .bind(organization_id)
    .bind(admin_role_id)
    .bind(now)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    let organization = fetch_organization(&mut tx, organization_id).await?;
    let membership = sqlx::query_as::<_, DbMembership>(
        r#"
        SELECT m.id, m.user_id, m.organization_id, m.role_id, r.name AS role_name,
               m.created_at, m.updated_at, m.deleted_at
        FROM memberships m
        LEFT JOIN roles r ON r.id = m.role_id
        WHERE m.id = ?
        "#,
    )
    .bind(membership_id)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;

    Ok((organization.try_into()?, membership.into()))
}

/// Applies `{name?, deleted?}` to an organization.
///
/// Deactivation revokes every active non-Administrator membership and marks
/// the organization deleted, atomically; administrators keep access to the
/// deactivated organization. Reactivation clears the deletion mark only and
/// does not restore previously revoked memberships.
pub async fn apply_organization_delta(
    pool: &SqlitePool,
    organization_id: Uuid,
    delta: &OrganizationDeltaRequest,
) -> Result<Organization, AppError> {
    let mut tx = pool.begin().await?;

    let current = fetch_organization(&mut tx, organization_id).await?;

    let wants_delete = delta.deleted == Some(true) && current.deleted_at.is_none();
    let wants_reactivate = delta.deleted == Some(false) && current.deleted_at.is_some();
    let new_name = delta
        .name
        .as_ref()
        .filter(|name| **name != current.name)
        .cloned();

    if !wants_delete && !wants_reactivate && new_name.is_none() {
        return Ok(current.try_into()?);
    }

    if current.deleted_at.is_some() && !wants_reactivate {
        return Err(AppError::already_deleted("organization is deactivated"));
    }

    if (wants_delete || wants_reactivate) && current.is_unitary {
        return Err(AppError::invalid_transition(
            "personal organizations follow their owner's lifecycle",
        ));
    }

    let now = utc_now();

    if wants_reactivate {
        sqlx::query("UPDATE organizations SET deleted_at = NULL, updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(organization_id)
            .execute(&mut *tx)
            .await?;
    }

    if let Some(name) = &new_name {
        sqlx::query("UPDATE organizations SET name = ?, updated_at = ? WHERE id = ?")
            .bind(name)
            .bind(now)
            .bind(organization_id)
            .execute(&mut *tx)
            .await?;
    }

    if wants_delete {
        // Administrators retain access to an organization pending deletion so
        // they can service in-flight obligations.
        sqlx::query(
            r#"
            UPDATE memberships
            SET deleted_at = ?, updated_at = ?
            WHERE organization_id = ?
              AND deleted_at IS NULL
              AND role_id NOT IN (SELECT id FROM roles WHERE name = ?)
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(organization_id)
        .bind(roles::ADMINISTRATOR)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE organizations SET deleted_at = ?, updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(now)
            .bind(organization_id)
            .execute(&mut *tx)
            .await?;
    }

    let updated = fetch_organization(&mut tx, organization_id).await?;
    tx.commit().await?;

    Ok(updated.try_into()?)
}
