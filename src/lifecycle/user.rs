use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::authz::guard;
use crate::errors::AppError;
use crate::models::user::{DbUser, User, UserDeltaRequest};
use crate::utils::{normalize_email, utc_now, validate_email};

pub(crate) async fn fetch_user(
    conn: &mut SqliteConnection,
    user_id: Uuid,
) -> Result<DbUser, AppError> {
    sqlx::query_as::<_, DbUser>(
        "SELECT id, name, email, password_hash, is_operator, created_at, updated_at, deleted_at FROM users WHERE id = ?",
    )
    .bind(user_id)
    .fetch_optional(conn)
    .await?
    .ok_or_else(|| AppError::not_found("user not found"))
}

async fn ensure_email_available(
    conn: &mut SqliteConnection,
    email: &str,
    exclude_user: Uuid,
) -> Result<(), AppError> {
    let clash: i64 = sqlx::query_scalar(
        "SELECT COUNT(1) FROM users WHERE email = ? AND deleted_at IS NULL AND id != ?",
    )
    .bind(email)
    .bind(exclude_user)
    .fetch_one(conn)
    .await?;

    if clash > 0 {
        return Err(AppError::conflict("email already in use"));
    }

    Ok(())
}

/// Applies `{name?, email?, deleted?}` to a user.
///
/// Deactivation is all-or-nothing: every organization where the user is an
/// active Administrator is guard-checked before any write, then the user's
/// memberships in non-unitary organizations are revoked, the personal
/// organization is deactivated, and the user is marked deleted, in one
/// transaction. Reactivation restores the user and their personal
/// organization only.
pub async fn apply_user_delta(
    pool: &SqlitePool,
    user_id: Uuid,
    delta: &UserDeltaRequest,
) -> Result<User, AppError> {
    let mut tx = pool.begin().await?;

    let current = fetch_user(&mut tx, user_id).await?;

    let wants_delete = delta.deleted == Some(true) && current.deleted_at.is_none();
    let wants_reactivate = delta.deleted == Some(false) && current.deleted_at.is_some();
    let new_name = delta
        .name
        .as_ref()
        .filter(|name| **name != current.name)
        .cloned();
    let new_email = delta
        .email
        .as_deref()
        .map(normalize_email)
        .filter(|email| *email != current.email);
    if let Some(email) = &new_email {
        validate_email(email)?;
    }

    if !wants_delete && !wants_reactivate && new_name.is_none() && new_email.is_none() {
        return Ok(current.try_into()?);
    }

    if current.deleted_at.is_some() && !wants_reactivate {
        return Err(AppError::already_deleted("user is deactivated"));
    }

    let now = utc_now();

    if wants_reactivate {
        let email = new_email.as_deref().unwrap_or(&current.email);
        ensure_email_available(&mut tx, email, user_id).await?;

        sqlx::query("UPDATE users SET deleted_at = NULL, updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        // The personal organization follows its owner back to life.
        sqlx::query(
            "UPDATE organizations SET deleted_at = NULL, updated_at = ? WHERE is_unitary = 1 AND name = ? AND deleted_at IS NOT NULL",
        )
        .bind(now)
        .bind(user_id.to_string())
        .execute(&mut *tx)
        .await?;
    }

    if let Some(name) = &new_name {
        sqlx::query("UPDATE users SET name = ?, updated_at = ? WHERE id = ?")
            .bind(name)
            .bind(now)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
    }

    if let Some(email) = &new_email {
        if !wants_reactivate {
            ensure_email_available(&mut tx, email, user_id).await?;
        }

        sqlx::query("UPDATE users SET email = ?, updated_at = ? WHERE id = ?")
            .bind(email)
            .bind(now)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
    }

    if wants_delete {
        // Reject before any write if any organization would lose its last
        // active Administrator.
        let orphaned = guard::orgs_orphaned_by_user(&mut tx, user_id).await?;
        if !orphaned.is_empty() {
            return Err(AppError::constraint_violation(format!(
                "deactivation would leave {} organization(s) without an Administrator",
                orphaned.len()
            )));
        }

        sqlx::query(
            r#"
            UPDATE memberships
            SET deleted_at = ?, updated_at = ?
            WHERE user_id = ?
              AND deleted_at IS NULL
              AND organization_id IN (SELECT id FROM organizations WHERE is_unitary = 0)
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE organizations SET deleted_at = ?, updated_at = ? WHERE is_unitary = 1 AND name = ? AND deleted_at IS NULL",
        )
        .bind(now)
        .bind(now)
        .bind(user_id.to_string())
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE users SET deleted_at = ?, updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(now)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
    }

    let updated = fetch_user(&mut tx, user_id).await?;
    tx.commit().await?;

    Ok(updated.try_into()?)
}
