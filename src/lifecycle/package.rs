use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::package::{
    ArchiveDeltaRequest, DbPackage, DbPackageVersion, Package, PackageVersion,
};
use crate::utils::utc_now;

pub(crate) async fn fetch_package(
    conn: &mut SqliteConnection,
    organization_id: Uuid,
    package_id: Uuid,
) -> Result<DbPackage, AppError> {
    sqlx::query_as::<_, DbPackage>(
        "SELECT id, organization_id, name, created_at, updated_at, archived_at, deleted_at FROM packages WHERE id = ? AND organization_id = ?",
    )
    .bind(package_id)
    .bind(organization_id)
    .fetch_optional(conn)
    .await?
    .ok_or_else(|| AppError::not_found("package not found"))
}

pub(crate) async fn fetch_version(
    conn: &mut SqliteConnection,
    package_id: Uuid,
    version_id: Uuid,
) -> Result<DbPackageVersion, AppError> {
    sqlx::query_as::<_, DbPackageVersion>(
        "SELECT id, package_id, version, created_at, updated_at, archived_at, deleted_at FROM package_versions WHERE id = ? AND package_id = ?",
    )
    .bind(version_id)
    .bind(package_id)
    .fetch_optional(conn)
    .await?
    .ok_or_else(|| AppError::not_found("package version not found"))
}

pub async fn create_package(
    pool: &SqlitePool,
    organization_id: Uuid,
    name: &str,
) -> Result<Package, AppError> {
    let mut tx = pool.begin().await?;

    let organization = super::organization::fetch_organization(&mut tx, organization_id).await?;
    if organization.deleted_at.is_some() {
        return Err(AppError::invalid_transition("organization is deactivated"));
    }

    let clash: i64 = sqlx::query_scalar(
        "SELECT COUNT(1) FROM packages WHERE organization_id = ? AND name = ? AND deleted_at IS NULL",
    )
    .bind(organization_id)
    .bind(name)
    .fetch_one(&mut *tx)
    .await?;
    if clash > 0 {
        return Err(AppError::conflict("package name already in use"));
    }

    let now = utc_now();
    let package_id = Uuid::new_v4();

    sqlx::query(
        "INSERT INTO packages (id, organization_id, name, created_at, updated_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(package_id)
    .bind(organization_id)
    .bind(name)
    .bind(now)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    let created = fetch_package(&mut tx, organization_id, package_id).await?;
    tx.commit().await?;

    Ok(created.try_into()?)
}

pub async fn create_version(
    pool: &SqlitePool,
    organization_id: Uuid,
    package_id: Uuid,
    version: &str,
) -> Result<PackageVersion, AppError> {
    let mut tx = pool.begin().await?;

    let package = fetch_package(&mut tx, organization_id, package_id).await?;
    if package.is_deleted() {
        return Err(AppError::already_deleted("package is deleted"));
    }
    if package.is_archived() {
        return Err(AppError::invalid_transition("package is archived"));
    }

    let clash: i64 = sqlx::query_scalar(
        "SELECT COUNT(1) FROM package_versions WHERE package_id = ? AND version = ? AND deleted_at IS NULL",
    )
    .bind(package_id)
    .bind(version)
    .fetch_one(&mut *tx)
    .await?;
    if clash > 0 {
        return Err(AppError::conflict("version already published"));
    }

    let now = utc_now();
    let version_id = Uuid::new_v4();

    sqlx::query(
        "INSERT INTO package_versions (id, package_id, version, created_at, updated_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(version_id)
    .bind(package_id)
    .bind(version)
    .bind(now)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    let created = fetch_version(&mut tx, package_id, version_id).await?;
    tx.commit().await?;

    Ok(created.try_into()?)
}

/// Applies `{archived?, deleted?}` to a package.
///
/// Archiving cascades to every currently active version in the same
/// transaction; restoring the package leaves versions archived until they
/// are restored individually. Deletion is terminal.
pub async fn apply_package_delta(
    pool: &SqlitePool,
    organization_id: Uuid,
    package_id: Uuid,
    delta: &ArchiveDeltaRequest,
) -> Result<Package, AppError> {
    let mut tx = pool.begin().await?;

    let current = fetch_package(&mut tx, organization_id, package_id).await?;

    if delta.deleted == Some(false) && current.is_deleted() {
        return Err(AppError::invalid_transition("deletion is terminal"));
    }

    let wants_archive = delta.archived == Some(true) && !current.is_archived();
    let wants_restore = delta.archived == Some(false) && current.is_archived();
    let wants_delete = delta.deleted == Some(true) && !current.is_deleted();

    if !wants_archive && !wants_restore && !wants_delete {
        return Ok(current.try_into()?);
    }

    if current.is_deleted() {
        return Err(AppError::already_deleted("package is deleted"));
    }

    let now = utc_now();

    if wants_archive {
        sqlx::query("UPDATE packages SET archived_at = ?, updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(now)
            .bind(package_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "UPDATE package_versions SET archived_at = ?, updated_at = ? WHERE package_id = ? AND archived_at IS NULL AND deleted_at IS NULL",
        )
        .bind(now)
        .bind(now)
        .bind(package_id)
        .execute(&mut *tx)
        .await?;
    }

    if wants_restore {
        sqlx::query("UPDATE packages SET archived_at = NULL, updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(package_id)
            .execute(&mut *tx)
            .await?;
    }

    if wants_delete {
        sqlx::query("UPDATE packages SET deleted_at = ?, updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(now)
            .bind(package_id)
            .execute(&mut *tx)
            .await?;
    }

    let updated = fetch_package(&mut tx, organization_id, package_id).await?;
    tx.commit().await?;

    Ok(updated.try_into()?)
}

/// Applies `{archived?, deleted?}` to a package version.
///
/// A version cannot be restored while its parent package is archived or
/// deleted, and a deleted parent blocks every version mutation.
pub async fn apply_version_delta(
    pool: &SqlitePool,
    organization_id: Uuid,
    package_id: Uuid,
    version_id: Uuid,
    delta: &ArchiveDeltaRequest,
) -> Result<PackageVersion, AppError> {
    let mut tx = pool.begin().await?;

    let package = fetch_package(&mut tx, organization_id, package_id).await?;
    let current = fetch_version(&mut tx, package_id, version_id).await?;

    if delta.deleted == Some(false) && current.deleted_at.is_some() {
        return Err(AppError::invalid_transition("deletion is terminal"));
    }

    let wants_archive = delta.archived == Some(true) && current.archived_at.is_none();
    let wants_restore = delta.archived == Some(false) && current.archived_at.is_some();
    let wants_delete = delta.deleted == Some(true) && current.deleted_at.is_none();

    if !wants_archive && !wants_restore && !wants_delete {
        return Ok(current.try_into()?);
    }

    if current.deleted_at.is_some() {
        return Err(AppError::already_deleted("package version is deleted"));
    }

    if package.is_deleted() {
        return Err(AppError::invalid_transition("package is deleted"));
    }

    if wants_restore && package.is_archived() {
        return Err(AppError::invalid_transition("package is archived"));
    }

    let now = utc_now();

    if wants_archive {
        sqlx::query("UPDATE package_versions SET archived_at = ?, updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(now)
            .bind(version_id)
            .execute(&mut *tx)
            .await?;
    }

    if wants_restore {
        sqlx::query("UPDATE package_versions SET archived_at = NULL, updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(version_id)
            .execute(&mut *tx)
            .await?;
    }

    if wants_delete {
        sqlx::query("UPDATE package_versions SET deleted_at = ?, updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(now)
            .bind(version_id)
            .execute(&mut *tx)
            .await?;
    }

    let updated = fetch_version(&mut tx, package_id, version_id).await?;
    tx.commit().await?;

    Ok(updated.try_into()?)
}

/// Records one download of a live version.
pub async fn record_download(
    pool: &SqlitePool,
    organization_id: Uuid,
    package_id: Uuid,
    version_id: Uuid,
    user_id: Option<Uuid>,
) -> Result<Uuid, AppError> {
    let mut tx = pool.begin().await?;

    let package = fetch_package(&mut tx, organization_id, package_id).await?;
    let version = fetch_version(&mut tx, package_id, version_id).await?;

    if package.is_deleted() || version.deleted_at.is_some() {
        return Err(AppError::already_deleted("package version is deleted"));
    }
    if package.is_archived() || version.archived_at.is_some() {
        return Err(AppError::invalid_transition("publication is paused"));
    }

    let download_id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO package_downloads (id, package_version_id, user_id, created_at) VALUES (?, ?, ?, ?)",
    )
    .bind(download_id)
    .bind(version_id)
    .bind(user_id)
    .bind(utc_now())
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    Ok(download_id)
}
