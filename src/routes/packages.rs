use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use uuid::Uuid;

use crate::app::AppState;
use crate::authz::{tokens, PermissionCheck};
use crate::errors::{AppError, AppResult};
use crate::events::{log_activity_with_context, RequestContext};
use crate::jwt::AuthUser;
use crate::lifecycle::{self, run_batch, BatchOutcome};
use crate::models::package::{
    ArchiveDeltaRequest, DbPackage, DbPackageVersion, Package, PackageBatchRequest,
    PackageCreateRequest, PackageDownload, PackageVersion, PackageVersionBatchRequest,
    PackageVersionCreateRequest,
};

fn delta_action(delta: &ArchiveDeltaRequest) -> &'static str {
    if delta.deleted == Some(true) {
        "deleted"
    } else {
        match delta.archived {
            Some(true) => "archived",
            Some(false) => "restored",
            None => "updated",
        }
    }
}

// ============================================================================
// PACKAGES
// ============================================================================

#[utoipa::path(
    get,
    path = "/orgs/{org_id}/packages",
    tag = "Packages",
    params(("org_id" = Uuid, Path, description = "Organization id")),
    responses((status = 200, description = "Packages (live and archived)", body = [Package])),
    security(("bearerAuth" = []))
)]
pub async fn list_packages(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(org_id): Path<Uuid>,
) -> AppResult<Json<Vec<Package>>> {
    state
        .authz
        .authorize(&auth, org_id, &PermissionCheck::all_of([tokens::READ_PACKAGES]))
        .await?;

    let rows = sqlx::query_as::<_, DbPackage>(
        "SELECT id, organization_id, name, created_at, updated_at, archived_at, deleted_at FROM packages WHERE organization_id = ? AND deleted_at IS NULL ORDER BY name",
    )
    .bind(org_id)
    .fetch_all(&state.pool)
    .await?;

    let packages: Vec<Package> = rows
        .into_iter()
        .map(Package::try_from)
        .collect::<Result<_, _>>()?;

    Ok(Json(packages))
}

#[utoipa::path(
    post,
    path = "/orgs/{org_id}/packages",
    tag = "Packages",
    params(("org_id" = Uuid, Path, description = "Organization id")),
    request_body = PackageCreateRequest,
    responses(
        (status = 201, description = "Package created", body = Package),
        (status = 409, description = "Package name already in use")
    ),
    security(("bearerAuth" = []))
)]
pub async fn create_package(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Path(org_id): Path<Uuid>,
    Json(payload): Json<PackageCreateRequest>,
) -> AppResult<(StatusCode, Json<Package>)> {
    state
        .authz
        .authorize(&auth, org_id, &PermissionCheck::all_of([tokens::WRITE_PACKAGES]))
        .await?;

    if payload.name.trim().is_empty() {
        return Err(AppError::bad_request("package name must not be empty"));
    }

    let package = lifecycle::package::create_package(&state.pool, org_id, payload.name.trim()).await?;

    log_activity_with_context(
        &state.event_bus,
        "created",
        Some(auth.user_id),
        &package,
        None,
        Some(RequestContext::from_headers(&headers)),
    );

    Ok((StatusCode::CREATED, Json(package)))
}

#[utoipa::path(
    get,
    path = "/orgs/{org_id}/packages/{package_id}",
    tag = "Packages",
    params(
        ("org_id" = Uuid, Path, description = "Organization id"),
        ("package_id" = Uuid, Path, description = "Package id")
    ),
    responses((status = 200, description = "Package detail", body = Package)),
    security(("bearerAuth" = []))
)]
pub async fn get_package(
    State(state): State<AppState>,
    auth: AuthUser,
    Path((org_id, package_id)): Path<(Uuid, Uuid)>,
) -> AppResult<Json<Package>> {
    state
        .authz
        .authorize(&auth, org_id, &PermissionCheck::all_of([tokens::READ_PACKAGES]))
        .await?;

    let mut conn = state.pool.acquire().await?;
    let package = lifecycle::package::fetch_package(&mut conn, org_id, package_id).await?;

    Ok(Json(package.try_into()?))
}

/// Apply `{archived?, deleted?}`. Archiving cascades to the package's active
/// versions; deletion is terminal.
#[utoipa::path(
    patch,
    path = "/orgs/{org_id}/packages/{package_id}",
    tag = "Packages",
    params(
        ("org_id" = Uuid, Path, description = "Organization id"),
        ("package_id" = Uuid, Path, description = "Package id")
    ),
    request_body = ArchiveDeltaRequest,
    responses(
        (status = 200, description = "Package snapshot", body = Package),
        (status = 409, description = "Invalid lifecycle transition")
    ),
    security(("bearerAuth" = []))
)]
pub async fn patch_package(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Path((org_id, package_id)): Path<(Uuid, Uuid)>,
    Json(delta): Json<ArchiveDeltaRequest>,
) -> AppResult<Json<Package>> {
    state
        .authz
        .authorize(&auth, org_id, &PermissionCheck::all_of([tokens::WRITE_PACKAGES]))
        .await?;

    let package = lifecycle::package::apply_package_delta(&state.pool, org_id, package_id, &delta).await?;

    if !delta.is_empty() {
        log_activity_with_context(
            &state.event_bus,
            delta_action(&delta),
            Some(auth.user_id),
            &package,
            None,
            Some(RequestContext::from_headers(&headers)),
        );
    }

    Ok(Json(package))
}

#[utoipa::path(
    patch,
    path = "/orgs/{org_id}/packages/batch",
    tag = "Packages",
    params(("org_id" = Uuid, Path, description = "Organization id")),
    request_body = PackageBatchRequest,
    responses((status = 200, description = "Per-id outcomes")),
    security(("bearerAuth" = []))
)]
pub async fn patch_packages_batch(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(org_id): Path<Uuid>,
    Json(payload): Json<PackageBatchRequest>,
) -> AppResult<Json<BatchOutcome<Package>>> {
    state
        .authz
        .authorize(&auth, org_id, &PermissionCheck::all_of([tokens::WRITE_PACKAGES]))
        .await?;

    let items = payload
        .packages
        .into_iter()
        .map(|item| {
            let pool = state.pool.clone();
            let id = item.id;
            let delta = item.delta;
            (id, move || {
                let pool = pool.clone();
                let delta = delta.clone();
                async move { lifecycle::package::apply_package_delta(&pool, org_id, id, &delta).await }
            })
        })
        .collect();

    Ok(Json(run_batch(items).await))
}

// ============================================================================
// VERSIONS
// ============================================================================

#[utoipa::path(
    get,
    path = "/orgs/{org_id}/packages/{package_id}/versions",
    tag = "Packages",
    params(
        ("org_id" = Uuid, Path, description = "Organization id"),
        ("package_id" = Uuid, Path, description = "Package id")
    ),
    responses((status = 200, description = "Versions (live and archived)", body = [PackageVersion])),
    security(("bearerAuth" = []))
)]
pub async fn list_versions(
    State(state): State<AppState>,
    auth: AuthUser,
    Path((org_id, package_id)): Path<(Uuid, Uuid)>,
) -> AppResult<Json<Vec<PackageVersion>>> {
    state
        .authz
        .authorize(&auth, org_id, &PermissionCheck::all_of([tokens::READ_VERSIONS]))
        .await?;

    let mut conn = state.pool.acquire().await?;
    lifecycle::package::fetch_package(&mut conn, org_id, package_id).await?;

    let rows = sqlx::query_as::<_, DbPackageVersion>(
        "SELECT id, package_id, version, created_at, updated_at, archived_at, deleted_at FROM package_versions WHERE package_id = ? AND deleted_at IS NULL ORDER BY created_at DESC",
    )
    .bind(package_id)
    .fetch_all(&mut *conn)
    .await?;

    let versions: Vec<PackageVersion> = rows
        .into_iter()
        .map(PackageVersion::try_from)
        .collect::<Result<_, _>>()?;

    Ok(Json(versions))
}

/// Publishing needs both package and version write access.
#[utoipa::path(
    post,
    path = "/orgs/{org_id}/packages/{package_id}/versions",
    tag = "Packages",
    params(
        ("org_id" = Uuid, Path, description = "Organization id"),
        ("package_id" = Uuid, Path, description = "Package id")
    ),
    request_body = PackageVersionCreateRequest,
    responses(
        (status = 201, description = "Version published", body = PackageVersion),
        (status = 409, description = "Version already published or package archived")
    ),
    security(("bearerAuth" = []))
)]
pub async fn create_version(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Path((org_id, package_id)): Path<(Uuid, Uuid)>,
    Json(payload): Json<PackageVersionCreateRequest>,
) -> AppResult<(StatusCode, Json<PackageVersion>)> {
    state
        .authz
        .authorize(
            &auth,
            org_id,
            &PermissionCheck::all_of([tokens::WRITE_PACKAGES, tokens::WRITE_VERSIONS]),
        )
        .await?;

    if payload.version.trim().is_empty() {
        return Err(AppError::bad_request("version must not be empty"));
    }

    let version =
        lifecycle::package::create_version(&state.pool, org_id, package_id, payload.version.trim()).await?;

    log_activity_with_context(
        &state.event_bus,
        "created",
        Some(auth.user_id),
        &version,
        None,
        Some(RequestContext::from_headers(&headers)),
    );

    Ok((StatusCode::CREATED, Json(version)))
}

/// Apply `{archived?, deleted?}` to a version. Restoring is rejected while
/// the parent package is archived or deleted.
#[utoipa::path(
    patch,
    path = "/orgs/{org_id}/packages/{package_id}/versions/{version_id}",
    tag = "Packages",
    params(
        ("org_id" = Uuid, Path, description = "Organization id"),
        ("package_id" = Uuid, Path, description = "Package id"),
        ("version_id" = Uuid, Path, description = "Version id")
    ),
    request_body = ArchiveDeltaRequest,
    responses(
        (status = 200, description = "Version snapshot", body = PackageVersion),
        (status = 409, description = "Invalid lifecycle transition")
    ),
    security(("bearerAuth" = []))
)]
pub async fn patch_version(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Path((org_id, package_id, version_id)): Path<(Uuid, Uuid, Uuid)>,
    Json(delta): Json<ArchiveDeltaRequest>,
) -> AppResult<Json<PackageVersion>> {
    state
        .authz
        .authorize(&auth, org_id, &PermissionCheck::all_of([tokens::WRITE_VERSIONS]))
        .await?;

    let version =
        lifecycle::package::apply_version_delta(&state.pool, org_id, package_id, version_id, &delta).await?;

    if !delta.is_empty() {
        log_activity_with_context(
            &state.event_bus,
            delta_action(&delta),
            Some(auth.user_id),
            &version,
            None,
            Some(RequestContext::from_headers(&headers)),
        );
    }

    Ok(Json(version))
}

#[utoipa::path(
    patch,
    path = "/orgs/{org_id}/packages/{package_id}/versions/batch",
    tag = "Packages",
    params(
        ("org_id" = Uuid, Path, description = "Organization id"),
        ("package_id" = Uuid, Path, description = "Package id")
    ),
    request_body = PackageVersionBatchRequest,
    responses((status = 200, description = "Per-id outcomes")),
    security(("bearerAuth" = []))
)]
pub async fn patch_versions_batch(
    State(state): State<AppState>,
    auth: AuthUser,
    Path((org_id, package_id)): Path<(Uuid, Uuid)>,
    Json(payload): Json<PackageVersionBatchRequest>,
) -> AppResult<Json<BatchOutcome<PackageVersion>>> {
    state
        .authz
        .authorize(&auth, org_id, &PermissionCheck::all_of([tokens::WRITE_VERSIONS]))
        .await?;

    let items = payload
        .versions
        .into_iter()
        .map(|item| {
            let pool = state.pool.clone();
            let id = item.id;
            let delta = item.delta;
            (id, move || {
                let pool = pool.clone();
                let delta = delta.clone();
                async move {
                    lifecycle::package::apply_version_delta(&pool, org_id, package_id, id, &delta).await
                }
            })
        })
        .collect();

    Ok(Json(run_batch(items).await))
}

// ============================================================================
// DOWNLOADS
// ============================================================================

#[utoipa::path(
    post,
    path = "/orgs/{org_id}/packages/{package_id}/versions/{version_id}/download",
    tag = "Packages",
    params(
        ("org_id" = Uuid, Path, description = "Organization id"),
        ("package_id" = Uuid, Path, description = "Package id"),
        ("version_id" = Uuid, Path, description = "Version id")
    ),
    responses(
        (status = 204, description = "Download recorded"),
        (status = 409, description = "Publication is paused")
    ),
    security(("bearerAuth" = []))
)]
pub async fn record_download(
    State(state): State<AppState>,
    auth: AuthUser,
    Path((org_id, package_id, version_id)): Path<(Uuid, Uuid, Uuid)>,
) -> AppResult<StatusCode> {
    state
        .authz
        .authorize(
            &auth,
            org_id,
            &PermissionCheck::one_of([tokens::READ_PACKAGES, tokens::READ_VERSIONS]),
        )
        .await?;

    lifecycle::package::record_download(&state.pool, org_id, package_id, version_id, Some(auth.user_id))
        .await?;

    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    get,
    path = "/orgs/{org_id}/packages/{package_id}/versions/{version_id}/downloads",
    tag = "Packages",
    params(
        ("org_id" = Uuid, Path, description = "Organization id"),
        ("package_id" = Uuid, Path, description = "Package id"),
        ("version_id" = Uuid, Path, description = "Version id")
    ),
    responses((status = 200, description = "Download ledger", body = [PackageDownload])),
    security(("bearerAuth" = []))
)]
pub async fn list_downloads(
    State(state): State<AppState>,
    auth: AuthUser,
    Path((org_id, package_id, version_id)): Path<(Uuid, Uuid, Uuid)>,
) -> AppResult<Json<Vec<PackageDownload>>> {
    state
        .authz
        .authorize(&auth, org_id, &PermissionCheck::all_of([tokens::READ_DOWNLOADS]))
        .await?;

    let mut conn = state.pool.acquire().await?;
    lifecycle::package::fetch_package(&mut conn, org_id, package_id).await?;
    lifecycle::package::fetch_version(&mut conn, package_id, version_id).await?;

    let downloads = sqlx::query_as::<_, PackageDownload>(
        "SELECT id, package_version_id, user_id, created_at FROM package_downloads WHERE package_version_id = ? ORDER BY created_at DESC",
    )
    .bind(version_id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(Json(downloads))
}
