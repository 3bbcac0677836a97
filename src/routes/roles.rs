use std::collections::HashMap;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use uuid::Uuid;

use crate::app::AppState;
use crate::authz::{roles as role_names, tokens, PermissionCheck};
use crate::errors::{AppError, AppResult};
use crate::events::{log_activity_with_context, RequestContext};
use crate::jwt::AuthUser;
use crate::models::role::{DbRole, Role, RoleCreateRequest, RoleUpdateRequest};
use crate::utils::utc_now;

fn validate_custom_role_name(name: &str) -> Result<(), AppError> {
    if name.trim().is_empty() {
        return Err(AppError::bad_request("role name must not be empty"));
    }

    if role_names::RESTRICTED_NAMES.contains(&name) {
        return Err(AppError::constraint_violation(format!(
            "\"{name}\" is reserved for global roles"
        )));
    }

    Ok(())
}

fn validate_permissions(permissions: &[String]) -> Result<(), AppError> {
    for token in permissions {
        if !tokens::is_valid(token) {
            return Err(AppError::bad_request(format!("unknown permission token \"{token}\"")));
        }
    }

    Ok(())
}

async fn load_permissions(
    pool: &sqlx::SqlitePool,
    role_ids: &[Uuid],
) -> AppResult<HashMap<Uuid, Vec<String>>> {
    let mut by_role: HashMap<Uuid, Vec<String>> = HashMap::new();

    for chunk in role_ids.chunks(32) {
        let placeholders = vec!["?"; chunk.len()].join(", ");
        let sql = format!(
            "SELECT role_id, permission FROM role_permissions WHERE role_id IN ({placeholders}) ORDER BY permission",
        );

        let mut query = sqlx::query_as::<_, (Uuid, String)>(&sql);
        for id in chunk {
            query = query.bind(id);
        }

        for (role_id, permission) in query.fetch_all(pool).await? {
            by_role.entry(role_id).or_default().push(permission);
        }
    }

    Ok(by_role)
}

/// Global roles plus this organization's custom roles.
#[utoipa::path(
    get,
    path = "/orgs/{org_id}/roles",
    tag = "Roles",
    params(("org_id" = Uuid, Path, description = "Organization id")),
    responses((status = 200, description = "Assignable roles", body = [Role])),
    security(("bearerAuth" = []))
)]
pub async fn list_roles(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(org_id): Path<Uuid>,
) -> AppResult<Json<Vec<Role>>> {
    state
        .authz
        .authorize(
            &auth,
            org_id,
            &PermissionCheck::one_of([tokens::READ_ROLES, tokens::WRITE_ROLES]),
        )
        .await?;

    let rows = sqlx::query_as::<_, DbRole>(
        r#"
        SELECT id, organization_id, name, description, created_at, updated_at
        FROM roles
        WHERE organization_id IS NULL OR organization_id = ?
        ORDER BY organization_id IS NOT NULL, name
        "#,
    )
    .bind(org_id)
    .fetch_all(&state.pool)
    .await?;

    let ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();
    let mut permissions = load_permissions(&state.pool, &ids).await?;

    let roles = rows
        .into_iter()
        .map(|row| {
            let perms = permissions.remove(&row.id).unwrap_or_default();
            row.into_role(perms)
        })
        .collect();

    Ok(Json(roles))
}

#[utoipa::path(
    post,
    path = "/orgs/{org_id}/roles",
    tag = "Roles",
    params(("org_id" = Uuid, Path, description = "Organization id")),
    request_body = RoleCreateRequest,
    responses(
        (status = 201, description = "Custom role created", body = Role),
        (status = 409, description = "Reserved role name")
    ),
    security(("bearerAuth" = []))
)]
pub async fn create_role(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Path(org_id): Path<Uuid>,
    Json(payload): Json<RoleCreateRequest>,
) -> AppResult<(StatusCode, Json<Role>)> {
    state
        .authz
        .authorize(&auth, org_id, &PermissionCheck::all_of([tokens::WRITE_ROLES]))
        .await?;

    validate_custom_role_name(&payload.name)?;
    validate_permissions(&payload.permissions)?;

    let now = utc_now();
    let role_id = Uuid::new_v4();

    let mut tx = state.pool.begin().await?;

    sqlx::query(
        "INSERT INTO roles (id, organization_id, name, description, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(role_id)
    .bind(org_id)
    .bind(&payload.name)
    .bind(&payload.description)
    .bind(now)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    for token in &payload.permissions {
        sqlx::query("INSERT OR IGNORE INTO role_permissions (role_id, permission, created_at) VALUES (?, ?, ?)")
            .bind(role_id)
            .bind(token)
            .bind(now)
            .execute(&mut *tx)
            .await?;
    }

    let row = sqlx::query_as::<_, DbRole>(
        "SELECT id, organization_id, name, description, created_at, updated_at FROM roles WHERE id = ?",
    )
    .bind(role_id)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;

    let mut permissions = payload.permissions;
    permissions.sort();
    permissions.dedup();
    let role = row.into_role(permissions);

    log_activity_with_context(
        &state.event_bus,
        "created",
        Some(auth.user_id),
        &role,
        None,
        Some(RequestContext::from_headers(&headers)),
    );

    Ok((StatusCode::CREATED, Json(role)))
}

async fn fetch_custom_role(
    pool: &sqlx::SqlitePool,
    org_id: Uuid,
    role_id: Uuid,
) -> AppResult<DbRole> {
    let role = sqlx::query_as::<_, DbRole>(
        "SELECT id, organization_id, name, description, created_at, updated_at FROM roles WHERE id = ?",
    )
    .bind(role_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| AppError::not_found("role not found"))?;

    match role.organization_id {
        None => Err(AppError::constraint_violation("global roles are immutable")),
        Some(owner) if owner != org_id => Err(AppError::not_found("role not found")),
        Some(_) => Ok(role),
    }
}

#[utoipa::path(
    put,
    path = "/orgs/{org_id}/roles/{role_id}",
    tag = "Roles",
    params(
        ("org_id" = Uuid, Path, description = "Organization id"),
        ("role_id" = Uuid, Path, description = "Role id")
    ),
    request_body = RoleUpdateRequest,
    responses(
        (status = 200, description = "Role updated", body = Role),
        (status = 409, description = "Global roles are immutable")
    ),
    security(("bearerAuth" = []))
)]
pub async fn update_role(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Path((org_id, role_id)): Path<(Uuid, Uuid)>,
    Json(payload): Json<RoleUpdateRequest>,
) -> AppResult<Json<Role>> {
    state
        .authz
        .authorize(&auth, org_id, &PermissionCheck::all_of([tokens::WRITE_ROLES]))
        .await?;

    let mut role = fetch_custom_role(&state.pool, org_id, role_id).await?;

    if let Some(name) = &payload.name {
        validate_custom_role_name(name)?;
        role.name = name.clone();
    }
    if payload.description.is_some() {
        role.description = payload.description.clone();
    }
    if let Some(permissions) = &payload.permissions {
        validate_permissions(permissions)?;
    }

    let now = utc_now();
    let mut tx = state.pool.begin().await?;

    sqlx::query("UPDATE roles SET name = ?, description = ?, updated_at = ? WHERE id = ?")
        .bind(&role.name)
        .bind(&role.description)
        .bind(now)
        .bind(role_id)
        .execute(&mut *tx)
        .await?;

    if let Some(permissions) = &payload.permissions {
        sqlx::query("DELETE FROM role_permissions WHERE role_id = ?")
            .bind(role_id)
            .execute(&mut *tx)
            .await?;

        for token in permissions {
            sqlx::query("INSERT OR IGNORE INTO role_permissions (role_id, permission, created_at) VALUES (?, ?, ?)")
                .bind(role_id)
                .bind(token)
                .bind(now)
                .execute(&mut *tx)
                .await?;
        }
    }

    let permissions: Vec<String> =
        sqlx::query_scalar("SELECT permission FROM role_permissions WHERE role_id = ? ORDER BY permission")
            .bind(role_id)
            .fetch_all(&mut *tx)
            .await?;

    tx.commit().await?;

    role.updated_at = now;
    let role = role.into_role(permissions);

    log_activity_with_context(
        &state.event_bus,
        "updated",
        Some(auth.user_id),
        &role,
        None,
        Some(RequestContext::from_headers(&headers)),
    );

    Ok(Json(role))
}

/// Custom roles are the one place physical deletion occurs, and only with
/// zero active assignees.
#[utoipa::path(
    delete,
    path = "/orgs/{org_id}/roles/{role_id}",
    tag = "Roles",
    params(
        ("org_id" = Uuid, Path, description = "Organization id"),
        ("role_id" = Uuid, Path, description = "Role id")
    ),
    responses(
        (status = 204, description = "Role deleted"),
        (status = 409, description = "Role still has active assignees")
    ),
    security(("bearerAuth" = []))
)]
pub async fn delete_role(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Path((org_id, role_id)): Path<(Uuid, Uuid)>,
) -> AppResult<StatusCode> {
    state
        .authz
        .authorize(&auth, org_id, &PermissionCheck::all_of([tokens::WRITE_ROLES]))
        .await?;

    let role = fetch_custom_role(&state.pool, org_id, role_id).await?;

    let mut tx = state.pool.begin().await?;

    let assignees: i64 = sqlx::query_scalar(
        "SELECT COUNT(1) FROM memberships WHERE role_id = ? AND deleted_at IS NULL",
    )
    .bind(role_id)
    .fetch_one(&mut *tx)
    .await?;
    if assignees > 0 {
        return Err(AppError::constraint_violation(
            "role still has active assignees",
        ));
    }

    sqlx::query("DELETE FROM role_permissions WHERE role_id = ?")
        .bind(role_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM roles WHERE id = ?")
        .bind(role_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;

    let role = role.into_role(Vec::new());
    log_activity_with_context(
        &state.event_bus,
        "deleted",
        Some(auth.user_id),
        &role,
        None,
        Some(RequestContext::from_headers(&headers)),
    );

    Ok(StatusCode::NO_CONTENT)
}
