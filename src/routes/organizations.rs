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
use crate::models::organization::{
    DbOrganization, Organization, OrganizationBatchRequest, OrganizationCreateRequest,
    OrganizationDeltaRequest,
};

/// Lifecycle changes need the admin token; a plain rename needs
/// write:organization.
fn delta_check(delta: &OrganizationDeltaRequest) -> PermissionCheck {
    if delta.deleted.is_some() {
        PermissionCheck::all_of([tokens::ADMIN])
    } else {
        PermissionCheck::all_of([tokens::WRITE_ORGANIZATION])
    }
}

fn delta_action(delta: &OrganizationDeltaRequest) -> &'static str {
    match delta.deleted {
        Some(true) => "deleted",
        Some(false) => "reactivated",
        None => "updated",
    }
}

#[utoipa::path(
    post,
    path = "/orgs",
    tag = "Organizations",
    request_body = OrganizationCreateRequest,
    responses((status = 201, description = "Organization created", body = Organization)),
    security(("bearerAuth" = []))
)]
pub async fn create_organization(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Json(payload): Json<OrganizationCreateRequest>,
) -> AppResult<(StatusCode, Json<Organization>)> {
    if payload.name.trim().is_empty() {
        return Err(AppError::bad_request("organization name must not be empty"));
    }

    let (organization, membership) =
        lifecycle::organization::create_organization(&state.pool, auth.user_id, payload.name.trim()).await?;

    let context = RequestContext::from_headers(&headers);
    log_activity_with_context(
        &state.event_bus,
        "created",
        Some(auth.user_id),
        &organization,
        None,
        Some(context.clone()),
    );
    log_activity_with_context(
        &state.event_bus,
        "created",
        Some(auth.user_id),
        &membership,
        None,
        Some(context),
    );

    Ok((StatusCode::CREATED, Json(organization)))
}

#[utoipa::path(
    get,
    path = "/orgs",
    tag = "Organizations",
    responses((status = 200, description = "Organizations the caller belongs to", body = [Organization])),
    security(("bearerAuth" = []))
)]
pub async fn list_organizations(
    State(state): State<AppState>,
    auth: AuthUser,
) -> AppResult<Json<Vec<Organization>>> {
    let rows = if auth.is_operator {
        sqlx::query_as::<_, DbOrganization>(
            "SELECT id, name, is_unitary, created_at, updated_at, deleted_at FROM organizations ORDER BY created_at DESC",
        )
        .fetch_all(&state.pool)
        .await?
    } else {
        sqlx::query_as::<_, DbOrganization>(
            r#"
            SELECT o.id, o.name, o.is_unitary, o.created_at, o.updated_at, o.deleted_at
            FROM organizations o
            INNER JOIN memberships m ON m.organization_id = o.id
            WHERE m.user_id = ? AND m.deleted_at IS NULL
            ORDER BY o.created_at DESC
            "#,
        )
        .bind(auth.user_id)
        .fetch_all(&state.pool)
        .await?
    };

    let organizations: Vec<Organization> = rows
        .into_iter()
        .map(Organization::try_from)
        .collect::<Result<_, _>>()?;

    Ok(Json(organizations))
}

#[utoipa::path(
    get,
    path = "/orgs/{org_id}",
    tag = "Organizations",
    params(("org_id" = Uuid, Path, description = "Organization id")),
    responses(
        (status = 200, description = "Organization detail", body = Organization),
        (status = 403, description = "No privileges in this organization")
    ),
    security(("bearerAuth" = []))
)]
pub async fn get_organization(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(org_id): Path<Uuid>,
) -> AppResult<Json<Organization>> {
    state
        .authz
        .authorize(
            &auth,
            org_id,
            &PermissionCheck::one_of([tokens::READ_ORGANIZATION, tokens::READ_MEMBERS]),
        )
        .await?;

    let mut conn = state.pool.acquire().await?;
    let organization = lifecycle::organization::fetch_organization(&mut conn, org_id).await?;

    Ok(Json(organization.try_into()?))
}

/// Apply `{name?, deleted?}` to an organization. Deactivation revokes all
/// non-Administrator memberships atomically; reactivation does not restore
/// them.
#[utoipa::path(
    patch,
    path = "/orgs/{org_id}",
    tag = "Organizations",
    params(("org_id" = Uuid, Path, description = "Organization id")),
    request_body = OrganizationDeltaRequest,
    responses(
        (status = 200, description = "Organization snapshot", body = Organization),
        (status = 409, description = "Invalid lifecycle transition")
    ),
    security(("bearerAuth" = []))
)]
pub async fn patch_organization(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Path(org_id): Path<Uuid>,
    Json(delta): Json<OrganizationDeltaRequest>,
) -> AppResult<Json<Organization>> {
    state.authz.authorize(&auth, org_id, &delta_check(&delta)).await?;

    let organization = lifecycle::organization::apply_organization_delta(&state.pool, org_id, &delta).await?;

    if !delta.is_empty() {
        log_activity_with_context(
            &state.event_bus,
            delta_action(&delta),
            Some(auth.user_id),
            &organization,
            None,
            Some(RequestContext::from_headers(&headers)),
        );
    }

    Ok(Json(organization))
}

/// Batch organization deltas. Authorization runs per id; a denied or failing
/// id never aborts its siblings.
#[utoipa::path(
    patch,
    path = "/orgs/batch",
    tag = "Organizations",
    request_body = OrganizationBatchRequest,
    responses((status = 200, description = "Per-id outcomes")),
    security(("bearerAuth" = []))
)]
pub async fn patch_organizations_batch(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(payload): Json<OrganizationBatchRequest>,
) -> AppResult<Json<BatchOutcome<Organization>>> {
    let items = payload
        .organizations
        .into_iter()
        .map(|item| {
            let state = state.clone();
            let auth = auth.clone();
            let id = item.id;
            let delta = item.delta;
            (id, move || {
                let state = state.clone();
                let auth = auth.clone();
                let delta = delta.clone();
                async move {
                    state.authz.authorize(&auth, id, &delta_check(&delta)).await?;
                    lifecycle::organization::apply_organization_delta(&state.pool, id, &delta).await
                }
            })
        })
        .collect();

    Ok(Json(run_batch(items).await))
}
