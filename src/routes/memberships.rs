use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use uuid::Uuid;

use crate::app::AppState;
use crate::authz::{tokens, PermissionCheck};
use crate::errors::AppResult;
use crate::events::{log_activity_with_context, RequestContext};
use crate::jwt::AuthUser;
use crate::lifecycle::{self, run_batch, BatchOutcome};
use crate::models::membership::{
    DbMembership, Membership, MembershipBatchRequest, MembershipCreateRequest, MembershipDeltaRequest,
};

fn delta_action(delta: &MembershipDeltaRequest) -> &'static str {
    match delta.revoked {
        Some(true) => "revoked",
        Some(false) => "reactivated",
        None => "updated",
    }
}

#[utoipa::path(
    get,
    path = "/orgs/{org_id}/memberships",
    tag = "Memberships",
    params(("org_id" = Uuid, Path, description = "Organization id")),
    responses((status = 200, description = "Active memberships", body = [Membership])),
    security(("bearerAuth" = []))
)]
pub async fn list_memberships(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(org_id): Path<Uuid>,
) -> AppResult<Json<Vec<Membership>>> {
    state
        .authz
        .authorize(&auth, org_id, &PermissionCheck::all_of([tokens::READ_MEMBERS]))
        .await?;

    let rows = sqlx::query_as::<_, DbMembership>(
        r#"
        SELECT m.id, m.user_id, m.organization_id, m.role_id, r.name AS role_name,
               m.created_at, m.updated_at, m.deleted_at
        FROM memberships m
        LEFT JOIN roles r ON r.id = m.role_id
        WHERE m.organization_id = ? AND m.deleted_at IS NULL
        ORDER BY m.created_at ASC
        "#,
    )
    .bind(org_id)
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(rows.into_iter().map(Membership::from).collect()))
}

#[utoipa::path(
    post,
    path = "/orgs/{org_id}/memberships",
    tag = "Memberships",
    params(("org_id" = Uuid, Path, description = "Organization id")),
    request_body = MembershipCreateRequest,
    responses(
        (status = 201, description = "Membership created", body = Membership),
        (status = 409, description = "User already has an active membership")
    ),
    security(("bearerAuth" = []))
)]
pub async fn create_membership(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Path(org_id): Path<Uuid>,
    Json(payload): Json<MembershipCreateRequest>,
) -> AppResult<(StatusCode, Json<Membership>)> {
    state
        .authz
        .authorize(&auth, org_id, &PermissionCheck::all_of([tokens::WRITE_MEMBERS]))
        .await?;

    let membership = lifecycle::membership::create_membership(&state.pool, org_id, &payload).await?;

    state.authz.invalidate(membership.user_id, org_id).await;
    log_activity_with_context(
        &state.event_bus,
        "created",
        Some(auth.user_id),
        &membership,
        None,
        Some(RequestContext::from_headers(&headers)),
    );

    Ok((StatusCode::CREATED, Json(membership)))
}

/// Apply `{role_id?, revoked?}` to a membership. Removal or reassignment of
/// the organization's last active Administrator is rejected with a
/// constraint violation; an empty delta is an idempotent no-op.
#[utoipa::path(
    patch,
    path = "/orgs/{org_id}/memberships/{membership_id}",
    tag = "Memberships",
    params(
        ("org_id" = Uuid, Path, description = "Organization id"),
        ("membership_id" = Uuid, Path, description = "Membership id")
    ),
    request_body = MembershipDeltaRequest,
    responses(
        (status = 200, description = "Membership snapshot", body = Membership),
        (status = 409, description = "Would orphan the organization's Administrator coverage")
    ),
    security(("bearerAuth" = []))
)]
pub async fn patch_membership(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Path((org_id, membership_id)): Path<(Uuid, Uuid)>,
    Json(delta): Json<MembershipDeltaRequest>,
) -> AppResult<Json<Membership>> {
    state
        .authz
        .authorize(&auth, org_id, &PermissionCheck::all_of([tokens::WRITE_MEMBERS]))
        .await?;

    let membership =
        lifecycle::membership::apply_membership_delta(&state.pool, org_id, membership_id, &delta).await?;

    if !delta.is_empty() {
        state.authz.invalidate(membership.user_id, org_id).await;
        log_activity_with_context(
            &state.event_bus,
            delta_action(&delta),
            Some(auth.user_id),
            &membership,
            None,
            Some(RequestContext::from_headers(&headers)),
        );
    }

    Ok(Json(membership))
}

/// Batch membership deltas: each id runs in its own transaction and task;
/// per-id failures are collected, not fatal to siblings.
#[utoipa::path(
    patch,
    path = "/orgs/{org_id}/memberships/batch",
    tag = "Memberships",
    params(("org_id" = Uuid, Path, description = "Organization id")),
    request_body = MembershipBatchRequest,
    responses((status = 200, description = "Per-id outcomes")),
    security(("bearerAuth" = []))
)]
pub async fn patch_memberships_batch(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(org_id): Path<Uuid>,
    Json(payload): Json<MembershipBatchRequest>,
) -> AppResult<Json<BatchOutcome<Membership>>> {
    state
        .authz
        .authorize(&auth, org_id, &PermissionCheck::all_of([tokens::WRITE_MEMBERS]))
        .await?;

    let items = payload
        .memberships
        .into_iter()
        .map(|item| {
            let pool = state.pool.clone();
            let id = item.id;
            let delta = item.delta;
            (id, move || {
                let pool = pool.clone();
                let delta = delta.clone();
                async move {
                    lifecycle::membership::apply_membership_delta(&pool, org_id, id, &delta).await
                }
            })
        })
        .collect();

    let outcome = run_batch(items).await;

    for membership in &outcome.applied {
        state.authz.invalidate(membership.user_id, org_id).await;
    }

    Ok(Json(outcome))
}
