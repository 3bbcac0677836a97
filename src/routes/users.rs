use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use uuid::Uuid;

use crate::app::AppState;
use crate::errors::{AppError, AppResult};
use crate::events::{log_activity_with_context, RequestContext};
use crate::jwt::AuthUser;
use crate::lifecycle::{self, run_batch, BatchOutcome};
use crate::models::user::{User, UserBatchRequest, UserDeltaRequest};

fn ensure_self_or_operator(auth: &AuthUser, user_id: Uuid) -> Result<(), AppError> {
    if auth.user_id == user_id || auth.is_operator {
        return Ok(());
    }

    Err(AppError::missing_permission(
        "only the account owner or a system operator may do this",
    ))
}

fn delta_action(delta: &UserDeltaRequest) -> &'static str {
    match delta.deleted {
        Some(true) => "deleted",
        Some(false) => "reactivated",
        None => "updated",
    }
}

#[utoipa::path(
    get,
    path = "/users/{id}",
    tag = "Users",
    params(("id" = Uuid, Path, description = "User id")),
    responses(
        (status = 200, description = "User detail", body = User),
        (status = 404, description = "User not found")
    ),
    security(("bearerAuth" = []))
)]
pub async fn get_user(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<User>> {
    ensure_self_or_operator(&auth, id)?;

    let mut conn = state.pool.acquire().await?;
    let user = lifecycle::user::fetch_user(&mut conn, id).await?;

    Ok(Json(user.try_into()?))
}

/// Apply a profile/lifecycle delta to a user. Deactivation cascades through
/// the user's memberships and personal organization; it is rejected outright
/// when any organization would lose its last Administrator.
#[utoipa::path(
    patch,
    path = "/users/{id}",
    tag = "Users",
    params(("id" = Uuid, Path, description = "User id")),
    request_body = UserDeltaRequest,
    responses(
        (status = 200, description = "User snapshot", body = User),
        (status = 409, description = "Deactivation would orphan an organization")
    ),
    security(("bearerAuth" = []))
)]
pub async fn patch_user(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(delta): Json<UserDeltaRequest>,
) -> AppResult<Json<User>> {
    ensure_self_or_operator(&auth, id)?;

    let user = lifecycle::user::apply_user_delta(&state.pool, id, &delta).await?;

    if !delta.is_empty() {
        log_activity_with_context(
            &state.event_bus,
            delta_action(&delta),
            Some(auth.user_id),
            &user,
            None,
            Some(RequestContext::from_headers(&headers)),
        );
    }

    Ok(Json(user))
}

/// Batch user deltas; each id is applied independently and failures are
/// reported per id.
#[utoipa::path(
    patch,
    path = "/users/batch",
    tag = "Users",
    request_body = UserBatchRequest,
    responses((status = 200, description = "Per-id outcomes")),
    security(("bearerAuth" = []))
)]
pub async fn patch_users_batch(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(payload): Json<UserBatchRequest>,
) -> AppResult<Json<BatchOutcome<User>>> {
    if !auth.is_operator {
        return Err(AppError::missing_permission(
            "batch user mutation requires a system operator",
        ));
    }

    let items = payload
        .users
        .into_iter()
        .map(|item| {
            let pool = state.pool.clone();
            let id = item.id;
            let delta = item.delta;
            (id, move || {
                let pool = pool.clone();
                let delta = delta.clone();
                async move { lifecycle::user::apply_user_delta(&pool, id, &delta).await }
            })
        })
        .collect();

    Ok(Json(run_batch(items).await))
}
