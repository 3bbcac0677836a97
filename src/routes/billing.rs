use axum::extract::{Path, State};
use axum::Json;
use uuid::Uuid;

use crate::app::AppState;
use crate::authz::{tokens, PermissionCheck};
use crate::errors::{AppError, AppResult};
use crate::jwt::AuthUser;
use crate::lifecycle;
use crate::models::billing::{BillingProfile, BillingUpdateRequest};
use crate::utils::utc_now;

#[utoipa::path(
    get,
    path = "/orgs/{org_id}/billing",
    tag = "Billing",
    params(("org_id" = Uuid, Path, description = "Organization id")),
    responses(
        (status = 200, description = "Billing profile", body = BillingProfile),
        (status = 404, description = "No billing profile yet")
    ),
    security(("bearerAuth" = []))
)]
pub async fn get_billing(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(org_id): Path<Uuid>,
) -> AppResult<Json<BillingProfile>> {
    state
        .authz
        .authorize(&auth, org_id, &PermissionCheck::all_of([tokens::READ_BILLING]))
        .await?;

    let profile = sqlx::query_as::<_, BillingProfile>(
        "SELECT organization_id, email, plan, updated_at FROM billing_profiles WHERE organization_id = ?",
    )
    .bind(org_id)
    .fetch_optional(&state.pool)
    .await?
    .ok_or_else(|| AppError::not_found("no billing profile for this organization"))?;

    Ok(Json(profile))
}

#[utoipa::path(
    put,
    path = "/orgs/{org_id}/billing",
    tag = "Billing",
    params(("org_id" = Uuid, Path, description = "Organization id")),
    request_body = BillingUpdateRequest,
    responses((status = 200, description = "Billing profile", body = BillingProfile)),
    security(("bearerAuth" = []))
)]
pub async fn put_billing(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(org_id): Path<Uuid>,
    Json(payload): Json<BillingUpdateRequest>,
) -> AppResult<Json<BillingProfile>> {
    state
        .authz
        .authorize(&auth, org_id, &PermissionCheck::all_of([tokens::WRITE_BILLING]))
        .await?;

    let mut conn = state.pool.acquire().await?;
    let organization = lifecycle::organization::fetch_organization(&mut conn, org_id).await?;
    if organization.deleted_at.is_some() {
        return Err(AppError::already_deleted("organization is deactivated"));
    }

    let now = utc_now();
    sqlx::query(
        r#"
        INSERT INTO billing_profiles (organization_id, email, plan, updated_at)
        VALUES (?, ?, ?, ?)
        ON CONFLICT (organization_id) DO UPDATE SET email = excluded.email, plan = excluded.plan, updated_at = excluded.updated_at
        "#,
    )
    .bind(org_id)
    .bind(&payload.email)
    .bind(&payload.plan)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    Ok(Json(BillingProfile {
        organization_id: org_id,
        email: payload.email,
        plan: payload.plan,
        updated_at: now,
    }))
}
