use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::Serialize;
use uuid::Uuid;

use crate::app::AppState;
use crate::authz::roles;
use crate::errors::{AppError, AppResult};
use crate::events::{log_activity_with_context, RequestContext};
use crate::jwt::AuthUser;
use crate::lifecycle;
use crate::models::user::{AuthResponse, DbUser, LoginRequest, RegisterRequest, User};
use crate::utils::{hash_password, normalize_email, utc_now, validate_email, verify_password};

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    message: String,
}

/// Registration provisions the user, their personal (unitary) organization
/// and an Administrator membership in it, atomically.
#[utoipa::path(
    post,
    path = "/auth/register",
    tag = "Auth",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "User registered", body = AuthResponse),
        (status = 409, description = "Email already in use")
    )
)]
pub async fn register(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<RegisterRequest>,
) -> AppResult<(StatusCode, Json<AuthResponse>)> {
    let email = normalize_email(&payload.email);
    validate_email(&email)?;
    let password_hash = hash_password(&payload.password)?;
    let now = utc_now();
    let user_id = Uuid::new_v4();
    let org_id = Uuid::new_v4();

    let mut tx = state.pool.begin().await?;

    let taken: i64 = sqlx::query_scalar("SELECT COUNT(1) FROM users WHERE email = ? AND deleted_at IS NULL")
        .bind(&email)
        .fetch_one(&mut *tx)
        .await?;
    if taken > 0 {
        return Err(AppError::conflict("email already in use"));
    }

    sqlx::query(
        "INSERT INTO users (id, name, email, password_hash, is_operator, created_at, updated_at) VALUES (?, ?, ?, ?, 0, ?, ?)",
    )
    .bind(user_id)
    .bind(&payload.name)
    .bind(&email)
    .bind(password_hash)
    .bind(now)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    // The unitary organization is keyed by its owner: name = user id.
    sqlx::query(
        "INSERT INTO organizations (id, name, is_unitary, created_at, updated_at) VALUES (?, ?, 1, ?, ?)",
    )
    .bind(org_id)
    .bind(user_id.to_string())
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
    .bind(Uuid::new_v4())
    .bind(user_id)
    .bind(org_id)
    .bind(admin_role_id)
    .bind(now)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    let db_user = lifecycle::user::fetch_user(&mut tx, user_id).await?;
    tx.commit().await?;

    let user: User = db_user.try_into()?;
    let token = state.jwt.encode(user.id, user.is_operator)?;

    log_activity_with_context(
        &state.event_bus,
        "registered",
        Some(user.id),
        &user,
        None,
        Some(RequestContext::from_headers(&headers)),
    );

    Ok((StatusCode::CREATED, Json(AuthResponse { token, user })))
}

#[utoipa::path(
    post,
    path = "/auth/login",
    tag = "Auth",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Login successful", body = AuthResponse),
        (status = 401, description = "Invalid credentials")
    )
)]
pub async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> AppResult<Json<AuthResponse>> {
    let db_user = sqlx::query_as::<_, DbUser>(
        "SELECT id, name, email, password_hash, is_operator, created_at, updated_at, deleted_at FROM users WHERE email = ? AND deleted_at IS NULL",
    )
    .bind(normalize_email(&payload.email))
    .fetch_optional(&state.pool)
    .await?
    .ok_or_else(|| AppError::unauthorized("invalid credentials"))?;

    let password_ok = verify_password(&payload.password, &db_user.password_hash)?;
    if !password_ok {
        return Err(AppError::unauthorized("invalid credentials"));
    }

    let token = state.jwt.encode(db_user.id, db_user.is_operator)?;
    let user: User = db_user.try_into()?;

    Ok(Json(AuthResponse { token, user }))
}

#[utoipa::path(
    get,
    path = "/auth/me",
    tag = "Auth",
    responses((status = 200, description = "Current user", body = User))
)]
pub async fn me(State(state): State<AppState>, auth: AuthUser) -> AppResult<Json<User>> {
    let mut conn = state.pool.acquire().await?;
    let db_user = lifecycle::user::fetch_user(&mut conn, auth.user_id).await?;
    if db_user.deleted_at.is_some() {
        return Err(AppError::unauthorized("account is deactivated"));
    }
    let user: User = db_user.try_into()?;
    Ok(Json(user))
}

#[utoipa::path(
    post,
    path = "/auth/logout",
    tag = "Auth",
    responses((status = 200, description = "Logout acknowledged"))
)]
pub async fn logout(_auth: AuthUser) -> AppResult<Json<MessageResponse>> {
    Ok(Json(MessageResponse {
        message: "Logged out".to_string(),
    }))
}
