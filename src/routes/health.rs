use axum::extract::State;
use axum::Json;
use serde::Serialize;
use sqlx::query_scalar;
use utoipa::ToSchema;

use crate::app::AppState;
use crate::errors::AppResult;

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
    pub db_ok: bool,
    pub db_error: Option<String>,
}

impl HealthResponse {
    fn with_db(db_ok: bool, db_error: Option<String>) -> Self {
        Self {
            status: "ok",
            service: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
            db_ok,
            db_error,
        }
    }
}

#[utoipa::path(
    get,
    path = "/api/health",
    tag = "Health",
    responses((status = 200, description = "Health check", body = HealthResponse))
)]
pub async fn health(State(state): State<AppState>) -> AppResult<Json<HealthResponse>> {
    // Lightweight DB check
    let db_check = query_scalar::<_, i64>("SELECT 1").fetch_one(&state.pool).await;

    match db_check {
        Ok(_) => Ok(Json(HealthResponse::with_db(true, None))),
        Err(e) => Ok(Json(HealthResponse::with_db(false, Some(e.to_string())))),
    }
}
