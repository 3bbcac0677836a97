use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct BillingProfile {
    pub organization_id: Uuid,
    pub email: String,
    #[schema(example = "team")]
    pub plan: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct BillingUpdateRequest {
    #[schema(example = "billing@acme.example")]
    pub email: String,
    #[schema(example = "team")]
    pub plan: String,
}
