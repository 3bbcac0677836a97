use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::errors::AppError;
use crate::events::{Loggable, Severity};

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
    /// A user's personal single-member organization. Its lifecycle is bound
    /// to the owning user and it cannot be deleted or reactivated on its own.
    pub is_unitary: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Loggable for Organization {
    fn entity_type() -> &'static str { "organization" }
    fn subject_id(&self) -> Uuid { self.id }
    fn severity(&self) -> Severity { Severity::Critical }
}

#[derive(Debug, Clone, FromRow)]
pub struct DbOrganization {
    pub id: Uuid,
    pub name: String,
    pub is_unitary: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl TryFrom<DbOrganization> for Organization {
    type Error = AppError;

    fn try_from(value: DbOrganization) -> Result<Self, Self::Error> {
        Ok(Organization {
            id: value.id,
            name: value.name,
            is_unitary: value.is_unitary,
            created_at: value.created_at,
            updated_at: value.updated_at,
            deleted_at: value.deleted_at,
        })
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct OrganizationCreateRequest {
    #[schema(example = "acme")]
    pub name: String,
}

/// Delta applied to an organization: rename and/or deletion flag.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct OrganizationDeltaRequest {
    pub name: Option<String>,
    pub deleted: Option<bool>,
}

impl OrganizationDeltaRequest {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.deleted.is_none()
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct OrganizationBatchItem {
    pub id: Uuid,
    #[serde(flatten)]
    pub delta: OrganizationDeltaRequest,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct OrganizationBatchRequest {
    pub organizations: Vec<OrganizationBatchItem>,
}
