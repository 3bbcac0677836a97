use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::errors::AppError;
use crate::events::Loggable;

/// Two-stage lifecycle: `archived_at` pauses publication and is reversible,
/// `deleted_at` is terminal.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Package {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub archived_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Loggable for Package {
    fn entity_type() -> &'static str { "package" }
    fn subject_id(&self) -> Uuid { self.id }
}

#[derive(Debug, Clone, FromRow)]
pub struct DbPackage {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub archived_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl DbPackage {
    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

impl TryFrom<DbPackage> for Package {
    type Error = AppError;

    fn try_from(value: DbPackage) -> Result<Self, Self::Error> {
        Ok(Package {
            id: value.id,
            organization_id: value.organization_id,
            name: value.name,
            created_at: value.created_at,
            updated_at: value.updated_at,
            archived_at: value.archived_at,
            deleted_at: value.deleted_at,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PackageVersion {
    pub id: Uuid,
    pub package_id: Uuid,
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub archived_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Loggable for PackageVersion {
    fn entity_type() -> &'static str { "package_version" }
    fn subject_id(&self) -> Uuid { self.id }
}

#[derive(Debug, Clone, FromRow)]
pub struct DbPackageVersion {
    pub id: Uuid,
    pub package_id: Uuid,
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub archived_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl TryFrom<DbPackageVersion> for PackageVersion {
    type Error = AppError;

    fn try_from(value: DbPackageVersion) -> Result<Self, Self::Error> {
        Ok(PackageVersion {
            id: value.id,
            package_id: value.package_id,
            version: value.version,
            created_at: value.created_at,
            updated_at: value.updated_at,
            archived_at: value.archived_at,
            deleted_at: value.deleted_at,
        })
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct PackageCreateRequest {
    #[schema(example = "left-pad")]
    pub name: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct PackageVersionCreateRequest {
    #[schema(example = "1.2.0")]
    pub version: String,
}

/// Delta applied to a package or version: archive state and/or terminal
/// deletion.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct ArchiveDeltaRequest {
    /// true archives (pauses publication), false restores.
    pub archived: Option<bool>,
    /// true soft-deletes; deletion is terminal.
    pub deleted: Option<bool>,
}

impl ArchiveDeltaRequest {
    pub fn is_empty(&self) -> bool {
        self.archived.is_none() && self.deleted.is_none()
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ArchiveBatchItem {
    pub id: Uuid,
    #[serde(flatten)]
    pub delta: ArchiveDeltaRequest,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct PackageBatchRequest {
    pub packages: Vec<ArchiveBatchItem>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct PackageVersionBatchRequest {
    pub versions: Vec<ArchiveBatchItem>,
}

#[derive(Debug, Clone, Serialize, FromRow, ToSchema)]
pub struct PackageDownload {
    pub id: Uuid,
    pub package_version_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}
