use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::events::{Loggable, Severity};

/// A user's link to an organization through exactly one role.
///
/// `deleted_at` set means the membership is revoked; `created_at` marks the
/// start of the *current* join (reactivation resets it).
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Membership {
    pub id: Uuid,
    pub user_id: Uuid,
    pub organization_id: Uuid,
    pub role_id: Uuid,
    /// Resolved role name; absent when the role row was physically removed
    /// after this membership was revoked.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Loggable for Membership {
    fn entity_type() -> &'static str { "membership" }
    fn subject_id(&self) -> Uuid { self.id }
    fn severity(&self) -> Severity { Severity::Critical }
}

#[derive(Debug, Clone, FromRow)]
pub struct DbMembership {
    pub id: Uuid,
    pub user_id: Uuid,
    pub organization_id: Uuid,
    pub role_id: Uuid,
    pub role_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl DbMembership {
    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }
}

impl From<DbMembership> for Membership {
    fn from(db: DbMembership) -> Self {
        Membership {
            id: db.id,
            user_id: db.user_id,
            organization_id: db.organization_id,
            role_id: db.role_id,
            role_name: db.role_name,
            created_at: db.created_at,
            updated_at: db.updated_at,
            deleted_at: db.deleted_at,
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct MembershipCreateRequest {
    pub user_id: Uuid,
    pub role_id: Uuid,
}

/// Delta applied to a membership: role reassignment and/or revocation state.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct MembershipDeltaRequest {
    pub role_id: Option<Uuid>,
    /// true revokes the membership, false reactivates a revoked one.
    pub revoked: Option<bool>,
}

impl MembershipDeltaRequest {
    pub fn is_empty(&self) -> bool {
        self.role_id.is_none() && self.revoked.is_none()
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct MembershipBatchItem {
    pub id: Uuid,
    #[serde(flatten)]
    pub delta: MembershipDeltaRequest,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct MembershipBatchRequest {
    pub memberships: Vec<MembershipBatchItem>,
}
