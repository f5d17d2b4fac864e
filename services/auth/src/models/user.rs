//! User and invitation models

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::UserRole;

pub const USER_DEFAULT_PICTURE: &str = "https://static.example.com/images/default-user.png";

pub fn invitation_expiration() -> Duration {
    Duration::days(7)
}

/// User entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    pub picture: String,
    pub email: String,
    pub role: UserRole,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl User {
    pub fn new(
        organization_id: Uuid,
        name: String,
        picture: String,
        email: String,
        role: UserRole,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            organization_id,
            name,
            picture,
            email,
            role,
            created_at: now,
            deleted_at: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Address a soft-deleted user is moved to so its e-mail can be reused
    pub fn anonymized_email(&self) -> String {
        format!("{}@deleted.user", self.id)
    }
}

/// Pending invitation of an e-mail address into an organization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invitation {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub email: String,
    pub role: UserRole,
    pub expires_at: DateTime<Utc>,
}

impl Invitation {
    pub fn new(organization_id: Uuid, email: &str, role: UserRole, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            organization_id,
            email: email.to_string(),
            role,
            expires_at: now + invitation_expiration(),
        }
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}
