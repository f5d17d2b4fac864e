//! Token verification
//!
//! Turns a sealed token into the (session, user, organization) triple it
//! grants access as, or explains why it does not grant anything. Nothing is
//! written while checking.

use chrono::Utc;
use std::sync::Arc;
use tracing::debug;

use crate::codec::TokenCodec;
use crate::error::{AuthError, AuthResult};
use crate::models::{Organization, Session, User};
use crate::repositories::{Database, Repositories};

/// Identity a valid token resolves to
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedIdentity {
    pub session: Session,
    pub user: User,
    pub organization: Organization,
}

#[derive(Clone)]
pub struct AuthVerifier {
    codec: Arc<TokenCodec>,
    database: Arc<dyn Database>,
}

impl AuthVerifier {
    pub fn new(codec: Arc<TokenCodec>, database: Arc<dyn Database>) -> Self {
        Self { codec, database }
    }

    pub async fn check_token(&self, token: &str) -> AuthResult<VerifiedIdentity> {
        self.check_token_with(self.database.repositories(), token)
            .await
    }

    /// Same checks as [`Self::check_token`], reading through `repositories`
    pub async fn check_token_with(
        &self,
        repositories: &dyn Repositories,
        token: &str,
    ) -> AuthResult<VerifiedIdentity> {
        let now = Utc::now();

        let token = self
            .codec
            .open_token(token)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))?;

        if token.is_expired_at(now) {
            return Err(invalid_token("token expired"));
        }

        let session = repositories
            .sessions()
            .get_by_id(token.private.session_id)
            .await?
            .ok_or_else(|| invalid_token("no session linked"))?;

        if session.is_expired_at(now) {
            return Err(invalid_token("session expired"));
        }

        if session.provider != token.private.provider {
            return Err(invalid_token("provider doesn't match"));
        }

        let user = repositories
            .users()
            .get_by_id(session.user_id)
            .await?
            .ok_or_else(|| invalid_token("no user linked"))?;

        if user.is_deleted() {
            return Err(AuthError::UnauthorizedUser("user is deleted".to_string()));
        }

        let organization = repositories
            .organizations()
            .get_by_id(user.organization_id)
            .await?
            .ok_or_else(|| invalid_token("no organization linked"))?;

        if organization.is_deleted() {
            return Err(AuthError::UnauthorizedUser(
                "organization is deleted".to_string(),
            ));
        }

        debug!("Token verified for session: {}", session.id);

        Ok(VerifiedIdentity {
            session,
            user,
            organization,
        })
    }
}

fn invalid_token(reason: &str) -> AuthError {
    AuthError::InvalidToken(reason.to_string())
}
