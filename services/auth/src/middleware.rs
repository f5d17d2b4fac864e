//! Per-request authentication for the HTTP layer

use chrono::Utc;
use tracing::{error, info};

use crate::error::{AuthError, AuthResult};
use crate::models::{Organization, Session, User, UserRole};
use crate::repositories::Repositories;
use crate::verifier::AuthVerifier;

/// Cookie holding the sealed state between the start and end phases
pub const STATE_COOKIE_NAME: &str = "auth_state";
/// Cookie holding the sealed token once signed in
pub const TOKEN_COOKIE_NAME: &str = "auth_token";

/// Identity of the caller for the rest of the request
#[derive(Debug, Clone, PartialEq)]
pub struct RequestIdentity {
    pub session: Session,
    pub user: User,
    pub organization: Organization,
}

impl RequestIdentity {
    pub fn is_admin(&self) -> bool {
        self.user.role == UserRole::Admin
    }
}

/// Verify `token` and record where its session was seen from
pub async fn authenticate(
    verifier: &AuthVerifier,
    repositories: &dyn Repositories,
    token: &str,
    ip: &str,
    device: &str,
) -> AuthResult<RequestIdentity> {
    let verified = verifier.check_token_with(repositories, token).await?;
    let mut session = verified.session;

    if session.record_location(ip, device) {
        info!("New location for session: {}", session.id);
    }
    session.last_seen_at = Utc::now();

    if let Err(e) = repositories.sessions().update_seen(&session).await {
        error!("Failed to record session activity {}: {}", session.id, e);
        return Err(e.into());
    }

    Ok(RequestIdentity {
        session,
        user: verified.user,
        organization: verified.organization,
    })
}

pub fn require_admin(identity: &RequestIdentity) -> AuthResult<()> {
    if identity.is_admin() {
        Ok(())
    } else {
        Err(AuthError::UnauthorizedUser("admin role required".to_string()))
    }
}

/// Extract the token from an `Authorization: Bearer` header value
pub fn bearer_token(header: &str) -> Option<&str> {
    header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Value of cookie `name` in a `Cookie` header value
pub fn cookie_value<'a>(header: &'a str, name: &str) -> Option<&'a str> {
    header
        .split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
        .filter(|value| !value.is_empty())
}
