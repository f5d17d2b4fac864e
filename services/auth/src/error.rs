//! Error types surfaced by the authentication core

use common::error::DatabaseError;
use thiserror::Error;

/// Failure of a sign-in, sign-out or token check
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Invalid email: {0}")]
    InvalidEmail(String),

    #[error("Sign in code already requested")]
    SignInCodeAlreadyRequested,

    #[error("Invalid OAuth provider: {0}")]
    InvalidOAuthProvider(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid sign in code: {0}")]
    InvalidSignInCode(String),

    #[error("Invalid OAuth result: {0}")]
    InvalidOAuthResult(String),

    #[error("Unauthorized user: {0}")]
    UnauthorizedUser(String),

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    /// A concurrent sign-in won a uniqueness race and retries were exhausted
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Generic(String),
}

impl AuthError {
    /// Whether the failure is on our side rather than caused by the request
    pub fn is_server_error(&self) -> bool {
        matches!(self, AuthError::Generic(_) | AuthError::Conflict(_))
    }
}

impl From<DatabaseError> for AuthError {
    fn from(error: DatabaseError) -> Self {
        if error.is_conflict() {
            AuthError::Conflict(error.to_string())
        } else {
            AuthError::Generic(error.to_string())
        }
    }
}

/// Type alias for Result with AuthError
pub type AuthResult<T> = Result<T, AuthError>;
