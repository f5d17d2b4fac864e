//! Authentication service models

pub mod organization;
pub mod role;
pub mod session;
pub mod sign_in_code;
pub mod token;
pub mod user;

// Re-export for convenience
pub use organization::{
    ORGANIZATION_DEFAULT_PICTURE, Organization, OrganizationCapacity, OrganizationPlan,
    OrganizationSettings, OrganizationUsage,
};
pub use role::UserRole;
pub use session::{Session, SessionLocation, SessionMetadata, SessionProvider, UnknownProvider};
pub use sign_in_code::{
    DEV_SIGN_IN_CODE, SIGN_IN_CODE_LENGTH, SIGN_IN_CODE_MAX_ATTEMPTS, SignInCode,
};
pub use token::{State, Token, TokenPrivate, TokenPublic};
pub use user::{Invitation, USER_DEFAULT_PICTURE, User};
