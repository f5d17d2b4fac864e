//! Storage boundary of the authentication core
//!
//! Every repository is an object-safe trait so the processor can run the same
//! code against the pool or against an open transaction. Two implementations
//! ship with the crate: [`postgres`] for production and [`memory`] for tests
//! and local tooling.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::error::DatabaseResult;
use uuid::Uuid;

use crate::models::{Invitation, Organization, Session, SessionProvider, SignInCode, User};

pub use memory::MemoryDatabase;
pub use postgres::PgDatabase;

#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn create(&self, session: &Session) -> DatabaseResult<()>;

    async fn get_by_id(&self, id: Uuid) -> DatabaseResult<Option<Session>>;

    async fn update_provider(&self, id: Uuid, provider: SessionProvider) -> DatabaseResult<()>;

    /// Persist `last_seen_at` and the session metadata
    async fn update_seen(&self, session: &Session) -> DatabaseResult<()>;

    async fn update_expired_at(&self, id: Uuid, expired_at: DateTime<Utc>) -> DatabaseResult<()>;
}

#[async_trait]
pub trait SignInCodeRepository: Send + Sync {
    async fn create(&self, sign_in_code: &SignInCode) -> DatabaseResult<()>;

    async fn get_by_id(&self, id: Uuid) -> DatabaseResult<Option<SignInCode>>;

    async fn get_by_email(&self, email: &str) -> DatabaseResult<Option<SignInCode>>;

    /// Count one more attempt in a single write, returning the new total
    async fn increment_attempts(&self, id: Uuid) -> DatabaseResult<i32>;

    async fn delete_by_id(&self, id: Uuid) -> DatabaseResult<()>;

    /// Delete every code expiring at or before `cutoff`, returning how many went
    async fn delete_by_expires_at(&self, cutoff: DateTime<Utc>) -> DatabaseResult<u64>;
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn create(&self, user: &User) -> DatabaseResult<()>;

    async fn get_by_id(&self, id: Uuid) -> DatabaseResult<Option<User>>;

    async fn get_by_email(&self, email: &str) -> DatabaseResult<Option<User>>;

    async fn update_email(&self, id: Uuid, email: &str) -> DatabaseResult<()>;
}

#[async_trait]
pub trait InvitationRepository: Send + Sync {
    async fn create(&self, invitation: &Invitation) -> DatabaseResult<()>;

    async fn get_by_email(&self, email: &str) -> DatabaseResult<Option<Invitation>>;

    async fn delete_by_id(&self, id: Uuid) -> DatabaseResult<()>;

    /// Delete every invitation expiring at or before `cutoff`, returning how many went
    async fn delete_by_expires_at(&self, cutoff: DateTime<Utc>) -> DatabaseResult<u64>;
}

#[async_trait]
pub trait OrganizationRepository: Send + Sync {
    async fn create(&self, organization: &Organization) -> DatabaseResult<()>;

    async fn get_by_id(&self, id: Uuid) -> DatabaseResult<Option<Organization>>;

    async fn get_by_domain(&self, domain: &str) -> DatabaseResult<Option<Organization>>;

    async fn update_domain(&self, id: Uuid, domain: &str) -> DatabaseResult<()>;
}

/// The repositories bound to one connection or transaction
pub trait Repositories: Send + Sync {
    fn sessions(&self) -> &dyn SessionRepository;

    fn sign_in_codes(&self) -> &dyn SignInCodeRepository;

    fn users(&self) -> &dyn UserRepository;

    fn invitations(&self) -> &dyn InvitationRepository;

    fn organizations(&self) -> &dyn OrganizationRepository;
}

/// Unit of work; dropping it without committing rolls it back
#[async_trait]
pub trait Transaction: Send + Sync {
    fn repositories(&self) -> &dyn Repositories;

    async fn commit(self: Box<Self>) -> DatabaseResult<()>;
}

/// Entry point to storage
#[async_trait]
pub trait Database: Send + Sync {
    /// Repositories running outside any transaction
    fn repositories(&self) -> &dyn Repositories;

    async fn begin(&self) -> DatabaseResult<Box<dyn Transaction>>;
}
