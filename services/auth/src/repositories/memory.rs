//! In-memory storage
//!
//! Transactions are serialized: `begin` takes the store lock for the whole
//! lifetime of the transaction and works on a private copy that `commit`
//! writes back. Uniqueness rules mirror the PostgreSQL schema.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::error::{DatabaseError, DatabaseResult};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::{
    Database, InvitationRepository, OrganizationRepository, Repositories, SessionRepository,
    SignInCodeRepository, Transaction, UserRepository,
};
use crate::models::{Invitation, Organization, Session, SessionProvider, SignInCode, User};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    sessions: HashMap<Uuid, Session>,
    sign_in_codes: HashMap<Uuid, SignInCode>,
    users: HashMap<Uuid, User>,
    invitations: HashMap<Uuid, Invitation>,
    organizations: HashMap<Uuid, Organization>,
}

#[derive(Clone)]
enum Handle {
    Shared(Arc<Mutex<MemoryState>>),
    /// Private copy owned by an open transaction
    Scoped(Arc<std::sync::Mutex<MemoryState>>),
}

/// Repositories over either the shared state or a transaction's copy
#[derive(Clone)]
pub struct MemoryStore {
    handle: Handle,
}

impl MemoryStore {
    async fn with<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut MemoryState) -> R + Send,
        R: Send,
    {
        match &self.handle {
            Handle::Shared(state) => {
                let mut guard = state.lock().await;
                f(&mut *guard)
            }
            Handle::Scoped(state) => {
                let mut guard = state.lock().unwrap_or_else(PoisonError::into_inner);
                f(&mut *guard)
            }
        }
    }
}

fn found(found: bool) -> DatabaseResult<()> {
    DatabaseError::expect_affected(u64::from(found), 1)
}

fn duplicate(constraint: &str) -> DatabaseError {
    DatabaseError::UniqueViolation(constraint.to_string())
}

/// In-memory [`Database`]
#[derive(Clone)]
pub struct MemoryDatabase {
    state: Arc<Mutex<MemoryState>>,
    store: MemoryStore,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        let state = Arc::new(Mutex::new(MemoryState::default()));
        Self {
            store: MemoryStore {
                handle: Handle::Shared(state.clone()),
            },
            state,
        }
    }
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    fn repositories(&self) -> &dyn Repositories {
        &self.store
    }

    async fn begin(&self) -> DatabaseResult<Box<dyn Transaction>> {
        let guard = self.state.clone().lock_owned().await;
        let working = Arc::new(std::sync::Mutex::new(guard.clone()));

        Ok(Box::new(MemoryTransaction {
            guard,
            working: working.clone(),
            store: MemoryStore {
                handle: Handle::Scoped(working),
            },
        }))
    }
}

pub struct MemoryTransaction {
    guard: OwnedMutexGuard<MemoryState>,
    working: Arc<std::sync::Mutex<MemoryState>>,
    store: MemoryStore,
}

#[async_trait]
impl Transaction for MemoryTransaction {
    fn repositories(&self) -> &dyn Repositories {
        &self.store
    }

    async fn commit(self: Box<Self>) -> DatabaseResult<()> {
        let mut this = *self;
        let working = std::mem::take(
            &mut *this
                .working
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        *this.guard = working;

        Ok(())
    }
}

impl Repositories for MemoryStore {
    fn sessions(&self) -> &dyn SessionRepository {
        self
    }

    fn sign_in_codes(&self) -> &dyn SignInCodeRepository {
        self
    }

    fn users(&self) -> &dyn UserRepository {
        self
    }

    fn invitations(&self) -> &dyn InvitationRepository {
        self
    }

    fn organizations(&self) -> &dyn OrganizationRepository {
        self
    }
}

#[async_trait]
impl SessionRepository for MemoryStore {
    async fn create(&self, session: &Session) -> DatabaseResult<()> {
        self.with(|state| {
            if state.sessions.contains_key(&session.id) {
                return Err(duplicate("session_pkey"));
            }
            state.sessions.insert(session.id, session.clone());
            Ok(())
        })
        .await
    }

    async fn get_by_id(&self, id: Uuid) -> DatabaseResult<Option<Session>> {
        Ok(self.with(|state| state.sessions.get(&id).cloned()).await)
    }

    async fn update_provider(&self, id: Uuid, provider: SessionProvider) -> DatabaseResult<()> {
        self.with(|state| {
            let session = state.sessions.get_mut(&id);
            let exists = session.is_some();
            if let Some(session) = session {
                session.provider = provider;
            }
            found(exists)
        })
        .await
    }

    async fn update_seen(&self, session: &Session) -> DatabaseResult<()> {
        self.with(|state| {
            let stored = state.sessions.get_mut(&session.id);
            let exists = stored.is_some();
            if let Some(stored) = stored {
                stored.metadata = session.metadata.clone();
                stored.last_seen_at = session.last_seen_at;
            }
            found(exists)
        })
        .await
    }

    async fn update_expired_at(&self, id: Uuid, expired_at: DateTime<Utc>) -> DatabaseResult<()> {
        self.with(|state| {
            let session = state.sessions.get_mut(&id);
            let exists = session.is_some();
            if let Some(session) = session {
                session.expired_at = Some(expired_at);
            }
            found(exists)
        })
        .await
    }
}

#[async_trait]
impl SignInCodeRepository for MemoryStore {
    async fn create(&self, sign_in_code: &SignInCode) -> DatabaseResult<()> {
        self.with(|state| {
            if state
                .sign_in_codes
                .values()
                .any(|existing| existing.email == sign_in_code.email)
            {
                return Err(duplicate("sign_in_code_email_key"));
            }
            state
                .sign_in_codes
                .insert(sign_in_code.id, sign_in_code.clone());
            Ok(())
        })
        .await
    }

    async fn get_by_id(&self, id: Uuid) -> DatabaseResult<Option<SignInCode>> {
        Ok(self.with(|state| state.sign_in_codes.get(&id).cloned()).await)
    }

    async fn get_by_email(&self, email: &str) -> DatabaseResult<Option<SignInCode>> {
        Ok(self
            .with(|state| {
                state
                    .sign_in_codes
                    .values()
                    .find(|code| code.email == email)
                    .cloned()
            })
            .await)
    }

    async fn increment_attempts(&self, id: Uuid) -> DatabaseResult<i32> {
        self.with(|state| {
            let code = state
                .sign_in_codes
                .get_mut(&id)
                .ok_or(DatabaseError::UnexpectedEffect {
                    affected: 0,
                    expected: 1,
                })?;
            code.attempts += 1;
            Ok(code.attempts)
        })
        .await
    }

    async fn delete_by_id(&self, id: Uuid) -> DatabaseResult<()> {
        self.with(|state| found(state.sign_in_codes.remove(&id).is_some()))
            .await
    }

    async fn delete_by_expires_at(&self, cutoff: DateTime<Utc>) -> DatabaseResult<u64> {
        Ok(self
            .with(|state| {
                let before = state.sign_in_codes.len();
                state
                    .sign_in_codes
                    .retain(|_, code| code.expires_at > cutoff);
                (before - state.sign_in_codes.len()) as u64
            })
            .await)
    }
}

#[async_trait]
impl UserRepository for MemoryStore {
    async fn create(&self, user: &User) -> DatabaseResult<()> {
        self.with(|state| {
            if state.users.contains_key(&user.id) {
                return Err(duplicate("user_pkey"));
            }
            if state.users.values().any(|existing| existing.email == user.email) {
                return Err(duplicate("user_email_key"));
            }
            state.users.insert(user.id, user.clone());
            Ok(())
        })
        .await
    }

    async fn get_by_id(&self, id: Uuid) -> DatabaseResult<Option<User>> {
        Ok(self.with(|state| state.users.get(&id).cloned()).await)
    }

    async fn get_by_email(&self, email: &str) -> DatabaseResult<Option<User>> {
        Ok(self
            .with(|state| state.users.values().find(|user| user.email == email).cloned())
            .await)
    }

    async fn update_email(&self, id: Uuid, email: &str) -> DatabaseResult<()> {
        self.with(|state| {
            if state
                .users
                .values()
                .any(|existing| existing.id != id && existing.email == email)
            {
                return Err(duplicate("user_email_key"));
            }
            let user = state.users.get_mut(&id);
            let exists = user.is_some();
            if let Some(user) = user {
                user.email = email.to_string();
            }
            found(exists)
        })
        .await
    }
}

#[async_trait]
impl InvitationRepository for MemoryStore {
    async fn create(&self, invitation: &Invitation) -> DatabaseResult<()> {
        self.with(|state| {
            if state
                .invitations
                .values()
                .any(|existing| existing.email == invitation.email)
            {
                return Err(duplicate("invitation_email_key"));
            }
            state.invitations.insert(invitation.id, invitation.clone());
            Ok(())
        })
        .await
    }

    async fn get_by_email(&self, email: &str) -> DatabaseResult<Option<Invitation>> {
        Ok(self
            .with(|state| {
                state
                    .invitations
                    .values()
                    .find(|invitation| invitation.email == email)
                    .cloned()
            })
            .await)
    }

    async fn delete_by_id(&self, id: Uuid) -> DatabaseResult<()> {
        self.with(|state| found(state.invitations.remove(&id).is_some()))
            .await
    }

    async fn delete_by_expires_at(&self, cutoff: DateTime<Utc>) -> DatabaseResult<u64> {
        Ok(self
            .with(|state| {
                let before = state.invitations.len();
                state
                    .invitations
                    .retain(|_, invitation| invitation.expires_at > cutoff);
                (before - state.invitations.len()) as u64
            })
            .await)
    }
}

#[async_trait]
impl OrganizationRepository for MemoryStore {
    async fn create(&self, organization: &Organization) -> DatabaseResult<()> {
        self.with(|state| {
            if state.organizations.contains_key(&organization.id) {
                return Err(duplicate("organization_pkey"));
            }
            if state
                .organizations
                .values()
                .any(|existing| existing.domain == organization.domain)
            {
                return Err(duplicate("organization_domain_key"));
            }
            state
                .organizations
                .insert(organization.id, organization.clone());
            Ok(())
        })
        .await
    }

    async fn get_by_id(&self, id: Uuid) -> DatabaseResult<Option<Organization>> {
        Ok(self
            .with(|state| state.organizations.get(&id).cloned())
            .await)
    }

    async fn get_by_domain(&self, domain: &str) -> DatabaseResult<Option<Organization>> {
        Ok(self
            .with(|state| {
                state
                    .organizations
                    .values()
                    .find(|organization| organization.domain == domain)
                    .cloned()
            })
            .await)
    }

    async fn update_domain(&self, id: Uuid, domain: &str) -> DatabaseResult<()> {
        self.with(|state| {
            if state
                .organizations
                .values()
                .any(|existing| existing.id != id && existing.domain == domain)
            {
                return Err(duplicate("organization_domain_key"));
            }
            let organization = state.organizations.get_mut(&id);
            let exists = organization.is_some();
            if let Some(organization) = organization {
                organization.domain = domain.to_string();
            }
            found(exists)
        })
        .await
    }
}
