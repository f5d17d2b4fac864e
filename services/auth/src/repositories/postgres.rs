//! PostgreSQL storage

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::error::{DatabaseError, DatabaseResult};
use sqlx::pool::PoolConnection;
use sqlx::types::Json;
use sqlx::{FromRow, PgConnection, PgPool, Postgres};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    Database, InvitationRepository, OrganizationRepository, Repositories, SessionRepository,
    SignInCodeRepository, Transaction, UserRepository,
};
use crate::models::{
    Invitation, Organization, OrganizationCapacity, OrganizationSettings, OrganizationUsage,
    Session, SessionMetadata, SessionProvider, SignInCode, User,
};

type SharedTransaction = Arc<Mutex<Option<sqlx::Transaction<'static, Postgres>>>>;

#[derive(Clone)]
enum Connection {
    Pool(PgPool),
    Transaction(SharedTransaction),
}

enum Acquired<'a> {
    Pooled(PoolConnection<Postgres>),
    Transaction(MutexGuard<'a, Option<sqlx::Transaction<'static, Postgres>>>),
}

impl Acquired<'_> {
    fn connection(&mut self) -> DatabaseResult<&mut PgConnection> {
        match self {
            Acquired::Pooled(connection) => Ok(&mut **connection),
            Acquired::Transaction(guard) => guard
                .as_mut()
                .map(|tx| &mut **tx)
                .ok_or(DatabaseError::TransactionClosed),
        }
    }
}

/// Repositories bound to the pool or to one open transaction
#[derive(Clone)]
pub struct PgStore {
    connection: Connection,
}

impl PgStore {
    async fn acquire(&self) -> DatabaseResult<Acquired<'_>> {
        match &self.connection {
            Connection::Pool(pool) => pool
                .acquire()
                .await
                .map(Acquired::Pooled)
                .map_err(DatabaseError::Connection),
            Connection::Transaction(tx) => Ok(Acquired::Transaction(tx.lock().await)),
        }
    }
}

/// PostgreSQL [`Database`]
#[derive(Clone)]
pub struct PgDatabase {
    pool: PgPool,
    store: PgStore,
}

impl PgDatabase {
    pub fn new(pool: PgPool) -> Self {
        Self {
            store: PgStore {
                connection: Connection::Pool(pool.clone()),
            },
            pool,
        }
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> DatabaseResult<()> {
        info!("Running auth schema migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))
    }
}

#[async_trait]
impl Database for PgDatabase {
    fn repositories(&self) -> &dyn Repositories {
        &self.store
    }

    async fn begin(&self) -> DatabaseResult<Box<dyn Transaction>> {
        let tx = self.pool.begin().await.map_err(DatabaseError::Connection)?;
        let shared: SharedTransaction = Arc::new(Mutex::new(Some(tx)));

        Ok(Box::new(PgTransaction {
            tx: shared.clone(),
            store: PgStore {
                connection: Connection::Transaction(shared),
            },
        }))
    }
}

pub struct PgTransaction {
    tx: SharedTransaction,
    store: PgStore,
}

#[async_trait]
impl Transaction for PgTransaction {
    fn repositories(&self) -> &dyn Repositories {
        &self.store
    }

    async fn commit(self: Box<Self>) -> DatabaseResult<()> {
        let tx = self
            .tx
            .lock()
            .await
            .take()
            .ok_or(DatabaseError::TransactionClosed)?;

        tx.commit().await.map_err(DatabaseError::from_query)
    }
}

impl Repositories for PgStore {
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

fn decode_error(error: impl std::fmt::Display) -> DatabaseError {
    DatabaseError::Decode(error.to_string())
}

#[derive(FromRow)]
struct SessionRow {
    id: Uuid,
    user_id: Uuid,
    provider: String,
    metadata: Json<SessionMetadata>,
    created_at: DateTime<Utc>,
    last_seen_at: DateTime<Utc>,
    expired_at: Option<DateTime<Utc>>,
}

impl TryFrom<SessionRow> for Session {
    type Error = DatabaseError;

    fn try_from(row: SessionRow) -> DatabaseResult<Self> {
        Ok(Session {
            id: row.id,
            user_id: row.user_id,
            provider: row.provider.parse().map_err(decode_error)?,
            metadata: row.metadata.0,
            created_at: row.created_at,
            last_seen_at: row.last_seen_at,
            expired_at: row.expired_at,
        })
    }
}

#[async_trait]
impl SessionRepository for PgStore {
    async fn create(&self, session: &Session) -> DatabaseResult<()> {
        info!("Creating session for user: {}", session.user_id);

        let mut conn = self.acquire().await?;
        sqlx::query(
            r#"
            INSERT INTO "session" ("id", "user_id", "provider", "metadata", "created_at", "last_seen_at", "expired_at")
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(session.id)
        .bind(session.user_id)
        .bind(session.provider.as_str())
        .bind(Json(&session.metadata))
        .bind(session.created_at)
        .bind(session.last_seen_at)
        .bind(session.expired_at)
        .execute(conn.connection()?)
        .await
        .map_err(DatabaseError::from_query)?;

        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> DatabaseResult<Option<Session>> {
        debug!("Finding session by id: {}", id);

        let mut conn = self.acquire().await?;
        let row = sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT "id", "user_id", "provider", "metadata", "created_at", "last_seen_at", "expired_at"
            FROM "session"
            WHERE "id" = $1
            "#,
        )
        .bind(id)
        .fetch_optional(conn.connection()?)
        .await
        .map_err(DatabaseError::from_query)?;

        row.map(Session::try_from).transpose()
    }

    async fn update_provider(&self, id: Uuid, provider: SessionProvider) -> DatabaseResult<()> {
        info!("Switching session {} to provider: {}", id, provider);

        let mut conn = self.acquire().await?;
        let result = sqlx::query(r#"UPDATE "session" SET "provider" = $2 WHERE "id" = $1"#)
            .bind(id)
            .bind(provider.as_str())
            .execute(conn.connection()?)
            .await
            .map_err(DatabaseError::from_query)?;

        DatabaseError::expect_affected(result.rows_affected(), 1)
    }

    async fn update_seen(&self, session: &Session) -> DatabaseResult<()> {
        let mut conn = self.acquire().await?;
        let result = sqlx::query(
            r#"UPDATE "session" SET "metadata" = $2, "last_seen_at" = $3 WHERE "id" = $1"#,
        )
        .bind(session.id)
        .bind(Json(&session.metadata))
        .bind(session.last_seen_at)
        .execute(conn.connection()?)
        .await
        .map_err(DatabaseError::from_query)?;

        DatabaseError::expect_affected(result.rows_affected(), 1)
    }

    async fn update_expired_at(&self, id: Uuid, expired_at: DateTime<Utc>) -> DatabaseResult<()> {
        info!("Expiring session: {}", id);

        let mut conn = self.acquire().await?;
        let result = sqlx::query(r#"UPDATE "session" SET "expired_at" = $2 WHERE "id" = $1"#)
            .bind(id)
            .bind(expired_at)
            .execute(conn.connection()?)
            .await
            .map_err(DatabaseError::from_query)?;

        DatabaseError::expect_affected(result.rows_affected(), 1)
    }
}

#[derive(FromRow)]
struct SignInCodeRow {
    id: Uuid,
    email: String,
    code: String,
    attempts: i32,
    expires_at: DateTime<Utc>,
}

impl From<SignInCodeRow> for SignInCode {
    fn from(row: SignInCodeRow) -> Self {
        SignInCode {
            id: row.id,
            email: row.email,
            code: row.code,
            attempts: row.attempts,
            expires_at: row.expires_at,
        }
    }
}

#[async_trait]
impl SignInCodeRepository for PgStore {
    async fn create(&self, sign_in_code: &SignInCode) -> DatabaseResult<()> {
        info!("Creating sign in code: {}", sign_in_code.id);

        let mut conn = self.acquire().await?;
        sqlx::query(
            r#"
            INSERT INTO "sign_in_code" ("id", "email", "code", "attempts", "expires_at")
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(sign_in_code.id)
        .bind(&sign_in_code.email)
        .bind(&sign_in_code.code)
        .bind(sign_in_code.attempts)
        .bind(sign_in_code.expires_at)
        .execute(conn.connection()?)
        .await
        .map_err(DatabaseError::from_query)?;

        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> DatabaseResult<Option<SignInCode>> {
        let mut conn = self.acquire().await?;
        let row = sqlx::query_as::<_, SignInCodeRow>(
            r#"SELECT "id", "email", "code", "attempts", "expires_at" FROM "sign_in_code" WHERE "id" = $1"#,
        )
        .bind(id)
        .fetch_optional(conn.connection()?)
        .await
        .map_err(DatabaseError::from_query)?;

        Ok(row.map(SignInCode::from))
    }

    async fn get_by_email(&self, email: &str) -> DatabaseResult<Option<SignInCode>> {
        let mut conn = self.acquire().await?;
        let row = sqlx::query_as::<_, SignInCodeRow>(
            r#"SELECT "id", "email", "code", "attempts", "expires_at" FROM "sign_in_code" WHERE "email" = $1"#,
        )
        .bind(email)
        .fetch_optional(conn.connection()?)
        .await
        .map_err(DatabaseError::from_query)?;

        Ok(row.map(SignInCode::from))
    }

    async fn increment_attempts(&self, id: Uuid) -> DatabaseResult<i32> {
        let mut conn = self.acquire().await?;
        let attempts = sqlx::query_scalar::<_, i32>(
            r#"UPDATE "sign_in_code" SET "attempts" = "attempts" + 1 WHERE "id" = $1 RETURNING "attempts""#,
        )
        .bind(id)
        .fetch_optional(conn.connection()?)
        .await
        .map_err(DatabaseError::from_query)?;

        attempts.ok_or(DatabaseError::UnexpectedEffect {
            affected: 0,
            expected: 1,
        })
    }

    async fn delete_by_id(&self, id: Uuid) -> DatabaseResult<()> {
        info!("Deleting sign in code: {}", id);

        let mut conn = self.acquire().await?;
        let result = sqlx::query(r#"DELETE FROM "sign_in_code" WHERE "id" = $1"#)
            .bind(id)
            .execute(conn.connection()?)
            .await
            .map_err(DatabaseError::from_query)?;

        DatabaseError::expect_affected(result.rows_affected(), 1)
    }

    async fn delete_by_expires_at(&self, cutoff: DateTime<Utc>) -> DatabaseResult<u64> {
        let mut conn = self.acquire().await?;
        let result = sqlx::query(r#"DELETE FROM "sign_in_code" WHERE "expires_at" <= $1"#)
            .bind(cutoff)
            .execute(conn.connection()?)
            .await
            .map_err(DatabaseError::from_query)?;

        Ok(result.rows_affected())
    }
}

#[derive(FromRow)]
struct UserRow {
    id: Uuid,
    organization_id: Uuid,
    name: String,
    picture: String,
    email: String,
    role: String,
    created_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
}

impl TryFrom<UserRow> for User {
    type Error = DatabaseError;

    fn try_from(row: UserRow) -> DatabaseResult<Self> {
        Ok(User {
            id: row.id,
            organization_id: row.organization_id,
            name: row.name,
            picture: row.picture,
            email: row.email,
            role: row.role.parse().map_err(decode_error)?,
            created_at: row.created_at,
            deleted_at: row.deleted_at,
        })
    }
}

const USER_COLUMNS: &str =
    r#""id", "organization_id", "name", "picture", "email", "role", "created_at", "deleted_at""#;

#[async_trait]
impl UserRepository for PgStore {
    async fn create(&self, user: &User) -> DatabaseResult<()> {
        info!("Creating new user: {}", user.id);

        let mut conn = self.acquire().await?;
        sqlx::query(
            r#"
            INSERT INTO "user" ("id", "organization_id", "name", "picture", "email", "role", "created_at", "deleted_at")
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(user.id)
        .bind(user.organization_id)
        .bind(&user.name)
        .bind(&user.picture)
        .bind(&user.email)
        .bind(user.role.as_str())
        .bind(user.created_at)
        .bind(user.deleted_at)
        .execute(conn.connection()?)
        .await
        .map_err(DatabaseError::from_query)?;

        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> DatabaseResult<Option<User>> {
        let mut conn = self.acquire().await?;
        let row = sqlx::query_as::<_, UserRow>(&format!(
            r#"SELECT {USER_COLUMNS} FROM "user" WHERE "id" = $1"#
        ))
        .bind(id)
        .fetch_optional(conn.connection()?)
        .await
        .map_err(DatabaseError::from_query)?;

        row.map(User::try_from).transpose()
    }

    async fn get_by_email(&self, email: &str) -> DatabaseResult<Option<User>> {
        let mut conn = self.acquire().await?;
        let row = sqlx::query_as::<_, UserRow>(&format!(
            r#"SELECT {USER_COLUMNS} FROM "user" WHERE "email" = $1"#
        ))
        .bind(email)
        .fetch_optional(conn.connection()?)
        .await
        .map_err(DatabaseError::from_query)?;

        row.map(User::try_from).transpose()
    }

    async fn update_email(&self, id: Uuid, email: &str) -> DatabaseResult<()> {
        info!("Updating email of user: {}", id);

        let mut conn = self.acquire().await?;
        let result = sqlx::query(r#"UPDATE "user" SET "email" = $2 WHERE "id" = $1"#)
            .bind(id)
            .bind(email)
            .execute(conn.connection()?)
            .await
            .map_err(DatabaseError::from_query)?;

        DatabaseError::expect_affected(result.rows_affected(), 1)
    }
}

#[derive(FromRow)]
struct InvitationRow {
    id: Uuid,
    organization_id: Uuid,
    email: String,
    role: String,
    expires_at: DateTime<Utc>,
}

impl TryFrom<InvitationRow> for Invitation {
    type Error = DatabaseError;

    fn try_from(row: InvitationRow) -> DatabaseResult<Self> {
        Ok(Invitation {
            id: row.id,
            organization_id: row.organization_id,
            email: row.email,
            role: row.role.parse().map_err(decode_error)?,
            expires_at: row.expires_at,
        })
    }
}

#[async_trait]
impl InvitationRepository for PgStore {
    async fn create(&self, invitation: &Invitation) -> DatabaseResult<()> {
        info!("Creating invitation into organization: {}", invitation.organization_id);

        let mut conn = self.acquire().await?;
        sqlx::query(
            r#"
            INSERT INTO "invitation" ("id", "organization_id", "email", "role", "expires_at")
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(invitation.id)
        .bind(invitation.organization_id)
        .bind(&invitation.email)
        .bind(invitation.role.as_str())
        .bind(invitation.expires_at)
        .execute(conn.connection()?)
        .await
        .map_err(DatabaseError::from_query)?;

        Ok(())
    }

    async fn get_by_email(&self, email: &str) -> DatabaseResult<Option<Invitation>> {
        let mut conn = self.acquire().await?;
        let row = sqlx::query_as::<_, InvitationRow>(
            r#"SELECT "id", "organization_id", "email", "role", "expires_at" FROM "invitation" WHERE "email" = $1"#,
        )
        .bind(email)
        .fetch_optional(conn.connection()?)
        .await
        .map_err(DatabaseError::from_query)?;

        row.map(Invitation::try_from).transpose()
    }

    async fn delete_by_id(&self, id: Uuid) -> DatabaseResult<()> {
        info!("Deleting invitation: {}", id);

        let mut conn = self.acquire().await?;
        let result = sqlx::query(r#"DELETE FROM "invitation" WHERE "id" = $1"#)
            .bind(id)
            .execute(conn.connection()?)
            .await
            .map_err(DatabaseError::from_query)?;

        DatabaseError::expect_affected(result.rows_affected(), 1)
    }

    async fn delete_by_expires_at(&self, cutoff: DateTime<Utc>) -> DatabaseResult<u64> {
        let mut conn = self.acquire().await?;
        let result = sqlx::query(r#"DELETE FROM "invitation" WHERE "expires_at" <= $1"#)
            .bind(cutoff)
            .execute(conn.connection()?)
            .await
            .map_err(DatabaseError::from_query)?;

        Ok(result.rows_affected())
    }
}

#[derive(FromRow)]
struct OrganizationRow {
    id: Uuid,
    name: String,
    picture: String,
    domain: String,
    settings: Json<OrganizationSettings>,
    plan: String,
    trial_ends_at: Option<DateTime<Utc>>,
    capacity_included: i32,
    capacity_extra: i32,
    usage_value: i32,
    usage_last_computed_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
}

impl TryFrom<OrganizationRow> for Organization {
    type Error = DatabaseError;

    fn try_from(row: OrganizationRow) -> DatabaseResult<Self> {
        Ok(Organization {
            id: row.id,
            name: row.name,
            picture: row.picture,
            domain: row.domain,
            settings: row.settings.0,
            plan: row.plan.parse().map_err(decode_error)?,
            trial_ends_at: row.trial_ends_at,
            capacity: OrganizationCapacity {
                included: row.capacity_included,
                extra: row.capacity_extra,
            },
            usage: OrganizationUsage {
                value: row.usage_value,
                last_computed_at: row.usage_last_computed_at,
            },
            created_at: row.created_at,
            deleted_at: row.deleted_at,
        })
    }
}

const ORGANIZATION_COLUMNS: &str = r#""id", "name", "picture", "domain", "settings", "plan", "trial_ends_at",
    "capacity_included", "capacity_extra", "usage_value", "usage_last_computed_at", "created_at", "deleted_at""#;

#[async_trait]
impl OrganizationRepository for PgStore {
    async fn create(&self, organization: &Organization) -> DatabaseResult<()> {
        info!("Creating organization: {}", organization.domain);

        let mut conn = self.acquire().await?;
        sqlx::query(&format!(
            r#"
            INSERT INTO "organization" ({ORGANIZATION_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#
        ))
        .bind(organization.id)
        .bind(&organization.name)
        .bind(&organization.picture)
        .bind(&organization.domain)
        .bind(Json(&organization.settings))
        .bind(organization.plan.as_str())
        .bind(organization.trial_ends_at)
        .bind(organization.capacity.included)
        .bind(organization.capacity.extra)
        .bind(organization.usage.value)
        .bind(organization.usage.last_computed_at)
        .bind(organization.created_at)
        .bind(organization.deleted_at)
        .execute(conn.connection()?)
        .await
        .map_err(DatabaseError::from_query)?;

        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> DatabaseResult<Option<Organization>> {
        let mut conn = self.acquire().await?;
        let row = sqlx::query_as::<_, OrganizationRow>(&format!(
            r#"SELECT {ORGANIZATION_COLUMNS} FROM "organization" WHERE "id" = $1"#
        ))
        .bind(id)
        .fetch_optional(conn.connection()?)
        .await
        .map_err(DatabaseError::from_query)?;

        row.map(Organization::try_from).transpose()
    }

    async fn get_by_domain(&self, domain: &str) -> DatabaseResult<Option<Organization>> {
        let mut conn = self.acquire().await?;
        let row = sqlx::query_as::<_, OrganizationRow>(&format!(
            r#"SELECT {ORGANIZATION_COLUMNS} FROM "organization" WHERE "domain" = $1"#
        ))
        .bind(domain)
        .fetch_optional(conn.connection()?)
        .await
        .map_err(DatabaseError::from_query)?;

        row.map(Organization::try_from).transpose()
    }

    async fn update_domain(&self, id: Uuid, domain: &str) -> DatabaseResult<()> {
        info!("Updating domain of organization {} to: {}", id, domain);

        let mut conn = self.acquire().await?;
        let result = sqlx::query(r#"UPDATE "organization" SET "domain" = $2 WHERE "id" = $1"#)
            .bind(id)
            .bind(domain)
            .execute(conn.connection()?)
            .await
            .map_err(DatabaseError::from_query)?;

        DatabaseError::expect_affected(result.rows_affected(), 1)
    }
}
