//! Background sweeps of expired sign-in material

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::error::AuthResult;
use crate::repositories::Database;

#[derive(Clone)]
pub struct AuthTasks {
    database: Arc<dyn Database>,
}

impl AuthTasks {
    pub fn new(database: Arc<dyn Database>) -> Self {
        Self { database }
    }

    pub async fn delete_expired_sign_in_codes(&self) -> AuthResult<u64> {
        let deleted = self
            .database
            .repositories()
            .sign_in_codes()
            .delete_by_expires_at(Utc::now())
            .await?;

        info!("Deleted {} expired sign in codes", deleted);
        Ok(deleted)
    }

    pub async fn delete_expired_invitations(&self) -> AuthResult<u64> {
        let deleted = self
            .database
            .repositories()
            .invitations()
            .delete_by_expires_at(Utc::now())
            .await?;

        info!("Deleted {} expired invitations", deleted);
        Ok(deleted)
    }

    /// Run both sweeps on `schedule` (cron with seconds)
    ///
    /// The returned scheduler keeps running until shut down.
    pub async fn start(&self, schedule: &str) -> Result<JobScheduler> {
        let tasks = self.clone();
        let scheduler = JobScheduler::new().await?;

        let job = Job::new_async(schedule, move |_, _| {
            let tasks = tasks.clone();
            Box::pin(async move {
                if let Err(e) = tasks.delete_expired_sign_in_codes().await {
                    error!("Failed to delete expired sign in codes: {}", e);
                }

                if let Err(e) = tasks.delete_expired_invitations().await {
                    error!("Failed to delete expired invitations: {}", e);
                }
            })
        })?;

        scheduler.add(job).await?;
        scheduler.start().await?;

        info!("Started sweep scheduler with schedule: {}", schedule);
        Ok(scheduler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Invitation, SignInCode, UserRole};
    use crate::repositories::MemoryDatabase;
    use chrono::Duration;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_sweeps_only_remove_expired_rows() {
        let database = Arc::new(MemoryDatabase::new());
        let repositories = database.repositories();
        let now = Utc::now();

        let live_code = SignInCode::new("live@acme.io", "AAAAAA".to_string(), now);
        let mut stale_code = SignInCode::new("stale@acme.io", "BBBBBB".to_string(), now);
        stale_code.expires_at = now - Duration::minutes(1);
        repositories.sign_in_codes().create(&live_code).await.unwrap();
        repositories.sign_in_codes().create(&stale_code).await.unwrap();

        let organization_id = Uuid::new_v4();
        let live_invitation =
            Invitation::new(organization_id, "new@acme.io", UserRole::Member, now);
        let mut stale_invitation =
            Invitation::new(organization_id, "old@acme.io", UserRole::Member, now);
        stale_invitation.expires_at = now - Duration::days(1);
        repositories.invitations().create(&live_invitation).await.unwrap();
        repositories.invitations().create(&stale_invitation).await.unwrap();

        let tasks = AuthTasks::new(database.clone());
        assert_eq!(tasks.delete_expired_sign_in_codes().await.unwrap(), 1);
        assert_eq!(tasks.delete_expired_invitations().await.unwrap(), 1);

        // idempotent
        assert_eq!(tasks.delete_expired_sign_in_codes().await.unwrap(), 0);
        assert_eq!(tasks.delete_expired_invitations().await.unwrap(), 0);

        assert!(
            repositories
                .sign_in_codes()
                .get_by_id(live_code.id)
                .await
                .unwrap()
                .is_some()
        );
        assert!(
            repositories
                .invitations()
                .get_by_email("new@acme.io")
                .await
                .unwrap()
                .is_some()
        );
    }
}
