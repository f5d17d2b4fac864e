use anyhow::Result;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use auth::config::AuthConfig;
use auth::repositories::PgDatabase;
use auth::tasks::AuthTasks;
use common::database;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting auth sweep worker");

    let config = AuthConfig::from_env()?;
    info!("Loaded configuration for {:?} environment", config.environment);

    // Initialize database connection pool
    let db_config = database::DatabaseConfig::from_env()?;
    let pool = database::init_pool(&db_config).await?;

    // Check database connectivity
    if database::health_check(&pool).await? {
        info!("Database connection successful");
    } else {
        anyhow::bail!("Failed to connect to database");
    }

    let database = PgDatabase::new(pool);
    database.migrate().await?;

    let tasks = AuthTasks::new(Arc::new(database));
    let mut scheduler = tasks.start(&config.sweep_schedule).await?;

    info!("Auth sweep worker started successfully");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down auth sweep worker");
    scheduler.shutdown().await?;

    Ok(())
}
