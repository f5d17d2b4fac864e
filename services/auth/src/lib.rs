//! Stateless multi-tenant authentication core
//!
//! Sealed tokens carry the session reference; every request is verified
//! against storage through [`verifier::AuthVerifier`], and sign-ins are driven
//! by [`processor::AuthProcessor`].
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use auth::config::AuthConfig;
//! use auth::email::BrevoEmailSender;
//! use auth::oauth::OAuthProviders;
//! use auth::processor::{AuthProcessor, SignInStart};
//! use auth::repositories::PgDatabase;
//!
//! # async fn example(pool: sqlx::PgPool) -> anyhow::Result<()> {
//! let config = AuthConfig::from_env()?;
//! let brevo = config.brevo.clone().ok_or_else(|| anyhow::anyhow!("brevo not configured"))?;
//! let oauth_providers = OAuthProviders::from_config(&config)?;
//!
//! let processor = AuthProcessor::from_config(
//!     config,
//!     Arc::new(PgDatabase::new(pool)),
//!     Arc::new(BrevoEmailSender::new(brevo)?),
//!     oauth_providers,
//! )?;
//!
//! let started = processor
//!     .start_email_sign_in("jane@acme.io", SignInStart::default())
//!     .await?;
//! println!("code {} sent", started.sign_in_code_id);
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod email;
pub mod error;
pub mod middleware;
pub mod models;
pub mod oauth;
pub mod processor;
pub mod repositories;
pub mod tasks;
pub mod validation;
pub mod verifier;
