//! Session model and related functionality

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Identity provider a session was established with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionProvider {
    Email,
    Google,
    Apple,
    Amazon,
    Saml,
}

impl SessionProvider {
    /// Providers that sign users in through an OAuth2 redirect
    pub const OAUTH: [SessionProvider; 3] = [
        SessionProvider::Google,
        SessionProvider::Apple,
        SessionProvider::Amazon,
    ];

    /// Get the provider name as stored and sealed
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionProvider::Email => "EMAIL",
            SessionProvider::Google => "GOOGLE",
            SessionProvider::Apple => "APPLE",
            SessionProvider::Amazon => "AMAZON",
            SessionProvider::Saml => "SAML",
        }
    }

    /// Lower-case name used in callback paths
    pub fn slug(&self) -> String {
        self.as_str().to_ascii_lowercase()
    }

    pub fn is_oauth(&self) -> bool {
        Self::OAUTH.contains(self)
    }
}

impl fmt::Display for SessionProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Unknown session provider: {0}")]
pub struct UnknownProvider(pub String);

impl FromStr for SessionProvider {
    type Err = UnknownProvider;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_uppercase().as_str() {
            "EMAIL" => Ok(SessionProvider::Email),
            "GOOGLE" => Ok(SessionProvider::Google),
            "APPLE" => Ok(SessionProvider::Apple),
            "AMAZON" => Ok(SessionProvider::Amazon),
            "SAML" => Ok(SessionProvider::Saml),
            _ => Err(UnknownProvider(value.to_string())),
        }
    }
}

/// Where a session was used from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionLocation {
    pub ip: String,
    pub device: String,
}

/// Persisted session metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMetadata {
    /// Distinct (ip, device) pairs in first-seen order
    #[serde(default)]
    pub locations: Vec<SessionLocation>,
}

/// Session entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub user_id: Uuid,
    pub provider: SessionProvider,
    pub metadata: SessionMetadata,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub expired_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Create a fresh session seen for the first time from `location`
    pub fn new(
        user_id: Uuid,
        provider: SessionProvider,
        location: SessionLocation,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            provider,
            metadata: SessionMetadata {
                locations: vec![location],
            },
            created_at: now,
            last_seen_at: now,
            expired_at: None,
        }
    }

    /// A session whose expiry has been reached stays invalid forever
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expired_at.is_some_and(|expired_at| now >= expired_at)
    }

    /// Append the location unless the exact pair is already known
    ///
    /// Returns whether the location was new.
    pub fn record_location(&mut self, ip: &str, device: &str) -> bool {
        let known = self
            .metadata
            .locations
            .iter()
            .any(|location| location.ip == ip && location.device == device);

        if !known {
            self.metadata.locations.push(SessionLocation {
                ip: ip.to_string(),
                device: device.to_string(),
            });
        }

        !known
    }
}
