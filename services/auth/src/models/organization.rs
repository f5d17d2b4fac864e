//! Organization model and trial provisioning

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

use crate::validation::is_safe_domain;

pub const ORGANIZATION_DEFAULT_PICTURE: &str =
    "https://static.example.com/images/default-organization.png";

pub fn organization_trial_period() -> Duration {
    Duration::days(14)
}

/// Billing plan of an organization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrganizationPlan {
    Enterprise,
    Business,
    Starter,
    Trial,
    Demo,
}

impl OrganizationPlan {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrganizationPlan::Enterprise => "ENTERPRISE",
            OrganizationPlan::Business => "BUSINESS",
            OrganizationPlan::Starter => "STARTER",
            OrganizationPlan::Trial => "TRIAL",
            OrganizationPlan::Demo => "DEMO",
        }
    }

    pub fn included_capacity(&self) -> i32 {
        match self {
            OrganizationPlan::Enterprise => 1_000_000,
            OrganizationPlan::Business => 100_000,
            OrganizationPlan::Starter => 10_000,
            OrganizationPlan::Trial => 100,
            OrganizationPlan::Demo => 0,
        }
    }
}

impl fmt::Display for OrganizationPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Unknown organization plan: {0}")]
pub struct UnknownPlan(pub String);

impl FromStr for OrganizationPlan {
    type Err = UnknownPlan;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "ENTERPRISE" => Ok(OrganizationPlan::Enterprise),
            "BUSINESS" => Ok(OrganizationPlan::Business),
            "STARTER" => Ok(OrganizationPlan::Starter),
            "TRIAL" => Ok(OrganizationPlan::Trial),
            "DEMO" => Ok(OrganizationPlan::Demo),
            _ => Err(UnknownPlan(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganizationSettings {
    /// Users with an e-mail on the organization domain join it on first sign-in
    #[serde(default)]
    pub domain_sign_in: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganizationCapacity {
    pub included: i32,
    pub extra: i32,
}

impl OrganizationCapacity {
    /// Trial quota: work domains get it included, personal ones as extra
    pub fn trial(safe_domain: bool) -> Self {
        let quota = OrganizationPlan::Trial.included_capacity();
        if safe_domain {
            Self {
                included: quota,
                extra: 0,
            }
        } else {
            Self {
                included: 0,
                extra: quota,
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganizationUsage {
    pub value: i32,
    pub last_computed_at: DateTime<Utc>,
}

/// Organization entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
    pub picture: String,
    pub domain: String,
    pub settings: OrganizationSettings,
    pub plan: OrganizationPlan,
    pub trial_ends_at: Option<DateTime<Utc>>,
    pub capacity: OrganizationCapacity,
    pub usage: OrganizationUsage,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Organization {
    /// Trial organization for the first user of an e-mail domain
    ///
    /// Work domains own their organization and enable domain sign-in. Personal
    /// or disposable domains get a per-address pseudo domain instead, so that
    /// two `gmail.com` users never land in the same organization. The pseudo
    /// domain is also used when `claim_domain` is false, i.e. when the work
    /// domain already belongs to an organization closed to domain sign-in.
    pub fn new_trial(
        email: &str,
        email_domain: &str,
        claim_domain: bool,
        now: DateTime<Utc>,
    ) -> Self {
        let safe_domain = is_safe_domain(email_domain);
        let (domain, domain_sign_in) = if safe_domain && claim_domain {
            (email_domain.to_string(), true)
        } else {
            (email.replace('@', "."), false)
        };

        Self {
            id: Uuid::new_v4(),
            name: name_from_domain(&domain),
            picture: ORGANIZATION_DEFAULT_PICTURE.to_string(),
            domain,
            settings: OrganizationSettings { domain_sign_in },
            plan: OrganizationPlan::Trial,
            trial_ends_at: Some(now + organization_trial_period()),
            capacity: OrganizationCapacity::trial(safe_domain),
            usage: OrganizationUsage {
                value: 0,
                last_computed_at: now,
            },
            created_at: now,
            deleted_at: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Domain a soft-deleted organization is moved to so its domain can be reused
    pub fn released_domain(&self) -> String {
        format!("{}.deleted.organization", self.id)
    }

    pub fn accepts_domain_sign_in(&self) -> bool {
        self.settings.domain_sign_in && is_safe_domain(&self.domain)
    }
}

fn name_from_domain(domain: &str) -> String {
    match domain.rsplit_once('.') {
        Some((name, _)) => name.to_string(),
        None => domain.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trial_for_work_domain() {
        let now = Utc::now();
        let organization = Organization::new_trial("jane@newcorp.com", "newcorp.com", true, now);

        assert_eq!(organization.name, "newcorp");
        assert_eq!(organization.domain, "newcorp.com");
        assert!(organization.settings.domain_sign_in);
        assert_eq!(organization.plan, OrganizationPlan::Trial);
        assert_eq!(organization.trial_ends_at, Some(now + Duration::days(14)));
        assert_eq!(
            organization.capacity,
            OrganizationCapacity {
                included: 100,
                extra: 0
            }
        );
        assert_eq!(organization.usage.value, 0);
        assert!(!organization.is_deleted());
    }

    #[test]
    fn test_trial_for_personal_domain() {
        let organization = Organization::new_trial("jane@gmail.com", "gmail.com", true, Utc::now());

        assert_eq!(organization.domain, "jane.gmail.com");
        assert_eq!(organization.name, "jane.gmail");
        assert!(!organization.settings.domain_sign_in);
        assert!(!organization.accepts_domain_sign_in());
        assert_eq!(
            organization.capacity,
            OrganizationCapacity {
                included: 0,
                extra: 100
            }
        );
    }

    #[test]
    fn test_trial_without_claiming_domain() {
        let organization = Organization::new_trial("bob@acme.io", "acme.io", false, Utc::now());

        assert_eq!(organization.domain, "bob.acme.io");
        assert!(!organization.settings.domain_sign_in);
        assert_eq!(organization.capacity.included, 100);
    }

    #[test]
    fn test_multi_label_domain_name() {
        let organization =
            Organization::new_trial("ops@eu.acme.co.uk", "eu.acme.co.uk", true, Utc::now());
        assert_eq!(organization.name, "eu.acme.co");
    }

    #[test]
    fn test_released_domain() {
        let organization = Organization::new_trial("jane@acme.io", "acme.io", true, Utc::now());
        assert_eq!(
            organization.released_domain(),
            format!("{}.deleted.organization", organization.id)
        );
    }

    #[test]
    fn test_plan_capacities() {
        assert_eq!(OrganizationPlan::Enterprise.included_capacity(), 1_000_000);
        assert_eq!(OrganizationPlan::Business.included_capacity(), 100_000);
        assert_eq!(OrganizationPlan::Starter.included_capacity(), 10_000);
        assert_eq!(OrganizationPlan::Trial.included_capacity(), 100);
        assert_eq!(OrganizationPlan::Demo.included_capacity(), 0);
        assert_eq!("STARTER".parse(), Ok(OrganizationPlan::Starter));
    }
}
