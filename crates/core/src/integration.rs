//! Tenant feed registrations.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::id::{IntegrationId, UserId};

/// Durable lifecycle status of an integration, as shown to the tenant.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationStatus {
    /// Registered but never successfully imported.
    NotIntegrated,
    /// First import is running.
    InAnalysis,
    /// A re-import of an already integrated feed is running.
    InUpdate,
    /// Last run imported the feed successfully.
    Integrated,
    /// First import failed.
    Error,
    /// A re-import failed; previously imported data is still in place.
    UpdateError,
}

impl IntegrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntegrationStatus::NotIntegrated => "not_integrated",
            IntegrationStatus::InAnalysis => "in_analysis",
            IntegrationStatus::InUpdate => "in_update",
            IntegrationStatus::Integrated => "integrated",
            IntegrationStatus::Error => "error",
            IntegrationStatus::UpdateError => "update_error",
        }
    }
}

impl core::fmt::Display for IntegrationStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IntegrationStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_integrated" => Ok(IntegrationStatus::NotIntegrated),
            "in_analysis" => Ok(IntegrationStatus::InAnalysis),
            "in_update" => Ok(IntegrationStatus::InUpdate),
            "integrated" => Ok(IntegrationStatus::Integrated),
            "error" => Ok(IntegrationStatus::Error),
            "update_error" => Ok(IntegrationStatus::UpdateError),
            other => Err(DomainError::UnknownStatus(other.to_string())),
        }
    }
}

/// A tenant's registered external feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Integration {
    pub id: IntegrationId,
    pub user_id: UserId,
    pub source_url: String,
    pub provider: String,
    pub status: IntegrationStatus,
    /// Items imported by the last successful run.
    pub item_count: u64,
    pub last_integrated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Integration {
    pub fn new(
        user_id: UserId,
        source_url: impl Into<String>,
        provider: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: IntegrationId::new(),
            user_id,
            source_url: source_url.into(),
            provider: provider.into(),
            status: IntegrationStatus::NotIntegrated,
            item_count: 0,
            last_integrated_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_integrated_before(&self) -> bool {
        self.last_integrated_at.is_some()
    }

    pub fn enter_processing(&mut self, now: DateTime<Utc>) {
        self.status = if self.has_integrated_before() {
            IntegrationStatus::InUpdate
        } else {
            IntegrationStatus::InAnalysis
        };
        self.updated_at = now;
    }

    pub fn record_success(&mut self, item_count: u64, now: DateTime<Utc>) {
        self.status = IntegrationStatus::Integrated;
        self.item_count = item_count;
        self.last_integrated_at = Some(now);
        self.updated_at = now;
    }

    pub fn record_failure(&mut self, now: DateTime<Utc>) {
        self.status = if self.has_integrated_before() {
            IntegrationStatus::UpdateError
        } else {
            IntegrationStatus::Error
        };
        self.updated_at = now;
    }

    /// Put the integration back to its idle status after an interrupted run.
    pub fn revert_idle(&mut self, now: DateTime<Utc>) {
        self.status = if self.has_integrated_before() {
            IntegrationStatus::Integrated
        } else {
            IntegrationStatus::NotIntegrated
        };
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn integration() -> Integration {
        Integration::new(UserId::new(), "https://feeds.example/1.xml", "kyero", Utc::now())
    }

    #[test]
    fn first_run_is_an_analysis() {
        let mut i = integration();
        i.enter_processing(Utc::now());
        assert_eq!(i.status, IntegrationStatus::InAnalysis);

        i.record_failure(Utc::now());
        assert_eq!(i.status, IntegrationStatus::Error);

        i.revert_idle(Utc::now());
        assert_eq!(i.status, IntegrationStatus::NotIntegrated);
    }

    #[test]
    fn later_runs_are_updates() {
        let mut i = integration();
        i.record_success(120, Utc::now());
        assert_eq!(i.item_count, 120);

        i.enter_processing(Utc::now());
        assert_eq!(i.status, IntegrationStatus::InUpdate);

        i.record_failure(Utc::now());
        assert_eq!(i.status, IntegrationStatus::UpdateError);
        assert_eq!(i.item_count, 120);
    }

    #[test]
    fn status_labels_round_trip() {
        for s in [
            IntegrationStatus::NotIntegrated,
            IntegrationStatus::InAnalysis,
            IntegrationStatus::InUpdate,
            IntegrationStatus::Integrated,
            IntegrationStatus::Error,
            IntegrationStatus::UpdateError,
        ] {
            assert_eq!(s.as_str().parse::<IntegrationStatus>().unwrap(), s);
        }
        assert!("integrating".parse::<IntegrationStatus>().is_err());
    }
}
