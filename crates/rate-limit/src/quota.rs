use admission_common::RateLimit;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// A per-user policy that takes precedence over endpoint and global policies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaOverride {
    pub subject_id: String,
    pub limit: RateLimit,
    pub expires_at: Option<DateTime<Utc>>,
}

impl QuotaOverride {
    /// Active strictly before `expires_at`; at `expires_at` it no longer applies.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |expiry| now < expiry)
    }
}

/// Concurrent store of quota overrides, last write wins.
#[derive(Debug, Default)]
pub struct QuotaStore {
    overrides: DashMap<String, QuotaOverride>,
}

impl QuotaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an override, replacing any previous one for the same user.
    pub fn set(&self, quota: QuotaOverride) -> Option<QuotaOverride> {
        self.overrides.insert(quota.subject_id.clone(), quota)
    }

    pub fn get_active(&self, subject_id: &str, now: DateTime<Utc>) -> Option<QuotaOverride> {
        self.overrides
            .get(subject_id)
            .filter(|entry| entry.is_active_at(now))
            .map(|entry| entry.value().clone())
    }

    pub fn clear(&self, subject_id: &str) -> Option<QuotaOverride> {
        self.overrides.remove(subject_id).map(|(_, quota)| quota)
    }

    /// Drop every override that has expired by `now`. Returns how many went.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.overrides.len();
        self.overrides.retain(|_, quota| quota.is_active_at(now));
        before.saturating_sub(self.overrides.len())
    }

    pub fn len(&self) -> usize {
        self.overrides.len()
    }

    pub fn is_empty(&self) -> bool {
        self.overrides.is_empty()
    }
}
