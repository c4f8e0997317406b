//! Recorded consent: privacy notices and the data subject's preference for each.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use super::system::System;
use crate::execution::ExecutionLogStatus;
use crate::request::Identity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementLevel {
    /// Must be propagated to every system using the notice's data uses
    SystemWide,
    /// Only enforced in the browser
    Frontend,
    NotApplicable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserConsentPreference {
    OptIn,
    OptOut,
    Acknowledge,
}

/// Snapshot of a privacy notice at the time the preference was saved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivacyNoticeHistory {
    pub id: String,
    pub name: String,
    pub enforcement_level: EnforcementLevel,
    #[serde(default)]
    pub data_uses: Vec<String>,
}

impl PrivacyNoticeHistory {
    pub fn new(name: impl Into<String>, enforcement_level: EnforcementLevel, data_uses: &[&str]) -> Self {
        Self {
            id: format!("pri_notice_history_{}", Uuid::new_v4()),
            name: name.into(),
            enforcement_level,
            data_uses: data_uses.iter().map(|u| u.to_string()).collect(),
        }
    }

    /// The notice applies when one of its data uses matches a system data use or
    /// one of that use's parents.
    pub fn applies_to_system(&self, system: &System) -> bool {
        let system_uses = system.data_uses(true);
        self.data_uses.iter().any(|use_key| system_uses.contains(use_key))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrivacyPreferenceHistory {
    pub id: String,
    pub preference: UserConsentPreference,
    pub privacy_notice_history: PrivacyNoticeHistory,
    /// system key -> propagation status
    #[serde(default)]
    pub affected_system_status: BTreeMap<String, ExecutionLogStatus>,
    /// identities used when propagating, for consent reporting
    #[serde(default)]
    pub secondary_user_ids: BTreeMap<String, Value>,
}

impl PrivacyPreferenceHistory {
    pub fn new(preference: UserConsentPreference, notice: PrivacyNoticeHistory) -> Self {
        Self {
            id: format!("pri_preference_history_{}", Uuid::new_v4()),
            preference,
            privacy_notice_history: notice,
            affected_system_status: BTreeMap::new(),
            secondary_user_ids: BTreeMap::new(),
        }
    }

    pub fn status_for(&self, system_key: &str) -> Option<ExecutionLogStatus> {
        self.affected_system_status.get(system_key).copied()
    }

    /// Record the initial status for a system. A status that already reached
    /// `complete`, `error` or `skipped` is kept.
    pub fn cache_system_status(&mut self, system_key: &str, status: ExecutionLogStatus) -> bool {
        match self.status_for(system_key) {
            Some(current) if current != ExecutionLogStatus::Pending => false,
            _ => {
                self.affected_system_status.insert(system_key.to_string(), status);
                true
            }
        }
    }

    /// Move a `pending` status to `complete` or `error`. Anything else is a no-op.
    pub fn transition_pending(&mut self, system_key: &str, status: ExecutionLogStatus) -> bool {
        if !matches!(status, ExecutionLogStatus::Complete | ExecutionLogStatus::Error) {
            return false;
        }
        match self.affected_system_status.get_mut(system_key) {
            Some(current) if *current == ExecutionLogStatus::Pending => {
                *current = status;
                true
            }
            _ => false,
        }
    }

    pub fn update_secondary_user_ids(&mut self, identities: &Identity) {
        for (key, value) in identities {
            if !value.is_null() {
                self.secondary_user_ids.insert(key.clone(), value.clone());
            }
        }
    }
}
