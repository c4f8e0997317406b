//! Privacy requests as handed to the engine by the intake layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::consent::PrivacyPreferenceHistory;
use crate::policy::Policy;

/// Identity field name -> value (e.g. `email`, `phone_number`).
pub type Identity = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    InProcessing,
    Complete,
    Error,
    Canceled,
}

/// Flat consent preference of the legacy consent workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentPreference {
    pub data_use: String,
    pub opt_in: bool,
}

impl ConsentPreference {
    pub fn new(data_use: impl Into<String>, opt_in: bool) -> Self {
        Self {
            data_use: data_use.into(),
            opt_in,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrivacyRequest {
    pub id: String,
    pub status: RequestStatus,
    pub identity: Identity,
    pub policy: Policy,
    #[serde(default)]
    pub consent_preferences: Vec<ConsentPreference>,
    #[serde(default)]
    pub privacy_preferences: Vec<PrivacyPreferenceHistory>,
    pub created_at: DateTime<Utc>,
}

impl PrivacyRequest {
    pub fn new(policy: Policy, identity: Identity) -> Self {
        Self {
            id: format!("pri_{}", Uuid::new_v4()),
            status: RequestStatus::Pending,
            identity,
            policy,
            consent_preferences: Vec::new(),
            privacy_preferences: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_consent_preferences(mut self, preferences: Vec<ConsentPreference>) -> Self {
        self.consent_preferences = preferences;
        self
    }

    pub fn with_privacy_preferences(mut self, preferences: Vec<PrivacyPreferenceHistory>) -> Self {
        self.privacy_preferences = preferences;
        self
    }

    pub fn preference(&self, id: &str) -> Option<&PrivacyPreferenceHistory> {
        self.privacy_preferences.iter().find(|p| p.id == id)
    }
}
