//! Collapse recorded consent into one propagation decision per system.

use serde::{Deserialize, Serialize};

use super::preference::{EnforcementLevel, PrivacyPreferenceHistory, UserConsentPreference};
use super::system::System;
use crate::request::PrivacyRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentAction {
    OptIn,
    OptOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropagationDecision {
    /// `None` means do nothing: the connector must not be called.
    pub action: Option<ConsentAction>,
    /// Ids of the preferences the decision was made from, in request order.
    /// Always empty for the legacy workflow.
    pub relevant_preference_ids: Vec<String>,
}

impl PropagationDecision {
    pub fn should_opt_in(&self) -> Option<bool> {
        self.action.map(|action| action == ConsentAction::OptIn)
    }

    fn nothing() -> Self {
        Self {
            action: None,
            relevant_preference_ids: Vec::new(),
        }
    }
}

/// Preferences that are candidates for third-party propagation.
///
/// Only system-wide notices count, acknowledgements are never propagated, and when a
/// system is known the notice must apply to one of its data uses. Orphaned connections
/// (no system) skip the data-use check.
pub fn filter_privacy_preferences_for_propagation<'a>(
    system: Option<&System>,
    preferences: &'a [PrivacyPreferenceHistory],
) -> Vec<&'a PrivacyPreferenceHistory> {
    preferences
        .iter()
        .filter(|pref| pref.privacy_notice_history.enforcement_level == EnforcementLevel::SystemWide)
        .filter(|pref| pref.preference != UserConsentPreference::Acknowledge)
        .filter(|pref| match system {
            Some(system) => pref.privacy_notice_history.applies_to_system(system),
            None => true,
        })
        .collect()
}

/// Decide whether to opt the data subject in, out, or do nothing for `system`.
///
/// Legacy requests carrying flat consent preferences opt in only when every preference
/// does; the system is ignored. Otherwise any relevant opt-out wins over opt-ins and the
/// decision keeps only the preferences agreeing with it.
pub fn should_opt_in_to_service(system: Option<&System>, request: &PrivacyRequest) -> PropagationDecision {
    if !request.consent_preferences.is_empty() {
        let opt_in = request.consent_preferences.iter().all(|pref| pref.opt_in);
        return PropagationDecision {
            action: Some(if opt_in { ConsentAction::OptIn } else { ConsentAction::OptOut }),
            relevant_preference_ids: Vec::new(),
        };
    }

    let relevant = filter_privacy_preferences_for_propagation(system, &request.privacy_preferences);
    if relevant.is_empty() {
        return PropagationDecision::nothing();
    }

    let (action, kept) = if relevant
        .iter()
        .any(|pref| pref.preference == UserConsentPreference::OptOut)
    {
        (ConsentAction::OptOut, UserConsentPreference::OptOut)
    } else {
        (ConsentAction::OptIn, UserConsentPreference::OptIn)
    };

    PropagationDecision {
        action: Some(action),
        relevant_preference_ids: relevant
            .into_iter()
            .filter(|pref| pref.preference == kept)
            .map(|pref| pref.id.clone())
            .collect(),
    }
}
