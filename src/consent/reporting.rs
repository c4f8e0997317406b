//! Per-system consent reporting statuses on a privacy request's preferences.

use tracing::debug;

use crate::execution::ExecutionLogStatus;
use crate::request::{Identity, PrivacyRequest};

/// Mark the relevant preferences `pending` for `system_key` (recording the identities the
/// connector will use) and every other preference `skipped`.
pub fn cache_initial_status_and_identities_for_consent_reporting(
    request: &mut PrivacyRequest,
    system_key: &str,
    relevant_preference_ids: &[String],
    relevant_user_identities: &Identity,
) {
    for pref in &mut request.privacy_preferences {
        if relevant_preference_ids.contains(&pref.id) {
            pref.update_secondary_user_ids(relevant_user_identities);
            pref.cache_system_status(system_key, ExecutionLogStatus::Pending);
        } else {
            pref.cache_system_status(system_key, ExecutionLogStatus::Skipped);
        }
    }
}

/// Used when nothing is propagated to `system_key`.
pub fn add_skipped_system_status_for_consent_reporting(request: &mut PrivacyRequest, system_key: &str) {
    for pref in &mut request.privacy_preferences {
        pref.cache_system_status(system_key, ExecutionLogStatus::Skipped);
    }
}

/// `pending` -> `complete` for every preference deemed relevant for `system_key`.
pub fn add_complete_system_status_for_consent_reporting(request: &mut PrivacyRequest, system_key: &str) -> usize {
    transition_all(request, system_key, ExecutionLogStatus::Complete)
}

/// `pending` -> `error` for every preference deemed relevant for `system_key`.
pub fn add_errored_system_status_for_consent_reporting(request: &mut PrivacyRequest, system_key: &str) -> usize {
    transition_all(request, system_key, ExecutionLogStatus::Error)
}

fn transition_all(request: &mut PrivacyRequest, system_key: &str, status: ExecutionLogStatus) -> usize {
    let updated = request
        .privacy_preferences
        .iter_mut()
        .map(|pref| pref.transition_pending(system_key, status))
        .filter(|changed| *changed)
        .count();
    debug!(privacy_request_id = %request.id, system_key, ?status, updated, "Consent reporting status cached");
    updated
}
