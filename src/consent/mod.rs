//! Consent propagation
//!
//! Decides, per connected system, whether a privacy request's recorded consent is
//! propagated as an opt-in, an opt-out, or not at all, and keeps the per-system
//! reporting status of every preference record.

pub mod decision;
pub mod preference;
pub mod reporting;
pub mod system;

pub use decision::{
    filter_privacy_preferences_for_propagation, should_opt_in_to_service, ConsentAction, PropagationDecision,
};
pub use preference::{
    EnforcementLevel, PrivacyNoticeHistory, PrivacyPreferenceHistory, UserConsentPreference,
};
pub use reporting::{
    add_complete_system_status_for_consent_reporting, add_errored_system_status_for_consent_reporting,
    add_skipped_system_status_for_consent_reporting, cache_initial_status_and_identities_for_consent_reporting,
};
pub use system::{PrivacyDeclaration, System};
