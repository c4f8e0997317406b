//! Dotted taxonomy keys (`marketing.advertising.first_party`, `user.contact.email`).
//!
//! Parent lookups are pure string operations: a key's parents are its dot-separated
//! prefixes, no taxonomy table required.

use std::collections::BTreeSet;

/// `a.b.c` -> `{a.b.c, a.b, a}`
pub fn parent_keys(key: &str) -> BTreeSet<String> {
    let mut keys = BTreeSet::from([key.to_string()]);
    let mut current = key;
    while let Some((parent, _)) = current.rsplit_once('.') {
        if parent.is_empty() {
            break;
        }
        keys.insert(parent.to_string());
        current = parent;
    }
    keys
}

/// True when `key` is `ancestor` or sits below it.
pub fn is_within(key: &str, ancestor: &str) -> bool {
    key == ancestor
        || key
            .strip_prefix(ancestor)
            .is_some_and(|rest| rest.starts_with('.'))
}
