//! Execution policies: which actions a privacy request performs and how erased
//! values are masked.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::graph::Field;
use crate::taxonomy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Access,
    Erasure,
    Consent,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Access => "access",
            ActionType::Erasure => "erasure",
            ActionType::Consent => "consent",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A masking strategy selected by key, plus its strategy-specific configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaskingSpec {
    pub strategy: String,
    #[serde(default)]
    pub configuration: Value,
}

impl MaskingSpec {
    pub fn new(strategy: impl Into<String>, configuration: Value) -> Self {
        Self {
            strategy: strategy.into(),
            configuration,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub key: String,
    pub action_type: ActionType,
    /// Data categories the rule applies to
    #[serde(default)]
    pub targets: Vec<String>,
    /// Erasure rules only; applied in order
    #[serde(default)]
    pub masking_strategy: Vec<MaskingSpec>,
}

impl Rule {
    pub fn new(key: impl Into<String>, action_type: ActionType) -> Self {
        Self {
            key: key.into(),
            action_type,
            targets: Vec::new(),
            masking_strategy: Vec::new(),
        }
    }

    pub fn with_target(mut self, category: impl Into<String>) -> Self {
        self.targets.push(category.into());
        self
    }

    pub fn with_masking(mut self, spec: MaskingSpec) -> Self {
        self.masking_strategy.push(spec);
        self
    }

    /// A field is targeted when one of its categories is, or descends from, a rule target.
    pub fn targets_field(&self, field: &Field) -> bool {
        field.data_categories.iter().any(|category| {
            self.targets
                .iter()
                .any(|target| taxonomy::is_within(category, target))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub key: String,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl Policy {
    pub fn new(key: impl Into<String>, rules: Vec<Rule>) -> Self {
        Self {
            key: key.into(),
            rules,
        }
    }

    pub fn rules_for(&self, action: ActionType) -> impl Iterator<Item = &Rule> {
        self.rules.iter().filter(move |rule| rule.action_type == action)
    }

    pub fn has_rules_for(&self, action: ActionType) -> bool {
        self.rules_for(action).next().is_some()
    }

    /// First erasure rule targeting `field`, if any.
    pub fn erasure_rule_for(&self, field: &Field) -> Option<&Rule> {
        self.rules_for(ActionType::Erasure)
            .find(|rule| rule.targets_field(field))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_erasure_rule_targets_category_descendants() {
        let policy = Policy::new(
            "erase_contact",
            vec![
                Rule::new("access", ActionType::Access).with_target("user"),
                Rule::new("erase", ActionType::Erasure)
                    .with_target("user.contact")
                    .with_masking(MaskingSpec::new("null_rewrite", json!({}))),
            ],
        );

        let email = Field::new("email").with_category("user.contact.email");
        let id = Field::new("id").with_category("system.operations");

        assert_eq!(policy.erasure_rule_for(&email).map(|r| r.key.as_str()), Some("erase"));
        assert!(policy.erasure_rule_for(&id).is_none());
        assert!(policy.has_rules_for(ActionType::Access));
        assert!(!policy.has_rules_for(ActionType::Consent));
    }

    #[test]
    fn test_deserialize_rule() {
        let rule: Rule = serde_json::from_value(json!({
            "key": "mask",
            "action_type": "erasure",
            "targets": ["user.name"],
            "masking_strategy": [{"strategy": "string_rewrite", "configuration": {"rewrite_value": "MASKED"}}]
        }))
        .unwrap();
        assert_eq!(rule.action_type, ActionType::Erasure);
        assert_eq!(rule.masking_strategy[0].strategy, "string_rewrite");
    }
}
