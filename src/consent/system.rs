use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::taxonomy;

/// What a system does with personal data, for one purpose.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivacyDeclaration {
    pub name: String,
    pub data_use: String,
    #[serde(default)]
    pub data_categories: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct System {
    pub fides_key: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub privacy_declarations: Vec<PrivacyDeclaration>,
}

impl System {
    pub fn new(fides_key: impl Into<String>) -> Self {
        Self {
            fides_key: fides_key.into(),
            name: None,
            privacy_declarations: Vec::new(),
        }
    }

    pub fn with_data_use(mut self, data_use: impl Into<String>) -> Self {
        let data_use = data_use.into();
        self.privacy_declarations.push(PrivacyDeclaration {
            name: data_use.clone(),
            data_use,
            data_categories: Vec::new(),
        });
        self
    }

    /// Declared data uses, optionally widened with every parent use.
    pub fn data_uses(&self, include_parents: bool) -> BTreeSet<String> {
        let mut uses = BTreeSet::new();
        for declaration in &self.privacy_declarations {
            if include_parents {
                uses.extend(taxonomy::parent_keys(&declaration.data_use));
            } else {
                uses.insert(declaration.data_use.clone());
            }
        }
        uses
    }
}
