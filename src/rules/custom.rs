//! Platform-tagged custom rule documents.
//!
//! A custom rule file is a YAML document stream; every document is one rule:
//!
//! ```yaml
//! ---
//! name: Word spawning cmd
//! backend: elasticsearch
//! metadata:
//!   author: blue team
//! rule: |
//!   winlog.event_data.ParentImage:*winword.exe AND winlog.event_data.Image:*cmd.exe
//! ```

use crate::error::{EvalError, Result};
use serde::Deserialize;
use std::path::Path;

/// One rule document. Unknown keys are rejected.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CustomRuleDocument {
    pub backend: String,
    pub name: String,
    pub rule: String,
    #[serde(default)]
    pub metadata: Option<serde_yaml::Mapping>,
}

/// Parse every document in a custom rule file.
pub fn parse_custom_rules(path: &Path) -> Result<Vec<CustomRuleDocument>> {
    let text = std::fs::read_to_string(path)?;
    parse_custom_rules_str(&text)
}

/// Parse a YAML stream of custom rule documents. Empty documents are ignored.
pub fn parse_custom_rules_str(text: &str) -> Result<Vec<CustomRuleDocument>> {
    let mut rules = Vec::new();
    for (position, document) in serde_yaml::Deserializer::from_str(text).enumerate() {
        let value = serde_yaml::Value::deserialize(document)
            .map_err(|e| EvalError::RuleFormat(format!("document {position}: {e}")))?;
        if value.is_null() {
            continue;
        }
        let rule: CustomRuleDocument = serde_yaml::from_value(value)
            .map_err(|e| EvalError::RuleFormat(format!("document {position}: {e}")))?;
        rules.push(rule);
    }
    Ok(rules)
}
