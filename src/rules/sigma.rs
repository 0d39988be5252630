//! Sigma rule translation into search-index queries.
//!
//! [`Translator`] is the seam between rule loading and whatever turns a rule
//! file into backend-native queries. [`SigmaTranslator`] is the built-in
//! implementation producing Elasticsearch query DSL documents against the
//! winlogbeat layout written by the telemetry normalizer.
//!
//! A rule whose `condition` is a list yields one query per condition, in
//! order. Features with no query-DSL equivalent are reported as
//! [`EvalError::Unsupported`]; structurally broken rules as
//! [`EvalError::Translation`].
//!
//! # Examples
//!
//! ```rust
//! use detection_eval::rules::{QueryBody, SigmaTranslator};
//!
//! let translator = SigmaTranslator::new();
//! let queries = translator.translate_str(r#"
//! title: Successful logon
//! logsource:
//!     product: windows
//!     service: security
//! detection:
//!     selection:
//!         EventID: 4624
//!     condition: selection
//! "#)?;
//!
//! assert_eq!(queries.len(), 1);
//! assert!(matches!(queries[0], QueryBody::Document(_)));
//! # Ok::<(), detection_eval::EvalError>(())
//! ```

use super::condition::{parse_condition, ConditionAst, Quantifier};
use super::field_mapping::FieldMapping;
use super::QueryBody;
use crate::error::{EvalError, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use serde_yaml::Value as YamlValue;
use std::collections::BTreeMap;
use std::path::Path;

/// Turns one rule file into one or more backend-native queries.
pub trait Translator: Send + Sync {
    fn translate(&self, path: &Path) -> Result<Vec<QueryBody>>;
}

/// Sigma to Elasticsearch query DSL.
#[derive(Debug, Clone, Default)]
pub struct SigmaTranslator {
    field_mapping: FieldMapping,
}

impl Translator for SigmaTranslator {
    fn translate(&self, path: &Path) -> Result<Vec<QueryBody>> {
        let text = std::fs::read_to_string(path)?;
        self.translate_str(&text)
    }
}

impl SigmaTranslator {
    pub fn new() -> Self {
        Self::with_field_mapping(FieldMapping::winlogbeat())
    }

    pub fn with_field_mapping(field_mapping: FieldMapping) -> Self {
        Self { field_mapping }
    }

    pub fn field_mapping(&self) -> &FieldMapping {
        &self.field_mapping
    }

    /// Translate Sigma YAML text.
    pub fn translate_str(&self, rule_yaml: &str) -> Result<Vec<QueryBody>> {
        let doc = single_document(rule_yaml)?;

        let detection = doc
            .get("detection")
            .and_then(YamlValue::as_mapping)
            .ok_or_else(|| EvalError::Translation("Missing detection section".to_string()))?;

        if detection.contains_key("timeframe") {
            return Err(EvalError::Unsupported("timeframe".to_string()));
        }

        let conditions = match detection.get("condition") {
            Some(YamlValue::String(condition)) => vec![condition.clone()],
            Some(YamlValue::Sequence(items)) => items
                .iter()
                .map(|item| {
                    item.as_str().map(str::to_string).ok_or_else(|| {
                        EvalError::Translation("Condition list must hold strings".to_string())
                    })
                })
                .collect::<Result<Vec<_>>>()?,
            _ => return Err(EvalError::Translation("Missing condition".to_string())),
        };

        let mut selections = BTreeMap::new();
        for (key, value) in detection {
            let Some(name) = key.as_str() else {
                return Err(EvalError::Translation(
                    "Selection names must be strings".to_string(),
                ));
            };
            if name == "condition" {
                continue;
            }
            selections.insert(name.to_string(), self.selection_clause(value)?);
        }

        conditions
            .iter()
            .map(|condition| {
                let ast = parse_condition(condition)?;
                let clause = condition_clause(&ast, &selections)?;
                Ok(QueryBody::Document(json!({ "query": clause })))
            })
            .collect()
    }

    fn selection_clause(&self, selection: &YamlValue) -> Result<JsonValue> {
        match selection {
            YamlValue::Mapping(fields) => {
                let clauses = fields
                    .iter()
                    .map(|(key, value)| {
                        let key = key.as_str().ok_or_else(|| {
                            EvalError::Translation("Field names must be strings".to_string())
                        })?;
                        self.field_clause(key, value)
                    })
                    .collect::<Result<Vec<_>>>()?;
                if clauses.is_empty() {
                    return Err(EvalError::Translation("Empty selection".to_string()));
                }
                Ok(all_of(clauses))
            }
            YamlValue::Sequence(items) if items.iter().all(YamlValue::is_mapping) => {
                let clauses = items
                    .iter()
                    .map(|item| self.selection_clause(item))
                    .collect::<Result<Vec<_>>>()?;
                if clauses.is_empty() {
                    return Err(EvalError::Translation("Empty selection".to_string()));
                }
                Ok(any_of(clauses))
            }
            YamlValue::Sequence(items) => {
                let clauses = items
                    .iter()
                    .map(keyword_clause)
                    .collect::<Result<Vec<_>>>()?;
                if clauses.is_empty() {
                    return Err(EvalError::Translation("Empty selection".to_string()));
                }
                Ok(any_of(clauses))
            }
            scalar => keyword_clause(scalar),
        }
    }

    fn field_clause(&self, key: &str, value: &YamlValue) -> Result<JsonValue> {
        let mut parts = key.split('|');
        let field_name = parts.next().unwrap_or_default();
        let modifiers = Modifiers::parse(parts)?;
        if field_name.is_empty() {
            return Err(EvalError::Unsupported(format!(
                "keyword search with modifiers '{key}'"
            )));
        }

        let field = self.field_mapping.normalize_field(field_name);
        let values: Vec<&YamlValue> = match value {
            YamlValue::Sequence(items) => items.iter().collect(),
            other => vec![other],
        };
        if values.is_empty() {
            return Err(EvalError::Translation(format!(
                "Field '{field_name}' has an empty value list"
            )));
        }

        let clauses = values
            .into_iter()
            .map(|value| self.value_clause(&field, value, &modifiers))
            .collect::<Result<Vec<_>>>()?;

        Ok(if modifiers.all {
            all_of(clauses)
        } else {
            any_of(clauses)
        })
    }

    fn value_clause(&self, field: &str, value: &YamlValue, modifiers: &Modifiers) -> Result<JsonValue> {
        let text = match value {
            YamlValue::Null => {
                return Ok(json!({ "bool": { "must_not": [ { "exists": { "field": field } } ] } }))
            }
            YamlValue::Bool(b) if modifiers.is_plain() => {
                return Ok(json!({ "match_phrase": { field: b } }))
            }
            YamlValue::Number(n) if modifiers.is_plain() => {
                let number: JsonValue = serde_json::to_value(n)?;
                return Ok(json!({ "match_phrase": { field: number } }));
            }
            YamlValue::String(s) => s.clone(),
            YamlValue::Bool(b) => b.to_string(),
            YamlValue::Number(n) => n.to_string(),
            _ => {
                return Err(EvalError::Translation(format!(
                    "Unsupported value type for field '{field}'"
                )))
            }
        };

        let text = if modifiers.base64 {
            STANDARD.encode(text.as_bytes())
        } else {
            text
        };

        if modifiers.regex {
            regex::Regex::new(&text).map_err(|e| {
                EvalError::Translation(format!("Invalid regex for field '{field}': {e}"))
            })?;
            let keyword = self.field_mapping.keyword_field(field);
            return Ok(json!({ "regexp": { keyword: { "value": text } } }));
        }

        let pattern = match modifiers.position {
            Position::Exact => text,
            Position::Contains => format!("*{text}*"),
            Position::StartsWith => format!("{text}*"),
            Position::EndsWith => format!("*{text}"),
        };

        if has_wildcard(&pattern) {
            let keyword = self.field_mapping.keyword_field(field);
            let pattern = escape_wildcard_value(&pattern);
            Ok(json!({ "wildcard": { keyword: { "value": pattern } } }))
        } else {
            Ok(json!({ "match_phrase": { field: pattern } }))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Position {
    Exact,
    Contains,
    StartsWith,
    EndsWith,
}

#[derive(Debug, Clone)]
struct Modifiers {
    position: Position,
    all: bool,
    regex: bool,
    base64: bool,
}

impl Modifiers {
    fn parse<'a>(names: impl Iterator<Item = &'a str>) -> Result<Self> {
        let mut modifiers = Self {
            position: Position::Exact,
            all: false,
            regex: false,
            base64: false,
        };
        for name in names {
            match name {
                "contains" => modifiers.position = Position::Contains,
                "startswith" => modifiers.position = Position::StartsWith,
                "endswith" => modifiers.position = Position::EndsWith,
                "all" => modifiers.all = true,
                "re" => modifiers.regex = true,
                "base64" => modifiers.base64 = true,
                other => {
                    return Err(EvalError::Unsupported(format!("modifier '{other}'")));
                }
            }
        }
        if modifiers.regex && (modifiers.position != Position::Exact || modifiers.base64) {
            return Err(EvalError::Unsupported(
                "'re' combined with other value modifiers".to_string(),
            ));
        }
        Ok(modifiers)
    }

    fn is_plain(&self) -> bool {
        self.position == Position::Exact && !self.regex && !self.base64
    }
}

fn single_document(rule_yaml: &str) -> Result<YamlValue> {
    let mut documents = Vec::new();
    for document in serde_yaml::Deserializer::from_str(rule_yaml) {
        let value = YamlValue::deserialize(document)
            .map_err(|e| EvalError::Translation(format!("Failed to parse YAML: {e}")))?;
        if !value.is_null() {
            documents.push(value);
        }
    }
    match documents.len() {
        0 => Err(EvalError::Translation("Empty rule file".to_string())),
        1 => Ok(documents.remove(0)),
        _ => Err(EvalError::Unsupported("multi-document rule collections".to_string())),
    }
}

fn keyword_clause(value: &YamlValue) -> Result<JsonValue> {
    let text = match value {
        YamlValue::String(s) => s.clone(),
        YamlValue::Number(n) => n.to_string(),
        YamlValue::Bool(b) => b.to_string(),
        _ => {
            return Err(EvalError::Translation(
                "Keyword lists must hold scalars".to_string(),
            ))
        }
    };
    let query = if has_wildcard(&text) {
        escape_query_string(&text, true)
    } else {
        format!("\"{}\"", text.replace('\\', "\\\\").replace('"', "\\\""))
    };
    Ok(json!({ "query_string": { "query": query } }))
}

fn condition_clause(ast: &ConditionAst, selections: &BTreeMap<String, JsonValue>) -> Result<JsonValue> {
    match ast {
        ConditionAst::Identifier(name) => selections.get(name).cloned().ok_or_else(|| {
            EvalError::Translation(format!("Unknown selection identifier: {name}"))
        }),
        ConditionAst::And(left, right) => Ok(all_of(vec![
            condition_clause(left, selections)?,
            condition_clause(right, selections)?,
        ])),
        ConditionAst::Or(left, right) => Ok(any_of(vec![
            condition_clause(left, selections)?,
            condition_clause(right, selections)?,
        ])),
        ConditionAst::Not(inner) => Ok(json!({
            "bool": { "must_not": [ condition_clause(inner, selections)? ] }
        })),
        ConditionAst::OfThem(quantifier) => {
            let group: Vec<JsonValue> = selections
                .iter()
                .filter(|(name, _)| !name.starts_with('_'))
                .map(|(_, clause)| clause.clone())
                .collect();
            quantified(*quantifier, group, "them")
        }
        ConditionAst::OfPattern(quantifier, pattern) => {
            let group: Vec<JsonValue> = selections
                .iter()
                .filter(|(name, _)| pattern_matches(pattern, name))
                .map(|(_, clause)| clause.clone())
                .collect();
            quantified(*quantifier, group, pattern)
        }
    }
}

fn quantified(quantifier: Quantifier, group: Vec<JsonValue>, target: &str) -> Result<JsonValue> {
    if group.is_empty() {
        return Err(EvalError::Translation(format!(
            "No selections match '{target}'"
        )));
    }
    Ok(match quantifier {
        Quantifier::Any => any_of(group),
        Quantifier::All => all_of(group),
        Quantifier::AtLeast(n) => json!({
            "bool": { "should": group, "minimum_should_match": n }
        }),
    })
}

fn all_of(mut clauses: Vec<JsonValue>) -> JsonValue {
    if clauses.len() == 1 {
        return clauses.remove(0);
    }
    json!({ "bool": { "must": clauses } })
}

fn any_of(mut clauses: Vec<JsonValue>) -> JsonValue {
    if clauses.len() == 1 {
        return clauses.remove(0);
    }
    json!({ "bool": { "should": clauses, "minimum_should_match": 1 } })
}

/// Glob match supporting only `*`, as used in `1 of selection_*`.
fn pattern_matches(pattern: &str, name: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == name;
    }
    let mut rest = name;
    for (i, part) in parts.iter().enumerate() {
        if i == 0 {
            match rest.strip_prefix(part) {
                Some(tail) => rest = tail,
                None => return false,
            }
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(at) => rest = &rest[at + part.len()..],
                None => return false,
            }
        }
    }
    true
}

/// Whether `value` holds an unescaped `*` or `?`.
fn has_wildcard(value: &str) -> bool {
    let mut escaped = false;
    for ch in value.chars() {
        match ch {
            '\\' if !escaped => escaped = true,
            '*' | '?' if !escaped => return true,
            _ => escaped = false,
        }
    }
    false
}

/// Double literal backslashes so the wildcard query does not read them as
/// escapes. `\*` and `\?` stay escaped; `\\` is one literal backslash, so
/// in `\\*` the star is still a wildcard.
fn escape_wildcard_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            match chars.peek() {
                Some(&next) if next == '*' || next == '?' => {
                    out.push('\\');
                    out.push(next);
                    chars.next();
                }
                Some('\\') => {
                    out.push_str("\\\\");
                    chars.next();
                }
                _ => out.push_str("\\\\"),
            }
        } else {
            out.push(ch);
        }
    }
    out
}

fn escape_query_string(value: &str, keep_wildcards: bool) -> String {
    const RESERVED: &str = "+-=&|><!(){}[]^\"~:/ ";
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' => {
                // keep existing escapes of wildcard characters
                match chars.peek() {
                    Some(&next) if keep_wildcards && (next == '*' || next == '?') => {
                        out.push('\\');
                        out.push(next);
                        chars.next();
                        continue;
                    }
                    Some('\\') if keep_wildcards => {
                        chars.next();
                    }
                    _ => {}
                }
                out.push_str("\\\\");
            }
            '*' | '?' if keep_wildcards => out.push(ch),
            '*' | '?' => {
                out.push('\\');
                out.push(ch);
            }
            c if RESERVED.contains(c) => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out
}
