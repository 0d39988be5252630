//! Rule loading and routing.
//!
//! [`RuleSource`] discovers rule files under a directory and materializes
//! [`Rule`]s holding one or more backend-native queries each. Rules that
//! target another backend family are listed as skipped, rules using features
//! the backend cannot express as unsupported, and files that fail for any
//! other reason as invalid.

pub mod condition;
pub mod custom;
pub mod field_mapping;
pub mod sigma;

pub use custom::{parse_custom_rules, CustomRuleDocument};
pub use field_mapping::FieldMapping;
pub use sigma::{SigmaTranslator, Translator};

use crate::discovery::discover_files;
use crate::error::{EvalError, Result};
use rayon::prelude::*;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, error, info};

/// File extensions read for both rule formats.
pub const RULE_EXTENSIONS: [&str; 2] = ["yaml", "yml"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RuleFormat {
    #[default]
    Sigma,
    Custom,
}

impl FromStr for RuleFormat {
    type Err = EvalError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sigma" => Ok(RuleFormat::Sigma),
            "custom" => Ok(RuleFormat::Custom),
            other => Err(EvalError::Config(format!("unknown rule format '{other}'"))),
        }
    }
}

impl fmt::Display for RuleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleFormat::Sigma => f.write_str("sigma"),
            RuleFormat::Custom => f.write_str("custom"),
        }
    }
}

/// A backend-native query: a structured search document or raw query text.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryBody {
    Document(Value),
    Text(String),
}

impl QueryBody {
    /// The request body to send to the search index.
    ///
    /// Text that parses as a JSON object is sent as-is; any other text is
    /// wrapped in a `query_string` query.
    ///
    /// ```rust
    /// use detection_eval::rules::QueryBody;
    /// use serde_json::json;
    ///
    /// let body = QueryBody::Text("winlog.event_id:4624".to_string()).to_search_body();
    /// assert_eq!(body, json!({"query": {"query_string": {"query": "winlog.event_id:4624"}}}));
    /// ```
    pub fn to_search_body(&self) -> Value {
        match self {
            QueryBody::Document(doc) => doc.clone(),
            QueryBody::Text(text) => match serde_json::from_str::<Value>(text.trim()) {
                Ok(doc @ Value::Object(_)) => doc,
                _ => json!({ "query": { "query_string": { "query": text.trim() } } }),
            },
        }
    }
}

/// One detection within a rule, with its position in the parent rule.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRepresentation {
    pub index: usize,
    pub body: QueryBody,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    /// Declared name for custom rules, file path for Sigma rules.
    pub name: String,
    pub format: RuleFormat,
    pub backend: String,
    pub queries: Vec<QueryRepresentation>,
    pub metadata: Option<serde_yaml::Mapping>,
}

impl Rule {
    pub fn new(
        name: impl Into<String>,
        format: RuleFormat,
        backend: impl Into<String>,
        bodies: Vec<QueryBody>,
    ) -> Self {
        let queries = bodies
            .into_iter()
            .enumerate()
            .map(|(index, body)| QueryRepresentation { index, body })
            .collect();
        Self {
            name: name.into(),
            format,
            backend: backend.into(),
            queries,
            metadata: None,
        }
    }

    /// Stable identifier of one detection, e.g. `rule.yml[0]`.
    pub fn sub_id(&self, query: &QueryRepresentation) -> String {
        format!("{}[{}]", self.name, query.index)
    }
}

/// A rule file that could not be loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvalidRule {
    pub source: String,
    pub reason: String,
}

/// Outcome of loading a rule directory.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleSet {
    pub rules: Vec<Rule>,
    pub skipped: Vec<String>,
    pub unsupported: Vec<String>,
    pub invalid: Vec<InvalidRule>,
}

impl RuleSet {
    pub fn query_count(&self) -> usize {
        self.rules.iter().map(|rule| rule.queries.len()).sum()
    }
}

/// Loads rules for one backend family.
#[derive(Debug, Clone)]
pub struct RuleSource {
    family: String,
    strict: bool,
}

enum FileOutcome {
    Rules {
        source: String,
        rules: Vec<Rule>,
        skipped: Vec<String>,
    },
    Unsupported(String),
    Invalid(InvalidRule),
}

impl RuleSource {
    /// `family` is the backend tag custom rules must carry to run.
    pub fn new(family: impl Into<String>) -> Self {
        Self {
            family: family.into(),
            strict: false,
        }
    }

    /// Abort loading on the first invalid file instead of listing it.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn family(&self) -> &str {
        &self.family
    }

    /// Load every rule file under `directory`.
    ///
    /// Files are processed in parallel; results keep discovery order. Rule
    /// names must be unique: a later rule reusing a name is listed as
    /// invalid.
    pub fn load(
        &self,
        directory: &Path,
        format: RuleFormat,
        translator: &dyn Translator,
    ) -> Result<RuleSet> {
        let extensions: Vec<String> = RULE_EXTENSIONS.iter().map(|e| e.to_string()).collect();
        let files = discover_files(directory, &extensions);
        info!(
            directory = %directory.display(),
            files = files.len(),
            format = %format,
            "loading rules"
        );

        let outcomes: Vec<FileOutcome> = files
            .par_iter()
            .map(|path| match format {
                RuleFormat::Sigma => self.load_sigma_file(path, translator),
                RuleFormat::Custom => self.load_custom_file(path),
            })
            .collect();

        let mut set = RuleSet::default();
        let mut names = HashSet::new();
        for outcome in outcomes {
            match outcome {
                FileOutcome::Rules {
                    source,
                    rules,
                    skipped,
                } => {
                    for rule in rules {
                        if names.insert(rule.name.clone()) {
                            set.rules.push(rule);
                            continue;
                        }
                        error!(rule = %rule.name, file = %source, "duplicate rule name");
                        self.reject(
                            &mut set,
                            InvalidRule {
                                source: source.clone(),
                                reason: format!("duplicate rule name '{}'", rule.name),
                            },
                        )?;
                    }
                    set.skipped.extend(skipped);
                }
                FileOutcome::Unsupported(source) => set.unsupported.push(source),
                FileOutcome::Invalid(invalid) => self.reject(&mut set, invalid)?,
            }
        }

        info!(
            rules = set.rules.len(),
            queries = set.query_count(),
            skipped = set.skipped.len(),
            unsupported = set.unsupported.len(),
            invalid = set.invalid.len(),
            "rules loaded"
        );
        Ok(set)
    }

    fn reject(&self, set: &mut RuleSet, invalid: InvalidRule) -> Result<()> {
        if self.strict {
            return Err(EvalError::RuleFormat(format!(
                "{}: {}",
                invalid.source, invalid.reason
            )));
        }
        set.invalid.push(invalid);
        Ok(())
    }

    fn load_sigma_file(&self, path: &Path, translator: &dyn Translator) -> FileOutcome {
        let source = path.display().to_string();
        match translator.translate(path) {
            Ok(bodies) => {
                debug!(rule = %source, queries = bodies.len(), "translated rule");
                let rule = Rule::new(
                    source.clone(),
                    RuleFormat::Sigma,
                    self.family.clone(),
                    bodies,
                );
                FileOutcome::Rules {
                    source,
                    rules: vec![rule],
                    skipped: Vec::new(),
                }
            }
            Err(EvalError::Unsupported(reason)) => {
                debug!(rule = %source, %reason, "rule not representable");
                FileOutcome::Unsupported(source)
            }
            Err(e) => {
                error!(rule = %source, error = %e, "failed to translate rule");
                FileOutcome::Invalid(InvalidRule {
                    source,
                    reason: e.to_string(),
                })
            }
        }
    }

    fn load_custom_file(&self, path: &Path) -> FileOutcome {
        let source = path.display().to_string();
        let documents = match parse_custom_rules(path) {
            Ok(documents) => documents,
            Err(e) => {
                error!(rule = %source, error = %e, "failed to parse custom rules");
                return FileOutcome::Invalid(InvalidRule {
                    source,
                    reason: e.to_string(),
                });
            }
        };

        let mut rules = Vec::new();
        let mut skipped = Vec::new();
        for document in documents {
            if document.backend != self.family {
                debug!(rule = %document.name, backend = %document.backend, "skipping rule");
                skipped.push(document.name);
                continue;
            }
            let mut rule = Rule::new(
                document.name,
                RuleFormat::Custom,
                document.backend,
                vec![QueryBody::Text(document.rule)],
            );
            rule.metadata = document.metadata;
            rules.push(rule);
        }
        FileOutcome::Rules {
            source,
            rules,
            skipped,
        }
    }
}
