//! Error types for the detection evaluation crate.

use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EvalError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("YAML parsing error: {0}")]
    Yaml(String),
    #[error("JSON error: {0}")]
    Json(String),
    #[error("Archive error: {0}")]
    Archive(String),
    #[error("Configuration error: {0}")]
    Config(String),
    /// A custom-format rule document is missing a required field or is not a mapping.
    #[error("Invalid rule document: {0}")]
    RuleFormat(String),
    /// The rule uses a feature the active backend cannot express.
    #[error("Unsupported rule feature: {0}")]
    Unsupported(String),
    #[error("Translation error: {0}")]
    Translation(String),
    #[error("Backend not reachable: {0}")]
    Connectivity(String),
    #[error("Backend error: {0}")]
    Backend(String),
    #[error("Malformed query: {0}")]
    MalformedQuery(String),
    #[error("Network error: {0}")]
    Network(String),
    #[error("Execution environment error: {0}")]
    Environment(String),
    #[error("Replay of {dataset} exited with status {status}")]
    Replay { dataset: String, status: i32 },
}

impl EvalError {
    /// Whether this error marks a rule the backend cannot express.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, EvalError::Unsupported(_))
    }
}

/// Cause recorded for a query that failed to execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryErrorKind {
    /// The request never got a response.
    Network,
    /// The backend rejected the query itself.
    MalformedQuery,
    Backend,
}

impl QueryErrorKind {
    pub fn of(error: &EvalError) -> Self {
        match error {
            EvalError::Network(_) | EvalError::Connectivity(_) => QueryErrorKind::Network,
            EvalError::MalformedQuery(_) => QueryErrorKind::MalformedQuery,
            _ => QueryErrorKind::Backend,
        }
    }
}

impl From<std::io::Error> for EvalError {
    fn from(err: std::io::Error) -> Self {
        EvalError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for EvalError {
    fn from(err: serde_json::Error) -> Self {
        EvalError::Json(err.to_string())
    }
}

impl From<serde_yaml::Error> for EvalError {
    fn from(err: serde_yaml::Error) -> Self {
        EvalError::Yaml(err.to_string())
    }
}
