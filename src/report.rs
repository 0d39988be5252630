//! Result aggregation and the exit policy.
//!
//! The search-index path accumulates outcomes in a [`ResultAggregator`] and
//! finalizes them into an [`EvaluationReport`]:
//!
//! ```json
//! {
//!   "invalid": [],
//!   "skipped": ["splunk rule"],
//!   "unsupported": ["rules/win_near.yml"],
//!   "archives/apt29.tar.gz": {
//!     "ingest": { "archives": 1, "records": 840, "malformed": 2, "dropped": 0, "indexed": 840, "rejected": 0 },
//!     "errors": [],
//!     "results": { "rules/win_logon.yml[0]": 12 }
//!   }
//! }
//! ```
//!
//! The capture path produces a [`CaptureReport`], a plain signature tally per
//! dataset.

use crate::error::{EvalError, QueryErrorKind, Result};
use crate::rules::{InvalidRule, RuleSet};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Which outcome fails the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExitCheck {
    /// Fail if any query produced zero hits.
    #[default]
    Missing,
    /// Fail if any query produced a hit.
    FalsePositive,
}

impl ExitCheck {
    pub fn fails(&self, hits: u64) -> bool {
        match self {
            ExitCheck::Missing => hits == 0,
            ExitCheck::FalsePositive => hits > 0,
        }
    }
}

impl FromStr for ExitCheck {
    type Err = EvalError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "missing" | "0" => Ok(ExitCheck::Missing),
            "false-positive" | "1" => Ok(ExitCheck::FalsePositive),
            other => Err(EvalError::Config(format!("unknown exit check '{other}'"))),
        }
    }
}

impl fmt::Display for ExitCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitCheck::Missing => f.write_str("missing"),
            ExitCheck::FalsePositive => f.write_str("false-positive"),
        }
    }
}

/// Run-level pass/fail decision, the OR of every observed outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExitPolicy {
    check: ExitCheck,
    failed: bool,
}

impl ExitPolicy {
    pub fn new(check: ExitCheck) -> Self {
        Self {
            check,
            failed: false,
        }
    }

    /// Record one hit count; returns whether this count fails the run.
    pub fn observe(&mut self, hits: u64) -> bool {
        let fails = self.check.fails(hits);
        self.failed |= fails;
        fails
    }

    pub fn failed(&self) -> bool {
        self.failed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryErrorEntry {
    pub query: String,
    pub kind: QueryErrorKind,
    pub message: String,
}

/// Ingestion totals for one dataset.
///
/// `errors` holds archives that could not be read to the end. Records read
/// before the failure stay indexed and are counted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub archives: usize,
    pub records: usize,
    pub malformed: usize,
    pub dropped: usize,
    pub indexed: usize,
    pub rejected: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl IngestSummary {
    pub fn merge(&mut self, other: IngestSummary) {
        self.archives += other.archives;
        self.records += other.records;
        self.malformed += other.malformed;
        self.dropped += other.dropped;
        self.indexed += other.indexed;
        self.rejected += other.rejected;
        self.errors.extend(other.errors);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DatasetReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingest: Option<IngestSummary>,
    pub results: BTreeMap<String, u64>,
    pub errors: Vec<QueryErrorEntry>,
}

impl DatasetReport {
    /// Whether `query` already has a hit count or an error.
    pub fn has_outcome(&self, query: &str) -> bool {
        self.results.contains_key(query) || self.errors.iter().any(|e| e.query == query)
    }
}

/// Final report of a search-index evaluation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EvaluationReport {
    /// Keyed by original dataset name, or `"all"` in merged mode.
    #[serde(flatten)]
    pub datasets: BTreeMap<String, DatasetReport>,
    pub skipped: Vec<String>,
    pub unsupported: Vec<String>,
    pub invalid: Vec<InvalidRule>,
    #[serde(skip)]
    pub failed: bool,
}

impl EvaluationReport {
    pub fn exit_code(&self) -> i32 {
        i32::from(self.failed)
    }
}

/// Accumulates per-dataset outcomes.
#[derive(Debug, Clone, Default)]
pub struct ResultAggregator {
    datasets: BTreeMap<String, DatasetReport>,
    skipped: Vec<String>,
    unsupported: Vec<String>,
    invalid: Vec<InvalidRule>,
    policy: ExitPolicy,
}

impl ResultAggregator {
    pub fn new(check: ExitCheck) -> Self {
        Self {
            policy: ExitPolicy::new(check),
            ..Self::default()
        }
    }

    /// Carry over the skipped, unsupported and invalid lists of a rule set.
    pub fn record_rule_set(&mut self, rules: &RuleSet) {
        self.skipped.extend(rules.skipped.iter().cloned());
        self.unsupported.extend(rules.unsupported.iter().cloned());
        self.invalid.extend(rules.invalid.iter().cloned());
    }

    /// Also makes `dataset` appear in the report when no query ran.
    pub fn record_ingest(&mut self, dataset: &str, summary: IngestSummary) {
        self.datasets.entry(dataset.to_string()).or_default().ingest = Some(summary);
    }

    /// Record the hit count of `query` on `dataset`.
    ///
    /// Each query gets one outcome per dataset. Returns `false`, leaving the
    /// report and the exit policy untouched, if one is already recorded.
    pub fn record_hits(&mut self, dataset: &str, query: &str, hits: u64) -> bool {
        let report = self.datasets.entry(dataset.to_string()).or_default();
        if report.has_outcome(query) {
            return false;
        }
        report.results.insert(query.to_string(), hits);
        self.policy.observe(hits);
        true
    }

    /// Record a failed query. Same single-outcome rule as
    /// [`ResultAggregator::record_hits`].
    pub fn record_error(&mut self, dataset: &str, query: &str, error: &EvalError) -> bool {
        let report = self.datasets.entry(dataset.to_string()).or_default();
        if report.has_outcome(query) {
            return false;
        }
        report.errors.push(QueryErrorEntry {
            query: query.to_string(),
            kind: QueryErrorKind::of(error),
            message: error.to_string(),
        });
        true
    }

    /// Build the report. Does not consume or change the accumulated state.
    pub fn finalize(&self) -> EvaluationReport {
        let mut skipped = self.skipped.clone();
        skipped.sort();
        let mut unsupported = self.unsupported.clone();
        unsupported.sort();
        let mut invalid = self.invalid.clone();
        invalid.sort_by(|a, b| a.source.cmp(&b.source));

        let mut datasets = self.datasets.clone();
        for report in datasets.values_mut() {
            report.errors.sort_by(|a, b| a.query.cmp(&b.query));
        }

        EvaluationReport {
            datasets,
            skipped,
            unsupported,
            invalid,
            failed: self.policy.failed(),
        }
    }
}

/// Alert counts by signature, per dataset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct CaptureReport {
    pub datasets: BTreeMap<String, BTreeMap<String, u64>>,
}

impl CaptureReport {
    pub fn insert(&mut self, dataset: impl Into<String>, tally: BTreeMap<String, u64>) {
        self.datasets.insert(dataset.into(), tally);
    }
}
