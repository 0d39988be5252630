//! Backend adapters.
//!
//! Both backends follow the same contract, [`Backend`]: ingest datasets,
//! execute rules against them, tear the execution environment down.
//! [`evaluate`] drives that sequence and always tears down, whatever fails.
//!
//! - [`IndexBackend`]: bulk-loads normalized telemetry into a search index and
//!   counts hits per query.
//! - [`CaptureBackend`]: replays packet captures through a detection engine
//!   and tallies alerts per signature.

pub mod capture;
pub mod environment;
pub mod index;
pub mod search;

pub use capture::{merge_rules, summarize_alerts, CaptureBackend, MergedRuleset};
pub use environment::{
    DockerEnvironment, ExecutionEnvironment, LaunchSpec, ManagedEnvironment, Mount,
};
pub use index::{IndexBackend, IndexState, IndexedDataset};
pub use search::{wait_until_ready, BulkSummary, ElasticClient, SearchClient};

use crate::error::Result;
use std::path::Path;
use tracing::warn;

/// Report key used for every dataset when datasets are merged.
pub const MERGED_DATASET: &str = "all";

/// Common ingest/execute/teardown capability set.
pub trait Backend {
    /// What `execute` runs.
    type Rules: ?Sized;
    type Report;

    /// Register the datasets under `datasets`, merged into one or one each.
    fn ingest(&mut self, datasets: &Path, merge: bool) -> Result<()>;

    fn execute(&mut self, rules: &Self::Rules) -> Result<Self::Report>;

    /// Release the execution environment. Safe to call more than once.
    fn teardown(&mut self) -> Result<()>;
}

/// Ingest then execute, tearing down unconditionally.
///
/// A teardown failure is logged; the evaluation outcome is returned as is.
pub fn evaluate<B: Backend>(
    backend: &mut B,
    datasets: &Path,
    merge: bool,
    rules: &B::Rules,
) -> Result<B::Report> {
    let outcome = backend
        .ingest(datasets, merge)
        .and_then(|()| backend.execute(rules));
    if let Err(e) = backend.teardown() {
        warn!(error = %e, "teardown failed");
    }
    outcome
}
