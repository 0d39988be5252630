//! Search-index backend.
//!
//! Lifecycle: `Created -> Ready -> Ingested -> Executed -> TornDown`.
//!
//! [`IndexBackend::start`] launches the search engine (when an environment is
//! given), waits for it and prepares the base index. `ingest` bulk-loads every
//! archive, either into the base index (merged) or into one generated index
//! per archive, then refreshes. An archive that cannot be read to the end
//! keeps what was loaded from it; the failure goes into that dataset's ingest
//! summary and the remaining archives are still loaded. `execute` counts hits for every query of every
//! rule on every dataset and releases the environment.

use super::environment::{LaunchSpec, ManagedEnvironment};
use super::search::{wait_until_ready, BulkSummary, SearchClient};
use super::{Backend, MERGED_DATASET};
use crate::config::IndexConfig;
use crate::discovery::discover_files;
use crate::error::{EvalError, Result};
use crate::normalizer::{read_archive, IndexedRecord, TelemetryNormalizer};
use crate::report::{EvaluationReport, ExitCheck, IngestSummary, ResultAggregator};
use crate::rules::{QueryBody, RuleSet};
use rayon::prelude::*;
use std::path::Path;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexState {
    Created,
    Ready,
    Ingested,
    Executed,
    TornDown,
}

/// A loaded dataset: the index it lives in and the name it is reported under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedDataset {
    pub index: String,
    pub name: String,
    pub ingest: IngestSummary,
}

pub struct IndexBackend<C: SearchClient> {
    client: C,
    environment: Option<ManagedEnvironment>,
    config: IndexConfig,
    normalizer: TelemetryNormalizer,
    check: ExitCheck,
    datasets: Vec<IndexedDataset>,
    state: IndexState,
}

impl<C: SearchClient> IndexBackend<C> {
    pub fn new(
        client: C,
        config: IndexConfig,
        normalizer: TelemetryNormalizer,
        check: ExitCheck,
    ) -> Self {
        Self {
            client,
            environment: None,
            config,
            normalizer,
            check,
            datasets: Vec::new(),
            state: IndexState::Created,
        }
    }

    /// Run the search engine inside `environment`, released at teardown.
    pub fn with_environment(mut self, environment: ManagedEnvironment) -> Self {
        self.environment = Some(environment);
        self
    }

    /// Launch the engine if one is attached, wait until it answers and
    /// prepare an empty base index.
    pub fn start(&mut self, pull: bool) -> Result<()> {
        if self.state != IndexState::Created {
            return Err(self.out_of_order("start"));
        }
        if let Some(environment) = self.environment.as_mut() {
            let spec = LaunchSpec {
                env: self.config.env.clone(),
                pull,
                ..LaunchSpec::new(self.config.image.clone())
            };
            environment.launch(&spec)?;
        }

        let prepared = wait_until_ready(&self.client, &self.config.readiness)
            .and_then(|()| self.prepare_index(&self.config.index_prefix));
        if let Err(e) = prepared {
            if let Err(release) = self.teardown() {
                warn!(error = %release, "failed to tear down search index");
            }
            return Err(e);
        }
        self.state = IndexState::Ready;
        Ok(())
    }

    pub fn state(&self) -> IndexState {
        self.state
    }

    pub fn datasets(&self) -> &[IndexedDataset] {
        &self.datasets
    }

    /// Delete and recreate an existing index. `None` means the base index.
    ///
    /// Returns whether the index existed.
    pub fn reset_index(&self, index: Option<&str>) -> Result<bool> {
        let index = index.unwrap_or(&self.config.index_prefix);
        if !self.client.index_exists(index)? {
            return Ok(false);
        }
        self.client.delete_index(index)?;
        self.client.create_index(index)?;
        debug!(index, "reset index");
        Ok(true)
    }

    fn prepare_index(&self, index: &str) -> Result<()> {
        if !self.reset_index(Some(index))? {
            self.client.create_index(index)?;
        }
        Ok(())
    }

    /// Load one archive into `index`.
    ///
    /// Never fails: read and bulk errors stop this archive only and are kept
    /// in the summary. Records handed over before the failure stay indexed.
    fn ingest_archive(&self, archive: &Path, index: &str) -> IngestSummary {
        let batch_size = self.config.bulk_batch_size.max(1);
        let mut batch: Vec<IndexedRecord> = Vec::with_capacity(batch_size);
        let mut bulk = BulkSummary::default();
        let mut records = 0;

        let read = read_archive(archive, index, &self.normalizer, |record| {
            records += 1;
            batch.push(record);
            if batch.len() >= batch_size {
                bulk.merge(self.client.bulk(&batch)?);
                batch.clear();
            }
            Ok(())
        });
        let flushed = self.client.bulk(&batch).map(|last| bulk.merge(last));

        let mut summary = IngestSummary {
            archives: 1,
            records,
            indexed: bulk.indexed,
            rejected: bulk.failed,
            ..IngestSummary::default()
        };
        match read.and_then(|stats| flushed.map(|()| stats)) {
            Ok(stats) => {
                summary.malformed = stats.malformed;
                summary.dropped = stats.dropped;
                info!(
                    archive = %archive.display(),
                    index,
                    files = stats.files,
                    records,
                    indexed = bulk.indexed,
                    rejected = bulk.failed,
                    "ingested archive"
                );
            }
            Err(e) => {
                warn!(
                    archive = %archive.display(),
                    index,
                    records,
                    error = %e,
                    "archive ingest failed, keeping records already loaded"
                );
                summary.errors.push(ingest_error(archive, &e));
            }
        }
        summary
    }

    fn out_of_order(&self, operation: &str) -> EvalError {
        EvalError::Backend(format!(
            "cannot {operation} while the index backend is {:?}",
            self.state
        ))
    }
}

impl<C: SearchClient> Backend for IndexBackend<C> {
    type Rules = RuleSet;
    type Report = EvaluationReport;

    fn ingest(&mut self, archives: &Path, merge: bool) -> Result<()> {
        if self.state != IndexState::Ready {
            return Err(self.out_of_order("ingest"));
        }
        let files = discover_files(archives, &self.config.archive_extensions);
        info!(directory = %archives.display(), archives = files.len(), merge, "ingesting telemetry");

        let mut datasets = Vec::new();
        if merge {
            let index = self.config.index_prefix.clone();
            let mut ingest = IngestSummary::default();
            for archive in &files {
                ingest.merge(self.ingest_archive(archive, &index));
            }
            datasets.push(IndexedDataset {
                index,
                name: MERGED_DATASET.to_string(),
                ingest,
            });
        } else {
            for (n, archive) in files.iter().enumerate() {
                let index = format!("{}{}", self.config.index_prefix, n + 1);
                let ingest = match self.prepare_index(&index) {
                    Ok(()) => self.ingest_archive(archive, &index),
                    Err(e) => {
                        warn!(archive = %archive.display(), index = %index, error = %e, "failed to prepare index");
                        IngestSummary {
                            archives: 1,
                            errors: vec![ingest_error(archive, &e)],
                            ..IngestSummary::default()
                        }
                    }
                };
                datasets.push(IndexedDataset {
                    index,
                    name: archive.display().to_string(),
                    ingest,
                });
            }
        }

        self.client.refresh()?;
        self.datasets = datasets;
        self.state = IndexState::Ingested;
        Ok(())
    }

    fn execute(&mut self, rules: &RuleSet) -> Result<EvaluationReport> {
        if self.state != IndexState::Ingested {
            return Err(self.out_of_order("execute"));
        }

        let queries: Vec<(String, &QueryBody)> = rules
            .rules
            .iter()
            .flat_map(|rule| {
                rule.queries
                    .iter()
                    .map(move |query| (rule.sub_id(query), &query.body))
            })
            .collect();

        let mut aggregator = ResultAggregator::new(self.check);
        aggregator.record_rule_set(rules);

        for dataset in &self.datasets {
            aggregator.record_ingest(&dataset.name, dataset.ingest.clone());
            let client = &self.client;
            let outcomes: Vec<(&str, Result<u64>)> = queries
                .par_iter()
                .map(|(sub_id, body)| {
                    (
                        sub_id.as_str(),
                        client.count_hits(&dataset.index, &body.to_search_body()),
                    )
                })
                .collect();

            for (sub_id, outcome) in outcomes {
                let recorded = match outcome {
                    Ok(hits) => aggregator.record_hits(&dataset.name, sub_id, hits),
                    Err(e) => {
                        warn!(query = sub_id, dataset = %dataset.name, error = %e, "query failed");
                        aggregator.record_error(&dataset.name, sub_id, &e)
                    }
                };
                if !recorded {
                    warn!(query = sub_id, dataset = %dataset.name, "query already has an outcome, ignoring");
                }
            }
            info!(dataset = %dataset.name, queries = queries.len(), "executed queries");
        }

        self.state = IndexState::Executed;
        if let Err(e) = self.teardown() {
            warn!(error = %e, "failed to tear down search index");
        }
        Ok(aggregator.finalize())
    }

    fn teardown(&mut self) -> Result<()> {
        self.state = IndexState::TornDown;
        match self.environment.as_mut() {
            Some(environment) => environment.release(),
            None => Ok(()),
        }
    }
}

/// Failure text for an ingest summary, naming the archive once.
fn ingest_error(archive: &Path, error: &EvalError) -> String {
    match error {
        EvalError::Archive(message) => message.clone(),
        other => format!("{}: {other}", archive.display()),
    }
}
