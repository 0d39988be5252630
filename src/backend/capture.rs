//! Packet-capture backend.
//!
//! Rule files are concatenated into one ruleset ([`merge_rules`]) that the
//! detection engine loads. Per dataset, a fresh engine instance replays the
//! capture, the alert log is copied out and alerts are tallied by signature.
//! Rule identity after replay is only what each alert reports as its
//! signature.

use super::environment::{LaunchSpec, ManagedEnvironment, Mount};
use super::{Backend, MERGED_DATASET};
use crate::config::CaptureConfig;
use crate::discovery::discover_files;
use crate::error::{EvalError, Result};
use crate::report::CaptureReport;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// Concatenated ruleset file, deleted on [`MergedRuleset::remove`] or drop.
#[derive(Debug)]
pub struct MergedRuleset {
    file: NamedTempFile,
    sources: usize,
}

impl MergedRuleset {
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Number of rule files merged.
    pub fn sources(&self) -> usize {
        self.sources
    }

    pub fn remove(self) -> Result<()> {
        self.file.close()?;
        Ok(())
    }
}

const MERGED_PREFIX: &str = ".merged-";

/// Concatenate every rule file under `directory` into a temporary file in
/// that same directory, each followed by a newline.
///
/// Merged rulesets left behind by an interrupted run are not merged again.
pub fn merge_rules(directory: &Path, extensions: &[String]) -> Result<MergedRuleset> {
    let files: Vec<PathBuf> = discover_files(directory, extensions)
        .into_iter()
        .filter(|path| {
            !path
                .file_name()
                .is_some_and(|name| name.to_string_lossy().starts_with(MERGED_PREFIX))
        })
        .collect();
    let mut merged = tempfile::Builder::new()
        .prefix(MERGED_PREFIX)
        .suffix(".rules")
        .tempfile_in(directory)?;
    for path in &files {
        let text = fs::read(path)?;
        merged.write_all(&text)?;
        merged.write_all(b"\n")?;
    }
    merged.flush()?;
    info!(directory = %directory.display(), files = files.len(), "merged rule files");
    Ok(MergedRuleset {
        file: merged,
        sources: files.len(),
    })
}

/// Count `alert` records by signature. Lines that are not JSON are dropped.
pub fn summarize_alerts(alert_log: &str) -> BTreeMap<String, u64> {
    let mut tally = BTreeMap::new();
    for line in alert_log.lines() {
        let Ok(record) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        if record["event_type"] != "alert" {
            continue;
        }
        if let Some(signature) = record["alert"]["signature"].as_str() {
            *tally.entry(signature.to_string()).or_insert(0) += 1;
        }
    }
    tally
}

/// Pull `member` out of a tar stream.
pub fn extract_member(tar_stream: &[u8], member: &str) -> Result<String> {
    let mut archive = tar::Archive::new(tar_stream);
    let entries = archive
        .entries()
        .map_err(|e| EvalError::Archive(e.to_string()))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| EvalError::Archive(e.to_string()))?;
        let matches = entry
            .path()
            .map_err(|e| EvalError::Archive(e.to_string()))?
            .file_name()
            .is_some_and(|name| name == member);
        if matches {
            let mut bytes = Vec::new();
            entry.read_to_end(&mut bytes)?;
            return Ok(String::from_utf8_lossy(&bytes).into_owned());
        }
    }
    Err(EvalError::Archive(format!("{member} not found in copied archive")))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureDataset {
    pub path: PathBuf,
    pub name: String,
}

pub struct CaptureBackend {
    environment: ManagedEnvironment,
    config: CaptureConfig,
    pull: bool,
    datasets: Vec<CaptureDataset>,
}

impl CaptureBackend {
    pub fn new(environment: ManagedEnvironment, config: CaptureConfig) -> Self {
        Self {
            environment,
            config,
            pull: false,
            datasets: Vec::new(),
        }
    }

    /// Pull the engine image before each launch.
    pub fn pull(mut self, pull: bool) -> Self {
        self.pull = pull;
        self
    }

    pub fn datasets(&self) -> &[CaptureDataset] {
        &self.datasets
    }

    fn alert_log_member(&self) -> &str {
        self.config
            .alert_log_path
            .rsplit('/')
            .next()
            .unwrap_or(self.config.alert_log_path.as_str())
    }

    fn replay(&mut self, dataset: &CaptureDataset, ruleset: &Path) -> Result<BTreeMap<String, u64>> {
        let capture = fs::canonicalize(&dataset.path)?;
        let spec = LaunchSpec {
            mounts: vec![
                Mount {
                    host: ruleset.to_path_buf(),
                    target: self.config.ruleset_mount.clone(),
                    read_only: true,
                },
                Mount {
                    host: capture,
                    target: self.config.capture_mount.clone(),
                    read_only: true,
                },
            ],
            pull: self.pull,
            tty: true,
            ..LaunchSpec::new(self.config.image.clone())
        };
        self.environment.launch(&spec)?;

        let status = self
            .environment
            .exec(&self.config.replay_command, &self.config.workdir)?;
        if status != 0 {
            return Err(EvalError::Replay {
                dataset: dataset.name.clone(),
                status,
            });
        }

        let stream = self.environment.copy_out(&self.config.alert_log_path)?;
        let alert_log = extract_member(&stream, self.alert_log_member())?;
        let tally = summarize_alerts(&alert_log);
        debug!(dataset = %dataset.name, signatures = tally.len(), "summarized alerts");
        Ok(tally)
    }
}

impl Backend for CaptureBackend {
    type Rules = MergedRuleset;
    type Report = CaptureReport;

    /// Merged mode treats the whole directory as one dataset; otherwise every
    /// capture file is its own dataset.
    fn ingest(&mut self, captures: &Path, merge: bool) -> Result<()> {
        self.datasets = if merge {
            vec![CaptureDataset {
                path: captures.to_path_buf(),
                name: MERGED_DATASET.to_string(),
            }]
        } else {
            discover_files(captures, &self.config.capture_extensions)
                .into_iter()
                .map(|path| CaptureDataset {
                    name: path.display().to_string(),
                    path,
                })
                .collect()
        };
        info!(directory = %captures.display(), datasets = self.datasets.len(), merge, "registered captures");
        Ok(())
    }

    /// Replay every dataset in turn. A failed replay aborts the run.
    fn execute(&mut self, ruleset: &MergedRuleset) -> Result<CaptureReport> {
        let mut report = CaptureReport::default();
        let datasets = self.datasets.clone();
        for dataset in &datasets {
            info!(dataset = %dataset.name, "replaying capture");
            let outcome = self.replay(dataset, ruleset.path());
            let released = self.environment.release();
            let tally = match (outcome, released) {
                (Ok(tally), Ok(())) => tally,
                (Ok(_), Err(e)) => return Err(e),
                (Err(e), released) => {
                    if let Err(release) = released {
                        warn!(dataset = %dataset.name, error = %release, "failed to release engine");
                    }
                    return Err(e);
                }
            };
            report.insert(dataset.name.clone(), tally);
        }
        Ok(report)
    }

    fn teardown(&mut self) -> Result<()> {
        self.environment.release()
    }
}
