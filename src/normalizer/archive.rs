//! Reading telemetry archives.
//!
//! An archive is a gzip-compressed tar bundle of JSON-lines files. Every
//! regular member is read line by line; lines that are blank or not valid JSON
//! are skipped and counted rather than failing the archive.

use super::{IndexedRecord, Provenance, TelemetryNormalizer};
use crate::error::{EvalError, Result};
use flate2::read::GzDecoder;
use serde_json::Value;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use tracing::{debug, warn};

/// Counters gathered while reading one archive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchiveStats {
    pub files: usize,
    pub records: usize,
    pub malformed: usize,
    pub dropped: usize,
}

impl ArchiveStats {
    pub fn merge(&mut self, other: ArchiveStats) {
        self.files += other.files;
        self.records += other.records;
        self.malformed += other.malformed;
        self.dropped += other.dropped;
    }
}

/// Read a `.tar.gz` archive, normalize each record for `dataset` and hand it
/// to `sink`.
///
/// Errors from `sink` abort the read and are returned as-is.
pub fn read_archive<F>(
    path: &Path,
    dataset: &str,
    normalizer: &TelemetryNormalizer,
    sink: F,
) -> Result<ArchiveStats>
where
    F: FnMut(IndexedRecord) -> Result<()>,
{
    let file = File::open(path)
        .map_err(|e| EvalError::Archive(format!("{}: {e}", path.display())))?;
    read_archive_from(
        GzDecoder::new(file),
        &path.display().to_string(),
        dataset,
        normalizer,
        sink,
    )
}

/// Like [`read_archive`], over an already-open (decompressed) tar stream.
pub fn read_archive_from<R, F>(
    reader: R,
    archive_name: &str,
    dataset: &str,
    normalizer: &TelemetryNormalizer,
    mut sink: F,
) -> Result<ArchiveStats>
where
    R: Read,
    F: FnMut(IndexedRecord) -> Result<()>,
{
    let mut archive = tar::Archive::new(reader);
    let entries = archive
        .entries()
        .map_err(|e| EvalError::Archive(format!("{archive_name}: {e}")))?;

    let mut stats = ArchiveStats::default();
    for entry in entries {
        let entry = entry.map_err(|e| EvalError::Archive(format!("{archive_name}: {e}")))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let member = entry
            .path()
            .map_err(|e| EvalError::Archive(format!("{archive_name}: {e}")))?
            .display()
            .to_string();
        let provenance = Provenance::new(dataset, format!("{archive_name}/{member}"));
        stats.files += 1;

        let file_stats = read_lines(BufReader::new(entry), &provenance, normalizer, &mut sink)?;
        debug!(
            file = %provenance.file_name,
            records = file_stats.records,
            malformed = file_stats.malformed,
            "read archive member"
        );
        stats.merge(file_stats);
    }

    if stats.malformed > 0 {
        warn!(
            archive = archive_name,
            malformed = stats.malformed,
            "skipped malformed telemetry lines"
        );
    }
    Ok(stats)
}

fn read_lines<R, F>(
    reader: R,
    provenance: &Provenance,
    normalizer: &TelemetryNormalizer,
    sink: &mut F,
) -> Result<ArchiveStats>
where
    R: BufRead,
    F: FnMut(IndexedRecord) -> Result<()>,
{
    let mut stats = ArchiveStats::default();
    for line in reader.split(b'\n') {
        let line = line.map_err(|e| {
            EvalError::Archive(format!("{}: {e}", provenance.file_name))
        })?;
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let raw: Value = match serde_json::from_slice(&line) {
            Ok(raw) => raw,
            Err(_) => {
                stats.malformed += 1;
                continue;
            }
        };
        match normalizer.apply(raw, provenance) {
            Some(record) => {
                stats.records += 1;
                sink(record)?;
            }
            None => stats.dropped += 1,
        }
    }
    Ok(stats)
}
