//! Shared fixtures and in-memory backends for integration tests.

#![allow(dead_code)]

use detection_eval::backend::{BulkSummary, ExecutionEnvironment, LaunchSpec, SearchClient};
use detection_eval::normalizer::IndexedRecord;
use detection_eval::{EvalError, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Write a `.tar.gz` telemetry archive with the given members.
pub fn write_archive(dir: &Path, name: &str, members: &[(&str, &str)]) -> PathBuf {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (member, body) in members {
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, member, body.as_bytes())
            .unwrap();
    }
    let bytes = builder.into_inner().unwrap().finish().unwrap();
    let path = dir.join(name);
    std::fs::write(&path, bytes).unwrap();
    path
}

/// A plain tar stream holding one file, as `docker cp` returns it.
pub fn tar_stream(name: &str, body: &str) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(body.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, name, body.as_bytes()).unwrap();
    builder.into_inner().unwrap()
}

/// Search index kept in memory.
///
/// Understands just enough query shapes to count documents by
/// `winlog.event_id`: a `match_phrase` on that field, or a `query_string`
/// of the form `winlog.event_id:<n>`. A `query_string` of `BROKEN` is
/// rejected as malformed.
#[derive(Default)]
pub struct MemoryIndex {
    pub documents: Mutex<BTreeMap<String, Vec<Value>>>,
    pub searches: Mutex<Vec<(String, Value)>>,
    pub refreshed: Mutex<bool>,
}

impl MemoryIndex {
    pub fn document_count(&self, index: &str) -> usize {
        self.documents
            .lock()
            .unwrap()
            .get(index)
            .map_or(0, Vec::len)
    }

    pub fn searched_indices(&self) -> Vec<String> {
        let mut indices: Vec<String> = self
            .searches
            .lock()
            .unwrap()
            .iter()
            .map(|(index, _)| index.clone())
            .collect();
        indices.sort();
        indices.dedup();
        indices
    }
}

fn wanted_event_id(body: &Value) -> Result<Option<Value>> {
    let query = &body["query"];
    if let Some(id) = query["match_phrase"].get("winlog.event_id") {
        return Ok(Some(id.clone()));
    }
    if let Some(text) = query["query_string"]["query"].as_str() {
        if text == "BROKEN" {
            return Err(EvalError::MalformedQuery("Failed to parse query [BROKEN]".to_string()));
        }
        if let Some(id) = text.strip_prefix("winlog.event_id:") {
            return Ok(Some(serde_json::from_str(id).unwrap_or(Value::String(id.to_string()))));
        }
    }
    Ok(None)
}

impl SearchClient for MemoryIndex {
    fn health(&self) -> Result<()> {
        Ok(())
    }

    fn create_index(&self, index: &str) -> Result<()> {
        self.documents
            .lock()
            .unwrap()
            .insert(index.to_string(), Vec::new());
        Ok(())
    }

    fn index_exists(&self, index: &str) -> Result<bool> {
        Ok(self.documents.lock().unwrap().contains_key(index))
    }

    fn delete_index(&self, index: &str) -> Result<()> {
        self.documents.lock().unwrap().remove(index);
        Ok(())
    }

    fn bulk(&self, records: &[IndexedRecord]) -> Result<BulkSummary> {
        let mut documents = self.documents.lock().unwrap();
        for record in records {
            documents
                .entry(record.index.clone())
                .or_default()
                .push(record.source.clone());
        }
        Ok(BulkSummary {
            indexed: records.len(),
            failed: 0,
        })
    }

    fn refresh(&self) -> Result<()> {
        *self.refreshed.lock().unwrap() = true;
        Ok(())
    }

    fn count_hits(&self, index: &str, body: &Value) -> Result<u64> {
        assert!(
            *self.refreshed.lock().unwrap(),
            "searched before the index was refreshed"
        );
        self.searches
            .lock()
            .unwrap()
            .push((index.to_string(), body.clone()));

        let wanted = wanted_event_id(body)?;
        let documents = self.documents.lock().unwrap();
        let docs = documents.get(index).map(Vec::as_slice).unwrap_or_default();
        let hits = match wanted {
            Some(id) => docs
                .iter()
                .filter(|doc| doc["winlog"]["event_id"] == id)
                .count(),
            None => docs.len(),
        };
        Ok(hits as u64)
    }
}

/// Search client shared between the backend under test and the assertions.
#[derive(Clone, Default)]
pub struct SharedIndex(pub Arc<MemoryIndex>);

impl SearchClient for SharedIndex {
    fn health(&self) -> Result<()> {
        self.0.health()
    }
    fn create_index(&self, index: &str) -> Result<()> {
        self.0.create_index(index)
    }
    fn index_exists(&self, index: &str) -> Result<bool> {
        self.0.index_exists(index)
    }
    fn delete_index(&self, index: &str) -> Result<()> {
        self.0.delete_index(index)
    }
    fn bulk(&self, records: &[IndexedRecord]) -> Result<BulkSummary> {
        self.0.bulk(records)
    }
    fn refresh(&self) -> Result<()> {
        self.0.refresh()
    }
    fn count_hits(&self, index: &str, body: &Value) -> Result<u64> {
        self.0.count_hits(index, body)
    }
}

/// Container runtime that records every call.
///
/// `exec` returns `exit_status`; `copy_out` returns `alert_logs` in turn,
/// one per launch. `kill` fails when `kill_fails` is set.
#[derive(Clone, Default)]
pub struct ScriptedEnvironment {
    pub calls: Arc<Mutex<Vec<String>>>,
    pub launches: Arc<Mutex<Vec<LaunchSpec>>>,
    pub exit_status: i32,
    pub alert_logs: Arc<Mutex<Vec<String>>>,
    pub kill_fails: bool,
}

impl ScriptedEnvironment {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }
}

impl ExecutionEnvironment for ScriptedEnvironment {
    fn launch(&self, spec: &LaunchSpec) -> Result<String> {
        let mut launches = self.launches.lock().unwrap();
        launches.push(spec.clone());
        let id = format!("container{}", launches.len());
        self.calls.lock().unwrap().push(format!("launch {id}"));
        Ok(id)
    }

    fn exec(&self, id: &str, command: &[String], workdir: &str) -> Result<i32> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("exec {id} {} in {workdir}", command.join(" ")));
        Ok(self.exit_status)
    }

    fn copy_out(&self, id: &str, path: &str) -> Result<Vec<u8>> {
        self.calls.lock().unwrap().push(format!("copy {id} {path}"));
        let mut logs = self.alert_logs.lock().unwrap();
        let log = if logs.is_empty() {
            String::new()
        } else {
            logs.remove(0)
        };
        Ok(tar_stream("eve.json", &log))
    }

    fn kill(&self, id: &str) -> Result<()> {
        self.calls.lock().unwrap().push(format!("kill {id}"));
        if self.kill_fails {
            return Err(EvalError::Environment(format!("cannot kill {id}")));
        }
        Ok(())
    }
}
