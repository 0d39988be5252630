//! Telemetry normalization.
//!
//! Reshapes recorded Windows event records (Mordor-style JSON lines) into the
//! winlogbeat layout the search index is queried against. The transformation
//! is pure and total: any JSON value goes in, a JSON value comes out. Records
//! that match none of the legacy shapes only gain provenance fields.
//!
//! # Examples
//!
//! ```rust
//! use detection_eval::normalizer::{normalize, Provenance};
//! use serde_json::json;
//!
//! let provenance = Provenance::new("dredd1", "logs.tar.gz/host.json");
//! let doc = normalize(
//!     json!({"EventID": 4624, "Hostname": "WIN1", "Channel": "security"}),
//!     &provenance,
//! );
//!
//! assert_eq!(doc["winlog"]["event_id"], 4624);
//! assert_eq!(doc["winlog"]["channel"], "Security");
//! assert_eq!(doc["event"]["code"], 4624);
//! ```

pub mod archive;

pub use archive::{read_archive, ArchiveStats};

use crate::config::{MissingEventId, NormalizerConfig};
use serde_json::{Map, Value};
use tracing::debug;

/// Top-level fields that stay in place when a legacy record is folded into
/// `winlog.event_data`.
pub const EVENT_DATA_EXCLUDED: [&str; 6] = [
    "winlog",
    "log",
    "Channel",
    "Hostname",
    "@timestamp",
    "@version",
];

/// Where a record came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provenance {
    /// Backend-facing dataset identifier (the destination index).
    pub dataset: String,
    /// Source file, as `<archive>/<member>`.
    pub file_name: String,
}

impl Provenance {
    pub fn new(dataset: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            file_name: file_name.into(),
        }
    }
}

/// A normalized document addressed to an index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedRecord {
    pub index: String,
    pub source: Value,
}

/// Normalize one raw event record.
///
/// Non-object values are returned unchanged. A `winlog` or `event` field
/// that is present but not an object is replaced by an object.
pub fn normalize(source: Value, provenance: &Provenance) -> Value {
    let mut doc = match source {
        Value::Object(doc) => doc,
        other => return other,
    };

    set_log_file_name(&mut doc, &provenance.file_name);
    let mut winlog = take_object(&mut doc, "winlog");

    if let Some(event_id) = doc.remove("EventID") {
        fold_legacy_record(&mut doc, &mut winlog, event_id);
    }

    if let Some(event_data) = doc.remove("event_data") {
        winlog.insert("event_data".to_string(), event_data);
    }

    if let Some(channel) = doc.remove("log_name") {
        winlog.insert("channel".to_string(), channel);
    }

    normalize_channel_case(&mut winlog);

    if let Some(event_id) = doc.remove("event_id") {
        winlog.insert("event_id".to_string(), event_id);
    }

    let code = winlog.get("event_id").cloned();
    doc.insert("winlog".to_string(), Value::Object(winlog));

    if let Some(code) = code {
        let mut event = take_object(&mut doc, "event");
        event.insert("code".to_string(), code);
        doc.insert("event".to_string(), Value::Object(event));
    }

    Value::Object(doc)
}

/// Rewrite a lowercase `security` channel to `Security`. Other values,
/// including other casings, are left alone.
pub fn normalize_channel_case(winlog: &mut Map<String, Value>) {
    if let Some(channel) = winlog.get_mut("channel") {
        if channel.as_str() == Some("security") {
            *channel = Value::String("Security".to_string());
        }
    }
}

/// The `event.code` of a normalized document, if one was assigned.
pub fn event_code(doc: &Value) -> Option<&Value> {
    doc.get("event").and_then(|event| event.get("code"))
}

fn fold_legacy_record(
    doc: &mut Map<String, Value>,
    winlog: &mut Map<String, Value>,
    event_id: Value,
) {
    winlog.insert("event_id".to_string(), event_id);
    doc.remove("type");
    doc.remove("host");

    let moved: Vec<String> = doc
        .keys()
        .filter(|key| !EVENT_DATA_EXCLUDED.contains(&key.as_str()))
        .cloned()
        .collect();
    let mut event_data = Map::new();
    for key in moved {
        if let Some(value) = doc.remove(&key) {
            event_data.insert(key, value);
        }
    }
    winlog.insert("event_data".to_string(), Value::Object(event_data));

    if let Some(hostname) = doc.remove("Hostname") {
        winlog.insert("computer_name".to_string(), hostname);
    }
    if let Some(channel) = doc.remove("Channel") {
        winlog.insert("channel".to_string(), channel);
    }
}

fn set_log_file_name(doc: &mut Map<String, Value>, file_name: &str) {
    let mut log = take_object(doc, "log");
    let mut file = take_object(&mut log, "file");
    file.insert("name".to_string(), Value::String(file_name.to_string()));
    log.insert("file".to_string(), Value::Object(file));
    doc.insert("log".to_string(), Value::Object(log));
}

fn take_object(doc: &mut Map<String, Value>, key: &str) -> Map<String, Value> {
    match doc.remove(key) {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

/// Applies [`normalize`] and the configured policy for records without an
/// event id.
#[derive(Debug, Clone, Default)]
pub struct TelemetryNormalizer {
    missing_event_id: MissingEventId,
}

impl TelemetryNormalizer {
    pub fn new(config: &NormalizerConfig) -> Self {
        Self {
            missing_event_id: config.missing_event_id,
        }
    }

    pub fn missing_event_id(&self) -> MissingEventId {
        self.missing_event_id
    }

    /// Normalize a record for indexing. Returns `None` when the record has no
    /// event id and the policy drops such records.
    pub fn apply(&self, raw: Value, provenance: &Provenance) -> Option<IndexedRecord> {
        let source = normalize(raw, provenance);
        if event_code(&source).is_none() {
            debug!(file = %provenance.file_name, "record has no winlog.event_id");
            if self.missing_event_id == MissingEventId::Drop {
                return None;
            }
        }
        Some(IndexedRecord {
            index: provenance.dataset.clone(),
            source,
        })
    }
}
