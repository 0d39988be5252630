//! Field mapping from Sigma field names to indexed document paths.
//!
//! This module provides the [`FieldMapping`] struct used by the Sigma
//! translator. A mapping has explicit per-field entries, an optional prefix
//! applied to every unmapped field, and an optional suffix used for
//! term-level (wildcard and regex) clauses.

use std::collections::HashMap;

/// Field mapping configuration for Sigma translation.
///
/// # Examples
///
/// ```rust
/// use detection_eval::rules::FieldMapping;
///
/// let mapping = FieldMapping::winlogbeat();
/// assert_eq!(mapping.taxonomy(), "winlogbeat");
/// assert_eq!(mapping.normalize_field("EventID"), "winlog.event_id");
/// assert_eq!(mapping.normalize_field("Image"), "winlog.event_data.Image");
/// assert_eq!(mapping.normalize_field("event.code"), "event.code");
/// ```
#[derive(Debug, Clone)]
pub struct FieldMapping {
    field_map: HashMap<String, String>,
    taxonomy: String,
    unmapped_prefix: Option<String>,
    keyword_suffix: Option<String>,
}

impl FieldMapping {
    /// Create an empty mapping that uses field names as-is.
    ///
    /// ```rust
    /// use detection_eval::rules::FieldMapping;
    ///
    /// let mapping = FieldMapping::new();
    /// assert_eq!(mapping.taxonomy(), "sigma");
    /// assert_eq!(mapping.normalize_field("Image"), "Image");
    /// ```
    pub fn new() -> Self {
        Self {
            field_map: HashMap::new(),
            taxonomy: "sigma".to_string(),
            unmapped_prefix: None,
            keyword_suffix: None,
        }
    }

    /// The layout produced by the telemetry normalizer: well-known header
    /// fields live under `winlog`, everything else under
    /// `winlog.event_data`.
    pub fn winlogbeat() -> Self {
        let mut mapping = Self {
            field_map: HashMap::new(),
            taxonomy: "winlogbeat".to_string(),
            unmapped_prefix: Some("winlog.event_data.".to_string()),
            keyword_suffix: Some(".keyword".to_string()),
        };
        for (source, target) in [
            ("EventID", "winlog.event_id"),
            ("Channel", "winlog.channel"),
            ("Computer", "winlog.computer_name"),
            ("Hostname", "winlog.computer_name"),
            ("Provider_Name", "winlog.provider_name"),
            ("EventRecordID", "winlog.record_id"),
        ] {
            mapping.add_mapping(source.to_string(), target.to_string());
        }
        mapping
    }

    /// Add or replace a field mapping.
    pub fn add_mapping(&mut self, source_field: String, target_field: String) {
        self.field_map.insert(source_field, target_field);
    }

    pub fn taxonomy(&self) -> &str {
        &self.taxonomy
    }

    /// Map a Sigma field name to the document path it is indexed under.
    ///
    /// Dotted names are treated as already-qualified paths and never get the
    /// unmapped prefix.
    pub fn normalize_field(&self, field_name: &str) -> String {
        if let Some(target) = self.field_map.get(field_name) {
            return target.clone();
        }
        match &self.unmapped_prefix {
            Some(prefix) if !field_name.contains('.') => format!("{prefix}{field_name}"),
            _ => field_name.to_string(),
        }
    }

    /// The path to use for exact term-level matching (wildcards, regexes).
    ///
    /// ```rust
    /// use detection_eval::rules::FieldMapping;
    ///
    /// let mapping = FieldMapping::winlogbeat();
    /// assert_eq!(
    ///     mapping.keyword_field("winlog.event_data.Image"),
    ///     "winlog.event_data.Image.keyword"
    /// );
    /// ```
    pub fn keyword_field(&self, normalized_field: &str) -> String {
        match &self.keyword_suffix {
            Some(suffix) => format!("{normalized_field}{suffix}"),
            None => normalized_field.to_string(),
        }
    }
}

impl Default for FieldMapping {
    fn default() -> Self {
        Self::winlogbeat()
    }
}
