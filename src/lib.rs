//! # Detection Eval
//!
//! Evaluate detection rule sets against recorded telemetry and report, per
//! rule and per dataset, whether each rule fired.
//!
//! Two backends are supported:
//!
//! - a **search index** (Elasticsearch): telemetry archives are normalized
//!   into the winlogbeat layout, bulk-loaded, and every rule query is counted;
//! - a **packet-capture engine** (Suricata): captures are replayed against a
//!   merged ruleset and alerts are tallied by signature.
//!
//! ## Quick Start
//!
//! ### Normalizing telemetry
//!
//! ```rust
//! use detection_eval::normalizer::{Provenance, TelemetryNormalizer};
//! use serde_json::json;
//!
//! let normalizer = TelemetryNormalizer::default();
//! let record = normalizer
//!     .apply(
//!         json!({"EventID": 4688, "NewProcessName": "C:\\Windows\\cmd.exe"}),
//!         &Provenance::new("dredd1", "apt29.tar.gz/host.json"),
//!     )
//!     .expect("kept by default");
//!
//! assert_eq!(record.index, "dredd1");
//! assert_eq!(record.source["winlog"]["event_data"]["NewProcessName"], "C:\\Windows\\cmd.exe");
//! ```
//!
//! ### Translating Sigma rules
//!
//! ```rust
//! use detection_eval::rules::{QueryBody, SigmaTranslator};
//!
//! let queries = SigmaTranslator::new().translate_str(r#"
//! detection:
//!     selection:
//!         EventID: 4688
//!         NewProcessName|endswith: '\cmd.exe'
//!     condition: selection
//! "#)?;
//!
//! let QueryBody::Document(body) = &queries[0] else { unreachable!() };
//! assert!(body["query"]["bool"]["must"].is_array());
//! # Ok::<(), detection_eval::EvalError>(())
//! ```
//!
//! ### Running an evaluation
//!
//! ```rust,no_run
//! use detection_eval::backend::{evaluate, ElasticClient, IndexBackend, ManagedEnvironment};
//! use detection_eval::config::EvalConfig;
//! use detection_eval::normalizer::TelemetryNormalizer;
//! use detection_eval::report::ExitCheck;
//! use detection_eval::rules::{RuleFormat, RuleSource, SigmaTranslator};
//! use std::path::Path;
//!
//! let config = EvalConfig::default();
//! let rules = RuleSource::new(&config.index.family).load(
//!     Path::new("rules/windows"),
//!     RuleFormat::Sigma,
//!     &SigmaTranslator::new(),
//! )?;
//!
//! let client = ElasticClient::new(&config.index.url, config.index.request_timeout())?;
//! let mut backend = IndexBackend::new(
//!     client,
//!     config.index.clone(),
//!     TelemetryNormalizer::new(&config.normalizer),
//!     ExitCheck::Missing,
//! )
//! .with_environment(ManagedEnvironment::docker(&config.runtime.binary));
//! backend.start(config.runtime.pull)?;
//!
//! let report = evaluate(&mut backend, Path::new("datasets"), false, &rules)?;
//! println!("{}", serde_json::to_string_pretty(&report)?);
//! std::process::exit(report.exit_code());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod backend;
pub mod config;
pub mod discovery;
pub mod error;
pub mod normalizer;
pub mod report;
pub mod rules;

pub use backend::{evaluate, Backend, CaptureBackend, IndexBackend};
pub use config::EvalConfig;
pub use error::{EvalError, QueryErrorKind, Result};
pub use normalizer::{normalize, Provenance, TelemetryNormalizer};
pub use report::{CaptureReport, EvaluationReport, ExitCheck, ResultAggregator};
pub use rules::{Rule, RuleFormat, RuleSet, RuleSource, SigmaTranslator, Translator};
