//! End-to-end evaluation on the search-index backend, driven through an
//! in-memory index and a scripted container runtime.

mod common;

use common::{write_archive, ScriptedEnvironment, SharedIndex};
use detection_eval::backend::{
    evaluate, Backend, BulkSummary, IndexBackend, IndexState, ManagedEnvironment, SearchClient,
};
use detection_eval::config::{IndexConfig, MissingEventId, NormalizerConfig};
use detection_eval::normalizer::{IndexedRecord, TelemetryNormalizer};
use detection_eval::report::ExitCheck;
use detection_eval::rules::{RuleFormat, RuleSet, RuleSource, SigmaTranslator};
use detection_eval::{EvalError, QueryErrorKind, Result};
use serde_json::Value;
use std::fs;
use std::path::Path;

const LOGON: &str = r#"
title: Logon
detection:
    selection:
        EventID: 4624
    condition: selection
"#;

const PROCESS: &str = r#"
title: Process creation
detection:
    selection:
        EventID: 4688
    condition: selection
"#;

const NEAR: &str = r#"
title: Uses near
detection:
    a:
        EventID: 1
    b:
        EventID: 2
    condition: a near b
"#;

struct Fixture {
    _dir: tempfile::TempDir,
    rules: std::path::PathBuf,
    archives: std::path::PathBuf,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let rules = dir.path().join("rules");
    let archives = dir.path().join("archives");
    fs::create_dir_all(rules.join("windows")).unwrap();
    fs::create_dir_all(&archives).unwrap();

    fs::write(rules.join("windows/logon.yml"), LOGON).unwrap();
    fs::write(rules.join("windows/process.yml"), PROCESS).unwrap();
    fs::write(rules.join("near.yml"), NEAR).unwrap();

    write_archive(
        &archives,
        "apt29.tar.gz",
        &[(
            "host1.json",
            "{\"EventID\": 4624, \"Hostname\": \"WIN1\", \"Channel\": \"security\"}\n\
             {\"EventID\": 4624, \"Hostname\": \"WIN1\"}\n\
             this line is not json\n",
        )],
    );
    write_archive(
        &archives,
        "empire.tar.gz",
        &[
            ("a/host2.json", "{\"EventID\": 4688, \"NewProcessName\": \"cmd.exe\"}\n"),
            ("b/host3.json", "{\"event_id\": 4624, \"log_name\": \"security\"}\n"),
        ],
    );

    Fixture {
        _dir: dir,
        rules,
        archives,
    }
}

fn fast_config() -> IndexConfig {
    let mut config = IndexConfig::default();
    config.readiness.max_attempts = 1;
    config.bulk_batch_size = 1;
    config
}

fn backend(
    index: &SharedIndex,
    environment: &ScriptedEnvironment,
    check: ExitCheck,
) -> IndexBackend<SharedIndex> {
    let mut backend = IndexBackend::new(
        index.clone(),
        fast_config(),
        TelemetryNormalizer::default(),
        check,
    )
    .with_environment(ManagedEnvironment::new(Box::new(environment.clone())));
    backend.start(false).unwrap();
    backend
}

fn sigma_rules(dir: &Path) -> RuleSet {
    RuleSource::new("elasticsearch")
        .load(dir, RuleFormat::Sigma, &SigmaTranslator::new())
        .unwrap()
}

#[test]
fn test_per_dataset_report_uses_archive_names() {
    let fx = fixture();
    let index = SharedIndex::default();
    let environment = ScriptedEnvironment::default();
    let rules = sigma_rules(&fx.rules);

    let mut backend = backend(&index, &environment, ExitCheck::Missing);
    let report = evaluate(&mut backend, &fx.archives, false, &rules).unwrap();

    let apt29 = fx.archives.join("apt29.tar.gz").display().to_string();
    let empire = fx.archives.join("empire.tar.gz").display().to_string();
    let keys: Vec<&String> = report.datasets.keys().collect();
    assert_eq!(keys, vec![&apt29, &empire]);

    let logon = fx.rules.join("windows/logon.yml").display().to_string();
    let process = fx.rules.join("windows/process.yml").display().to_string();
    assert_eq!(report.datasets[&apt29].results[&format!("{logon}[0]")], 2);
    assert_eq!(report.datasets[&apt29].results[&format!("{process}[0]")], 0);
    assert_eq!(report.datasets[&empire].results[&format!("{logon}[0]")], 1);
    assert_eq!(report.datasets[&empire].results[&format!("{process}[0]")], 1);

    // one zero-hit query fails the run in missing-signal mode
    assert!(report.failed);
    assert_eq!(report.exit_code(), 1);

    // generated index names never reach the report
    let printed = serde_json::to_string(&report).unwrap();
    assert!(!printed.contains("dredd1"));
    assert!(!printed.contains("dredd2"));
    assert_eq!(index.0.searched_indices(), vec!["dredd1", "dredd2"]);

    // the malformed line was skipped, everything else loaded
    assert_eq!(index.0.document_count("dredd1"), 2);
    assert_eq!(index.0.document_count("dredd2"), 2);
}

#[test]
fn test_merged_ingest_reports_all() {
    let fx = fixture();
    let index = SharedIndex::default();
    let environment = ScriptedEnvironment::default();
    let rules = sigma_rules(&fx.rules);

    let mut backend = backend(&index, &environment, ExitCheck::Missing);
    let report = evaluate(&mut backend, &fx.archives, true, &rules).unwrap();

    assert_eq!(report.datasets.keys().collect::<Vec<_>>(), vec!["all"]);
    assert_eq!(index.0.document_count("dredd"), 4);
    assert!(!report.failed);

    let value = serde_json::to_value(&report).unwrap();
    assert!(value.get("all").is_some());
    assert!(value.get("skipped").is_some());
    assert!(value.get("unsupported").is_some());
}

#[test]
fn test_unsupported_rules_are_listed_not_run() {
    let fx = fixture();
    let index = SharedIndex::default();
    let environment = ScriptedEnvironment::default();
    let rules = sigma_rules(&fx.rules);

    let near = fx.rules.join("near.yml").display().to_string();
    assert_eq!(rules.unsupported, vec![near.clone()]);

    let mut backend = backend(&index, &environment, ExitCheck::Missing);
    let report = evaluate(&mut backend, &fx.archives, true, &rules).unwrap();

    assert_eq!(report.unsupported, vec![near.clone()]);
    for dataset in report.datasets.values() {
        assert!(dataset.results.keys().all(|key| !key.starts_with(&near)));
    }
}

#[test]
fn test_custom_rules_for_other_backends_are_skipped() {
    let fx = fixture();
    let custom = fx.rules.join("custom");
    fs::create_dir_all(&custom).unwrap();
    fs::write(
        custom.join("rules.yaml"),
        "name: es logon\nbackend: elasticsearch\nrule: 'winlog.event_id:4624'\n\
         ---\nname: splunk logon\nbackend: splunk\nrule: 'index=windows EventCode=4624'\n\
         ---\nname: broken query\nbackend: elasticsearch\nrule: BROKEN\n",
    )
    .unwrap();

    let rules = RuleSource::new("elasticsearch")
        .load(&custom, RuleFormat::Custom, &SigmaTranslator::new())
        .unwrap();
    assert_eq!(rules.skipped, vec!["splunk logon"]);

    let index = SharedIndex::default();
    let environment = ScriptedEnvironment::default();
    let mut backend = backend(&index, &environment, ExitCheck::FalsePositive);
    let report = evaluate(&mut backend, &fx.archives, true, &rules).unwrap();

    let all = &report.datasets["all"];
    assert_eq!(all.results["es logon[0]"], 3);
    assert!(!all.results.contains_key("splunk logon[0]"));
    assert_eq!(report.skipped, vec!["splunk logon"]);

    // the malformed query is recorded with its cause and the run goes on
    assert_eq!(all.errors.len(), 1);
    assert_eq!(all.errors[0].query, "broken query[0]");
    assert_eq!(all.errors[0].kind, QueryErrorKind::MalformedQuery);

    // a positive count fails false-positive mode
    assert!(report.failed);

    let searches = index.0.searches.lock().unwrap();
    assert!(searches
        .iter()
        .all(|(_, body)| !body.to_string().contains("EventCode")));
}

#[test]
fn test_environment_is_released_after_execute() {
    let fx = fixture();
    let index = SharedIndex::default();
    let environment = ScriptedEnvironment::default();
    let rules = sigma_rules(&fx.rules);

    let mut backend = backend(&index, &environment, ExitCheck::Missing);
    evaluate(&mut backend, &fx.archives, false, &rules).unwrap();

    assert_eq!(backend.state(), IndexState::TornDown);
    assert_eq!(environment.calls(), vec!["launch container1", "kill container1"]);

    let launches = environment.launches.lock().unwrap();
    assert_eq!(launches[0].image, "elasticsearch:7.6.0");
    assert_eq!(
        launches[0].env.get("discovery.type").map(String::as_str),
        Some("single-node")
    );
}

#[test]
fn test_unreadable_archives_keep_other_results() {
    let fx = fixture();
    let scratch = tempfile::tempdir().unwrap();
    let body = "{\"EventID\": 4624}\n".repeat(200);
    let full = write_archive(scratch.path(), "full.tar.gz", &[("host.json", body.as_str())]);
    let bytes = fs::read(&full).unwrap();
    fs::write(fx.archives.join("b_truncated.tar.gz"), &bytes[..bytes.len() / 2]).unwrap();
    fs::write(fx.archives.join("corrupt.tar.gz"), b"not gzip").unwrap();

    let index = SharedIndex::default();
    let environment = ScriptedEnvironment::default();
    let rules = sigma_rules(&fx.rules);

    let mut backend = backend(&index, &environment, ExitCheck::Missing);
    let report = evaluate(&mut backend, &fx.archives, false, &rules).unwrap();

    let name = |archive: &str| fx.archives.join(archive).display().to_string();
    let logon = format!("{}[0]", fx.rules.join("windows/logon.yml").display());
    let process = format!("{}[0]", fx.rules.join("windows/process.yml").display());
    assert_eq!(report.datasets.len(), 4);

    // readable archives are loaded and evaluated as usual
    assert_eq!(report.datasets[&name("apt29.tar.gz")].results[&logon], 2);
    assert_eq!(report.datasets[&name("empire.tar.gz")].results[&process], 1);
    let apt29 = report.datasets[&name("apt29.tar.gz")].ingest.as_ref().unwrap();
    assert!(apt29.errors.is_empty());
    assert_eq!(apt29.records, 2);
    assert_eq!(apt29.malformed, 1);

    // unreadable archives are reported under their own names
    for broken in ["b_truncated.tar.gz", "corrupt.tar.gz"] {
        let dataset = &report.datasets[&name(broken)];
        let ingest = dataset.ingest.as_ref().unwrap();
        assert_eq!(ingest.errors.len(), 1, "{broken}");
        assert!(ingest.errors[0].starts_with(&name(broken)), "{}", ingest.errors[0]);
        assert!(dataset.results.contains_key(&logon));
    }

    assert_eq!(environment.count("kill"), 1);
}

#[test]
fn test_duplicate_custom_rule_names_are_not_run_twice() {
    let fx = fixture();
    let custom = fx.rules.join("custom");
    fs::create_dir_all(&custom).unwrap();
    for (file, rule) in [
        ("a.yml", "winlog.event_id:4624"),
        ("b.yml", "winlog.event_id:9999"),
        ("c.yml", "BROKEN"),
    ] {
        fs::write(
            custom.join(file),
            format!("name: dup\nbackend: elasticsearch\nrule: '{rule}'\n"),
        )
        .unwrap();
    }

    let rules = RuleSource::new("elasticsearch")
        .load(&custom, RuleFormat::Custom, &SigmaTranslator::new())
        .unwrap();
    assert_eq!(rules.rules.len(), 1);
    assert_eq!(rules.invalid.len(), 2);

    let index = SharedIndex::default();
    let environment = ScriptedEnvironment::default();
    let mut backend = backend(&index, &environment, ExitCheck::Missing);
    let report = evaluate(&mut backend, &fx.archives, true, &rules).unwrap();

    let all = &report.datasets["all"];
    assert_eq!(all.results.len(), 1);
    assert_eq!(all.results["dup[0]"], 3);
    assert!(all.errors.is_empty());
    assert!(!report.failed);
    assert_eq!(report.invalid.len(), 2);
}

struct Unreachable;

impl SearchClient for Unreachable {
    fn health(&self) -> Result<()> {
        Err(EvalError::Network("connection refused".to_string()))
    }
    fn create_index(&self, _: &str) -> Result<()> {
        Ok(())
    }
    fn index_exists(&self, _: &str) -> Result<bool> {
        Ok(false)
    }
    fn delete_index(&self, _: &str) -> Result<()> {
        Ok(())
    }
    fn bulk(&self, _: &[IndexedRecord]) -> Result<BulkSummary> {
        Ok(BulkSummary::default())
    }
    fn refresh(&self) -> Result<()> {
        Ok(())
    }
    fn count_hits(&self, _: &str, _: &Value) -> Result<u64> {
        Ok(0)
    }
}

#[test]
fn test_start_failure_is_reported_over_release_failure() {
    let environment = ScriptedEnvironment {
        kill_fails: true,
        ..ScriptedEnvironment::default()
    };
    let mut backend = IndexBackend::new(
        Unreachable,
        fast_config(),
        TelemetryNormalizer::default(),
        ExitCheck::Missing,
    )
    .with_environment(ManagedEnvironment::new(Box::new(environment.clone())));

    let result = backend.start(false);
    assert!(matches!(result, Err(EvalError::Connectivity(_))));
    assert_eq!(environment.calls(), vec!["launch container1", "kill container1"]);
}

#[test]
fn test_drop_policy_skips_records_without_event_id() {
    let dir = tempfile::tempdir().unwrap();
    write_archive(
        dir.path(),
        "mixed.tar.gz",
        &[("host.json", "{\"message\": \"no id\"}\n{\"EventID\": 1}\n")],
    );

    let index = SharedIndex::default();
    let mut backend = IndexBackend::new(
        index.clone(),
        fast_config(),
        TelemetryNormalizer::new(&NormalizerConfig {
            missing_event_id: MissingEventId::Drop,
        }),
        ExitCheck::Missing,
    );
    backend.start(false).unwrap();
    backend.ingest(dir.path(), true).unwrap();
    assert_eq!(index.0.document_count("dredd"), 1);

    let report = backend.execute(&RuleSet::default()).unwrap();
    assert!(report.datasets["all"].results.is_empty());
    let ingest = report.datasets["all"].ingest.as_ref().unwrap();
    assert_eq!(ingest.records, 1);
    assert_eq!(ingest.dropped, 1);
    assert_eq!(ingest.indexed, 1);
    assert!(!report.failed);
}
