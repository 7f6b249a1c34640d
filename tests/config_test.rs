use std::fs;

use hostq::config::parser::{load_scripts_manifest, load_settings, parse_settings};
use hostq::error::is_validation;
use hostq::state::models::ScriptScope;
use tempfile::TempDir;

#[test]
fn test_parse_full_settings() {
    let yaml = r#"
database: /var/lib/hostq/state.db
max_server_wait_secs: 60
max_output_chars: 2048
busy_timeout_ms: 250
retry:
  max_retries: 3
  base_delay_ms: 5
"#;

    let settings = parse_settings(yaml).expect("Should parse valid settings");
    assert_eq!(settings.database, "/var/lib/hostq/state.db");
    assert_eq!(settings.max_server_wait().as_secs(), 60);
    assert_eq!(settings.max_output_chars, 2048);
    assert_eq!(settings.busy_timeout().as_millis(), 250);
    assert_eq!(settings.retry.max_retries, 3);
    assert_eq!(settings.retry.base_delay_ms, 5);
}

#[test]
fn test_partial_settings_keep_defaults() {
    let settings = parse_settings("max_output_chars: 500\n").unwrap();
    assert_eq!(settings.max_output_chars, 500);
    assert_eq!(settings.database, ".hostq/hostq.db");
    assert_eq!(settings.max_server_wait_secs, 300);
    assert_eq!(settings.retry.max_retries, 5);

    let empty = parse_settings("").unwrap();
    assert_eq!(empty.max_output_chars, 10_000);
}

#[test]
fn test_unknown_keys_are_rejected() {
    assert!(parse_settings("parallelism: 4\n").is_err());
    assert!(parse_settings("retry:\n  jitter: true\n").is_err());
}

#[test]
fn test_invalid_values_are_rejected() {
    let err = parse_settings("max_output_chars: 0\n").unwrap_err();
    assert!(is_validation(&err));

    let err = parse_settings("database: ''\n").unwrap_err();
    assert!(is_validation(&err));

    let err = parse_settings("retry:\n  max_retries: 1000\n").unwrap_err();
    assert!(is_validation(&err));
}

#[test]
fn test_missing_settings_file_uses_defaults() {
    let dir = TempDir::new().unwrap();
    let settings = load_settings(&dir.path().join("hostq.yaml")).unwrap();
    assert_eq!(settings.database, ".hostq/hostq.db");
}

#[test]
fn test_load_settings_from_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("hostq.yaml");
    fs::write(&path, "max_server_wait_secs: 10\n").unwrap();
    assert_eq!(load_settings(&path).unwrap().max_server_wait_secs, 10);
}

#[test]
fn test_scripts_manifest_resolves_relative_paths() {
    let dir = TempDir::new().unwrap();
    fs::create_dir_all(dir.path().join("scripts")).unwrap();
    fs::write(dir.path().join("scripts/logs.sh"), "#!/bin/sh\ntar czf /tmp/logs.tgz /var/log\n").unwrap();
    fs::write(dir.path().join("scripts/defender.ps1"), "Update-MpSignature\n").unwrap();
    let manifest = dir.path().join("scripts.yaml");
    fs::write(
        &manifest,
        r#"
team: 4
scripts:
  - name: logs.sh
    path: scripts/logs.sh
  - name: defender.ps1
    path: scripts/defender.ps1
"#,
    )
    .unwrap();

    let (scope, desired) = load_scripts_manifest(&manifest).unwrap();
    assert_eq!(scope, ScriptScope::Team(4));
    assert_eq!(desired.len(), 2);
    assert_eq!(desired[0].name, "logs.sh");
    assert!(desired[0].contents.starts_with("#!/bin/sh"));
    assert_eq!(desired[1].contents, "Update-MpSignature\n");
}

#[test]
fn test_scripts_manifest_errors() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("a.sh"), "echo a").unwrap();

    let duplicate = dir.path().join("dup.yaml");
    fs::write(
        &duplicate,
        "scripts:\n  - name: a.sh\n    path: a.sh\n  - name: a.sh\n    path: a.sh\n",
    )
    .unwrap();
    assert!(is_validation(&load_scripts_manifest(&duplicate).unwrap_err()));

    let missing = dir.path().join("missing.yaml");
    fs::write(&missing, "scripts:\n  - name: b.sh\n    path: b.sh\n").unwrap();
    let err = load_scripts_manifest(&missing).unwrap_err();
    assert!(err.to_string().contains("b.sh"));

    let global = dir.path().join("global.yaml");
    fs::write(&global, "scripts: []\n").unwrap();
    let (scope, desired) = load_scripts_manifest(&global).unwrap();
    assert_eq!(scope, ScriptScope::Global);
    assert!(desired.is_empty());
}
