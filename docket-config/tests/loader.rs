use std::collections::HashMap;
use std::path::PathBuf;

use docket_config::{ConfigLoadError, ConfigLoader, ConfigSource};
use tempfile::TempDir;

/// Loader isolated from the process environment and working directory.
fn loader(dir: &TempDir, vars: &[(&str, &str)]) -> ConfigLoader {
    let vars: HashMap<String, String> = vars
        .iter()
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect();
    ConfigLoader::new()
        .without_env_file()
        .with_search_dir(dir.path())
        .with_env(move |name| vars.get(name).cloned())
}

#[test]
fn falls_back_to_defaults_with_a_warning() {
    let dir = tempfile::tempdir().unwrap();
    let load = loader(&dir, &[]).load().unwrap();

    assert_eq!(load.source, ConfigSource::Default);
    assert_eq!(load.config.watch.root, PathBuf::from("Testing"));
    assert_eq!(
        load.config.storage.hash_store_path,
        PathBuf::from("file_hashes.json")
    );
    assert!(
        load.warnings
            .items
            .iter()
            .any(|warning| warning.message.contains("No docket.toml"))
    );
}

#[test]
fn discovers_docket_toml_in_search_dir() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("docket.toml"),
        "[watch]\nroot = \"/srv/scans\"\n\n[extraction]\ndpi = 300\n",
    )
    .unwrap();

    let load = loader(&dir, &[]).load().unwrap();
    assert_eq!(load.source, ConfigSource::File(dir.path().join("docket.toml")));
    assert_eq!(load.config.watch.root, PathBuf::from("/srv/scans"));
    assert_eq!(load.config.extraction.dpi, 300);
    assert!(load.warnings.is_empty());
}

#[test]
fn env_path_wins_over_discovered_file() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("docket.toml"), "[watch]\nroot = \"a\"\n")
        .unwrap();
    let other = dir.path().join("other.json");
    std::fs::write(&other, r#"{"watch": {"root": "b"}}"#).unwrap();

    let load = loader(&dir, &[("DOCKET_CONFIG_PATH", other.to_str().unwrap())])
        .load()
        .unwrap();
    assert_eq!(load.source, ConfigSource::EnvPath(other));
    assert_eq!(load.config.watch.root, PathBuf::from("b"));
}

#[test]
fn inline_json_is_accepted() {
    let dir = tempfile::tempdir().unwrap();
    let load = loader(
        &dir,
        &[(
            "DOCKET_CONFIG_JSON",
            r#"{"pipeline": {"echo_ttl_ms": 60000}}"#,
        )],
    )
    .load()
    .unwrap();
    assert_eq!(load.source, ConfigSource::EnvInline);
    assert_eq!(load.config.pipeline.echo_ttl_ms, 60_000);
}

#[test]
fn explicit_missing_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = loader(&dir, &[])
        .with_config_path(dir.path().join("nope.toml"))
        .load()
        .unwrap_err();
    assert!(matches!(err, ConfigLoadError::MissingConfig { .. }));
}

#[test]
fn malformed_file_reports_its_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("docket.toml");
    std::fs::write(&path, "[watch\nroot = 1").unwrap();

    let err = loader(&dir, &[]).load().unwrap_err();
    match err {
        ConfigLoadError::Parse { origin, .. } => {
            assert_eq!(origin, path.display().to_string())
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn transient_suffixes_come_from_env() {
    let dir = tempfile::tempdir().unwrap();
    let load = loader(&dir, &[("DOCKET_TRANSIENT_SUFFIXES", ".tmp, .part")])
        .load()
        .unwrap();
    assert_eq!(
        load.config.watch.transient_suffixes,
        vec![".tmp".to_string(), ".part".to_string()]
    );
}

#[test]
fn overrides_are_validated() {
    let dir = tempfile::tempdir().unwrap();
    let err = loader(&dir, &[])
        .load_with(|config| config.extraction.max_pages = Some(0))
        .unwrap_err();
    assert!(matches!(err, ConfigLoadError::GuardRail(_)));
}

#[test]
fn env_file_variables_are_not_required() {
    let dir = tempfile::tempdir().unwrap();
    let load = ConfigLoader::new()
        .with_env_file(dir.path().join("missing.env"))
        .with_search_dir(dir.path())
        .with_env(|_| None)
        .load()
        .unwrap();
    assert!(!load.env_file_loaded);
}
