use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use predicates::str::contains;

#[test]
fn top_level_help_lists_subcommands() {
    let mut cmd = cargo_bin_cmd!("docketd");
    let output = cmd
        .arg("--help")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8_lossy(&output);
    for subcommand in ["watch", "extract", "snapshot", "history"] {
        assert!(text.contains(subcommand), "help missing '{subcommand}'");
    }
    assert!(text.contains("--settle-window"), "help missing --settle-window");
}

#[test]
fn extract_help_mentions_dry_run() {
    let mut cmd = cargo_bin_cmd!("docketd");
    cmd.arg("extract")
        .arg("--help")
        .assert()
        .success()
        .stdout(contains("--dry-run"));
}

#[test]
fn history_prints_recent_entries() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("changes.log");
    std::fs::write(
        &log,
        "2026-01-05T10:00:00.000Z | Created | /in/a.txt | -\n\
         2026-01-05T10:00:01.000Z | Deleted | /in/a.txt | -\n",
    )
    .unwrap();

    let mut cmd = cargo_bin_cmd!("docketd");
    cmd.current_dir(dir.path())
        .env_remove("DOCKET_CONFIG_PATH")
        .env_remove("DOCKET_CONFIG_JSON")
        .arg("history")
        .arg("--limit")
        .arg("1")
        .arg("--change-log")
        .arg(&log)
        .assert()
        .success()
        .stdout(contains("Deleted"))
        .stdout(contains("Created").not());
}

#[test]
fn snapshot_of_fresh_store_is_empty_json() {
    let dir = tempfile::tempdir().unwrap();
    let store = dir.path().join("hashes.json");

    let mut cmd = cargo_bin_cmd!("docketd");
    cmd.current_dir(dir.path())
        .env_remove("DOCKET_CONFIG_PATH")
        .env_remove("DOCKET_CONFIG_JSON")
        .arg("snapshot")
        .arg("--hash-store")
        .arg(&store)
        .assert()
        .success()
        .stdout(contains("{}"));
}

#[test]
fn watch_refuses_a_missing_root() {
    let dir = tempfile::tempdir().unwrap();

    let mut cmd = cargo_bin_cmd!("docketd");
    cmd.current_dir(dir.path())
        .env_remove("DOCKET_CONFIG_PATH")
        .env_remove("DOCKET_CONFIG_JSON")
        .arg("--root")
        .arg(dir.path().join("missing"))
        .arg("watch")
        .assert()
        .failure()
        .stderr(contains("not an existing directory"));
}
