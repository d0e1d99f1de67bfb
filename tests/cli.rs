//! Smoke tests that run the built `cf` binary against a temp config.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn setup_test_env(extra: &str) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/cf.sqlite"

[chunking]
strategy = "message"

[retrieval]
top_k = 5

[server]
bind = "127.0.0.1:7399"
{}
"#,
        root.display(),
        extra
    );

    let config_path = config_dir.join("cf.toml");
    fs::write(&config_path, config_content).unwrap();
    (tmp, config_path)
}

fn run_cf(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let output = Command::new(env!("CARGO_BIN_EXE_cf"))
        .arg("--config")
        .arg(config_path)
        .args(args)
        .env_remove("GMAIL_ACCESS_TOKEN")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run cf binary: {}", e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env("");
    let (stdout, stderr, success) = run_cf(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/cf.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env("");
    assert!(run_cf(&config_path, &["init"]).2, "first init failed");
    assert!(run_cf(&config_path, &["init"]).2, "second init failed");
}

#[test]
fn test_empty_store_reports() {
    let (_tmp, config_path) = setup_test_env("");
    run_cf(&config_path, &["init"]);

    let (stdout, _, success) = run_cf(&config_path, &["casefile", "list"]);
    assert!(success);
    assert!(stdout.contains("No casefiles."));

    let (stdout, _, success) = run_cf(&config_path, &["clusters"]);
    assert!(success);
    assert!(stdout.contains("No clusters"));

    let (stdout, _, success) = run_cf(&config_path, &["status"]);
    assert!(success);
    assert!(stdout.contains("Messages:    0"));
    assert!(stdout.contains("metadata_synced"));
}

#[test]
fn test_unknown_casefile_fails() {
    let (_tmp, config_path) = setup_test_env("");
    run_cf(&config_path, &["init"]);

    let (_, stderr, success) = run_cf(&config_path, &["status", "missing"]);
    assert!(!success);
    assert!(stderr.contains("unknown casefile"));

    let (_, stderr, success) = run_cf(&config_path, &["casefile", "show", "missing"]);
    assert!(!success);
    assert!(stderr.contains("unknown casefile"));
}

#[test]
fn test_casefile_with_unknown_members_fails() {
    let (_tmp, config_path) = setup_test_env("");
    run_cf(&config_path, &["init"]);

    let (_, stderr, success) = run_cf(
        &config_path,
        &["casefile", "create", "--name", "x", "--message", "ghost"],
    );
    assert!(!success);
    assert!(stderr.contains("not in the message store"));
}

#[test]
fn test_sync_requires_mail_provider() {
    let (_tmp, config_path) = setup_test_env("");
    run_cf(&config_path, &["init"]);

    let (_, stderr, success) = run_cf(&config_path, &["sync"]);
    assert!(!success);
    assert!(stderr.contains("No mail provider configured"));
}

#[test]
fn test_sync_requires_token() {
    let (_tmp, config_path) = setup_test_env("\n[gmail]\nuser_id = \"me\"\n");
    run_cf(&config_path, &["init"]);

    let (_, stderr, success) = run_cf(&config_path, &["sync"]);
    assert!(!success);
    assert!(stderr.contains("GMAIL_ACCESS_TOKEN"));
}

#[test]
fn test_embed_and_ask_error_when_disabled() {
    let (_tmp, config_path) = setup_test_env("");
    run_cf(&config_path, &["init"]);

    let (_, stderr, success) = run_cf(&config_path, &["embed", "some-id"]);
    assert!(!success);
    assert!(stderr.contains("disabled"));

    let (_, stderr, success) = run_cf(&config_path, &["ask", "some-id", "lease"]);
    assert!(!success);
    assert!(stderr.contains("requires embeddings"));
}

#[test]
fn test_invalid_config_rejected() {
    let (_tmp, config_path) = setup_test_env("");
    let content = fs::read_to_string(&config_path)
        .unwrap()
        .replace("strategy = \"message\"", "strategy = \"sentence\"");
    fs::write(&config_path, content).unwrap();

    let (_, stderr, success) = run_cf(&config_path, &["init"]);
    assert!(!success);
    assert!(stderr.contains("Unknown chunking strategy"));
}
