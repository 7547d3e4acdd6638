use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn snap_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("snap");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    let data_dir = root.join("data");
    fs::create_dir_all(&data_dir).unwrap();

    fs::write(
        root.join("article.md"),
        "# Ownership\n\nEvery value in Rust has a single owner. When the owner goes out of scope the value is dropped.",
    )
    .unwrap();

    // Embeddings are disabled, so submissions cannot be indexed.
    let config_content = format!(
        r#"[db]
path = "{}/data/snap.sqlite"

[indexing]
max_attempts = 1
base_backoff_ms = 1
max_backoff_ms = 1

[server]
bind = "127.0.0.1:7331"
"#,
        root.display()
    );

    let config_path = config_dir.join("snap.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_snap(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = snap_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run snap binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

#[test]
fn test_init_creates_database() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_snap(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_snap(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_snap(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_docs_empty() {
    let (_tmp, config_path) = setup_test_env();

    run_snap(&config_path, &["init"]);
    let (stdout, stderr, success) = run_snap(&config_path, &["docs"]);
    assert!(success, "docs failed: {}", stderr);
    assert!(stdout.contains("No documents."));
}

#[test]
fn test_search_before_submit_is_not_indexed() {
    let (_tmp, config_path) = setup_test_env();

    run_snap(&config_path, &["init"]);
    let (_, stderr, success) = run_snap(&config_path, &["search", "ownership"]);
    assert!(!success, "search over an empty store should fail");
    assert!(
        stderr.contains("nothing indexed"),
        "Should report nothing indexed, got: {}",
        stderr
    );
}

#[test]
fn test_submit_without_embeddings_fails_and_records_document() {
    let (tmp, config_path) = setup_test_env();
    let article = tmp.path().join("article.md");

    run_snap(&config_path, &["init"]);
    let (stdout, _, success) = run_snap(
        &config_path,
        &[
            "submit",
            "--file",
            article.to_str().unwrap(),
            "--url",
            "https://example.com/ownership",
        ],
    );
    assert!(!success, "submit should fail when embeddings are disabled");
    assert!(stdout.contains("outcome: abandoned"), "got: {}", stdout);

    let (stdout, _, success) = run_snap(&config_path, &["docs"]);
    assert!(success);
    assert!(stdout.contains("failed"));
    assert!(stdout.contains("https://example.com/ownership"));
}

#[test]
fn test_submit_requires_text_or_file() {
    let (_tmp, config_path) = setup_test_env();

    run_snap(&config_path, &["init"]);
    let (_, stderr, success) = run_snap(&config_path, &["submit"]);
    assert!(!success);
    assert!(stderr.contains("--file"), "got: {}", stderr);
}

#[test]
fn test_search_unknown_mode_errors() {
    let (_tmp, config_path) = setup_test_env();

    run_snap(&config_path, &["init"]);
    let (_, stderr, success) = run_snap(&config_path, &["search", "test", "--mode", "fuzzy"]);
    assert!(!success, "Unknown mode should fail");
    assert!(stderr.contains("fuzzy"), "got: {}", stderr);
}

#[test]
fn test_get_missing_document() {
    let (_tmp, config_path) = setup_test_env();

    run_snap(&config_path, &["init"]);
    let (_, stderr, success) = run_snap(&config_path, &["get", "doc-nonexistent"]);
    assert!(!success, "get with missing ID should fail");
    assert!(
        stderr.contains("not found"),
        "Should report not found, got: {}",
        stderr
    );
}

#[test]
fn test_delete_missing_document() {
    let (_tmp, config_path) = setup_test_env();

    run_snap(&config_path, &["init"]);
    let (_, stderr, success) = run_snap(&config_path, &["delete", "doc-nonexistent"]);
    assert!(!success);
    assert!(stderr.contains("not found"), "got: {}", stderr);
}

#[test]
fn test_invalid_config_rejected() {
    let (tmp, _) = setup_test_env();
    let bad = tmp.path().join("bad.toml");
    fs::write(
        &bad,
        "[db]\npath = \"x.sqlite\"\n\n[retrieval]\nvector_weight = -1.0\n",
    )
    .unwrap();

    let (_, stderr, success) = run_snap(&bad, &["init"]);
    assert!(!success);
    assert!(stderr.contains("retrieval"), "got: {}", stderr);
}
