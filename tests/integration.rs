use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn archivist_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("archivist");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let files_dir = root.join("files");
    fs::create_dir_all(files_dir.join("copies")).unwrap();
    let statement = "Chase Bank\nStatement period March 2023\nClosing balance $1,234.56\n";
    fs::write(files_dir.join("statement.txt"), statement).unwrap();
    fs::write(files_dir.join("copies").join("statement.txt"), statement).unwrap();
    fs::write(
        files_dir.join("lease.md"),
        "# Residential Lease\n\nTerm: 12 months starting June 1, 2022.\n",
    )
    .unwrap();

    // Port 1 refuses connections, so labeling sees an unreachable server.
    let config_content = format!(
        r#"[db]
path = "{root}/data/archivist.sqlite"

[storage]
sidecar_dir = "{root}/data/sidecars"

[extraction]
workers = 2

[inference]
base_url = "http://127.0.0.1:1/v1"
timeout_secs = 5
max_retries = 0
"#,
        root = root.display()
    );

    let config_path = config_dir.join("archivist.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn files_dir(config_path: &Path) -> PathBuf {
    config_path.parent().unwrap().parent().unwrap().join("files")
}

fn run_archivist(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = archivist_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run archivist binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

fn scan(config_path: &Path) -> (String, String, bool) {
    let root = files_dir(config_path);
    run_archivist(config_path, &["scan", root.to_str().unwrap()])
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_archivist(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data").join("archivist.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_archivist(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_archivist(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_scan_registers_files() {
    let (_tmp, config_path) = setup_test_env();

    run_archivist(&config_path, &["init"]);
    let (stdout, stderr, success) = scan(&config_path);
    assert!(success, "scan failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("discovered: 3"));
    assert!(stdout.contains("new: 3"));
    assert!(stdout.contains("ok"));
}

#[test]
fn test_rescan_is_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    scan(&config_path);
    let (stdout, _, success) = scan(&config_path);
    assert!(success);
    assert!(stdout.contains("new: 0"), "got: {}", stdout);
    assert!(stdout.contains("unchanged: 3"), "got: {}", stdout);
}

#[test]
fn test_scan_without_root_errors() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_archivist(&config_path, &["scan"]);
    assert!(!success, "scan without a root should fail");
    assert!(stderr.contains("scan root"), "got: {}", stderr);
}

#[test]
fn test_scan_missing_root_records_failed_run() {
    let (tmp, config_path) = setup_test_env();

    let missing = tmp.path().join("nope");
    let (_, _, success) = run_archivist(&config_path, &["scan", missing.to_str().unwrap()]);
    assert!(!success);

    let (stdout, _, success) = run_archivist(&config_path, &["runs", "list"]);
    assert!(success);
    assert!(stdout.contains("inventory"));
    assert!(stdout.contains("failed"));
}

#[test]
fn test_extract_deduplicates_identical_content() {
    let (_tmp, config_path) = setup_test_env();

    scan(&config_path);
    let (stdout, stderr, success) = run_archivist(&config_path, &["extract"]);
    assert!(success, "extract failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("succeeded: 3"), "got: {}", stdout);
    assert!(stdout.contains("deduplicated: 1"), "got: {}", stdout);
    assert!(stdout.contains("via sidecar-cache: 1"), "got: {}", stdout);

    let (stdout, _, _) = run_archivist(&config_path, &["extract"]);
    assert!(stdout.contains("succeeded: 0"), "got: {}", stdout);
}

#[test]
fn test_extract_rejects_zero_workers() {
    let (_tmp, config_path) = setup_test_env();

    scan(&config_path);
    let (_, _, success) = run_archivist(&config_path, &["extract", "--workers", "0"]);
    assert!(!success);
}

#[test]
fn test_label_fails_when_server_unreachable() {
    let (_tmp, config_path) = setup_test_env();

    scan(&config_path);
    run_archivist(&config_path, &["extract"]);
    let (_, stderr, success) = run_archivist(&config_path, &["label"]);
    assert!(!success, "label should fail without an inference server");
    assert!(stderr.contains("unreachable"), "got: {}", stderr);

    let (stdout, _, _) = run_archivist(&config_path, &["runs", "list", "--stage", "labeling"]);
    assert!(stdout.contains("labeling"));
    assert!(stdout.contains("failed"));
}

#[test]
fn test_plan_with_no_labels() {
    let (_tmp, config_path) = setup_test_env();

    run_archivist(&config_path, &["init"]);
    let (stdout, _, success) = run_archivist(&config_path, &["plan"]);
    assert!(success);
    assert!(stdout.contains("planned: 0"));
}

#[test]
fn test_runs_show() {
    let (_tmp, config_path) = setup_test_env();

    scan(&config_path);
    let (stdout, _, success) = run_archivist(&config_path, &["runs", "show", "1"]);
    assert!(success);
    assert!(stdout.contains("stage:     inventory"));
    assert!(stdout.contains("status:    completed"));
    assert!(stdout.contains("\"discovered\": 3"));

    let (_, _, success) = run_archivist(&config_path, &["runs", "show", "999"]);
    assert!(!success);
}

#[test]
fn test_runs_reap_with_nothing_stale() {
    let (_tmp, config_path) = setup_test_env();

    scan(&config_path);
    let (stdout, _, success) = run_archivist(&config_path, &["runs", "reap"]);
    assert!(success);
    assert!(stdout.contains("reaped runs: 0"));
}

#[test]
fn test_show_input_history() {
    let (_tmp, config_path) = setup_test_env();

    scan(&config_path);
    run_archivist(&config_path, &["extract"]);

    let lease = fs::canonicalize(files_dir(&config_path).join("lease.md")).unwrap();
    let (stdout, stderr, success) = run_archivist(&config_path, &["show", lease.to_str().unwrap()]);
    assert!(success, "show failed: {}", stderr);
    assert!(stdout.contains("lease.md"));
    assert!(stdout.contains("Extractions (1)"));
    assert!(stdout.contains("success"));

    let (stdout, _, success) =
        run_archivist(&config_path, &["show", lease.to_str().unwrap(), "--json"]);
    assert!(success);
    let parsed: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(parsed[0]["extractions"][0]["backend"], "text");
}

#[test]
fn test_show_missing_input() {
    let (_tmp, config_path) = setup_test_env();

    run_archivist(&config_path, &["init"]);
    let (_, stderr, success) = run_archivist(&config_path, &["show", "/no/such/file.pdf"]);
    assert!(!success);
    assert!(stderr.contains("no input found"));
}

#[test]
fn test_stats_json() {
    let (_tmp, config_path) = setup_test_env();

    scan(&config_path);
    run_archivist(&config_path, &["extract"]);
    let (stdout, _, success) = run_archivist(&config_path, &["stats", "--json"]);
    assert!(success);
    let parsed: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(parsed["inputs"], 3);
    assert_eq!(parsed["unique_contents"], 2);
    assert_eq!(parsed["extracted"], 3);
    assert_eq!(parsed["labeled"], 0);
}

#[test]
fn test_completions_without_config() {
    let tmp = TempDir::new().unwrap();
    let missing = tmp.path().join("missing.toml");
    let (stdout, _, success) = run_archivist(&missing, &["completions", "bash"]);
    assert!(success);
    assert!(stdout.contains("archivist"));
}

#[test]
fn test_missing_config_errors() {
    let tmp = TempDir::new().unwrap();
    let missing = tmp.path().join("missing.toml");
    let (_, stderr, success) = run_archivist(&missing, &["stats"]);
    assert!(!success);
    assert!(stderr.contains("config"));
}
