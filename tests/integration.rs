use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn greylit_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("greylit");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    fs::write(
        root.join("results.json"),
        r#"[
  {"title": "Telehealth adoption in rural clinics", "link": "https://www.health.gov/reports/telehealth?utm_source=newsletter", "snippet": "A 2021 survey of rural clinics.", "date": "2021-05-01"},
  {"title": "Telehealth adoption in rural clinics", "link": "https://health.gov/reports/telehealth", "has_pdf": true},
  {"title": "Nurse staffing ratios in urban hospitals", "link": "https://nursing.example.org/staffing"},
  {"title": "Coastal flood defence funding", "link": "https://climate.example.net/funding"},
  {"title": "", "link": "https://blank.example.com/item"}
]"#,
    )
    .unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/greylit.sqlite"

[pipeline]
batch_size = 2
max_concurrent_batches = 2
max_retries = 1
retry_base_delay_ms = 1

[logging]
filter = "warn"
"#,
        root.display()
    );

    let config_path = config_dir.join("greylit.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_greylit(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = greylit_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run greylit binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

fn ingest_and_process(config_path: &Path) {
    let results = config_path
        .parent()
        .unwrap()
        .parent()
        .unwrap()
        .join("results.json");
    run_greylit(config_path, &["init"]);
    let (stdout, stderr, success) = run_greylit(
        config_path,
        &["ingest", "review-1", results.to_str().unwrap(), "--title", "Rural health"],
    );
    assert!(success, "ingest failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("inserted: 5"));

    let (stdout, stderr, success) =
        run_greylit(config_path, &["process", "review-1", "--progress", "off"]);
    assert!(success, "process failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("status: completed"));
}

#[test]
fn test_init_creates_database() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_greylit(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_greylit(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_greylit(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_process_reports_counts() {
    let (_tmp, config_path) = setup_test_env();
    ingest_and_process(&config_path);

    let (stdout, _, success) = run_greylit(&config_path, &["status", "review-1", "--errors", "3"]);
    assert!(success);
    assert!(stdout.contains("Status:      completed"));
    assert!(stdout.contains("Processed:   4"));
    assert!(stdout.contains("Errors:      1"));
    assert!(stdout.contains("Duplicates:  1"));
    assert!(stdout.contains("Recent errors (1)"));
    assert!(stdout.contains("raw result has no title"));
}

#[test]
fn test_process_is_idempotent() {
    let (_tmp, config_path) = setup_test_env();
    ingest_and_process(&config_path);

    let (stdout, _, success) =
        run_greylit(&config_path, &["process", "review-1", "--progress", "off"]);
    assert!(success);
    assert!(stdout.contains("already completed"));
}

#[test]
fn test_stats_json_is_parseable() {
    let (_tmp, config_path) = setup_test_env();
    ingest_and_process(&config_path);

    let (stdout, stderr, success) = run_greylit(&config_path, &["stats", "review-1", "--json"]);
    assert!(success, "stats failed: stderr={}", stderr);
    let stats: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(stats["total_results"], 5);
    assert_eq!(stats["processed_results"], 4);
    assert_eq!(stats["duplicate_groups"], 1);
    assert_eq!(stats["unique_results"], 3);
}

#[test]
fn test_groups_and_merge() {
    let (_tmp, config_path) = setup_test_env();
    ingest_and_process(&config_path);

    let (stdout, _, success) = run_greylit(&config_path, &["groups", "review-1"]);
    assert!(success);
    assert!(stdout.contains("exact_url"));
    let group_id = stdout
        .lines()
        .nth(1)
        .and_then(|line| line.split_whitespace().next())
        .unwrap()
        .to_string();

    let (stdout, stderr, success) = run_greylit(&config_path, &["merge", &group_id]);
    assert!(success, "merge failed: stderr={}", stderr);
    assert!(stdout.contains("results: 2"));
    assert!(stdout.contains("sources: health.gov"));
}

#[test]
fn test_process_unknown_session_fails() {
    let (_tmp, config_path) = setup_test_env();
    run_greylit(&config_path, &["init"]);

    let (_, stderr, success) =
        run_greylit(&config_path, &["process", "nope", "--progress", "off"]);
    assert!(!success);
    assert!(stderr.contains("unknown search session"));
}

#[test]
fn test_retry_requires_failed_session() {
    let (_tmp, config_path) = setup_test_env();
    ingest_and_process(&config_path);

    let (_, stderr, success) =
        run_greylit(&config_path, &["retry", "review-1", "--progress", "off"]);
    assert!(!success);
    assert!(stderr.contains("cannot retry"));
}

#[test]
fn test_missing_config_fails() {
    let (stdout, stderr, success) = run_greylit(Path::new("/nonexistent/greylit.toml"), &["init"]);
    assert!(!success, "expected failure: stdout={}", stdout);
    assert!(stderr.contains("Failed to read config file"));
}
