//! CLI integration tests for dbshift.
//!
//! These tests verify command-line argument parsing, help output,
//! and exit codes for various error conditions.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;

/// Get a command for the dbshift binary.
fn cmd() -> Command {
    Command::cargo_bin("dbshift").unwrap()
}

fn write_config(dir: &tempfile::TempDir, content: &str) -> std::path::PathBuf {
    let path = dir.path().join("migration.yaml");
    let mut f = std::fs::File::create(&path).unwrap();
    f.write_all(content.as_bytes()).unwrap();
    path
}

const VALID_CONFIG: &str = r#"
databases:
  src:
    backend: mssql
    host: localhost
    database: crm
    user: reader
    password: secret
  dst:
    backend: postgres
    host: localhost
    database: analytics
    user: loader
    password: secret
    writable: true

settings:
  source: src
  target: dst

queries:
  - id: customers
    source_query: SELECT * FROM customers
    target_table: customers
    target_columns: [id, name]
"#;

#[test]
fn help_shows_all_commands() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("resume"))
        .stdout(predicate::str::contains("validate"))
        .stdout(predicate::str::contains("show"))
        .stdout(predicate::str::contains("list-databases"))
        .stdout(predicate::str::contains("test-connection"))
        .stdout(predicate::str::contains("constraints"))
        .stdout(predicate::str::contains("fk-order"));
}

#[test]
fn constraints_rejects_unknown_state() {
    cmd()
        .args(["constraints", "src", "sideways"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("sideways"));
}

#[test]
fn run_subcommand_help() {
    cmd()
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--dry-run"));
}

#[test]
fn version_flag() {
    cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("dbshift"));
}

#[test]
fn missing_config_file_fails() {
    cmd()
        .args(["-c", "/nonexistent/migration.yaml", "validate"])
        .assert()
        .failure()
        .code(1);
}

#[test]
fn validate_accepts_a_valid_config() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(&dir, VALID_CONFIG);
    cmd()
        .args(["-c", path.to_str().unwrap(), "validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("valid"));
}

#[test]
fn validate_rejects_non_writable_target() {
    let dir = tempfile::tempdir().unwrap();
    let config = VALID_CONFIG.replace("writable: true", "writable: false");
    let path = write_config(&dir, &config);
    cmd()
        .args(["-c", path.to_str().unwrap(), "validate"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("writable"));
}

#[test]
fn validate_rejects_unknown_variable() {
    let dir = tempfile::tempdir().unwrap();
    let config = VALID_CONFIG.replace(
        "SELECT * FROM customers",
        "SELECT * FROM customers WHERE region = '${region}'",
    );
    let path = write_config(&dir, &config);
    cmd()
        .args(["-c", path.to_str().unwrap(), "validate"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("region"));
}

#[test]
fn list_databases_shows_roles() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(&dir, VALID_CONFIG);
    cmd()
        .args(["-c", path.to_str().unwrap(), "list-databases"])
        .assert()
        .success()
        .stdout(predicate::str::contains("src [source]"))
        .stdout(predicate::str::contains("dst [target]"))
        .stdout(predicate::str::contains("writable"));
}

#[test]
fn show_without_runs_fails_with_resume_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = format!(
        "{}\n",
        VALID_CONFIG.replace(
            "settings:\n  source: src\n  target: dst",
            &format!(
                "settings:\n  source: src\n  target: dst\n  progress_dir: {}",
                dir.path().join("state").display()
            )
        )
    );
    let path = write_config(&dir, &config);
    cmd()
        .args(["-c", path.to_str().unwrap(), "show"])
        .assert()
        .failure()
        .code(4)
        .stderr(predicate::str::contains("no stored runs"));
}

#[test]
fn malformed_yaml_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(&dir, "databases: [not, a, map]");
    cmd()
        .args(["-c", path.to_str().unwrap(), "validate"])
        .assert()
        .failure();
}

#[test]
fn fk_order_requires_tables() {
    cmd()
        .args(["fk-order", "src"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("TABLES"));
}
