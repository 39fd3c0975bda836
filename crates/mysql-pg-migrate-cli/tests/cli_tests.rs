//! CLI integration tests for mysql-pg-migrate.
//!
//! These tests verify command-line argument parsing, help output,
//! offline mapping checks and exit codes for configuration errors.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;

/// Get a command for the mysql-pg-migrate binary.
fn cmd() -> Command {
    Command::cargo_bin("mysql-pg-migrate").unwrap()
}

fn config_file(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "{}", contents).unwrap();
    file
}

const VALID_CONFIG: &str = r#"
source:
  host: mysql.local
  database: loja
  user: app
target:
  host: pg.local
  database: shop
  user: app
migration:
  exclude_tables: [logs_*]
mappings:
  - source: usuarios
    target: users
    fields:
      - { source_field: id, target_field: id }
      - { source_field: ativo, target_field: active, converter: bool_from_int01 }
  - source: pedidos
    target: orders
    depends_on: [usuarios]
    source_filter: "status = 'pago'"
    fields:
      - { source_field: id, target_field: id }
      - { source_field: itens, target_field: items, converter: json_parse_or_wrap }
"#;

// =============================================================================
// Help and Version Tests
// =============================================================================

#[test]
fn test_help_shows_all_commands() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("resume"))
        .stdout(predicate::str::contains("validate"))
        .stdout(predicate::str::contains("check-mappings"))
        .stdout(predicate::str::contains("health-check"));
}

#[test]
fn test_run_subcommand_help() {
    cmd()
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--dry-run"))
        .stdout(predicate::str::contains("--workers"));
}

#[test]
fn test_version_flag() {
    cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("mysql-pg-migrate"));
}

#[test]
fn test_global_flag_defaults() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--state-file"))
        .stdout(predicate::str::contains("--output-json"))
        .stdout(predicate::str::contains("[default: config.yaml]"))
        .stdout(predicate::str::contains("[default: 60]"))
        .stdout(predicate::str::contains("[default: text]"))
        .stdout(predicate::str::contains("[default: info]"));
}

#[test]
fn test_no_subcommand_shows_help() {
    cmd()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage:"));
}

// =============================================================================
// Exit Code Tests
// =============================================================================

#[test]
fn test_missing_config_exits_with_code_7() {
    // Missing file is an IO error (code 7), not config error (code 1)
    cmd()
        .args(["--config", "nonexistent_config_file.yaml", "check-mappings"])
        .assert()
        .code(7);
}

#[test]
fn test_invalid_yaml_exits_with_code_1() {
    let file = config_file("invalid: yaml: content: [\n");
    cmd()
        .args(["--config", file.path().to_str().unwrap(), "check-mappings"])
        .assert()
        .code(1);
}

#[test]
fn test_empty_config_exits_with_code_1() {
    let file = tempfile::NamedTempFile::new().unwrap();
    cmd()
        .args(["--config", file.path().to_str().unwrap(), "health-check"])
        .assert()
        .code(1);
}

#[test]
fn test_unknown_converter_exits_with_code_1() {
    let file = config_file(&VALID_CONFIG.replace("bool_from_int01", "bool_from_yes_no"));
    cmd()
        .args(["--config", file.path().to_str().unwrap(), "check-mappings"])
        .assert()
        .code(1);
}

#[test]
fn test_duplicate_target_field_exits_with_code_1() {
    let file = config_file(&VALID_CONFIG.replace("target_field: active", "target_field: id"));
    cmd()
        .args(["--config", file.path().to_str().unwrap(), "check-mappings"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("usuarios"));
}

#[test]
fn test_resume_without_state_file_exits_with_code_1() {
    let file = config_file(VALID_CONFIG);
    cmd()
        .args(["--config", file.path().to_str().unwrap(), "resume"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("--state-file"));
}

// =============================================================================
// check-mappings
// =============================================================================

#[test]
fn test_check_mappings_prints_summary() {
    let file = config_file(VALID_CONFIG);
    cmd()
        .args(["--config", file.path().to_str().unwrap(), "check-mappings"])
        .assert()
        .success()
        .stdout(predicate::str::contains("2 mappings OK"))
        .stdout(predicate::str::contains("usuarios -> users"))
        .stdout(predicate::str::contains("depends on: usuarios"))
        .stdout(predicate::str::contains("filter: status = 'pago'"));
}

#[test]
fn test_check_mappings_json_output() {
    let file = config_file(VALID_CONFIG);
    let output = cmd()
        .args([
            "--config",
            file.path().to_str().unwrap(),
            "--output-json",
            "check-mappings",
        ])
        .output()
        .unwrap();
    assert!(output.status.success());

    let mappings: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(mappings.as_array().unwrap().len(), 2);
    assert_eq!(mappings[1]["target"], "orders");
}

#[test]
fn test_check_mappings_shows_split_table_names() {
    let split = format!(
        "{}{}",
        VALID_CONFIG,
        r#"  - name: equipe
    source: usuarios
    target: team_members
    source_filter: "tipo = 'equipe'"
    fields:
      - { source_field: id, target_field: user_id }
"#
    );
    let file = config_file(&split);
    cmd()
        .args(["--config", file.path().to_str().unwrap(), "check-mappings"])
        .assert()
        .success()
        .stdout(predicate::str::contains("3 mappings OK"))
        .stdout(predicate::str::contains("equipe: usuarios -> team_members"));
}

#[test]
fn test_split_table_without_name_exits_with_code_1() {
    let split = format!(
        "{}{}",
        VALID_CONFIG,
        r#"  - source: usuarios
    target: team_members
    fields:
      - { source_field: id, target_field: user_id }
"#
    );
    let file = config_file(&split);
    cmd()
        .args(["--config", file.path().to_str().unwrap(), "check-mappings"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("duplicate mapping for entity 'usuarios'"));
}
