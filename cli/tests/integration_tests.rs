use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn droverctl() -> Command {
    let mut cmd = Command::cargo_bin("droverctl").unwrap();
    cmd.env_remove("DROVER_CONFIG").env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_cli_help() {
    droverctl()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Drover CLI"));
}

#[test]
fn test_cli_version() {
    droverctl()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("droverctl"));
}

#[test]
fn test_feed_command_help() {
    droverctl()
        .args(["feed", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--feed-file"));
}

#[test]
fn test_reindex_requires_documents() {
    droverctl()
        .args(["reindex", "--url", "http://localhost:19071/"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--documents"));
}

#[test]
fn test_invalid_command() {
    droverctl()
        .arg("invalid-command")
        .assert()
        .failure()
        .stderr(predicate::str::contains("error:"));
}

#[test]
fn test_config_init_and_validate() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("drover.toml");

    droverctl()
        .args(["--no-color", "config", "init"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("Wrote default configuration"));

    droverctl()
        .args(["--no-color", "config", "validate", "--file"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("is valid"));

    droverctl()
        .args(["config", "init"])
        .arg(&path)
        .assert()
        .code(2);
}

#[test]
fn test_config_show_as_json() {
    droverctl()
        .args(["--format", "json", "config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("wait_timeout_secs"));
}

#[test]
fn test_invalid_config_file_exits_with_config_code() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("drover.toml");
    std::fs::write(&path, "[polling]\ninterval_ms = 0\n").unwrap();

    droverctl()
        .arg("--config")
        .arg(&path)
        .args(["config", "show"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Polling interval"));
}

#[test]
fn test_check_graphs_flags_regression() {
    let temp = TempDir::new().unwrap();
    let reports = temp.path().join("reports.jsonl");
    let bounds = temp.path().join("bounds.toml");
    std::fs::write(
        &reports,
        concat!(
            r#"{"created_at":"2024-01-01T00:00:00Z","parameters":{"legend":"reindex"},"metrics":{"reindexing.throughput":5000.0},"graphs":[]}"#,
            "\n",
            r#"{"created_at":"2024-01-02T00:00:00Z","parameters":{"legend":"reindex"},"metrics":{"reindexing.throughput":20000.0},"graphs":[]}"#,
            "\n",
        ),
    )
    .unwrap();
    std::fs::write(
        &bounds,
        "[reindex]\n\"reindexing.throughput\" = { y_min = 10000.0, y_max = 50000.0 }\n",
    )
    .unwrap();

    droverctl()
        .args(["--no-color", "check-graphs", "--reports"])
        .arg(&reports)
        .arg("--bounds")
        .arg(&bounds)
        .assert()
        .code(6)
        .stdout(predicate::str::contains("reindexing.throughput = 5000"))
        .stderr(predicate::str::contains("outside their historic bounds"));
}

#[test]
fn test_check_graphs_within_bounds() {
    let temp = TempDir::new().unwrap();
    let reports = temp.path().join("reports.jsonl");
    let bounds = temp.path().join("bounds.toml");
    std::fs::write(
        &reports,
        r#"{"created_at":"2024-01-01T00:00:00Z","parameters":{"legend":"reindex"},"metrics":{"reindexing.throughput":20000.0},"graphs":[]}"#,
    )
    .unwrap();
    std::fs::write(
        &bounds,
        "[reindex]\n\"reindexing.throughput\" = { y_min = 10000.0, y_max = 50000.0 }\n",
    )
    .unwrap();

    droverctl()
        .args(["--no-color", "check-graphs", "--reports"])
        .arg(&reports)
        .arg("--bounds")
        .arg(&bounds)
        .assert()
        .success()
        .stdout(predicate::str::contains("1 records within bounds of 1 graphs"));
}

#[test]
fn test_feed_with_malformed_output_exits_with_parse_code() {
    // echo prints its arguments, which is not a feeder summary
    droverctl()
        .args([
            "feed",
            "--program",
            "echo",
            "--target",
            "http://localhost:8080/",
            "--feed-file",
            "docs.json",
            "--no-sampling",
        ])
        .assert()
        .code(4)
        .stderr(predicate::str::contains("[parse]"));
}

#[test]
fn test_feed_with_missing_program_exits_with_launch_code() {
    droverctl()
        .args([
            "feed",
            "--program",
            "drover-no-such-feeder",
            "--target",
            "http://localhost:8080/",
            "--feed-file",
            "docs.json",
            "--no-sampling",
        ])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("[launch]"));
}
