//! Integration tests for the planar binary.

use std::path::Path;
use std::process::{Command, Output};

fn planar(args: &[&str], config: &Path) -> Output {
    Command::new(env!("CARGO_BIN_EXE_planar"))
        .args(args)
        .env("PLANAR_CONFIG", config)
        .env("RUST_LOG", "planar=warn")
        .output()
        .expect("failed to run planar")
}

const CONFIG: &str = r#"
environment = "ci"

[[jobs]]
group = "etl"
name = "import"
unit = { type = "rest", url = "http://127.0.0.1:9/import" }

[[triggers]]
group = "etl"
name = "nightly"
job_group = "etl"
job_name = "import"
at = "2030-01-01T00:00:00Z"

[[rules]]
id = 1
title = "import failed"
event = 3
group = "ops"
hook = "mail"

[[groups]]
name = "ops"
"#;

#[test]
fn test_check_config_summarises_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("planar.toml");
    std::fs::write(&path, CONFIG).unwrap();

    let output = planar(&["check-config"], &path);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("1 jobs, 1 triggers, 1 rules, 1 groups"), "{stdout}");
}

#[test]
fn test_check_config_rejects_bad_rule() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("planar.toml");
    std::fs::write(
        &path,
        r#"
        [[rules]]
        id = 2
        title = "too many rows"
        event = 10
        argument = "many"
        group = "ops"
        hook = "mail"
        "#,
    )
    .unwrap();

    assert!(!planar(&["check-config"], &path).status.success());
}

#[test]
fn test_check_config_requires_file() {
    let dir = tempfile::tempdir().unwrap();
    assert!(!planar(&["check-config"], &dir.path().join("absent.toml")).status.success());
}

#[cfg(unix)]
#[test]
fn test_test_hook_invokes_process_hook() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let hooks = dir.path().join("hooks");
    std::fs::create_dir(&hooks).unwrap();
    let received = dir.path().join("received.json");
    let script = hooks.join("mail.sh");
    std::fs::write(&script, format!("#!/bin/sh\ncat > {}\n", received.display())).unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

    let config = dir.path().join("planar.toml");
    std::fs::write(&config, CONFIG).unwrap();

    let output = planar(
        &["test-hook", "mail", "--hooks-dir", hooks.to_str().unwrap(), "--group", "ops"],
        &config,
    );
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let frame: serde_json::Value =
        serde_json::from_str(std::fs::read_to_string(&received).unwrap().trim()).unwrap();
    assert_eq!(frame["method"], "test");
    let details: serde_json::Value =
        serde_json::from_str(frame["payload"]["details"].as_str().unwrap()).unwrap();
    assert_eq!(details["fire_instance_id"], "__test_fire_instance_id__");
    assert_eq!(details["event_id"], 3);
    assert_eq!(details["group"]["name"], "ops");
}

#[cfg(unix)]
#[test]
fn test_test_hook_reports_unknown_hook() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("planar.toml");
    std::fs::write(&config, CONFIG).unwrap();

    let output = planar(
        &["test-hook", "pager", "--hooks-dir", dir.path().to_str().unwrap()],
        &config,
    );
    assert!(!output.status.success());
}
