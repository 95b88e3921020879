//! CLI integration tests

use std::io::Write;
use std::process::{Command, Output};

fn agimon(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_agimon"))
        .args(args)
        .env_remove("AGIMON_URL")
        .output()
        .expect("Failed to execute command")
}

fn write_temp(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

/// Test that the CLI shows help
#[test]
fn test_cli_help() {
    let output = agimon(&["--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI help should succeed");
    assert!(stdout.contains("AGI Monitor"), "Should show app name");
    assert!(stdout.contains("health"), "Should show health command");
    assert!(stdout.contains("plan"), "Should show plan command");
    assert!(stdout.contains("decode-auth"), "Should show decode-auth command");
}

/// Test that the CLI shows version
#[test]
fn test_cli_version() {
    let output = agimon(&["--version"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI version should succeed");
    assert!(stdout.contains("agimon"), "Should show binary name");
}

/// Test plan command help
#[test]
fn test_plan_help() {
    let output = agimon(&["plan", "--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "Plan help should succeed");
    assert!(stdout.contains("--event"), "Should show event option");
    assert!(stdout.contains("--catalog"), "Should show catalog option");
    assert!(stdout.contains("--no-dim-first"), "Should show no-dim-first option");
}

/// Test decoding an auth header to JSON
#[test]
fn test_decode_auth_json() {
    // {"instanceId":"i-0abc","privateIp":"10.0.0.5"}
    let header = "eyJpbnN0YW5jZUlkIjoiaS0wYWJjIiwicHJpdmF0ZUlwIjoiMTAuMC4wLjUifQ==";
    let output = agimon(&["--format", "json", "decode-auth", header]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "decode-auth should succeed");
    let claims: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(claims["instanceId"], "i-0abc");
    assert_eq!(claims["privateIp"], "10.0.0.5");
}

/// Test that a garbage header fails
#[test]
fn test_decode_auth_invalid() {
    let output = agimon(&["decode-auth", "%%%"]);
    assert!(!output.status.success(), "decode-auth should fail");
}

/// Test an offline sizing plan
#[test]
fn test_plan_json() {
    let gib: u64 = 1024 * 1024 * 1024;
    let event = write_temp(&format!(
        r#"{{"AGIName":"agi-1","Event":"SYS_RESOURCE_USAGE_MONITOR","IngestStatus":{{"System":{{"MemoryTotalBytes":{},"MemoryFreeBytes":{}}}}}}}"#,
        32 * gib,
        gib
    ));
    let catalog = write_temp(
        r#"[{"name":"r6a.xlarge","memory_gib":32.0,"cpus":4},{"name":"r6a.2xlarge","memory_gib":64.0,"cpus":8}]"#,
    );

    let output = agimon(&[
        "--format",
        "json",
        "plan",
        "--event",
        event.path().to_str().unwrap(),
        "--catalog",
        catalog.path().to_str().unwrap(),
        "--current-type",
        "r6a.xlarge",
    ]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "plan should succeed: {stdout}");
    let report: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(report["status"], 418);
    assert_eq!(report["outcome"], "sizing: instance-ram");
    assert_eq!(report["ram"]["final_type"], "r6a.2xlarge");
}

/// Test the health probe against a stub monitor
#[test]
fn test_health_probe() {
    let mut server = mockito::Server::new();
    server
        .mock("GET", "/agi/health")
        .with_status(200)
        .with_body("OK")
        .create();

    let output = agimon(&["--format", "json", "health", "--url", &server.url()]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "health should succeed: {stdout}");
    let report: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(report["status_code"], 200);
}

/// Test the health probe failing on a non-200 answer
#[test]
fn test_health_probe_unhealthy() {
    let mut server = mockito::Server::new();
    server
        .mock("GET", "/agi/health")
        .with_status(503)
        .create();

    let output = agimon(&["health", "--url", &server.url()]);
    assert!(!output.status.success(), "health should fail");
}
