//! End-to-end tests of the peertrust binary

use serde_json::Value;
use std::process::{Command, Output};

fn peertrust(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_peertrust"))
        .args(["--log-level", "error"])
        .args(args)
        .output()
        .expect("failed to run peertrust")
}

fn stdout(output: &Output) -> String {
    assert!(
        output.status.success(),
        "command failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

#[test]
fn test_keygen_is_deterministic_with_entropy() {
    let entropy = "11".repeat(32);
    let first = stdout(&peertrust(&["keygen", "--entropy", &entropy]));
    let second = stdout(&peertrust(&["keygen", "--entropy", &entropy]));
    assert_eq!(first, second);
    // compressed SEC1
    assert_eq!(first.len(), 66);

    assert!(!peertrust(&["keygen", "--entropy", "abcd"]).status.success());
}

#[test]
fn test_topic_is_stable() {
    let a = stdout(&peertrust(&["topic", "public-room", "lobby"]));
    let b = stdout(&peertrust(&["topic", "public-room", "lobby"]));
    let manifest = stdout(&peertrust(&["topic", "public-manifest", "lobby"]));
    assert_eq!(a, b);
    assert_ne!(a, manifest);
    assert_eq!(a.len(), 64);
}

#[test]
fn test_device_code_shape() {
    let code = stdout(&peertrust(&["device-code"]));
    assert_eq!(code.len(), 8);
    assert!(code.chars().all(|c| c.is_ascii_digit()));
}

#[test]
fn test_seal_and_unseal() {
    let seed = "42".repeat(32);
    let sealed = stdout(&peertrust(&["seal", "--pin", "2468", &seed]));
    let opened = stdout(&peertrust(&["unseal", "--pin", "2468", &sealed]));
    assert_eq!(opened, seed);

    let wrong = peertrust(&["unseal", "--pin", "0000", &sealed]);
    assert!(!wrong.status.success());
}

#[test]
fn test_simulate_pcap() {
    let report: Value = serde_json::from_str(&stdout(&peertrust(&["simulate", "pcap"]))).unwrap();
    assert_eq!(report["receiver"], "Authorized");
    assert_eq!(report["initiator"][0], "Authorized");
    assert_eq!(report["receiverHoldsSeed"], true);
}

#[test]
fn test_simulate_siep_wrong_code() {
    let report: Value =
        serde_json::from_str(&stdout(&peertrust(&["simulate", "siep-wrong-code"]))).unwrap();
    assert!(report["authorizedDevice"]["error"].is_string());
    assert_eq!(report["newDeviceHoldsSeed"], false);
    assert_eq!(report["newDeviceRegistered"], false);
}

#[test]
fn test_config_file_sets_kdf_cost() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("peertrust.toml");
    std::fs::write(
        &path,
        "[kdf]\nmemory_kib = 64\niterations = 1\nparallelism = 1\n",
    )
    .unwrap();
    let config = path.to_str().unwrap();

    let sealed = stdout(&peertrust(&["--config", config, "seal", "--pin", "2468"]));
    let parsed: Value = serde_json::from_str(&sealed).unwrap();
    assert_eq!(parsed["kdf"]["memory_kib"], 64);

    std::fs::write(&path, "[protocol]\nmax_frame_size = 10\n").unwrap();
    assert!(!peertrust(&["--config", config, "device-code"]).status.success());
}

#[test]
fn test_config_file_sets_logging() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("peertrust.toml");
    let run = || {
        Command::new(env!("CARGO_BIN_EXE_peertrust"))
            .args(["--config", path.to_str().unwrap()])
            .env_remove("RUST_LOG")
            .output()
            .expect("failed to run peertrust")
    };

    std::fs::write(&path, "[logging]\nlevel = \"info\"\njson_format = true\n").unwrap();
    let logged = stdout(&run());
    let line: Value = serde_json::from_str(logged.lines().next().unwrap()).unwrap();
    assert_eq!(line["level"], "WARN");
    assert!(line["fields"]["message"]
        .as_str()
        .unwrap()
        .starts_with("No command specified"));

    std::fs::write(&path, "[logging]\nlevel = \"error\"\n").unwrap();
    assert!(stdout(&run()).is_empty());
}
