#![cfg(all(unix, feature = "cli"))]

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

fn unique_temp_dir(tag: &str) -> PathBuf {
    let dir = PathBuf::from(format!(
        "/tmp/tpcli-{tag}-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
    dir
}

fn trustpipe() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_trustpipe"));
    command.arg("--log-level").arg("error");
    command
}

fn wait_for_socket(path: &Path, timeout: Duration) {
    let start = Instant::now();
    while !path.exists() {
        if start.elapsed() >= timeout {
            panic!("server did not bind {}", path.display());
        }
        thread::sleep(Duration::from_millis(25));
    }
}

struct Server(Child);

impl Drop for Server {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

fn start_server(dir: &Path, sock_path: &Path) -> Server {
    let keygen = trustpipe()
        .arg("keygen")
        .arg("--out")
        .arg(dir)
        .arg("--bits")
        .arg("1024")
        .output()
        .expect("keygen should run");
    assert!(keygen.status.success(), "keygen failed: {keygen:?}");

    let child = trustpipe()
        .arg("serve")
        .arg(sock_path)
        .arg("--private-key")
        .arg(dir.join("private.pem"))
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .expect("serve should start");
    wait_for_socket(sock_path, Duration::from_secs(5));
    Server(child)
}

fn send(dir: &Path, sock_path: &Path, request_type: &str, extra: &[&str]) -> Output {
    trustpipe()
        .arg("--format")
        .arg("json")
        .arg("send")
        .arg(sock_path)
        .arg("--type")
        .arg(request_type)
        .arg("--assume")
        .arg("indeterminate")
        .arg("--public-key")
        .arg(dir.join("public.pem"))
        .args(extra)
        .output()
        .expect("send should run")
}

#[test]
fn challenge_then_request_round_trip() {
    let dir = unique_temp_dir("roundtrip");
    let sock_path = dir.join("svc.sock");
    let _server = start_server(&dir, &sock_path);

    let output = send(&dir, &sock_path, "IsUIRunningAutoupdateCheck", &[]);
    assert!(output.status.success(), "send failed: {output:?}");

    let reply: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("stdout should be JSON");
    assert_eq!(reply["request_type"], "IsUIRunningAutoupdateCheck");
    assert_eq!(reply["trust_state"], "challenge-verified");
    assert_eq!(reply["payload"], "False");

    let output = send(&dir, &sock_path, "SaveProxy", &["--arg", "proxy={}"]);
    assert!(output.status.success(), "send failed: {output:?}");
    let reply: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(reply["payload"], "Success");

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn unknown_request_is_answered_with_request_error() {
    let dir = unique_temp_dir("unknown");
    let sock_path = dir.join("svc.sock");
    let _server = start_server(&dir, &sock_path);

    let output = send(&dir, &sock_path, "NoSuchRequest", &[]);
    assert!(output.status.success(), "send failed: {output:?}");
    let reply: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(reply["payload"], "Error: invalid Request");

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn wrong_public_key_fails_trust() {
    let dir = unique_temp_dir("wrongkey");
    let sock_path = dir.join("svc.sock");
    let _server = start_server(&dir, &sock_path);

    let other = dir.join("other");
    let keygen = trustpipe()
        .arg("keygen")
        .arg("--out")
        .arg(&other)
        .arg("--bits")
        .arg("1024")
        .output()
        .expect("keygen should run");
    assert!(keygen.status.success());

    let output = send(&other, &sock_path, "IsUIRunningAutoupdateCheck", &[]);
    assert_eq!(output.status.code(), Some(40));

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn missing_service_times_out_with_124() {
    let dir = unique_temp_dir("missing");
    let output = trustpipe()
        .arg("send")
        .arg(dir.join("absent.sock"))
        .arg("--type")
        .arg("GetLaunchArguments")
        .arg("--connect-timeout")
        .arg("200ms")
        .output()
        .expect("send should run");
    assert_eq!(output.status.code(), Some(124));

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn version_prints_package_version() {
    let output = trustpipe()
        .arg("version")
        .output()
        .expect("version should run");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains(env!("CARGO_PKG_VERSION")));
}
