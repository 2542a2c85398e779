#![cfg(feature = "cli")]

use std::net::{TcpListener, TcpStream};
use std::process::{Child, Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

fn fwlink(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_fwlink"))
        .args(["--log-level", "error", "--format", "json"])
        .args(args)
        .output()
        .expect("fwlink should run")
}

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("ephemeral bind should work")
        .local_addr()
        .expect("bound listener has an address")
        .port()
}

struct Server(Child);

impl Drop for Server {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

fn spawn_server(addr: &str, extra: &[&str]) -> Server {
    let child = Command::new(env!("CARGO_BIN_EXE_fwlink"))
        .args(["--log-level", "error", "--format", "json", "serve", addr])
        .args(extra)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("serve should start");
    Server(child)
}

/// Retry `args` until the server accepts, then return the first successful output.
fn until_ok(args: &[&str], timeout: Duration) -> Output {
    let start = Instant::now();
    loop {
        let output = fwlink(args);
        if output.status.success() || start.elapsed() >= timeout {
            return output;
        }
        thread::sleep(Duration::from_millis(50));
    }
}

#[test]
fn version_prints_package_version() {
    let output = fwlink(&["version"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains(&format!("fwlink {}", env!("CARGO_PKG_VERSION"))));
}

#[test]
fn loopback_reads_back_what_it_wrote() {
    for version in ["default", "v0", "v3"] {
        let output = fwlink(&[
            "loopback",
            "--srp-version",
            version,
            "--address",
            "0x40",
            "--data",
            "0102030405060708",
        ]);
        assert!(output.status.success(), "{version}: {output:?}");
        let stdout = String::from_utf8_lossy(&output.stdout);
        assert!(stdout.contains("\"matched\":true"), "{stdout}");
        assert!(stdout.contains("\"read\":\"0102030405060708\""), "{stdout}");
    }
}

#[test]
fn loopback_rejects_unaligned_v0_access() {
    let output = fwlink(&["loopback", "--srp-version", "v0", "--data", "010203"]);
    assert_eq!(output.status.code(), Some(64));
}

#[test]
fn decode_rssi_reports_fields() {
    let output = fwlink(&["decode-rssi", "0840000300050848"]);
    assert!(output.status.success(), "{output:?}");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("\"ack\":true"));
    assert!(stdout.contains("\"sequence\":5"));
    assert!(stdout.contains("\"acknowledge\":3"));
    assert!(stdout.contains("\"checksum_ok\":true"));
}

#[test]
fn decode_rssi_flags_bad_checksum() {
    let output = fwlink(&["decode-rssi", "08400003000508ff"]);
    assert_eq!(output.status.code(), Some(60));
    assert!(String::from_utf8_lossy(&output.stdout).contains("\"checksum_ok\":false"));
}

#[test]
fn decode_rssi_rejects_short_input() {
    let output = fwlink(&["decode-rssi", "0840"]);
    assert_eq!(output.status.code(), Some(60));
}

#[test]
fn write_then_read_against_server() {
    let addr = format!("127.0.0.1:{}", free_port());
    let _server = spawn_server(&addr, &["--base", "0x1000", "--size", "256"]);

    let output = until_ok(
        &["write", &addr, "--address", "0x1010", "--data", "cafef00d"],
        Duration::from_secs(5),
    );
    assert!(output.status.success(), "{output:?}");

    let output = fwlink(&["read", &addr, "--address", "0x1010", "--size", "4"]);
    assert!(output.status.success(), "{output:?}");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("\"data\":\"cafef00d\""), "{stdout}");
}

#[test]
fn out_of_range_read_is_a_device_error() {
    let addr = format!("127.0.0.1:{}", free_port());
    let _server = spawn_server(&addr, &["--base", "0x0", "--size", "16"]);

    // Wait for the listener with a request that succeeds.
    let ready = until_ok(&["read", &addr, "--address", "0x0"], Duration::from_secs(5));
    assert!(ready.status.success(), "{ready:?}");

    let output = fwlink(&["read", &addr, "--address", "0x100"]);
    assert_eq!(output.status.code(), Some(4));
}

#[test]
fn read_without_server_is_a_transport_error() {
    let addr = format!("127.0.0.1:{}", free_port());
    let output = fwlink(&["read", &addr, "--address", "0x0", "--timeout", "500ms"]);
    assert_eq!(output.status.code(), Some(3));
}

#[test]
fn serve_once_ends_when_peer_hangs_up_before_handshake() {
    let addr = format!("127.0.0.1:{}", free_port());
    let mut server = spawn_server(&addr, &["--once"]);

    let start = Instant::now();
    let stream = loop {
        match TcpStream::connect(&addr) {
            Ok(stream) => break stream,
            Err(_) if start.elapsed() < Duration::from_secs(5) => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(err) => panic!("server never listened: {err}"),
        }
    };
    drop(stream);

    let start = Instant::now();
    let status = loop {
        if let Some(status) = server.0.try_wait().expect("server status") {
            break status;
        }
        assert!(start.elapsed() < Duration::from_secs(5), "serve did not end the session");
        thread::sleep(Duration::from_millis(50));
    };
    assert!(status.success());
}
