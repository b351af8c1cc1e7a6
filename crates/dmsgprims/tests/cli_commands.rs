#![cfg(all(unix, feature = "cli"))]

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use dmsgprims::frame::{Message, CREATE, DELETE, LNK_PING, REPLY};
use dmsgprims::iocom::{connect, IocomHandle, ReplyHandler};

fn unique_temp_dir(tag: &str) -> PathBuf {
    let dir = PathBuf::from(format!(
        "/tmp/dmsgcli-{tag}-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
    dir
}

fn ignore(_: &IocomHandle, _: &Message) {}

fn wait_for_socket(path: &Path, timeout: Duration) {
    let start = Instant::now();
    loop {
        if connect(path, ignore).is_ok() {
            return;
        }
        if start.elapsed() >= timeout {
            panic!("connect timeout");
        }
        thread::sleep(Duration::from_millis(25));
    }
}

fn spawn_echo(sock_path: &Path) -> Child {
    let child = Command::new(env!("CARGO_BIN_EXE_dmsgprims"))
        .arg("--log-level")
        .arg("error")
        .arg("echo")
        .arg(sock_path)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .expect("echo command should start");
    wait_for_socket(sock_path, Duration::from_secs(3));
    child
}

#[test]
fn echo_server_answers_a_library_client() {
    let dir = unique_temp_dir("echo");
    let sock_path = dir.join("echo.sock");
    let mut child = spawn_echo(&sock_path);

    let iocom = connect(&sock_path, ignore).expect("client should connect");
    let handle = iocom.handle();
    let core = thread::spawn(move || iocom.run());

    let (tx, rx) = mpsc::channel();
    let on_reply: ReplyHandler = Box::new(move |_: &IocomHandle, msg: &Message| {
        let _ = tx.send((msg.cmd(), msg.aux().to_vec()));
    });
    let mut msg = handle
        .alloc(0, 5, LNK_PING | CREATE | DELETE, Some(on_reply))
        .expect("alloc should succeed");
    msg.write_aux(b"hello");
    handle.write(msg).expect("write should queue");

    let (cmd, aux) = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("echo reply should arrive");
    assert_eq!(cmd, LNK_PING | CREATE | DELETE | REPLY);
    assert_eq!(aux, b"hello");

    handle.shutdown();
    core.join()
        .expect("core thread should finish")
        .expect("shutdown is clean");
    let _ = child.kill();
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn send_wait_prints_reply_as_json() {
    let dir = unique_temp_dir("send");
    let sock_path = dir.join("echo.sock");
    let mut child = spawn_echo(&sock_path);

    let output = Command::new(env!("CARGO_BIN_EXE_dmsgprims"))
        .arg("--log-level")
        .arg("error")
        .arg("--format")
        .arg("json")
        .arg("send")
        .arg(&sock_path)
        .arg("--data")
        .arg("round trip")
        .arg("--wait")
        .output()
        .expect("send should run");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    let reply: serde_json::Value =
        serde_json::from_str(stdout.trim()).expect("send should emit json");
    assert_eq!(reply["kind"], "frame-received");
    assert_eq!(reply["command"], "LNK_PING");
    assert_eq!(reply["flags"], "CREATE|DELETE|REPLY");
    assert_eq!(reply["aux"], "round trip");
    assert_eq!(reply["error"], 0);

    let _ = child.kill();
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn send_to_missing_socket_fails() {
    let missing = PathBuf::from(format!(
        "/tmp/dmsgcli-missing-{}-{}.sock",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ));

    let output = Command::new(env!("CARGO_BIN_EXE_dmsgprims"))
        .arg("--log-level")
        .arg("error")
        .arg("send")
        .arg(&missing)
        .arg("--data")
        .arg("x")
        .output()
        .expect("send should run");

    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("connect failed"));
}

#[test]
fn version_reports_package_version() {
    let output = Command::new(env!("CARGO_BIN_EXE_dmsgprims"))
        .arg("version")
        .output()
        .expect("version should run");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(
        stdout.trim(),
        format!("dmsgprims {}", env!("CARGO_PKG_VERSION"))
    );
}
