//! End-to-end tests against the compiled `mpremote-bridge` binary: spawn
//! it with a real shell as the child, connect over TCP, and assert on the
//! observed wire behavior.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{Duration, Instant};

static NEXT_PORT: AtomicU16 = AtomicU16::new(23_800);

fn next_port_pair() -> (u16, u16) {
    let base = NEXT_PORT.fetch_add(2, Ordering::SeqCst);
    (base, base + 1)
}

struct Bridge {
    child: Child,
    raw_port: u16,
    rfc2217_port: u16,
}

impl Bridge {
    fn spawn_with_shell(rfc2217_port: u16, raw_port: u16) -> Self {
        Self::spawn_with_child(rfc2217_port, raw_port, &["/bin/sh"])
    }

    fn spawn_with_child(rfc2217_port: u16, raw_port: u16, child_argv: &[&str]) -> Self {
        let child = Command::new(env!("CARGO_BIN_EXE_mpremote-bridge"))
            .args([
                "-p",
                &rfc2217_port.to_string(),
                "-s",
                &raw_port.to_string(),
                "--host",
                "127.0.0.1",
            ])
            .args(child_argv)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn mpremote-bridge");

        // Give the dispatcher time to bind both listeners before the
        // test tries to connect.
        std::thread::sleep(Duration::from_millis(200));

        Self {
            child,
            raw_port,
            rfc2217_port,
        }
    }

    fn connect_raw(&self) -> TcpStream {
        connect_with_retry(self.raw_port)
    }

    fn connect_rfc2217(&self) -> TcpStream {
        connect_with_retry(self.rfc2217_port)
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn connect_with_retry(port: u16) -> TcpStream {
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        match TcpStream::connect(("127.0.0.1", port)) {
            Ok(s) => return s,
            Err(_) if Instant::now() < deadline => std::thread::sleep(Duration::from_millis(50)),
            Err(e) => panic!("failed to connect to 127.0.0.1:{port}: {e}"),
        }
    }
}

/// Read from `stream` until `needle` appears or the deadline passes,
/// returning everything read so far.
fn read_until(stream: &mut TcpStream, needle: &str, timeout: Duration) -> Vec<u8> {
    stream
        .set_read_timeout(Some(Duration::from_millis(100)))
        .unwrap();
    let mut collected = Vec::new();
    let deadline = Instant::now() + timeout;
    let mut buf = [0u8; 4096];
    while Instant::now() < deadline {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                collected.extend_from_slice(&buf[..n]);
                if String::from_utf8_lossy(&collected).contains(needle) {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(_) => break,
        }
    }
    collected
}

#[test]
fn raw_port_echoes_shell_output() {
    let (rfc2217_port, raw_port) = next_port_pair();
    let bridge = Bridge::spawn_with_shell(rfc2217_port, raw_port);
    let mut client = bridge.connect_raw();

    client.write_all(b"echo hi-there\n").unwrap();
    let out = read_until(&mut client, "hi-there", Duration::from_secs(3));
    assert!(
        String::from_utf8_lossy(&out).contains("hi-there"),
        "expected echoed shell output, got {:?}",
        String::from_utf8_lossy(&out)
    );
}

#[test]
fn busy_rejection_closes_second_client_with_banner() {
    let (rfc2217_port, raw_port) = next_port_pair();
    let bridge = Bridge::spawn_with_shell(rfc2217_port, raw_port);

    let _first = bridge.connect_raw();
    // Give the connection guard a moment to start watching the other port.
    std::thread::sleep(Duration::from_millis(150));

    let mut second = bridge.connect_rfc2217();
    let banner = read_until(
        &mut second,
        "Device busy",
        Duration::from_millis(500),
    );
    assert!(
        String::from_utf8_lossy(&banner).contains("Device busy - another client is connected"),
        "expected busy banner, got {:?}",
        String::from_utf8_lossy(&banner)
    );

    // The rejecting side closes the socket after sending the banner.
    let mut buf = [0u8; 16];
    second
        .set_read_timeout(Some(Duration::from_millis(500)))
        .unwrap();
    let n = second.read(&mut buf).unwrap_or(0);
    assert_eq!(n, 0, "rejected connection should be closed by the bridge");
}

#[test]
fn killing_child_mid_session_triggers_one_soft_reboot_and_stays_interactive() {
    let (rfc2217_port, raw_port) = next_port_pair();
    let bridge = Bridge::spawn_with_shell(rfc2217_port, raw_port);
    let mut client = bridge.connect_raw();

    // Terminate the shell itself, which triggers the soft-reboot path on
    // the next reader-flow iteration once the exit is observed.
    client.write_all(b"exit\n").unwrap();

    let seen = read_until(&mut client, "soft reboot", Duration::from_secs(3));
    let text = String::from_utf8_lossy(&seen);
    assert!(
        text.contains("soft reboot\r\n"),
        "expected the friendly reboot banner, got {:?}",
        text
    );
    assert_eq!(
        text.matches("soft reboot").count(),
        1,
        "expected exactly one reboot banner, got {:?}",
        text
    );

    // The replacement is a fresh interactive shell; prove the session
    // still works end to end with it, not just that the socket stayed open.
    client.write_all(b"echo hi-after-reboot\n").unwrap();
    let out = read_until(&mut client, "hi-after-reboot", Duration::from_secs(3));
    assert!(
        String::from_utf8_lossy(&out).contains("hi-after-reboot"),
        "expected the replacement child to answer, got {:?}",
        String::from_utf8_lossy(&out)
    );
}

#[test]
fn reconnecting_preserves_child_state() {
    let (rfc2217_port, raw_port) = next_port_pair();
    let bridge = Bridge::spawn_with_shell(rfc2217_port, raw_port);

    {
        let mut client = bridge.connect_raw();
        client.write_all(b"X=42\n").unwrap();
        // Drain the echo of the assignment itself before disconnecting.
        std::thread::sleep(Duration::from_millis(200));
        let _ = read_until(&mut client, "X=42", Duration::from_millis(300));
    }
    // Client socket drops here; the child process is not touched because
    // it has not exited, so the next connection reuses it as-is.
    std::thread::sleep(Duration::from_millis(200));

    let mut client = bridge.connect_raw();
    client.write_all(b"echo $X\n").unwrap();
    let out = read_until(&mut client, "42", Duration::from_secs(3));
    assert!(
        String::from_utf8_lossy(&out).contains("42"),
        "expected the shell variable to survive reconnect, got {:?}",
        String::from_utf8_lossy(&out)
    );
}
