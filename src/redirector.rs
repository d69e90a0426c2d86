//! The bidirectional pump between one client socket and one `PtyProcess`,
//! and the soft-reboot protocol that keeps a restart invisible to the
//! client.
//!
//! Each flow (reader, writer, and — for RFC 2217 — the modem-state poll)
//! runs on its own OS thread, matching the "genuinely preemptive"
//! requirement: one flow can sit in a blocking PTY read while another
//! sits in a blocking socket read. Socket writes are serialized through a
//! shared `Mutex<TcpStream>` clone; socket reads belong exclusively to the
//! writer flow, so no read-side synchronization is needed.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::rfc2217::Rfc2217Codec;
use crate::supervisor::ProcessSupervisor;
use crate::virtual_serial::{ModemLines, SettingsUpdate, VirtualSerial, RAW_REPL_BANNER};

const READER_CHUNK: usize = 4096;
const READER_TIMEOUT: Duration = Duration::from_millis(10);
const RAW_RECV_CHUNK: usize = 4096;
const RFC2217_RECV_CHUNK: usize = 1024;
const RESTARTING_POLL: Duration = Duration::from_millis(10);

#[cfg(unix)]
const RESTART_SETTLE_DELAY: Duration = Duration::from_millis(10);
#[cfg(windows)]
const RESTART_SETTLE_DELAY: Duration = Duration::from_millis(100);

const BANNER_READ_TIMEOUT: Duration = Duration::from_millis(50);
const RAW_REPL_ENTRY_DELAY: Duration = Duration::from_millis(50);
const DRAIN_TIMEOUT: Duration = Duration::from_millis(50);
const DRAIN_MAX_ITERATIONS: usize = 50;

#[cfg(unix)]
const DRAIN_EMPTY_BUDGET: usize = 5;
#[cfg(windows)]
const DRAIN_EMPTY_BUDGET: usize = 10;

const TEARDOWN_JOIN_CAP: Duration = Duration::from_secs(1);

const FRIENDLY_REBOOT_BANNER: &[u8] = b"soft reboot\r\n";
const FABRICATED_RAW_REPL_REPLY: &[u8] =
    b"OK\r\nMPY: soft reboot\r\nraw REPL; CTRL-B to exit\r\n>";

/// The per-variant framing policy: RFC 2217 telnet escaping plus
/// subnegotiation, or raw pass-through. One skeleton shared by both
/// listeners, with the protocol-specific bits pulled out into these
/// methods instead of two near-duplicate pump implementations.
pub enum Variant {
    Raw,
    Rfc2217(Mutex<Rfc2217Codec>),
}

struct FilterOutcome {
    data: Vec<u8>,
    responses: Vec<u8>,
    events: Vec<crate::rfc2217::Rfc2217Event>,
}

impl Variant {
    fn recv_chunk_size(&self) -> usize {
        match self {
            Variant::Raw => RAW_RECV_CHUNK,
            Variant::Rfc2217(_) => RFC2217_RECV_CHUNK,
        }
    }

    fn frame_out(&self, data: &[u8]) -> Vec<u8> {
        match self {
            Variant::Raw => data.to_vec(),
            Variant::Rfc2217(codec) => codec.lock().unwrap().escape(data),
        }
    }

    fn filter_in(&self, data: &[u8]) -> FilterOutcome {
        match self {
            Variant::Raw => FilterOutcome {
                data: data.to_vec(),
                responses: Vec::new(),
                events: Vec::new(),
            },
            Variant::Rfc2217(codec) => {
                let r = codec.lock().unwrap().filter(data);
                FilterOutcome {
                    data: r.data,
                    responses: r.responses,
                    events: r.events,
                }
            }
        }
    }

    fn is_rfc2217(&self) -> bool {
        matches!(self, Variant::Rfc2217(_))
    }

    fn modem_status_frame(&self, modem: ModemLines) -> Vec<u8> {
        match self {
            Variant::Raw => Vec::new(),
            Variant::Rfc2217(codec) => {
                codec.lock().unwrap().modem_status_frame(encode_modem_status(modem))
            }
        }
    }
}

fn encode_modem_status(modem: ModemLines) -> u8 {
    let mut bits = 0u8;
    if modem.cts {
        bits |= 0x10;
    }
    if modem.dsr {
        bits |= 0x20;
    }
    if modem.ri {
        bits |= 0x40;
    }
    if modem.cd {
        bits |= 0x80;
    }
    bits
}

/// One redirector per accepted connection. `shortcircuit` runs the session
/// to completion and does not return until the client has disconnected or
/// the session has otherwise died.
pub struct Redirector {
    virtual_serial: Arc<Mutex<VirtualSerial>>,
    supervisor: Arc<ProcessSupervisor>,
    stream: TcpStream,
    variant: Arc<Variant>,
}

impl Redirector {
    pub fn new(
        virtual_serial: Arc<Mutex<VirtualSerial>>,
        supervisor: Arc<ProcessSupervisor>,
        stream: TcpStream,
        variant: Variant,
    ) -> Self {
        Self {
            virtual_serial,
            supervisor,
            stream,
            variant: Arc::new(variant),
        }
    }

    /// IDLE → RUNNING → STOPPING → DEAD. Blocks the caller until the
    /// writer flow terminates, then joins the auxiliary flows with a 1-s
    /// cap so a wedged reader or modem-poll thread can't hang connection
    /// teardown indefinitely.
    pub fn shortcircuit(self) {
        let write_half = Arc::new(Mutex::new(
            self.stream.try_clone().expect("tcp stream clone for writer"),
        ));
        let mut writer_read_half = self.stream;

        let alive = Arc::new(AtomicBool::new(true));
        let restarting = Arc::new(AtomicBool::new(false));

        let (reader_done_tx, reader_done_rx) = mpsc::channel::<()>();
        let reader_handle = {
            let vs = Arc::clone(&self.virtual_serial);
            let supervisor = Arc::clone(&self.supervisor);
            let variant = Arc::clone(&self.variant);
            let write_half = Arc::clone(&write_half);
            let alive = Arc::clone(&alive);
            let restarting = Arc::clone(&restarting);
            thread::spawn(move || {
                reader_flow(vs, supervisor, write_half, alive, restarting, variant);
                let _ = reader_done_tx.send(());
            })
        };

        let modem_handle = if self.variant.is_rfc2217() {
            let (tx, rx) = mpsc::channel::<()>();
            let vs = Arc::clone(&self.virtual_serial);
            let variant = Arc::clone(&self.variant);
            let write_half = Arc::clone(&write_half);
            let alive = Arc::clone(&alive);
            let handle = thread::spawn(move || {
                modem_poll_flow(vs, write_half, alive, variant);
                let _ = tx.send(());
            });
            Some((handle, rx))
        } else {
            None
        };

        writer_flow(
            &mut writer_read_half,
            &self.virtual_serial,
            &write_half,
            &alive,
            &restarting,
            &self.variant,
        );

        alive.store(false, Ordering::SeqCst);
        join_with_cap("reader", reader_handle, reader_done_rx, TEARDOWN_JOIN_CAP);
        if let Some((handle, rx)) = modem_handle {
            join_with_cap("modem-poll", handle, rx, TEARDOWN_JOIN_CAP);
        }
    }
}

fn join_with_cap(name: &str, handle: thread::JoinHandle<()>, done: mpsc::Receiver<()>, cap: Duration) {
    if done.recv_timeout(cap).is_err() {
        warn!("{} flow did not finish within teardown cap, detaching", name);
    } else {
        let _ = handle.join();
    }
}

fn reader_flow(
    vs: Arc<Mutex<VirtualSerial>>,
    supervisor: Arc<ProcessSupervisor>,
    write_half: Arc<Mutex<TcpStream>>,
    alive: Arc<AtomicBool>,
    restarting: Arc<AtomicBool>,
    variant: Arc<Variant>,
) {
    while alive.load(Ordering::SeqCst) {
        let exited = vs.lock().unwrap().has_process_exited();
        if exited {
            if !run_soft_reboot(&vs, &supervisor, &write_half, &restarting, &variant) {
                alive.store(false, Ordering::SeqCst);
                break;
            }
            continue;
        }

        let data = vs.lock().unwrap().read(READER_CHUNK);
        if data.is_empty() {
            // read() uses the VirtualSerial's own timeout internally; a
            // short extra sleep avoids a hot loop while the PTY is merely
            // idle rather than exited.
            thread::sleep(READER_TIMEOUT);
            continue;
        }

        let framed = variant.frame_out(&data);
        if write_half.lock().unwrap().write_all(&framed).is_err() {
            debug!("client write failed, ending session");
            alive.store(false, Ordering::SeqCst);
            break;
        }
    }
}

fn writer_flow(
    read_half: &mut TcpStream,
    vs: &Arc<Mutex<VirtualSerial>>,
    write_half: &Arc<Mutex<TcpStream>>,
    alive: &Arc<AtomicBool>,
    restarting: &Arc<AtomicBool>,
    variant: &Arc<Variant>,
) {
    let _ = read_half.set_read_timeout(Some(Duration::from_millis(200)));
    let mut buf = vec![0u8; variant.recv_chunk_size()];

    while alive.load(Ordering::SeqCst) {
        if restarting.load(Ordering::SeqCst) {
            thread::sleep(RESTARTING_POLL);
            continue;
        }

        match read_half.read(&mut buf) {
            Ok(0) => {
                alive.store(false, Ordering::SeqCst);
                break;
            }
            Ok(n) => {
                let outcome = variant.filter_in(&buf[..n]);
                if !outcome.responses.is_empty() {
                    let _ = write_half.lock().unwrap().write_all(&outcome.responses);
                }
                apply_events(vs, outcome.events);
                if !outcome.data.is_empty() {
                    vs.lock().unwrap().write(&outcome.data);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => {
                continue;
            }
            Err(e) => {
                debug!("client read error: {}", e);
                alive.store(false, Ordering::SeqCst);
                break;
            }
        }
    }
}

fn apply_events(vs: &Arc<Mutex<VirtualSerial>>, events: Vec<crate::rfc2217::Rfc2217Event>) {
    if events.is_empty() {
        return;
    }
    let mut guard = vs.lock().unwrap();
    for event in events {
        match event {
            crate::rfc2217::Rfc2217Event::Settings(update) => apply_settings(&mut guard, update),
            crate::rfc2217::Rfc2217Event::SetControl(value) => apply_control(&mut guard, value),
            crate::rfc2217::Rfc2217Event::PurgeData(_) => guard.reset_input_buffer(),
            crate::rfc2217::Rfc2217Event::FlowSuspend | crate::rfc2217::Rfc2217Event::FlowResume => {
                // Acknowledged but not acted on: there is no backpressure
                // mechanism between the socket and the PTY to suspend.
            }
        }
    }
}

fn apply_settings(vs: &mut VirtualSerial, update: SettingsUpdate) {
    vs.apply_settings(update);
}

fn apply_control(vs: &mut VirtualSerial, value: u8) {
    match value {
        1 => vs.set_dtr(true),
        2 => vs.set_dtr(false),
        3 => vs.set_rts(true),
        4 => vs.set_rts(false),
        5 => vs.send_break(),
        _ => {}
    }
}

fn modem_poll_flow(
    vs: Arc<Mutex<VirtualSerial>>,
    write_half: Arc<Mutex<TcpStream>>,
    alive: Arc<AtomicBool>,
    variant: Arc<Variant>,
) {
    while alive.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_secs(1));
        if !alive.load(Ordering::SeqCst) {
            break;
        }
        let modem = vs.lock().unwrap().modem_lines();
        let frame = variant.modem_status_frame(modem);
        if !frame.is_empty() {
            let _ = write_half.lock().unwrap().write_all(&frame);
        }
    }
}

/// Restart the child in place without the client noticing: announce the
/// reboot if the child wasn't mid-raw-REPL, swap the process, and replay
/// whatever banner or raw-REPL handshake the client would otherwise have
/// missed. Returns `false` if the restart itself failed, in which case the
/// caller ends the session.
fn run_soft_reboot(
    vs: &Arc<Mutex<VirtualSerial>>,
    supervisor: &ProcessSupervisor,
    write_half: &Arc<Mutex<TcpStream>>,
    restarting: &AtomicBool,
    variant: &Variant,
) -> bool {
    restarting.store(true, Ordering::SeqCst);

    let was_in_raw_repl = vs.lock().unwrap().in_raw_repl();

    if !was_in_raw_repl {
        let framed = variant.frame_out(FRIENDLY_REBOOT_BANNER);
        let _ = write_half.lock().unwrap().write_all(&framed);
    }

    if let Err(e) = supervisor.restart_and_install(vs) {
        error!("soft reboot failed: {}", e);
        restarting.store(false, Ordering::SeqCst);
        return false;
    }

    thread::sleep(RESTART_SETTLE_DELAY);

    let banner = vs.lock().unwrap().pty_read_raw(READER_CHUNK, BANNER_READ_TIMEOUT);

    if was_in_raw_repl {
        reenter_raw_repl(vs, write_half, variant);
    } else if !banner.is_empty() {
        let framed = variant.frame_out(&banner);
        let _ = write_half.lock().unwrap().write_all(&framed);
    }

    restarting.store(false, Ordering::SeqCst);
    info!("soft reboot complete, in_raw_repl={}", was_in_raw_repl);
    true
}

/// Re-enter raw REPL mode after a soft reboot and send the fabricated
/// device-style reply exactly once. The reference tool this behavior is
/// modeled on sends this reply a second time from its reconnect path,
/// which a client parsing raw-REPL framing sees as a stray duplicate
/// banner; this drains the real banner and replies only from here.
fn reenter_raw_repl(vs: &Arc<Mutex<VirtualSerial>>, write_half: &Arc<Mutex<TcpStream>>, variant: &Variant) {
    thread::sleep(RAW_REPL_ENTRY_DELAY);
    vs.lock().unwrap().pty_write_raw(&[0x01]);

    let mut collected = Vec::new();
    let mut empty_reads = 0usize;

    for _ in 0..DRAIN_MAX_ITERATIONS {
        let chunk = vs.lock().unwrap().pty_read_raw(READER_CHUNK, DRAIN_TIMEOUT);
        if chunk.is_empty() {
            empty_reads += 1;
            if empty_reads >= DRAIN_EMPTY_BUDGET {
                break;
            }
            continue;
        }
        empty_reads = 0;
        collected.extend_from_slice(&chunk);
        let text = String::from_utf8_lossy(&collected);
        if text.contains(RAW_REPL_BANNER) && text.trim_end().ends_with('>') {
            break;
        }
    }

    let framed = variant.frame_out(FABRICATED_RAW_REPL_REPLY);
    let _ = write_half.lock().unwrap().write_all(&framed);
    vs.lock().unwrap().set_in_raw_repl(true);
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;
    use crate::pty::PtyProcess;
    use std::net::{TcpListener, TcpStream};
    use std::time::Instant;

    fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn encode_modem_status_sets_expected_bits() {
        let mut modem = ModemLines::default();
        modem.cts = true;
        modem.dsr = true;
        assert_eq!(encode_modem_status(modem), 0x10 | 0x20);
    }

    #[test]
    fn variant_raw_frame_out_and_filter_in_are_identity() {
        let variant = Variant::Raw;
        assert_eq!(variant.frame_out(b"hello"), b"hello".to_vec());
        let outcome = variant.filter_in(b"hello");
        assert_eq!(outcome.data, b"hello".to_vec());
        assert!(outcome.responses.is_empty());
        assert!(outcome.events.is_empty());
    }

    #[test]
    fn apply_control_maps_bytes_to_modem_lines() {
        let pty = PtyProcess::spawn(&["/bin/cat".to_string()], None).unwrap();
        let mut vs = VirtualSerial::new(pty, Duration::from_millis(50));
        apply_control(&mut vs, 1);
        assert!(vs.modem_lines().dtr);
        apply_control(&mut vs, 2);
        assert!(!vs.modem_lines().dtr);
        apply_control(&mut vs, 5);
        assert!(vs.modem_lines().brk);
    }

    /// Kill the child mid-session and drive `run_soft_reboot` directly: the
    /// client should see the friendly reboot banner exactly once and end up
    /// talking to a live replacement process.
    #[test]
    fn soft_reboot_restarts_child_and_sends_friendly_banner_once() {
        let supervisor = ProcessSupervisor::new(
            vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                "read x; exit".to_string(),
            ],
            None,
        );
        let pty = supervisor.create().unwrap();
        let vs = Arc::new(Mutex::new(VirtualSerial::new(pty, Duration::from_millis(50))));

        vs.lock().unwrap().write(b"go\n");
        let deadline = Instant::now() + Duration::from_secs(2);
        while !vs.lock().unwrap().has_process_exited() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert!(vs.lock().unwrap().has_process_exited(), "child did not exit in time");

        let (mut client, server) = loopback_pair();
        let write_half = Arc::new(Mutex::new(server));
        let restarting = AtomicBool::new(false);
        let variant = Variant::Raw;

        let ok = run_soft_reboot(&vs, &supervisor, &write_half, &restarting, &variant);
        assert!(ok, "soft reboot should succeed with a valid command line");
        assert!(
            !vs.lock().unwrap().has_process_exited(),
            "replacement child should be alive"
        );

        client.set_read_timeout(Some(Duration::from_millis(500))).unwrap();
        let mut buf = [0u8; 256];
        let n = client.read(&mut buf).unwrap_or(0);
        let received = String::from_utf8_lossy(&buf[..n]).into_owned();
        assert!(
            received.contains("soft reboot\r\n"),
            "expected friendly banner, got {:?}",
            received
        );
        assert_eq!(
            received.matches("soft reboot").count(),
            1,
            "banner should appear exactly once, got {:?}",
            received
        );
    }
}
