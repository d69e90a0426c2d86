//! A serial-port façade wrapping the current `PtyProcess`.
//!
//! The RFC 2217 codec and the raw redirector both consume exactly the
//! operations below (`read`, `write`, `in_waiting`, `get_settings`/
//! `apply_settings`, modem-line getters and setters, and the no-op
//! buffer/break controls) instead of reaching into a `PtyProcess` of their
//! own, so both protocol variants see identical raw-REPL tracking and
//! soft-reboot behavior.

use std::collections::VecDeque;
use std::time::Duration;

use crate::pty::PtyProcess;

pub(crate) const RAW_REPL_BANNER: &str = "raw REPL; CTRL-B to exit";
pub(crate) const FRIENDLY_PROMPT: &str = ">>>";

/// Simulated serial line settings. RFC 2217 clients negotiate these; they
/// are stored and echoed back but never affect the underlying PTY, which
/// has no real UART to configure.
#[derive(Debug, Clone, PartialEq)]
pub struct SerialSettings {
    pub baudrate: u32,
    pub bytesize: u8,
    pub parity: Parity,
    pub stopbits: StopBits,
    pub rtscts: bool,
    pub dsrdtr: bool,
    pub xonxoff: bool,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baudrate: 9600,
            bytesize: 8,
            parity: Parity::None,
            stopbits: StopBits::One,
            rtscts: false,
            dsrdtr: false,
            xonxoff: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Odd,
    Even,
    Mark,
    Space,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StopBits {
    One,
    OnePointFive,
    Two,
}

/// Partial update applied by `apply_settings`; `None` fields are left
/// unchanged, matching RFC 2217's per-field SET-* subnegotiation.
#[derive(Debug, Clone, Default)]
pub struct SettingsUpdate {
    pub baudrate: Option<u32>,
    pub bytesize: Option<u8>,
    pub parity: Option<Parity>,
    pub stopbits: Option<StopBits>,
    pub rtscts: Option<bool>,
    pub dsrdtr: Option<bool>,
    pub xonxoff: Option<bool>,
}

/// Modem control lines. Outputs (DTR, RTS, break) are set by the client;
/// inputs (CTS, DSR, RI, CD) are read back — all are bookkeeping only,
/// never wired to the PTY.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModemLines {
    pub dtr: bool,
    pub rts: bool,
    pub cts: bool,
    pub dsr: bool,
    pub ri: bool,
    pub cd: bool,
    pub brk: bool,
}

/// The serial-port façade the redirector and RFC 2217 codec operate on.
///
/// `pty` is `None` only for the brief window inside a soft reboot between
/// closing the outgoing child and installing its replacement — every
/// other method treats a missing process the same as an exited one.
pub struct VirtualSerial {
    pty: Option<PtyProcess>,
    read_timeout: Duration,
    pending: VecDeque<u8>,
    in_raw_repl: bool,
    closed: bool,
    settings: SerialSettings,
    modem: ModemLines,
}

impl VirtualSerial {
    pub fn new(pty: PtyProcess, read_timeout: Duration) -> Self {
        Self {
            pty: Some(pty),
            read_timeout,
            pending: VecDeque::new(),
            in_raw_repl: false,
            closed: false,
            settings: SerialSettings::default(),
            modem: ModemLines::default(),
        }
    }

    /// Drain `pending` first; only touch the PTY once it's empty. This is
    /// how bytes peeked by `in_waiting` and bytes queued after a soft
    /// reboot are delivered in the right order.
    pub fn read(&mut self, max: usize) -> Vec<u8> {
        if !self.pending.is_empty() {
            let n = max.min(self.pending.len());
            return self.pending.drain(..n).collect();
        }

        let Some(pty) = self.pty.as_ref() else {
            self.closed = true;
            return Vec::new();
        };
        let data = pty.read(max, self.read_timeout);
        if data.is_empty() && !pty.is_alive() {
            self.closed = true;
        }
        self.observe_child_to_client(&data);
        data
    }

    /// Write to the child, tracking raw-REPL entry/exit control bytes.
    pub fn write(&mut self, data: &[u8]) -> usize {
        self.observe_client_to_child(data);
        match self.pty.as_ref() {
            Some(pty) => pty.write(data),
            None => 0,
        }
    }

    /// Destructively peek one byte from the PTY (or `pending`) and return
    /// whether any bytes are available; the byte, if taken from the PTY,
    /// is re-queued into `pending` so it is not lost. A true
    /// non-destructive readiness check would avoid this, but the
    /// pending-buffer precedence rule in `read` makes the reordering safe.
    pub fn in_waiting(&mut self) -> usize {
        if !self.pending.is_empty() {
            return self.pending.len();
        }
        let peeked = match self.pty.as_ref() {
            Some(pty) => pty.read(1, Duration::from_millis(0)),
            None => Vec::new(),
        };
        if !peeked.is_empty() {
            self.observe_child_to_client(&peeked);
            self.pending.extend(peeked.iter().copied());
        }
        self.pending.len()
    }

    /// Queue bytes to be delivered ahead of any fresh PTY read — used by
    /// the soft-reboot protocol to fabricate the raw-REPL reply.
    pub fn queue_pending(&mut self, data: &[u8]) {
        self.pending.extend(data.iter().copied());
    }

    pub fn in_raw_repl(&self) -> bool {
        self.in_raw_repl
    }

    pub fn set_in_raw_repl(&mut self, value: bool) {
        self.in_raw_repl = value;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn has_process_exited(&self) -> bool {
        !self.pty.as_ref().is_some_and(|p| p.is_alive())
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.pty.as_ref().and_then(|p| p.poll())
    }

    /// Take the current child out, leaving `pty` empty. Used by a soft
    /// reboot to close the outgoing process before a replacement exists,
    /// so there is never a moment with two live children.
    pub fn take_pty(&mut self) -> Option<PtyProcess> {
        self.pty.take()
    }

    /// Install a freshly spawned child, clearing `closed` and
    /// `in_raw_repl` so the next read/write sees a fresh session.
    pub fn install_pty(&mut self, pty: PtyProcess) {
        self.closed = false;
        self.in_raw_repl = false;
        self.pty = Some(pty);
    }

    /// Reset per-connection state when a new client is accepted.
    pub fn reset_for_new_client(&mut self) {
        self.in_raw_repl = false;
        self.pending.clear();
    }

    pub fn apply_settings(&mut self, update: SettingsUpdate) {
        if let Some(v) = update.baudrate {
            self.settings.baudrate = v;
        }
        if let Some(v) = update.bytesize {
            self.settings.bytesize = v;
        }
        if let Some(v) = update.parity {
            self.settings.parity = v;
        }
        if let Some(v) = update.stopbits {
            self.settings.stopbits = v;
        }
        if let Some(v) = update.rtscts {
            self.settings.rtscts = v;
        }
        if let Some(v) = update.dsrdtr {
            self.settings.dsrdtr = v;
        }
        if let Some(v) = update.xonxoff {
            self.settings.xonxoff = v;
        }
    }

    pub fn get_settings(&self) -> SerialSettings {
        self.settings.clone()
    }

    pub fn modem_lines(&self) -> ModemLines {
        self.modem
    }

    pub fn set_dtr(&mut self, value: bool) {
        self.modem.dtr = value;
    }

    pub fn set_rts(&mut self, value: bool) {
        self.modem.rts = value;
    }

    pub fn send_break(&mut self) {
        // No-op: break is accepted and tracked but never forwarded to the
        // PTY, which has no line to assert it on.
        self.modem.brk = true;
    }

    pub fn reset_input_buffer(&mut self) {
        self.pending.clear();
    }

    pub fn reset_output_buffer(&mut self) {}

    pub fn flush(&mut self) {}

    /// Write access to the current PTY, used by the redirector to forward
    /// fabricated bytes (e.g. CTRL-A during raw-REPL re-entry) without
    /// running them back through raw-REPL tracking twice.
    pub fn pty_write_raw(&self, data: &[u8]) -> usize {
        match self.pty.as_ref() {
            Some(pty) => pty.write(data),
            None => 0,
        }
    }

    pub fn pty_read_raw(&self, max: usize, timeout: Duration) -> Vec<u8> {
        match self.pty.as_ref() {
            Some(pty) => pty.read(max, timeout),
            None => Vec::new(),
        }
    }

    /// Close the current child, if any. Consumes `self` since there is no
    /// replacement to install — only meaningful at process shutdown.
    pub fn shutdown_pty(self) {
        if let Some(pty) = self.pty {
            pty.close();
        }
    }

    fn observe_client_to_child(&mut self, data: &[u8]) {
        if data.contains(&0x01) {
            self.in_raw_repl = true;
        }
        if data.contains(&0x02) {
            self.in_raw_repl = false;
        }
    }

    fn observe_child_to_client(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let text = String::from_utf8_lossy(data);
        if text.contains(RAW_REPL_BANNER) {
            self.in_raw_repl = true;
        } else if self.in_raw_repl && text.contains(FRIENDLY_PROMPT) {
            self.in_raw_repl = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    fn make_serial() -> VirtualSerial {
        let pty = PtyProcess::spawn(&["/bin/cat".to_string()], None).unwrap();
        VirtualSerial::new(pty, Duration::from_millis(50))
    }

    #[cfg(unix)]
    #[test]
    fn pending_drains_before_pty() {
        let mut serial = make_serial();
        serial.queue_pending(b"abc");
        let read = serial.read(2);
        assert_eq!(read, b"ab");
        let read = serial.read(10);
        assert_eq!(read, b"c");
    }

    #[cfg(unix)]
    #[test]
    fn raw_repl_tracking_via_write_then_read() {
        let mut serial = make_serial();
        assert!(!serial.in_raw_repl());
        serial.write(&[0x01]);
        assert!(serial.in_raw_repl());
        serial.write(&[0x02]);
        assert!(!serial.in_raw_repl());
    }

    #[test]
    fn raw_repl_tracking_via_banner() {
        // No live PTY needed: exercise the text-observation path directly
        // through the struct's private fields via the public write/read
        // surface would require a real PTY, so we duplicate the pure
        // string logic here instead.
        let text = "some output\r\nraw REPL; CTRL-B to exit\r\n>";
        assert!(text.contains(RAW_REPL_BANNER));
    }

    #[test]
    fn apply_settings_partial_update_preserves_other_fields() {
        let defaults = SerialSettings::default();
        let mut settings = defaults.clone();
        let update = SettingsUpdate {
            baudrate: Some(115200),
            ..Default::default()
        };
        if let Some(v) = update.baudrate {
            settings.baudrate = v;
        }
        assert_eq!(settings.baudrate, 115200);
        assert_eq!(settings.bytesize, defaults.bytesize);
    }
}
