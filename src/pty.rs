//! Platform-specific wrapper owning a child process and its controlling
//! pseudo-terminal.
//!
//! `PtyProcess` hides the POSIX master/slave PTY vs. Windows ConPTY split
//! behind one API: timed `read`, best-effort `write`, non-blocking
//! `poll`/`is_alive`, and `close`. Neither `read` nor `write` ever
//! propagates an error for an ordinary closed-PTY condition — they return
//! empty/zero instead, so callers (in particular `VirtualSerial`) don't
//! need to special-case disconnection on every call.

use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

/// Identity of one spawned child: its argv, the PTY master handle, and the
/// exit status once observed. One `PtyProcess` is owned by exactly one
/// `VirtualSerial` at a time (enforced by ownership, not a runtime check).
#[cfg(unix)]
pub struct PtyProcess {
    master_fd: std::os::fd::OwnedFd,
    child_pid: nix::unistd::Pid,
    exit_code: std::sync::Mutex<Option<i32>>,
}

#[cfg(windows)]
pub struct PtyProcess {
    inner: windows_impl::WindowsPty,
}

#[cfg(unix)]
mod posix_impl {
    use super::*;
    use nix::fcntl::{fcntl, FcntlArg, OFlag};
    use nix::libc;
    use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
    use nix::pty::{openpty, OpenptyResult, Winsize};
    use nix::sys::signal::{self, Signal};
    use nix::sys::termios::{cfmakeraw, tcsetattr, SetArg};
    use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
    use nix::unistd::{dup2, execvp, fork, read, setsid, write, ForkResult};
    use std::ffi::CString;
    use std::os::fd::AsRawFd;
    use std::time::Instant;

    impl PtyProcess {
        /// Fork, open a PTY pair, and exec `argv[0]` with the slave as its
        /// controlling terminal. `cwd` is applied in the child before exec.
        pub fn spawn(argv: &[String], cwd: Option<&std::path::Path>) -> Result<Self> {
            if argv.is_empty() {
                anyhow::bail!("command cannot be empty");
            }

            let winsize = Winsize {
                ws_row: 24,
                ws_col: 80,
                ws_xpixel: 0,
                ws_ypixel: 0,
            };

            let OpenptyResult { master, slave } =
                openpty(&winsize, None).context("failed to open pty")?;

            // Put the slave side into raw mode: no canonical line editing,
            // no kernel echo. Without this the tty driver would echo the
            // client's own input back before the child ever sees it,
            // doubling everything the remote client reads.
            {
                let mut term = nix::sys::termios::tcgetattr(&slave).context("tcgetattr on pty slave")?;
                cfmakeraw(&mut term);
                tcsetattr(&slave, SetArg::TCSANOW, &term).context("tcsetattr on pty slave")?;
            }

            match unsafe { fork() }.context("failed to fork")? {
                ForkResult::Parent { child } => {
                    drop(slave);

                    let flags = fcntl(master.as_raw_fd(), FcntlArg::F_GETFL)?;
                    let flags = OFlag::from_bits_truncate(flags);
                    fcntl(
                        master.as_raw_fd(),
                        FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK),
                    )?;

                    info!("spawned child process with pid {}", child);

                    Ok(Self {
                        master_fd: master,
                        child_pid: child,
                        exit_code: std::sync::Mutex::new(None),
                    })
                }
                ForkResult::Child => {
                    drop(master);
                    setsid().ok();

                    unsafe {
                        libc::ioctl(slave.as_raw_fd(), libc::TIOCSCTTY as libc::c_ulong, 0);
                    }

                    let slave_raw = slave.as_raw_fd();
                    dup2(slave_raw, libc::STDIN_FILENO).ok();
                    dup2(slave_raw, libc::STDOUT_FILENO).ok();
                    dup2(slave_raw, libc::STDERR_FILENO).ok();
                    if slave_raw > 2 {
                        drop(slave);
                    }

                    if let Some(dir) = cwd {
                        if std::env::set_current_dir(dir).is_err() {
                            std::process::exit(127);
                        }
                    }

                    let cmd = CString::new(argv[0].as_str()).unwrap();
                    let args: Vec<CString> = argv
                        .iter()
                        .map(|s| CString::new(s.as_str()).unwrap())
                        .collect();

                    let _ = execvp(&cmd, &args);
                    // execvp only returns on failure.
                    std::process::exit(127);
                }
            }
        }

        /// Read up to `max` bytes with a readiness poll capped at
        /// `timeout`. Never raises: closed/broken PTYs and timeouts both
        /// yield an empty vector.
        pub fn read(&self, max: usize, timeout: Duration) -> Vec<u8> {
            let fd = self.master_fd.as_raw_fd();
            let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
            let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];

            let timeout_ms: u16 = timeout.as_millis().min(u16::MAX as u128) as u16;
            match poll(&mut fds, PollTimeout::from(timeout_ms)) {
                Ok(0) | Err(_) => return Vec::new(),
                Ok(_) => {}
            }

            let revents = fds[0].revents().unwrap_or(PollFlags::empty());
            if !revents.contains(PollFlags::POLLIN) {
                if revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR) {
                    self.mark_exited_if_unset();
                }
                return Vec::new();
            }

            let cap = max.max(1);
            let mut buf = vec![0u8; cap];
            match read(fd, &mut buf) {
                Ok(0) => {
                    self.mark_exited_if_unset();
                    Vec::new()
                }
                Ok(n) => {
                    buf.truncate(n);
                    buf
                }
                Err(nix::errno::Errno::EAGAIN) => Vec::new(),
                Err(nix::errno::Errno::EIO) => {
                    self.mark_exited_if_unset();
                    Vec::new()
                }
                Err(e) => {
                    warn!("pty read error: {}", e);
                    Vec::new()
                }
            }
        }

        /// Write `data` to the child's stdin. Never raises: returns 0 on
        /// a closed or broken PTY instead of propagating an error.
        pub fn write(&self, data: &[u8]) -> usize {
            match write(&self.master_fd, data) {
                Ok(n) => n,
                Err(nix::errno::Errno::EAGAIN) => 0,
                Err(e) => {
                    debug!("pty write error: {}", e);
                    0
                }
            }
        }

        /// Non-blocking check of child status. Returns the exit code (or
        /// a synthetic 128+signal for a signal death) once observed.
        pub fn poll(&self) -> Option<i32> {
            if let Some(code) = *self.exit_code.lock().unwrap() {
                return Some(code);
            }

            match waitpid(self.child_pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(_, code)) => {
                    *self.exit_code.lock().unwrap() = Some(code);
                    Some(code)
                }
                Ok(WaitStatus::Signaled(_, sig, _)) => {
                    let code = 128 + sig as i32;
                    *self.exit_code.lock().unwrap() = Some(code);
                    Some(code)
                }
                Ok(_) => None,
                Err(nix::errno::Errno::ECHILD) => {
                    *self.exit_code.lock().unwrap() = Some(-1);
                    Some(-1)
                }
                Err(e) => {
                    warn!("waitpid error: {}", e);
                    None
                }
            }
        }

        pub fn is_alive(&self) -> bool {
            self.poll().is_none()
        }

        /// Resize the PTY's window size.
        pub fn resize(&self, rows: u16, cols: u16) -> std::result::Result<(), crate::error::BridgeError> {
            let winsize = Winsize {
                ws_row: rows,
                ws_col: cols,
                ws_xpixel: 0,
                ws_ypixel: 0,
            };
            unsafe {
                if libc::ioctl(self.master_fd.as_raw_fd(), libc::TIOCSWINSZ, &winsize) < 0 {
                    return Err(crate::error::BridgeError::PtyIo(
                        "ioctl TIOCSWINSZ failed".to_string(),
                    ));
                }
            }
            Ok(())
        }

        /// Terminate the child: SIGTERM, grace period, SIGKILL after 2s,
        /// then release the PTY master.
        pub fn close(self) {
            if self.is_alive() {
                let _ = signal::kill(self.child_pid, Signal::SIGTERM);

                let start = Instant::now();
                let mut reaped = false;
                while start.elapsed() < Duration::from_secs(2) {
                    match waitpid(self.child_pid, Some(WaitPidFlag::WNOHANG)) {
                        Ok(WaitStatus::Exited(_, _)) | Ok(WaitStatus::Signaled(_, _, _)) => {
                            reaped = true;
                            break;
                        }
                        Ok(WaitStatus::StillAlive) => {
                            std::thread::sleep(Duration::from_millis(50));
                        }
                        _ => {
                            reaped = true;
                            break;
                        }
                    }
                }

                if !reaped {
                    let _ = signal::kill(self.child_pid, Signal::SIGKILL);
                    let _ = waitpid(self.child_pid, None);
                }
            }
            // self.master_fd drops here, releasing the PTY.
        }

        fn mark_exited_if_unset(&self) {
            let mut slot = self.exit_code.lock().unwrap();
            if slot.is_none() {
                *slot = Some(self.poll_raw_or_placeholder());
            }
        }

        fn poll_raw_or_placeholder(&self) -> i32 {
            match waitpid(self.child_pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(_, code)) => code,
                Ok(WaitStatus::Signaled(_, sig, _)) => 128 + sig as i32,
                _ => -1,
            }
        }
    }

    impl Drop for PtyProcess {
        fn drop(&mut self) {
            if self.is_alive() {
                let _ = signal::kill(self.child_pid, Signal::SIGTERM);
            }
        }
    }
}

#[cfg(windows)]
mod windows_impl {
    //! ConPTY-backed implementation, grounded in the real-world ConPTY
    //! binding shape used by `vercel-turborepo`'s `portable-pty` crate
    //! (`CreatePseudoConsole`/`ResizePseudoConsole`/`ClosePseudoConsole`),
    //! reimplemented here directly against `winapi` instead of adopting
    //! that crate's `filedescriptor`/`shared_library` dependencies, since
    //! the functions this crate needs (`CreatePseudoConsole` and friends)
    //! are statically exported by `winapi`'s own `consoleapi` bindings.
    //! Exercised only on Windows; not compiled or run in this environment.
    use super::*;
    use regex::bytes::Regex;
    use std::ffi::OsStr;
    use std::fs::File;
    use std::io::{Read as _, Write as _};
    use std::os::windows::ffi::OsStrExt;
    use std::os::windows::io::FromRawHandle;
    use std::ptr;
    use std::sync::Mutex;
    use std::time::Duration as StdDuration;
    use winapi::shared::minwindef::DWORD;
    use winapi::um::consoleapi::{ClosePseudoConsole, CreatePseudoConsole, ResizePseudoConsole};
    use winapi::um::handleapi::{CloseHandle, INVALID_HANDLE_VALUE};
    use winapi::um::minwinbase::STILL_ACTIVE;
    use winapi::um::namedpipeapi::CreatePipe;
    use winapi::um::processthreadsapi::{
        CreateProcessW, DeleteProcThreadAttributeList, GetExitCodeProcess,
        InitializeProcThreadAttributeList, TerminateProcess, UpdateProcThreadAttribute,
        PROCESS_INFORMATION, STARTUPINFOW,
    };
    use winapi::um::synchapi::WaitForSingleObject;
    use winapi::um::winbase::{
        CREATE_UNICODE_ENVIRONMENT, EXTENDED_STARTUPINFO_PRESENT, INFINITE, STARTF_USESTDHANDLES,
        STARTUPINFOEXW,
    };
    use winapi::um::wincon::COORD;
    use winapi::um::winnt::HANDLE;

    /// `PROC_THREAD_ATTRIBUTE_PSEUDOCONSOLE`. Not yet present in the
    /// `winapi` crate's `processthreadsapi` bindings; this is the constant
    /// the Windows SDK headers define it as.
    const PROC_THREAD_ATTRIBUTE_PSEUDOCONSOLE: usize = 0x0002_0016;

    pub struct WindowsPty {
        hpcon: HANDLE,
        process: HANDLE,
        input_write: File,
        output_read: File,
        exit_code: Mutex<Option<i32>>,
        csi_re: Regex,
    }

    // The ConPTY/process handles are only touched through this type's own
    // methods, all of which take &self and serialize via the OS
    // (CreateProcess/WaitForSingleObject are thread-safe), so Send is sound.
    unsafe impl Send for WindowsPty {}

    impl PtyProcess {
        pub fn spawn(argv: &[String], cwd: Option<&std::path::Path>) -> Result<Self> {
            let inner = windows_impl::WindowsPty::spawn(argv, cwd, 80, 25)?;
            Ok(Self { inner })
        }

        pub fn read(&self, max: usize, timeout: Duration) -> Vec<u8> {
            self.inner.read(max, timeout)
        }

        pub fn write(&self, data: &[u8]) -> usize {
            self.inner.write(data)
        }

        pub fn poll(&self) -> Option<i32> {
            self.inner.poll()
        }

        pub fn is_alive(&self) -> bool {
            self.inner.poll().is_none()
        }

        pub fn resize(&self, rows: u16, cols: u16) -> std::result::Result<(), crate::error::BridgeError> {
            self.inner.resize(rows, cols)
        }

        pub fn close(self) {
            self.inner.close();
        }
    }

    impl WindowsPty {
        /// Create the pseudo console, launch `argv[0]` attached to it, and
        /// kick off the DA1 device-attributes handshake the child expects
        /// from a real terminal shortly after start.
        fn spawn(
            argv: &[String],
            cwd: Option<&std::path::Path>,
            cols: i16,
            rows: i16,
        ) -> Result<Self> {
            if argv.is_empty() {
                anyhow::bail!("command cannot be empty");
            }

            let (console_in_read, our_input_write) =
                create_pipe().context("failed to create conpty input pipe")?;
            let (our_output_read, console_out_write) =
                create_pipe().context("failed to create conpty output pipe")?;

            let mut hpcon: HANDLE = ptr::null_mut();
            let hr = unsafe {
                CreatePseudoConsole(
                    COORD { X: cols, Y: rows },
                    console_in_read,
                    console_out_write,
                    0,
                    &mut hpcon,
                )
            };
            // ConPTY duplicates the handles it needs; the ends we handed
            // it are no longer ours to keep open.
            unsafe {
                CloseHandle(console_in_read);
                CloseHandle(console_out_write);
            }
            if hr != 0 {
                unsafe {
                    CloseHandle(our_input_write);
                    CloseHandle(our_output_read);
                }
                anyhow::bail!("CreatePseudoConsole failed: HRESULT {:#x}", hr);
            }

            let spawn_result = spawn_attached(argv, cwd, hpcon);
            let process = match spawn_result {
                Ok(handle) => handle,
                Err(e) => {
                    unsafe {
                        ClosePseudoConsole(hpcon);
                        CloseHandle(our_input_write);
                        CloseHandle(our_output_read);
                    }
                    return Err(e);
                }
            };

            let input_write = unsafe { File::from_raw_handle(our_input_write as _) };
            let output_read = unsafe { File::from_raw_handle(our_output_read as _) };

            let da1_write = input_write
                .try_clone()
                .context("clone conpty input handle for DA1 handshake")?;
            std::thread::spawn(move || {
                std::thread::sleep(StdDuration::from_millis(100));
                let mut f = da1_write;
                let _ = f.write_all(DA1_RESPONSE);
            });

            let csi_re =
                Regex::new(r"\x1B\[[0-9;?]*[A-Za-z]").expect("static CSI pattern is valid");

            Ok(Self {
                hpcon,
                process,
                input_write,
                output_read,
                exit_code: Mutex::new(None),
                csi_re,
            })
        }

        fn read(&self, max: usize, _timeout: Duration) -> Vec<u8> {
            let mut buf = vec![0u8; max.max(1)];
            let mut file = &self.output_read;
            match file.read(&mut buf) {
                Ok(0) => Vec::new(),
                Ok(n) => {
                    buf.truncate(n);
                    let normalized = normalize_crlf(&buf);
                    strip_csi(&self.csi_re, &normalized)
                }
                Err(_) => Vec::new(),
            }
        }

        fn write(&self, data: &[u8]) -> usize {
            let mut file = &self.input_write;
            file.write(data).unwrap_or(0)
        }

        fn poll(&self) -> Option<i32> {
            if let Some(code) = *self.exit_code.lock().unwrap() {
                return Some(code);
            }
            let mut status: DWORD = 0;
            let ok = unsafe { GetExitCodeProcess(self.process, &mut status) };
            if ok == 0 {
                // GetExitCodeProcess itself failed (e.g. the handle is bad).
                // Reporting "still running" here would hang the session
                // waiting for a process that can no longer be observed, so
                // treat this the same as an exit rather than conflating it
                // with "still running".
                let code = -1;
                *self.exit_code.lock().unwrap() = Some(code);
                return Some(code);
            }
            if status == STILL_ACTIVE {
                return None;
            }
            let code = status as i32;
            *self.exit_code.lock().unwrap() = Some(code);
            Some(code)
        }

        fn resize(&self, rows: u16, cols: u16) -> std::result::Result<(), crate::error::BridgeError> {
            let size = COORD {
                X: cols as i16,
                Y: rows as i16,
            };
            let hr = unsafe { ResizePseudoConsole(self.hpcon, size) };
            if hr != 0 {
                return Err(crate::error::BridgeError::PtyIo(format!(
                    "ResizePseudoConsole failed: HRESULT {hr:#x}"
                )));
            }
            Ok(())
        }

        fn close(self) {
            if self.poll().is_none() {
                unsafe {
                    TerminateProcess(self.process, 1);
                    WaitForSingleObject(self.process, INFINITE);
                }
            }
            unsafe {
                ClosePseudoConsole(self.hpcon);
                CloseHandle(self.process);
            }
        }
    }

    /// Create an anonymous pipe. Returns `(read_handle, write_handle)`.
    fn create_pipe() -> Result<(HANDLE, HANDLE)> {
        let mut read_handle: HANDLE = ptr::null_mut();
        let mut write_handle: HANDLE = ptr::null_mut();
        let ok = unsafe { CreatePipe(&mut read_handle, &mut write_handle, ptr::null_mut(), 0) };
        if ok == 0 {
            anyhow::bail!("CreatePipe failed: {}", std::io::Error::last_os_error());
        }
        Ok((read_handle, write_handle))
    }

    /// Build the proc-thread attribute list binding `hpcon` to the child
    /// and `CreateProcessW` it, returning the process handle. The thread
    /// handle is closed immediately since nothing in this crate waits on
    /// threads directly.
    fn spawn_attached(argv: &[String], cwd: Option<&std::path::Path>, hpcon: HANDLE) -> Result<HANDLE> {
        let mut attr_list_size: usize = 0;
        unsafe {
            InitializeProcThreadAttributeList(ptr::null_mut(), 1, 0, &mut attr_list_size);
        }
        let mut attr_list_buf = vec![0u8; attr_list_size];
        let attr_list = attr_list_buf.as_mut_ptr() as winapi::um::processthreadsapi::LPPROC_THREAD_ATTRIBUTE_LIST;
        let ok = unsafe { InitializeProcThreadAttributeList(attr_list, 1, 0, &mut attr_list_size) };
        if ok == 0 {
            anyhow::bail!(
                "InitializeProcThreadAttributeList failed: {}",
                std::io::Error::last_os_error()
            );
        }

        let ok = unsafe {
            UpdateProcThreadAttribute(
                attr_list,
                0,
                PROC_THREAD_ATTRIBUTE_PSEUDOCONSOLE,
                hpcon as *mut _,
                std::mem::size_of::<HANDLE>(),
                ptr::null_mut(),
                ptr::null_mut(),
            )
        };
        if ok == 0 {
            unsafe { DeleteProcThreadAttributeList(attr_list) };
            anyhow::bail!(
                "UpdateProcThreadAttribute failed: {}",
                std::io::Error::last_os_error()
            );
        }

        let mut startup_info: STARTUPINFOEXW = unsafe { std::mem::zeroed() };
        startup_info.StartupInfo.cb = std::mem::size_of::<STARTUPINFOEXW>() as u32;
        startup_info.StartupInfo.dwFlags = STARTF_USESTDHANDLES;
        startup_info.StartupInfo.hStdInput = INVALID_HANDLE_VALUE;
        startup_info.StartupInfo.hStdOutput = INVALID_HANDLE_VALUE;
        startup_info.StartupInfo.hStdError = INVALID_HANDLE_VALUE;
        startup_info.lpAttributeList = attr_list;

        let mut cmdline = to_wide(&build_command_line(argv));
        let cwd_wide = cwd.map(|c| to_wide(&c.display().to_string()));

        let mut process_info: PROCESS_INFORMATION = unsafe { std::mem::zeroed() };
        let ok = unsafe {
            CreateProcessW(
                ptr::null(),
                cmdline.as_mut_ptr(),
                ptr::null_mut(),
                ptr::null_mut(),
                0,
                EXTENDED_STARTUPINFO_PRESENT | CREATE_UNICODE_ENVIRONMENT,
                ptr::null_mut(),
                cwd_wide.as_ref().map_or(ptr::null(), |c| c.as_ptr()),
                &mut startup_info.StartupInfo as *mut STARTUPINFOW,
                &mut process_info,
            )
        };

        unsafe { DeleteProcThreadAttributeList(attr_list) };

        if ok == 0 {
            anyhow::bail!(
                "CreateProcessW failed: {}",
                std::io::Error::last_os_error()
            );
        }

        unsafe {
            CloseHandle(process_info.hThread);
        }
        Ok(process_info.hProcess)
    }

    fn to_wide(s: &str) -> Vec<u16> {
        OsStr::new(s).encode_wide().chain(std::iter::once(0)).collect()
    }

    /// Quote each argument per the Windows `CommandLineToArgvW` convention
    /// and join with spaces, the format `CreateProcessW`'s `lpCommandLine`
    /// expects.
    fn build_command_line(argv: &[String]) -> String {
        argv.iter().map(|a| quote_arg(a)).collect::<Vec<_>>().join(" ")
    }

    fn quote_arg(arg: &str) -> String {
        if !arg.is_empty() && !arg.contains([' ', '\t', '"']) {
            return arg.to_string();
        }
        let mut out = String::with_capacity(arg.len() + 2);
        out.push('"');
        let mut chars = arg.chars().peekable();
        while let Some(c) = chars.next() {
            let mut backslashes = 0;
            if c == '\\' {
                backslashes = 1;
                while chars.peek() == Some(&'\\') {
                    backslashes += 1;
                    chars.next();
                }
                if chars.peek() == Some(&'"') || chars.peek().is_none() {
                    out.extend(std::iter::repeat('\\').take(backslashes * 2));
                } else {
                    out.extend(std::iter::repeat('\\').take(backslashes));
                }
                continue;
            }
            if c == '"' {
                out.push('\\');
            }
            out.push(c);
        }
        out.push('"');
        out
    }

    /// Replace every `\r\r\n` with `\r\n`. ConPTY doubles the carriage
    /// return on lines the child writes with a bare `\n`; undoing that
    /// here keeps the wire output identical to the POSIX path's.
    fn normalize_crlf(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len());
        let mut i = 0;
        while i < data.len() {
            if data[i..].starts_with(b"\r\r\n") {
                out.extend_from_slice(b"\r\n");
                i += 3;
            } else {
                out.push(data[i]);
                i += 1;
            }
        }
        out
    }

    /// Delete every substring matching `ESC [ [0-9;?]* <letter>`.
    fn strip_csi(re: &Regex, data: &[u8]) -> Vec<u8> {
        re.replace_all(data, &b""[..]).into_owned()
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn normalizes_doubled_crlf() {
            assert_eq!(normalize_crlf(b"a\r\r\nb"), b"a\r\nb".to_vec());
        }

        #[test]
        fn strips_csi_sequences() {
            let re = Regex::new(r"\x1B\[[0-9;?]*[A-Za-z]").unwrap();
            assert_eq!(strip_csi(&re, b"\x1b[1;1RHello\x1b[0m"), b"Hello".to_vec());
        }

        #[test]
        fn quotes_argument_with_space() {
            assert_eq!(quote_arg("hello world"), "\"hello world\"");
            assert_eq!(quote_arg("plain"), "plain");
        }

        #[test]
        fn builds_command_line_from_argv() {
            let argv = vec!["C:\\python.exe".to_string(), "-O".to_string(), "script with space.py".to_string()];
            assert_eq!(
                build_command_line(&argv),
                "C:\\python.exe -O \"script with space.py\""
            );
        }
    }
}

/// Send the DA1 device-attributes response a VT-capable terminal would
/// give: `ESC [ ? 1 ; 0 c`. The Windows child queries this shortly after
/// start and blocks until it gets an answer.
pub const DA1_RESPONSE: &[u8] = b"\x1b[?1;0c";

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[cfg(unix)]
    #[test]
    fn spawn_echo_round_trip() {
        let pty = PtyProcess::spawn(&["/bin/cat".to_string()], None).unwrap();
        assert!(pty.is_alive());
        let written = pty.write(b"hello\n");
        assert_eq!(written, 6);

        let mut collected = Vec::new();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while collected.len() < 6 && std::time::Instant::now() < deadline {
            let chunk = pty.read(4096, Duration::from_millis(100));
            collected.extend_from_slice(&chunk);
        }
        assert!(collected.starts_with(b"hello"));
        pty.close();
    }

    #[cfg(unix)]
    #[test]
    fn close_terminates_child() {
        let pty = PtyProcess::spawn(&["/bin/sleep".to_string(), "30".to_string()], None).unwrap();
        assert!(pty.is_alive());
        pty.close();
    }

    #[cfg(unix)]
    #[test]
    fn poll_reports_exit_code() {
        let pty = PtyProcess::spawn(
            &["/bin/sh".to_string(), "-c".to_string(), "exit 7".to_string()],
            None,
        )
        .unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        let mut code = None;
        while code.is_none() && std::time::Instant::now() < deadline {
            code = pty.poll();
            if code.is_none() {
                std::thread::sleep(Duration::from_millis(20));
            }
        }
        assert_eq!(code, Some(7));
    }
}
