//! Owns the child command line and produces `PtyProcess` replacements on
//! demand.
//!
//! The supervisor does not hold the live `PtyProcess` itself — ownership
//! of the *current* child lives in `VirtualSerial`, which the redirector
//! swaps during a soft reboot. `create`/`restart` take the outgoing
//! process by value so they can close it before handing back its
//! replacement, which keeps "at most one live child at a time" true
//! without a second copy of the pointer floating around.

use std::path::PathBuf;
use std::sync::Mutex;

use tracing::info;

use crate::error::BridgeError;
use crate::pty::PtyProcess;
use crate::virtual_serial::VirtualSerial;

pub struct ProcessSupervisor {
    command: Vec<String>,
    cwd: Option<PathBuf>,
}

impl ProcessSupervisor {
    pub fn new(command: Vec<String>, cwd: Option<PathBuf>) -> Self {
        Self { command, cwd }
    }

    /// Spawn the initial child.
    pub fn create(&self) -> Result<PtyProcess, BridgeError> {
        PtyProcess::spawn(&self.command, self.cwd.as_deref())
            .map_err(|e| BridgeError::SpawnFailed(e.to_string()))
    }

    /// Close `previous` and spawn its replacement, logging the event as a
    /// soft reboot rather than a cold start. A spawn failure here is
    /// session-fatal: there is no retry policy, so the caller has to treat
    /// it as the end of the current session.
    pub fn restart(&self, previous: PtyProcess) -> Result<PtyProcess, BridgeError> {
        previous.close();
        info!("soft reboot: restarting child process");
        PtyProcess::spawn(&self.command, self.cwd.as_deref())
            .map_err(|e| BridgeError::RestartFailed(e.to_string()))
    }

    /// Close the current child at shutdown.
    pub fn cleanup(&self, current: PtyProcess) {
        current.close();
    }

    /// Close the child currently installed in `vs` and swap in its
    /// replacement, used by the redirector's soft-reboot dance. The
    /// outgoing process is taken out and closed before the replacement is
    /// spawned, so there is never a window with two live children, and a
    /// spawn failure leaves `vs` with no child rather than a half-closed
    /// one.
    pub fn restart_and_install(&self, vs: &Mutex<VirtualSerial>) -> Result<(), BridgeError> {
        let previous = vs.lock().unwrap().take_pty();
        let new_pty = match previous {
            Some(previous) => self.restart(previous)?,
            None => {
                info!("soft reboot: restarting child process");
                PtyProcess::spawn(&self.command, self.cwd.as_deref())
                    .map_err(|e| BridgeError::RestartFailed(e.to_string()))?
            }
        };
        vs.lock().unwrap().install_pty(new_pty);
        Ok(())
    }
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;

    #[test]
    fn create_spawns_a_running_child() {
        let supervisor = ProcessSupervisor::new(vec!["/bin/cat".to_string()], None);
        let pty = supervisor.create().unwrap();
        assert!(pty.is_alive());
        supervisor.cleanup(pty);
    }

    #[test]
    fn restart_closes_previous_and_spawns_new() {
        let supervisor = ProcessSupervisor::new(vec!["/bin/cat".to_string()], None);
        let first = supervisor.create().unwrap();
        let second = supervisor.restart(first).unwrap();
        assert!(second.is_alive());
        supervisor.cleanup(second);
    }

    #[test]
    fn create_fails_for_missing_executable() {
        let supervisor = ProcessSupervisor::new(vec!["/no/such/binary".to_string()], None);
        // exec failure happens in the forked child and surfaces as an
        // immediate exit, not a spawn error, on POSIX — so `create`
        // itself only fails if fork/openpty fail. Exercise that the
        // resulting process reports itself as not alive shortly after.
        let pty = supervisor.create().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(100));
        assert!(!pty.is_alive());
        supervisor.cleanup(pty);
    }
}
