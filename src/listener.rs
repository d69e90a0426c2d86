//! Binds the two TCP ports, accepts at most one concurrent client, and
//! rejects late arrivals with a busy banner while a session is active.

use std::io::Write;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::BridgeError;
use crate::redirector::{Redirector, Variant};
use crate::rfc2217::Rfc2217Codec;
use crate::supervisor::ProcessSupervisor;
use crate::virtual_serial::VirtualSerial;

const BUSY_MESSAGE: &[u8] = b"\r\nError: Device busy - another client is connected\r\n";
const GUARD_INTERVAL: Duration = Duration::from_millis(100);
const READ_TIMEOUT: Duration = Duration::from_millis(10);

#[derive(Clone, Copy, PartialEq, Eq)]
enum Protocol {
    Rfc2217,
    Raw,
}

impl Protocol {
    fn label(self) -> &'static str {
        match self {
            Protocol::Rfc2217 => "rfc2217",
            Protocol::Raw => "raw",
        }
    }
}

struct BoundListener {
    protocol: Protocol,
    listener: TcpListener,
}

/// Owns both listener sockets, the supervisor, and the long-lived
/// `VirtualSerial`, and runs the accept loop until shutdown is requested.
pub struct Dispatcher {
    listeners: Vec<BoundListener>,
    supervisor: Arc<ProcessSupervisor>,
    virtual_serial: Arc<Mutex<VirtualSerial>>,
}

impl Dispatcher {
    pub fn bind(config: &Config, supervisor: ProcessSupervisor, virtual_serial: VirtualSerial) -> Result<Self> {
        let mut listeners = Vec::new();
        if config.rfc2217_port != 0 {
            listeners.push(bind_one(&config.host, config.rfc2217_port, Protocol::Rfc2217)?);
        }
        if config.raw_port != 0 {
            listeners.push(bind_one(&config.host, config.raw_port, Protocol::Raw)?);
        }
        if listeners.is_empty() {
            anyhow::bail!("both rfc2217-port and raw-port are disabled; nothing to serve");
        }

        for entry in &listeners {
            entry.listener.set_nonblocking(true)?;
        }

        Ok(Self {
            listeners,
            supervisor: Arc::new(supervisor),
            virtual_serial: Arc::new(Mutex::new(virtual_serial)),
        })
    }

    /// Accept loop: runs until `shutdown` is flipped. Returns once the
    /// current session (if any) has ended and the child has been closed.
    pub fn run(self, shutdown: &AtomicBool) {
        while !shutdown.load(Ordering::SeqCst) {
            let Some((stream, peer, protocol)) = self.poll_accept(shutdown) else {
                continue;
            };

            info!("{} client connected from {}", protocol.label(), peer);
            let _ = stream.set_nodelay(true);

            if self.virtual_serial.lock().unwrap().has_process_exited() {
                if let Err(e) = self.recreate_child() {
                    warn!("failed to recreate child for new connection: {}", e);
                    continue;
                }
            }
            self.virtual_serial.lock().unwrap().reset_for_new_client();

            let guard_alive = Arc::new(AtomicBool::new(true));
            let guard_handle = self.spawn_connection_guard(protocol, Arc::clone(&guard_alive));

            let variant = match protocol {
                Protocol::Raw => Variant::Raw,
                Protocol::Rfc2217 => Variant::Rfc2217(Mutex::new(Rfc2217Codec::new())),
            };
            let redirector = Redirector::new(
                Arc::clone(&self.virtual_serial),
                Arc::clone(&self.supervisor),
                stream,
                variant,
            );
            redirector.shortcircuit();

            guard_alive.store(false, Ordering::SeqCst);
            let _ = guard_handle.join();
            info!("{} client disconnected", protocol.label());
        }

        match Arc::try_unwrap(self.virtual_serial) {
            Ok(mutex) => mutex.into_inner().unwrap().shutdown_pty(),
            Err(_) => warn!("virtual serial still shared at shutdown; child cleanup skipped"),
        }
    }

    fn poll_accept(&self, shutdown: &AtomicBool) -> Option<(TcpStream, SocketAddr, Protocol)> {
        loop {
            if shutdown.load(Ordering::SeqCst) {
                return None;
            }
            for entry in &self.listeners {
                match entry.listener.accept() {
                    Ok((stream, peer)) => return Some((stream, peer, entry.protocol)),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                    Err(e) => {
                        warn!("accept error on {} listener: {}", entry.protocol.label(), e);
                        continue;
                    }
                }
            }
            thread::sleep(Duration::from_millis(20));
        }
    }

    fn recreate_child(&self) -> Result<(), BridgeError> {
        let old = self.virtual_serial.lock().unwrap().take_pty();
        if let Some(old) = old {
            old.close();
        }
        let new_pty = self.supervisor.create()?;
        self.virtual_serial.lock().unwrap().install_pty(new_pty);
        Ok(())
    }

    /// Every 100 ms, non-blockingly accept any pending connection on the
    /// listener(s) other than the one currently in session, reject it
    /// with the busy banner, and close it.
    fn spawn_connection_guard(&self, active: Protocol, alive: Arc<AtomicBool>) -> thread::JoinHandle<()> {
        let others: Vec<TcpListener> = self
            .listeners
            .iter()
            .filter(|l| l.protocol != active)
            .map(|l| l.listener.try_clone().expect("listener clone for guard"))
            .collect();

        thread::spawn(move || {
            while alive.load(Ordering::SeqCst) {
                for listener in &others {
                    if let Ok((mut stream, peer)) = listener.accept() {
                        debug!("rejecting busy connection from {}", peer);
                        let _ = stream.write_all(BUSY_MESSAGE);
                        let _ = stream.shutdown(std::net::Shutdown::Both);
                    }
                }
                thread::sleep(GUARD_INTERVAL);
            }
        })
    }
}

fn bind_one(host: &str, port: u16, protocol: Protocol) -> Result<BoundListener> {
    let addr = format!("{host}:{port}");
    let listener = TcpListener::bind(&addr).map_err(|source| BridgeError::BindFailed {
        host: host.to_string(),
        port,
        source,
    })?;
    info!("{} listener bound on {}", protocol.label(), addr);
    Ok(BoundListener { protocol, listener })
}
