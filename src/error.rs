//! Error kinds the core distinguishes from one another.
//!
//! Most fallible operations in this crate return `anyhow::Result` and are
//! logged and converted to a state transition at the flow boundary (see
//! `redirector.rs`). The enum here exists for the handful of places that
//! need to pattern-match on *which* kind of failure occurred: spawn-failed
//! is fatal at startup but session-fatal during a restart, while pty-io
//! just marks the serial façade closed.

/// Error kinds distinguished by the session core.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The child process could not be started.
    #[error("failed to spawn child process: {0}")]
    SpawnFailed(String),

    /// A restart produced no usable replacement child.
    #[error("failed to restart child process: {0}")]
    RestartFailed(String),

    /// A read or write against the PTY failed for a reason other than the
    /// ordinary "child exited" case.
    #[error("pty i/o error: {0}")]
    PtyIo(String),

    /// A TCP listener could not be bound.
    #[error("failed to bind listener on {host}:{port}: {source}")]
    BindFailed {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// Something in the external CLI configuration is invalid and must
    /// abort startup before any network resource is touched.
    #[error("invalid configuration: {0}")]
    Configuration(String),
}
