//! Command-line surface and the configuration it builds.
//!
//! Parsing, validation, and the child argv assembly live here so that
//! `main.rs` only has to call `Config::from_args` and act on the result.
//! Validation failures (missing executable, non-executable file, missing
//! working directory) exit the process before any network resource is
//! bound, which keeps `main.rs` from ever needing to unwind a half-bound
//! listener or a half-spawned child.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use crate::error::BridgeError;

/// Bridges a locally spawned REPL child process to RFC 2217 and raw TCP
/// serial-port endpoints.
#[derive(Parser, Debug, Clone)]
#[command(name = "mpremote-bridge")]
#[command(about = "Exposes a child REPL's PTY as RFC 2217 and raw TCP endpoints")]
#[command(version)]
pub struct Args {
    /// Path to the REPL executable to spawn
    pub executable: String,

    /// Arguments passed through verbatim to the child process
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub child_args: Vec<String>,

    /// Working directory for the child process
    #[arg(short = 'd', long = "directory")]
    pub directory: Option<PathBuf>,

    /// RFC 2217 listener port (0 disables it)
    #[arg(short = 'p', long = "rfc2217-port", default_value = "2217")]
    pub rfc2217_port: u16,

    /// Raw socket listener port (0 disables it)
    #[arg(short = 's', long = "raw-port", default_value = "2218")]
    pub raw_port: u16,

    /// Bind address for both listeners
    #[arg(long = "host", default_value = "0.0.0.0")]
    pub host: String,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Optimization level forwarded to the child as repeated -O
    #[arg(short = 'O', action = clap::ArgAction::Count)]
    pub optimize: u8,

    /// key=value options forwarded to the child as repeated -X key=value
    #[arg(short = 'X', value_name = "KEY=VALUE")]
    pub options: Vec<String>,

    /// Terminal rows to size the PTY with (defaults to 24 if undetectable)
    #[arg(long)]
    pub rows: Option<u16>,

    /// Terminal columns to size the PTY with (defaults to 80 if undetectable)
    #[arg(long)]
    pub cols: Option<u16>,
}

/// Fully resolved bridge configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// argv for the child process, with `-O`/`-X` options folded in.
    pub command: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub rfc2217_port: u16,
    pub raw_port: u16,
    pub host: String,
    pub verbosity: u8,
    pub rows: Option<u16>,
    pub cols: Option<u16>,
}

impl Config {
    /// Validate the parsed CLI arguments and build the child argv.
    ///
    /// Validation happens before any socket is bound: a missing or
    /// non-executable child binary, or a missing working directory, fails
    /// here rather than surfacing later as a confusing spawn error.
    pub fn from_args(args: Args) -> Result<Self> {
        let executable_path = PathBuf::from(&args.executable);
        if !executable_path.exists() {
            return Err(BridgeError::Configuration(format!(
                "executable not found: {}",
                args.executable
            ))
            .into());
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let meta = std::fs::metadata(&executable_path)
                .with_context(|| format!("failed to stat executable: {}", args.executable))?;
            if meta.permissions().mode() & 0o111 == 0 {
                return Err(BridgeError::Configuration(format!(
                    "executable is not executable: {}",
                    args.executable
                ))
                .into());
            }
        }

        if let Some(ref dir) = args.directory {
            if !dir.is_dir() {
                return Err(BridgeError::Configuration(format!(
                    "working directory does not exist: {}",
                    dir.display()
                ))
                .into());
            }
        }

        let mut command = vec![args.executable.clone()];
        for _ in 0..args.optimize {
            command.push("-O".to_string());
        }
        for opt in &args.options {
            command.push("-X".to_string());
            command.push(opt.clone());
        }
        command.extend(args.child_args.iter().cloned());

        Ok(Self {
            command,
            cwd: args.directory,
            rfc2217_port: args.rfc2217_port,
            raw_port: args.raw_port,
            host: args.host,
            verbosity: args.verbose,
            rows: args.rows,
            cols: args.cols,
        })
    }

    /// Map the `-v` counter to a `tracing_subscriber::EnvFilter` directive,
    /// overridable by `RUST_LOG`.
    pub fn log_directive(&self) -> &'static str {
        match self.verbosity {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_missing_executable() {
        let args = Args {
            executable: "/no/such/binary-xyz".to_string(),
            child_args: vec![],
            directory: None,
            rfc2217_port: 2217,
            raw_port: 2218,
            host: "0.0.0.0".to_string(),
            verbose: 0,
            optimize: 0,
            options: vec![],
            rows: None,
            cols: None,
        };
        assert!(Config::from_args(args).is_err());
    }

    #[test]
    fn builds_command_with_optimize_and_options() {
        let args = Args {
            executable: "/bin/sh".to_string(),
            child_args: vec!["-c".to_string(), "true".to_string()],
            directory: None,
            rfc2217_port: 2217,
            raw_port: 2218,
            host: "0.0.0.0".to_string(),
            verbose: 0,
            optimize: 2,
            options: vec!["heapsize=64k".to_string()],
            rows: None,
            cols: None,
        };
        let config = Config::from_args(args).unwrap();
        assert_eq!(
            config.command,
            vec![
                "/bin/sh",
                "-O",
                "-O",
                "-X",
                "heapsize=64k",
                "-c",
                "true"
            ]
        );
    }

    #[test]
    fn log_directive_scales_with_verbosity() {
        let base = Args {
            executable: "/bin/sh".to_string(),
            child_args: vec![],
            directory: None,
            rfc2217_port: 2217,
            raw_port: 2218,
            host: "0.0.0.0".to_string(),
            verbose: 0,
            optimize: 0,
            options: vec![],
            rows: None,
            cols: None,
        };
        let mut args = base;
        assert_eq!(Config::from_args(args.clone()).unwrap().log_directive(), "info");
        args.verbose = 1;
        assert_eq!(Config::from_args(args.clone()).unwrap().log_directive(), "debug");
        args.verbose = 2;
        assert_eq!(Config::from_args(args.clone()).unwrap().log_directive(), "trace");
    }
}
