use clap::{Args, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use dmsgprims_frame::header::{BASECMD_MASK, PROTO_MASK};
use dmsgprims_frame::{DBG_SHELL, LNK_AUTH, LNK_CONN, LNK_ERROR, LNK_PAD, LNK_PING, LNK_SPAN};
use dmsgprims_iocom::IocomHandle;

use crate::exit::{CliError, CliResult, INTERNAL, SUCCESS};
use crate::output::OutputFormat;

pub mod echo;
pub mod listen;
pub mod send;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start an echo server.
    Echo(EchoArgs),
    /// Send a single-message transaction.
    Send(SendArgs),
    /// Listen and print received frames.
    Listen(ListenArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Echo(args) => echo::run(args, format),
        Command::Send(args) => send::run(args, format),
        Command::Listen(args) => listen::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct EchoArgs {
    /// Socket path to bind.
    pub path: PathBuf,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Socket path to connect to.
    pub path: PathBuf,
    /// Command: a name (ping, auth, conn, span, error, pad, shell) or a
    /// base command number (decimal or 0x hex).
    #[arg(long, default_value = "ping", value_parser = parse_command)]
    pub cmd: u32,
    /// Raw string payload.
    #[arg(long, conflicts_with = "file")]
    pub data: Option<String>,
    /// Read payload from file.
    #[arg(long, conflicts_with = "data")]
    pub file: Option<PathBuf>,
    /// Wait for the reply and print it.
    #[arg(long)]
    pub wait: bool,
    /// Maximum time to wait for the reply when --wait is set (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub wait_timeout: String,
}

#[derive(Args, Debug)]
pub struct ListenArgs {
    /// Socket path to bind.
    pub path: PathBuf,
    /// Exit after printing N frames.
    #[arg(long)]
    pub count: Option<usize>,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// Parse a `--cmd` value into a command word without flags.
pub fn parse_command(input: &str) -> Result<u32, String> {
    let named = match input.to_ascii_lowercase().as_str() {
        "pad" => Some(LNK_PAD),
        "ping" => Some(LNK_PING),
        "auth" => Some(LNK_AUTH),
        "conn" => Some(LNK_CONN),
        "span" => Some(LNK_SPAN),
        "error" => Some(LNK_ERROR),
        "shell" => Some(DBG_SHELL),
        _ => None,
    };
    if let Some(cmd) = named {
        return Ok(cmd);
    }

    let value = match input.strip_prefix("0x").or_else(|| input.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => input.parse(),
    }
    .map_err(|_| format!("unknown command: {input}"))?;

    // Protocol and base command together span 16 bits.
    if value == 0 || value > (PROTO_MASK | BASECMD_MASK) >> 8 {
        return Err(format!("command out of range: {input}"));
    }
    Ok(value << 8)
}

/// The connection a serving command is running, shared with Ctrl-C.
#[derive(Default)]
pub struct Session {
    current: Mutex<Option<IocomHandle>>,
    stopping: AtomicBool,
}

impl Session {
    pub fn serve(&self, handle: IocomHandle) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    pub fn idle(&self) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }
}

/// Ctrl-C closes the connection being served, or exits while idle.
pub fn install_ctrlc_handler(session: Arc<Session>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        session.stopping.store(true, Ordering::SeqCst);
        let handle = session
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match handle {
            Some(handle) => handle.shutdown(),
            None => std::process::exit(SUCCESS),
        }
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}
