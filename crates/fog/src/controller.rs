//! The surface we present to our own parent process.
//!
//! From the parent's point of view fog is just another managed
//! transport: requests arrive through `TOR_PT_*` environment
//! variables, and answers leave as protocol lines on stdout.  Nothing
//! else in the program may write to stdout.

use std::collections::HashMap;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

use fog_ptmgr::TRANSPORT_PROTOCOL_VERSION;

/// What the parent's environment told us to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PtEnv {
    /// Chain aliases the parent wants served.  The single entry `*`
    /// means "everything you have".
    pub(crate) requested: Vec<String>,
    /// State directory the parent set aside for us, if any.
    pub(crate) state_location: Option<PathBuf>,
    /// Whether the parent promised to close our stdin when it dies.
    pub(crate) exit_on_stdin_close: bool,
}

/// A problem with the parent's environment.
#[derive(Debug, Clone, Error)]
pub(crate) enum EnvError {
    /// The parent speaks no managed-transport version we do.
    #[error("no common managed-transport protocol version")]
    NoCommonVersion,

    /// A required variable was absent.
    #[error("required environment variable {0} is missing")]
    Missing(&'static str),
}

/// Interpret the `TOR_PT_*` variables in `vars`.
pub(crate) fn parse_env(vars: &HashMap<String, String>) -> Result<PtEnv, EnvError> {
    let versions = vars
        .get("TOR_PT_MANAGED_TRANSPORT_VER")
        .ok_or(EnvError::Missing("TOR_PT_MANAGED_TRANSPORT_VER"))?;
    if !versions.split(',').any(|v| v == TRANSPORT_PROTOCOL_VERSION) {
        return Err(EnvError::NoCommonVersion);
    }
    let transports = vars
        .get("TOR_PT_CLIENT_TRANSPORTS")
        .ok_or(EnvError::Missing("TOR_PT_CLIENT_TRANSPORTS"))?;
    let requested: Vec<String> = transports
        .split(',')
        .filter(|name| !name.is_empty())
        .map(str::to_owned)
        .collect();

    Ok(PtEnv {
        requested,
        state_location: vars.get("TOR_PT_STATE_LOCATION").map(PathBuf::from),
        exit_on_stdin_close: vars.get("TOR_PT_EXIT_ON_STDIN_CLOSE").map(String::as_str)
            == Some("1"),
    })
}

/// Writer for the protocol lines we owe the parent.
///
/// One line per call, flushed immediately: the parent reads these as
/// they appear, and a line held back in a buffer is a hung handshake.
#[derive(Debug, Default)]
pub(crate) struct Controller {}

impl Controller {
    /// Return a controller writing to this process's stdout.
    pub(crate) fn new() -> Controller {
        Controller {}
    }

    /// Emit one protocol line.
    fn emit(&mut self, line: &str) -> io::Result<()> {
        let mut out = io::stdout().lock();
        out.write_all(line.as_bytes())?;
        out.write_all(b"\n")?;
        out.flush()
    }

    /// Tell the parent which protocol version we speak.
    pub(crate) fn version(&mut self) -> io::Result<()> {
        self.emit(&format!("VERSION {}", TRANSPORT_PROTOCOL_VERSION))
    }

    /// Tell the parent why its environment was unusable, in the form
    /// it expects for the failure at hand.
    pub(crate) fn env_failure(&mut self, error: &EnvError) {
        let line = match error {
            EnvError::NoCommonVersion => "VERSION-ERROR no-version".to_owned(),
            EnvError::Missing(_) => format!("ENV-ERROR {}", error),
        };
        let _ = self.emit(&line);
    }

    /// Announce a chain as ready on `addr`.
    pub(crate) fn method(&mut self, alias: &str, addr: SocketAddr) -> io::Result<()> {
        self.emit(&format!("CMETHOD {} socks4 {}", alias, addr))
    }

    /// Announce that a chain could not be served, and why.
    pub(crate) fn method_error(&mut self, alias: &str, reason: &str) -> io::Result<()> {
        // The protocol is line-oriented; a multi-line reason would
        // desynchronize it.
        let reason = reason.replace(['\n', '\r'], " ");
        self.emit(&format!("CMETHOD-ERROR {} {}", alias, reason))
    }

    /// Announce that every requested chain has been dealt with.
    pub(crate) fn methods_done(&mut self) -> io::Result<()> {
        self.emit("CMETHODS DONE")
    }
}
