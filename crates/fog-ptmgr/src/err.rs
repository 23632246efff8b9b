//! Declare error types for transport launch and the status handshake.

use std::sync::Arc;

use thiserror::Error;

/// An error from launching a transport child or reading its status.
///
/// These errors are multicast: every chain waiting on a transport from
/// the same child observes the same failure.  That is why the type is
/// `Clone` and wraps its IO causes in `Arc`.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum Error {
    /// A transport was configured with an empty command line.
    #[error("Transport child process has an empty command line")]
    EmptyCommandLine,

    /// The child process could not be started at all.
    #[error("Could not launch transport child process {cmdline:?}")]
    Spawn {
        /// The command line we tried to run, joined for display.
        cmdline: String,
        /// What went wrong when spawning.
        #[source]
        source: Arc<std::io::Error>,
    },

    /// The child announced a managed-transport version we don't speak.
    #[error("Transport child spoke unsupported managed-transport version {version:?}")]
    UnsupportedProtocol {
        /// The version string the child sent.
        version: String,
    },

    /// The child's stdout ended before it finished announcing methods.
    #[error("Transport child exited before finishing its CMETHOD lines")]
    ExitedBeforeDone,

    /// Reading the child's stdout failed outright.
    #[error("Error reading transport child stdout")]
    ChildRead {
        /// The underlying read error.
        #[source]
        source: Arc<std::io::Error>,
    },

    /// The child finished its announcements without this transport.
    #[error("Transport {name:?} was not announced by its child process")]
    MethodMissing {
        /// The transport that went unannounced.
        name: String,
    },
}
