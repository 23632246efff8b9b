//! Set up logging for the process.

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

/// Environment variable consulted for the default log filter.
const LOG_ENV_VAR: &str = "FOG_LOG";

/// Install the global tracing subscriber.
///
/// Everything goes to stderr: stdout belongs to the managed-transport
/// protocol, and a stray log line there would corrupt the handshake
/// with our parent.  `cli_level`, when given, overrides [`LOG_ENV_VAR`].
pub(crate) fn setup_logging(cli_level: Option<&str>) -> Result<()> {
    let filter = match cli_level {
        Some(level) => EnvFilter::try_new(level)
            .with_context(|| format!("invalid log level {:?}", level))?,
        None => EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}
