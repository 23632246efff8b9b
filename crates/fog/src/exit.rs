//! Decide when it is time to shut down.

use anyhow::{Context, Result};
use tokio::io::AsyncReadExt;
use tracing::info;

/// Wait for a termination signal.
#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        outcome = tokio::signal::ctrl_c() => outcome,
        _ = term.recv() => Ok(()),
    }
}

/// Wait for a termination signal.
#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

/// Block until the process should shut down: on a termination signal,
/// or on stdin closing when `watch_stdin` is set.
///
/// A parent that sets `TOR_PT_EXIT_ON_STDIN_CLOSE` holds our stdin
/// open for as long as it lives; end-of-file there means the parent is
/// gone, however it died.
pub(crate) async fn wait_for_shutdown(watch_stdin: bool) -> Result<()> {
    let stdin_gone = async {
        if watch_stdin {
            let mut stdin = tokio::io::stdin();
            let mut buf = [0_u8; 64];
            loop {
                match stdin.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    // The parent isn't supposed to talk to us here;
                    // whatever this was, swallow it.
                    Ok(_) => {}
                }
            }
        } else {
            futures::future::pending::<()>().await;
        }
    };

    tokio::select! {
        outcome = wait_for_signal() => {
            outcome.context("listening for termination signal")?;
            info!("got termination signal");
        }
        () = stdin_gone => {
            info!("standard input closed; parent is gone");
        }
    }
    Ok(())
}
