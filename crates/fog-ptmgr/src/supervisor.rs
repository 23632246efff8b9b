//! Spawn transport children and multicast their readiness.
//!
//! One child process can provide several transports, and several
//! chains can wait on the same transport, so a child's single
//! ready-or-failed outcome has to be observable many times.  We
//! resolve that with a one-shot channel whose receiver is wrapped in a
//! [`Shared`] future: the outcome is stored once and replayed to every
//! subscriber.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use futures::FutureExt;
use futures::channel::oneshot;
use futures::future::{self, BoxFuture, Shared};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, info, trace, warn};

use crate::ipc::{Handshake, Methods, MethodSpec, TRANSPORT_PROTOCOL_VERSION};
use crate::{Error, Result};

/// Prefix of every environment variable owned by the managed-transport
/// protocol.
const PT_ENV_PREFIX: &str = "TOR_PT_";

/// Name of the state subdirectory we give our children.
const STATE_SUBDIR: &str = "fog";

/// The multicast outcome of one child's announcement monologue.
type SharedMethods = Shared<BoxFuture<'static, Result<Methods>>>;

/// Compute the environment for a transport child.
///
/// The parent environment is passed through except for `TOR_PT_*`
/// variables, which are replaced wholesale: the protocol version we
/// speak, the exact transports this child must provide, and a state
/// directory rooted under the one our own parent gave us.
pub fn child_env<I>(
    parent: I,
    transports: &[String],
    state_location: Option<&Path>,
) -> Vec<(String, String)>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut env: Vec<(String, String)> = parent
        .into_iter()
        .filter(|(key, _)| !key.starts_with(PT_ENV_PREFIX))
        .collect();
    env.push((
        "TOR_PT_MANAGED_TRANSPORT_VER".to_owned(),
        TRANSPORT_PROTOCOL_VERSION.to_owned(),
    ));
    env.push((
        "TOR_PT_CLIENT_TRANSPORTS".to_owned(),
        transports.join(","),
    ));
    if let Some(dir) = state_location {
        env.push((
            "TOR_PT_STATE_LOCATION".to_owned(),
            dir.join(STATE_SUBDIR).to_string_lossy().into_owned(),
        ));
    }
    env
}

/// Owner of every transport child process and its status reader.
///
/// Children live from [`Supervisor::launch`] until [`Supervisor::shutdown`]
/// or until this object is dropped, whichever comes first; no child
/// outlives the supervisor.
pub struct Supervisor {
    /// State directory given to us by our parent, if any.
    state_location: Option<PathBuf>,
    /// Handles for every child we spawned, kill-on-drop.
    children: Vec<Child>,
    /// Per-transport readiness, keyed by transport name.
    ready: HashMap<String, SharedMethods>,
}

impl Supervisor {
    /// Return a supervisor with no children yet.
    pub fn new(state_location: Option<PathBuf>) -> Supervisor {
        Supervisor {
            state_location,
            children: Vec::new(),
            ready: HashMap::new(),
        }
    }

    /// Spawn one child from `cmdline`, expected to provide exactly
    /// `transports`.
    ///
    /// Launch problems are not returned here: they are recorded as the
    /// child's outcome, so that every chain waiting on one of its
    /// transports observes the failure.
    pub fn launch(&mut self, cmdline: &[String], transports: &[String]) {
        let outcome = self.spawn_child(cmdline, transports);
        let shared = match outcome {
            Ok(shared) => shared,
            Err(e) => {
                warn!(error = %e, "transport child unavailable");
                future::ready(Err(e)).boxed().shared()
            }
        };
        for name in transports {
            self.ready.insert(name.clone(), shared.clone());
        }
    }

    /// Spawn the child process and its stdout reader.
    fn spawn_child(&mut self, cmdline: &[String], transports: &[String]) -> Result<SharedMethods> {
        let Some((program, args)) = cmdline.split_first() else {
            return Err(Error::EmptyCommandLine);
        };
        let cmdline_display = cmdline.join(" ");

        let mut command = Command::new(program);
        command
            .args(args)
            .env_clear()
            .envs(child_env(
                std::env::vars(),
                transports,
                self.state_location.as_deref(),
            ))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        // A child must not survive us, even if we die without dropping it.
        #[cfg(target_os = "linux")]
        unsafe {
            command.pre_exec(|| {
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = command.spawn().map_err(|source| Error::Spawn {
            cmdline: cmdline_display.clone(),
            source: Arc::new(source),
        })?;
        info!(child = %cmdline_display, transports = ?transports, "launched transport child");

        let Some(stdout) = child.stdout.take() else {
            return Err(Error::Spawn {
                cmdline: cmdline_display,
                source: Arc::new(std::io::Error::other("child stdout was not captured")),
            });
        };
        self.children.push(child);

        let (tx, rx) = oneshot::channel();
        tokio::spawn(read_child_stdout(stdout, tx, cmdline_display));
        Ok(rx
            .map(|outcome| match outcome {
                Ok(result) => result,
                // The reader task went away without reporting; treat it
                // like a child that died mid-monologue.
                Err(oneshot::Canceled) => Err(Error::ExitedBeforeDone),
            })
            .boxed()
            .shared())
    }

    /// Return a one-shot future resolving once the transport `name` is
    /// usable, with the method spec its child announced.
    ///
    /// Returns `None` for a transport no launched child was asked to
    /// provide.
    pub fn method(&self, name: &str) -> Option<BoxFuture<'static, Result<MethodSpec>>> {
        let shared = self.ready.get(name)?.clone();
        let name = name.to_owned();
        Some(
            async move {
                let methods = shared.await?;
                methods
                    .get(&name)
                    .cloned()
                    .ok_or(Error::MethodMissing { name })
            }
            .boxed(),
        )
    }

    /// Terminate every child we spawned.
    pub async fn shutdown(mut self) {
        for child in &mut self.children {
            match child.kill().await {
                Ok(()) => {}
                Err(e) => debug!(error = %e, "could not kill transport child"),
            }
        }
    }
}

/// Read a child's stdout to its end, reporting the handshake outcome
/// through `tx` as soon as it is known.
///
/// Keeps draining after the outcome so the child never blocks on a
/// full pipe.
async fn read_child_stdout(
    stdout: ChildStdout,
    tx: oneshot::Sender<Result<Methods>>,
    child_label: String,
) {
    let mut lines = BufReader::new(stdout).lines();
    let mut handshake = Handshake::new();
    let outcome = loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                trace!(child = %child_label, %line, "transport output");
                match handshake.handle_line(line.trim_end()) {
                    Ok(Some(methods)) => break Ok(methods),
                    Ok(None) => {}
                    Err(e) => break Err(e),
                }
            }
            Ok(None) => break Err(Error::ExitedBeforeDone),
            Err(e) => {
                break Err(Error::ChildRead {
                    source: Arc::new(e),
                });
            }
        }
    };
    match &outcome {
        Ok(methods) => {
            debug!(child = %child_label, n_methods = methods.len(), "transport child is ready");
        }
        Err(e) => warn!(child = %child_label, error = %e, "transport child failed"),
    }
    let _ = tx.send(outcome);

    while let Ok(Some(line)) = lines.next_line().await {
        trace!(child = %child_label, %line, "transport output (ignored)");
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use fog_socksproto::SocksVersion;

    fn fake_parent_env() -> Vec<(String, String)> {
        vec![
            ("PATH".to_owned(), "/usr/bin".to_owned()),
            ("HOME".to_owned(), "/home/user".to_owned()),
            ("TOR_PT_MANAGED_TRANSPORT_VER".to_owned(), "1,2".to_owned()),
            ("TOR_PT_CLIENT_TRANSPORTS".to_owned(), "fog_chain".to_owned()),
            ("TOR_PT_STATE_LOCATION".to_owned(), "/var/lib/tor/pt".to_owned()),
        ]
    }

    #[test]
    fn env_is_scrubbed_and_repopulated() {
        let transports = vec!["x".to_owned(), "y".to_owned()];
        let env = child_env(
            fake_parent_env(),
            &transports,
            Some(Path::new("/var/lib/tor/pt")),
        );

        let get = |key: &str| -> Vec<&str> {
            env.iter()
                .filter(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
                .collect()
        };
        // Non-protocol variables pass through.
        assert_eq!(get("PATH"), vec!["/usr/bin"]);
        // Every TOR_PT_ variable is ours, set exactly once.
        assert_eq!(get("TOR_PT_MANAGED_TRANSPORT_VER"), vec!["1"]);
        assert_eq!(get("TOR_PT_CLIENT_TRANSPORTS"), vec!["x,y"]);
        let state = get("TOR_PT_STATE_LOCATION");
        assert_eq!(state.len(), 1);
        assert!(state[0].ends_with("fog"));
        assert!(state[0].starts_with("/var/lib/tor/pt"));
    }

    #[test]
    fn env_without_state_location() {
        let env = child_env(fake_parent_env(), &["x".to_owned()], None);
        assert!(!env.iter().any(|(k, _)| k == "TOR_PT_STATE_LOCATION"));
    }

    /// Build a command line that plays a transport child from a shell
    /// script.
    #[cfg(unix)]
    fn script_child(script: &str) -> Vec<String> {
        vec!["/bin/sh".to_owned(), "-c".to_owned(), script.to_owned()]
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn child_announces_and_we_listen() {
        let mut sup = Supervisor::new(None);
        sup.launch(
            &script_child(
                "echo 'VERSION 1'; \
                 echo 'CMETHOD trebuchet socks5 127.0.0.1:41083 ARGS=tension=high'; \
                 echo 'CMETHODS DONE'; \
                 sleep 5",
            ),
            &["trebuchet".to_owned()],
        );

        let spec = sup.method("trebuchet").unwrap().await.unwrap();
        assert_eq!(spec.name, "trebuchet");
        assert_eq!(spec.protocol, SocksVersion::V5);
        assert_eq!(spec.addr, "127.0.0.1:41083".parse().unwrap());
        assert_eq!(spec.args, vec!["tension=high"]);

        // Readiness is multicast: a second subscriber sees it too.
        let again = sup.method("trebuchet").unwrap().await.unwrap();
        assert_eq!(again, spec);

        sup.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn missing_method_is_an_error() {
        let mut sup = Supervisor::new(None);
        sup.launch(
            &script_child(
                "echo 'VERSION 1'; \
                 echo 'CMETHOD present socks5 127.0.0.1:41083'; \
                 echo 'CMETHODS DONE'; \
                 sleep 5",
            ),
            &["present".to_owned(), "absent".to_owned()],
        );

        assert!(sup.method("present").unwrap().await.is_ok());
        let err = sup.method("absent").unwrap().await.unwrap_err();
        assert!(matches!(
            err,
            Error::MethodMissing { ref name } if name == "absent"
        ));
        sup.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn version_mismatch_is_an_error() {
        let mut sup = Supervisor::new(None);
        sup.launch(
            &script_child("echo 'VERSION 2'; sleep 5"),
            &["newfangled".to_owned()],
        );
        let err = sup.method("newfangled").unwrap().await.unwrap_err();
        assert!(matches!(
            err,
            Error::UnsupportedProtocol { ref version } if version == "2"
        ));
        sup.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn early_exit_is_an_error() {
        let mut sup = Supervisor::new(None);
        sup.launch(
            &script_child("echo 'VERSION 1'"),
            &["shortlived".to_owned()],
        );
        let err = sup.method("shortlived").unwrap().await.unwrap_err();
        assert!(matches!(err, Error::ExitedBeforeDone));
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn unlaunchable_child_fails_all_its_transports() {
        let mut sup = Supervisor::new(None);
        sup.launch(
            &["/nonexistent/transport-binary".to_owned()],
            &["a".to_owned(), "b".to_owned()],
        );
        for name in ["a", "b"] {
            let err = sup.method(name).unwrap().await.unwrap_err();
            assert!(matches!(err, Error::Spawn { .. }));
        }
        assert!(sup.method("unrelated").is_none());
        sup.shutdown().await;
    }
}
