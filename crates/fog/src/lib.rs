#![cfg_attr(docsrs, feature(doc_auto_cfg, doc_cfg))]
#![doc = include_str!("../README.md")]
// @@ begin lint list maintained by maint/add_warning @@
#![allow(renamed_and_removed_lints)] // @@REMOVE_WHEN(ci_arti_stable)
#![allow(unknown_lints)] // @@REMOVE_WHEN(ci_arti_nightly)
#![warn(missing_docs)]
#![warn(noop_method_call)]
#![warn(unreachable_pub)]
#![warn(clippy::all)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::cargo_common_metadata)]
#![deny(clippy::cast_lossless)]
#![deny(clippy::checked_conversions)]
#![warn(clippy::cognitive_complexity)]
#![deny(clippy::debug_assert_with_mut_call)]
#![deny(clippy::exhaustive_enums)]
#![deny(clippy::exhaustive_structs)]
#![deny(clippy::expl_impl_clone_on_copy)]
#![deny(clippy::fallible_impl_from)]
#![deny(clippy::implicit_clone)]
#![deny(clippy::large_stack_arrays)]
#![warn(clippy::manual_ok_or)]
#![deny(clippy::missing_docs_in_private_items)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::needless_pass_by_value)]
#![warn(clippy::option_option)]
#![deny(clippy::print_stderr)]
#![deny(clippy::print_stdout)]
#![warn(clippy::rc_buffer)]
#![deny(clippy::ref_option_ref)]
#![warn(clippy::semicolon_if_nothing_returned)]
#![warn(clippy::trait_duplication_in_bounds)]
#![deny(clippy::unchecked_duration_subtraction)]
#![deny(clippy::unnecessary_wraps)]
#![warn(clippy::unseparated_literal_suffix)]
#![deny(clippy::unwrap_used)]
#![allow(clippy::let_unit_value)] // This can reasonably be done for explicitness
#![allow(clippy::uninlined_format_args)]
//! <!-- @@ end lint list maintained by maint/add_warning @@ -->

mod controller;
mod exit;
mod trace;

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::{info, warn};

use crate::controller::{Controller, PtEnv};
use fog_chain::{Chain, Interceptor};
use fog_config::Config;
use fog_ptmgr::Supervisor;

/// Name of the configuration file we look for beside the executable.
const DEFAULT_CONFIG_NAME: &str = "fogrc";

/// Chain pluggable transports together, presenting them as one.
#[derive(Debug, Parser)]
#[command(author = "The Tor Project Developers", version, about)]
struct Cli {
    /// Configuration file to read.  Defaults to a `fogrc` file next to
    /// this executable.
    #[arg(short = 'f', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the log level (usually one of 'trace', 'debug',
    /// 'info', 'warn', 'error').
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

/// Where the configuration lives when `-f` is not given.
fn default_config_file() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("locating our own executable")?;
    Ok(exe.with_file_name(DEFAULT_CONFIG_NAME))
}

/// Inner main, separated for convenient error handling.
pub fn main_main() -> Result<()> {
    let cli = Cli::parse();
    trace::setup_logging(cli.log_level.as_deref())?;

    // The configuration comes first: a broken config file must fail
    // before we begin the handshake with our parent.
    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => default_config_file()?,
    };
    let text = std::fs::read_to_string(&config_path)
        .with_context(|| format!("reading configuration file {}", config_path.display()))?;
    let config = Config::parse(&text)
        .with_context(|| format!("in configuration file {}", config_path.display()))?;

    // The parent's environment tells us what to serve; if it is
    // unusable, the parent hears about it on stdout and the operator
    // on stderr.
    let vars: HashMap<String, String> = std::env::vars().collect();
    let mut controller = Controller::new();
    let env = match controller::parse_env(&vars) {
        Ok(env) => env,
        Err(e) => {
            controller.env_failure(&e);
            return Err(e).context("managed-transport environment");
        }
    };
    controller.version().context("writing VERSION line")?;

    let requested = resolve_requested(&env, &config);
    if requested.is_empty() {
        bail!("no requested chain is configured; nothing to serve");
    }
    info!(chains = ?requested, "serving chains");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("starting async runtime")?;
    runtime.block_on(run(&config, &env, &requested, controller))
}

/// Expand the parent's transport request against the configuration.
///
/// A lone `*` asks for every configured chain.  Otherwise we serve the
/// intersection of the request with the configured chain names; a name
/// that matches no chain is simply not ours to answer for.
fn resolve_requested(env: &PtEnv, config: &Config) -> Vec<String> {
    if env.requested.len() == 1 && env.requested[0] == "*" {
        let mut all: Vec<String> = config.chain_names().map(str::to_owned).collect();
        all.sort_unstable();
        all
    } else {
        env.requested
            .iter()
            .filter(|alias| config.chain(alias).is_some())
            .cloned()
            .collect()
    }
}

/// Launch children, bring up chains, and serve until shutdown.
async fn run(
    config: &Config,
    env: &PtEnv,
    requested: &[String],
    mut controller: Controller,
) -> Result<()> {
    // One child per distinct command line covers every transport the
    // requested chains need.
    let mut supervisor = Supervisor::new(env.state_location.clone());
    for cmdline in config.unique_cmdlines(requested) {
        let transports = config.pts_by_cmdline(&cmdline, requested);
        supervisor.launch(&cmdline, &transports);
    }

    // Chains come up independently; a transport that never becomes
    // ready must not hold back the chains that don't need it.  Reports
    // still go out in request order.
    let outcomes = futures::future::join_all(
        requested
            .iter()
            .map(|alias| start_chain(config, &supervisor, alias)),
    )
    .await;

    let mut running = Vec::new();
    for (alias, outcome) in requested.iter().zip(outcomes) {
        match outcome {
            Ok(interceptor) => {
                controller
                    .method(alias, interceptor.local_addr())
                    .context("writing CMETHOD line")?;
                running.push(interceptor);
            }
            Err(e) => {
                warn!(chain = %alias, error = %e, "cannot serve chain");
                controller
                    .method_error(alias, &format!("{:#}", e))
                    .context("writing CMETHOD-ERROR line")?;
            }
        }
    }
    controller
        .methods_done()
        .context("writing CMETHODS DONE line")?;

    if running.is_empty() {
        supervisor.shutdown().await;
        bail!("none of the requested chains could be served");
    }

    exit::wait_for_shutdown(env.exit_on_stdin_close).await?;
    info!("shutting down");
    drop(running);
    supervisor.shutdown().await;
    Ok(())
}

/// Wait for every transport of `alias` to become ready, then start the
/// chain's interceptor.
async fn start_chain(config: &Config, supervisor: &Supervisor, alias: &str) -> Result<Interceptor> {
    let Some(transports) = config.chain(alias) else {
        bail!("no chain with this name is configured");
    };
    let mut methods = Vec::with_capacity(transports.len());
    for name in transports {
        let Some(ready) = supervisor.method(name) else {
            bail!("transport {:?} was never launched", name);
        };
        let spec = ready
            .await
            .with_context(|| format!("transport {:?} is unavailable", name))?;
        methods.push(spec);
    }
    let chain = Chain::new(alias, methods)?;
    Interceptor::launch(chain)
        .await
        .with_context(|| format!("starting listener for chain {:?}", alias))
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn env_requesting(names: &str) -> PtEnv {
        PtEnv {
            requested: names
                .split(',')
                .filter(|n| !n.is_empty())
                .map(str::to_owned)
                .collect(),
            state_location: None,
            exit_on_stdin_close: false,
        }
    }

    fn two_chain_config() -> Config {
        Config::parse(
            "ClientTransportPlugin a /bin/pt-a\n\
             ClientTransportPlugin b /bin/pt-b\n\
             Alias a_b a|b\n\
             Alias b_a b|a\n",
        )
        .unwrap()
    }

    #[test]
    fn explicit_request_intersects_with_config() {
        let requested = resolve_requested(&env_requesting("a_b,ghost"), &two_chain_config());
        // Only names that match a configured chain are ours to serve.
        assert_eq!(requested, vec!["a_b"]);
    }

    #[test]
    fn fully_unknown_request_leaves_nothing() {
        let requested = resolve_requested(&env_requesting("ghost,phantom"), &two_chain_config());
        assert!(requested.is_empty());
    }

    #[test]
    fn wildcard_request_expands() {
        let requested = resolve_requested(&env_requesting("*"), &two_chain_config());
        assert_eq!(requested, vec!["a_b", "b_a"]);
    }
}
