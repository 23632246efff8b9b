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

mod err;

use std::collections::{BTreeSet, HashMap};

use tracing::warn;

pub use err::Error;

/// A Result as returned by this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Directive declaring one or more transports and their command line.
const TRANSPORT_DIRECTIVE: &str = "ClientTransportPlugin";
/// Directive declaring a chain alias.
const ALIAS_DIRECTIVE: &str = "Alias";

/// A validated fog configuration.
///
/// Holds the transport catalog (transport name to child command line),
/// the alias catalog (chain alias to the ordered transports it
/// traverses), and a derived index from command line to the chains
/// that depend on it.  A `Config` never changes after [`Config::parse`]
/// returns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Transport name to the command line that provides it.
    transports: HashMap<String, Vec<String>>,
    /// Chain alias to the ordered list of transport names it uses.
    aliases: HashMap<String, Vec<String>>,
    /// Command line to every chain alias that uses it, derived from
    /// the two catalogs above.
    chains_by_cmdline: HashMap<Vec<String>, BTreeSet<String>>,
}

impl Config {
    /// Parse a configuration from its text form.
    ///
    /// Blank lines and lines starting with `#` are ignored; tokens are
    /// split with shell-style quoting.  Unknown directives are logged
    /// and skipped.  Directive order does not matter: an `Alias` may
    /// name transports that are declared further down.
    pub fn parse(text: &str) -> Result<Config> {
        let mut transports: HashMap<String, Vec<String>> = HashMap::new();
        let mut aliases: HashMap<String, Vec<String>> = HashMap::new();
        let mut alias_lines: HashMap<String, usize> = HashMap::new();

        for (idx, raw) in text.lines().enumerate() {
            let line = idx + 1;
            let trimmed = raw.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let tokens =
                shell_words::split(trimmed).map_err(|source| Error::Quoting { line, source })?;
            let Some((directive, rest)) = tokens.split_first() else {
                continue;
            };
            match directive.as_str() {
                TRANSPORT_DIRECTIVE => {
                    if rest.len() < 2 {
                        return Err(Error::Truncated {
                            line,
                            directive: TRANSPORT_DIRECTIVE,
                            expected: "a name list and a command line",
                        });
                    }
                    let cmdline = rest[1..].to_vec();
                    for name in rest[0].split(',').filter(|n| !n.is_empty()) {
                        if transports.insert(name.to_owned(), cmdline.clone()).is_some() {
                            return Err(Error::DuplicateTransport {
                                line,
                                name: name.to_owned(),
                            });
                        }
                    }
                }
                ALIAS_DIRECTIVE => {
                    let [name, links] = rest else {
                        return Err(Error::Truncated {
                            line,
                            directive: ALIAS_DIRECTIVE,
                            expected: "a chain name and a pipe-joined transport list",
                        });
                    };
                    let pts: Vec<String> = links.split('|').map(str::to_owned).collect();
                    if pts.len() < 2 {
                        return Err(Error::ChainTooShort {
                            line,
                            name: name.clone(),
                        });
                    }
                    if aliases.insert(name.clone(), pts).is_some() {
                        return Err(Error::DuplicateAlias {
                            line,
                            name: name.clone(),
                        });
                    }
                    alias_lines.insert(name.clone(), line);
                }
                other => {
                    warn!(line, directive = other, "ignoring unrecognized directive");
                }
            }
        }

        // Aliases may only reference declared transports.
        for (alias, pts) in &aliases {
            for pt in pts {
                if !transports.contains_key(pt) {
                    return Err(Error::UnknownTransport {
                        line: alias_lines.get(alias).copied().unwrap_or_default(),
                        chain: alias.clone(),
                        name: pt.clone(),
                    });
                }
            }
        }

        let mut chains_by_cmdline: HashMap<Vec<String>, BTreeSet<String>> = HashMap::new();
        for (alias, pts) in &aliases {
            for pt in pts {
                let Some(cmdline) = transports.get(pt) else {
                    continue; // checked above
                };
                chains_by_cmdline
                    .entry(cmdline.clone())
                    .or_default()
                    .insert(alias.clone());
            }
        }

        Ok(Config {
            transports,
            aliases,
            chains_by_cmdline,
        })
    }

    /// Return the names of every configured chain, in no particular order.
    pub fn chain_names(&self) -> impl Iterator<Item = &str> {
        self.aliases.keys().map(String::as_str)
    }

    /// Return the ordered transports of the chain called `alias`, if any.
    pub fn chain(&self, alias: &str) -> Option<&[String]> {
        self.aliases.get(alias).map(Vec::as_slice)
    }

    /// Return the command line that provides the transport `pt`, if any.
    pub fn cmdline(&self, pt: &str) -> Option<&[String]> {
        self.transports.get(pt).map(Vec::as_slice)
    }

    /// Return every chain alias that depends on `cmdline`.
    pub fn chains_using(&self, cmdline: &[String]) -> impl Iterator<Item = &str> {
        self.chains_by_cmdline
            .get(cmdline)
            .into_iter()
            .flat_map(|aliases| aliases.iter().map(String::as_str))
    }

    /// Return the unique transport names provided by `cmdline` that
    /// appear in any of the `requested` chains, sorted.
    ///
    /// This is exactly the list a child process spawned from `cmdline`
    /// must be asked to provide.
    pub fn pts_by_cmdline(&self, cmdline: &[String], requested: &[String]) -> Vec<String> {
        let mut out: BTreeSet<String> = BTreeSet::new();
        for alias in requested {
            let Some(pts) = self.aliases.get(alias) else {
                continue;
            };
            for pt in pts {
                if self.transports.get(pt).map(Vec::as_slice) == Some(cmdline) {
                    out.insert(pt.clone());
                }
            }
        }
        out.into_iter().collect()
    }

    /// Return every distinct command line needed to cover the
    /// `requested` chains, sorted.
    ///
    /// Transports that share a byte-identical command line contribute
    /// one entry: one child process will serve them all.
    pub fn unique_cmdlines(&self, requested: &[String]) -> Vec<Vec<String>> {
        let mut out: BTreeSet<Vec<String>> = BTreeSet::new();
        for alias in requested {
            let Some(pts) = self.aliases.get(alias) else {
                continue;
            };
            for pt in pts {
                if let Some(cmdline) = self.transports.get(pt) {
                    out.insert(cmdline.clone());
                }
            }
        }
        out.into_iter().collect()
    }
}
