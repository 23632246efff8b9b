//! Parse the line protocol a managed transport speaks on its stdout.
//!
//! The protocol is a short monologue: a `VERSION` line, one `CMETHOD`
//! line per transport method, and a closing `CMETHODS DONE`.  Anything
//! else is noise and ignored, so transports can add lines without
//! breaking old controllers.

use std::collections::HashMap;
use std::net::SocketAddr;

use tracing::warn;

use crate::{Error, Result};
use fog_socksproto::SocksVersion;

/// The managed-transport protocol version we implement.
pub const TRANSPORT_PROTOCOL_VERSION: &str = "1";

/// Every method a child announced, by transport name.
pub type Methods = HashMap<String, MethodSpec>;

/// One SOCKS endpoint announced by a transport child.
///
/// Born from a `CMETHOD` line and never modified afterwards.  Chains
/// clone these freely; the child process that announced a spec has no
/// further say in it.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct MethodSpec {
    /// The transport name, e.g. `obfs3`.
    pub name: String,
    /// Which SOCKS protocol the transport's local port speaks.
    pub protocol: SocksVersion,
    /// The local address the transport listens on.
    pub addr: SocketAddr,
    /// Values from the `ARGS=` field, if any.
    pub args: Vec<String>,
    /// Values from the `OPT-ARGS=` field, if any.
    pub opt_args: Vec<String>,
}

impl MethodSpec {
    /// Construct a spec with no arguments, as most transports announce.
    pub fn new(name: impl Into<String>, protocol: SocksVersion, addr: SocketAddr) -> MethodSpec {
        MethodSpec {
            name: name.into(),
            protocol,
            addr,
            args: Vec::new(),
            opt_args: Vec::new(),
        }
    }
}

/// Where we are in a child's announcement monologue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Waiting for `VERSION`, `CMETHOD`, or `CMETHODS DONE`.
    Negotiating,
    /// Saw `CMETHODS DONE`; everything further is ignored.
    Done,
}

/// Incremental parser for one child's status stream.
///
/// Feed it lines with [`Handshake::handle_line`]; it yields the
/// accumulated [`Methods`] once on `CMETHODS DONE`, or an error on a
/// version we cannot speak.  End-of-stream handling is the caller's:
/// EOF before the methods were yielded means the child failed.
#[derive(Debug, Default)]
pub struct Handshake {
    /// Methods collected so far.
    methods: Methods,
    /// Current protocol state.
    state: State,
}

impl Default for State {
    fn default() -> State {
        State::Negotiating
    }
}

impl Handshake {
    /// Return a parser at the start of the monologue.
    pub fn new() -> Handshake {
        Handshake::default()
    }

    /// Consume one line of child output.
    ///
    /// Returns `Ok(Some(methods))` exactly once, when the child has
    /// finished announcing; `Ok(None)` while the monologue continues.
    pub fn handle_line(&mut self, line: &str) -> Result<Option<Methods>> {
        if self.state == State::Done {
            return Ok(None);
        }
        let mut words = line.split_whitespace();
        match words.next() {
            Some("VERSION") => {
                let version = words.next().unwrap_or("");
                if version != TRANSPORT_PROTOCOL_VERSION {
                    return Err(Error::UnsupportedProtocol {
                        version: version.to_owned(),
                    });
                }
                Ok(None)
            }
            Some("CMETHOD") => {
                match parse_cmethod(words) {
                    Ok(spec) => {
                        if self.methods.contains_key(&spec.name) {
                            warn!(
                                method = %spec.name,
                                "child announced the same method twice; keeping the first"
                            );
                        } else {
                            self.methods.insert(spec.name.clone(), spec);
                        }
                    }
                    Err(problem) => {
                        warn!(%line, problem, "ignoring unparseable CMETHOD line");
                    }
                }
                Ok(None)
            }
            Some("CMETHODS") => {
                if words.next() == Some("DONE") {
                    self.state = State::Done;
                    Ok(Some(std::mem::take(&mut self.methods)))
                } else {
                    Ok(None)
                }
            }
            _ => Ok(None),
        }
    }
}

/// Parse the fields of a `CMETHOD` line, after the keyword itself.
fn parse_cmethod<'a>(mut words: impl Iterator<Item = &'a str>) -> std::result::Result<MethodSpec, &'static str> {
    let name = words.next().ok_or("missing method name")?;
    let protocol: SocksVersion = words
        .next()
        .ok_or("missing protocol")?
        .parse()
        .map_err(|_| "unrecognized protocol")?;
    let addr: SocketAddr = words
        .next()
        .ok_or("missing address")?
        .parse()
        .map_err(|_| "unparseable address")?;

    let mut spec = MethodSpec::new(name, protocol, addr);
    for word in words {
        if let Some(values) = word.strip_prefix("ARGS=") {
            spec.args = values.split(',').map(str::to_owned).collect();
        } else if let Some(values) = word.strip_prefix("OPT-ARGS=") {
            spec.opt_args = values.split(',').map(str::to_owned).collect();
        }
        // Other trailing fields belong to future protocol versions.
    }
    Ok(spec)
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]

    use super::*;

    /// Drive a handshake over `lines`; panic if it errors early.
    fn feed(lines: &[&str]) -> Result<Option<Methods>> {
        let mut hs = Handshake::new();
        let mut last = Ok(None);
        for line in lines {
            last = hs.handle_line(line);
            if let Ok(Some(_)) | Err(_) = last {
                return last;
            }
        }
        last
    }

    #[test]
    fn typical_monologue() {
        let methods = feed(&[
            "VERSION 1",
            "CMETHOD obfs3 socks5 127.0.0.1:41083",
            "CMETHOD websocket socks4 127.0.0.1:41084 ARGS=k=v,mode=fast OPT-ARGS=cert",
            "CMETHODS DONE",
        ])
        .unwrap()
        .unwrap();

        assert_eq!(methods.len(), 2);
        let obfs3 = &methods["obfs3"];
        assert_eq!(obfs3.protocol, SocksVersion::V5);
        assert_eq!(obfs3.addr, "127.0.0.1:41083".parse().unwrap());
        assert!(obfs3.args.is_empty());

        let ws = &methods["websocket"];
        assert_eq!(ws.protocol, SocksVersion::V4);
        // Everything after the first `=` survives, commas split values.
        assert_eq!(ws.args, vec!["k=v", "mode=fast"]);
        assert_eq!(ws.opt_args, vec!["cert"]);
    }

    #[test]
    fn version_mismatch_fails() {
        let err = feed(&["VERSION 2"]).unwrap_err();
        assert!(matches!(
            err,
            Error::UnsupportedProtocol { ref version } if version == "2"
        ));
    }

    #[test]
    fn noise_is_ignored() {
        let methods = feed(&[
            "VERSION 1",
            "LOG something happened",
            "",
            "CMETHOD-ERROR flashproxy no port",
            "CMETHOD good socks5 127.0.0.1:7000",
            "CMETHODS DONE",
        ])
        .unwrap()
        .unwrap();
        assert_eq!(methods.len(), 1);
        assert!(methods.contains_key("good"));
    }

    #[test]
    fn malformed_cmethod_is_skipped() {
        let methods = feed(&[
            "VERSION 1",
            "CMETHOD broken socks9 127.0.0.1:7000",
            "CMETHOD alsobroken socks5 not-an-address",
            "CMETHOD fine socks5 127.0.0.1:7001",
            "CMETHODS DONE",
        ])
        .unwrap()
        .unwrap();
        assert_eq!(methods.len(), 1);
        assert!(methods.contains_key("fine"));
    }

    #[test]
    fn monologue_without_done_yields_nothing() {
        let outcome = feed(&["VERSION 1", "CMETHOD a socks5 127.0.0.1:7000"]).unwrap();
        assert!(outcome.is_none());
    }

    #[test]
    fn windows_line_endings() {
        // Callers trim the terminator, but a stray \r inside fields
        // would end up in split_whitespace's hands anyway.
        let methods = feed(&["VERSION 1", "CMETHOD a socks5 127.0.0.1:7000 ", "CMETHODS DONE "])
            .unwrap()
            .unwrap();
        assert!(methods.contains_key("a"));
    }
}
