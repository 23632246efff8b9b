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
pub mod v4;
pub mod v5;

use std::fmt::{self, Display};
use std::net::SocketAddr;
use std::str::FromStr;

pub use err::Error;

/// A Result as returned by this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// A version of the SOCKS protocol, as spoken by a proxy's local port.
///
/// This is the protocol field a pluggable transport announces for each
/// of its methods; we use it to decide which handshake to run when
/// dialing that transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum SocksVersion {
    /// SOCKS version 4 (or 4a, when the target is a hostname).
    V4,
    /// SOCKS version 5.
    V5,
}

impl FromStr for SocksVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<SocksVersion> {
        match s {
            "socks4" => Ok(SocksVersion::V4),
            "socks5" => Ok(SocksVersion::V5),
            _ => Err(Error::BadProtocolLabel(s.to_owned())),
        }
    }
}

impl Display for SocksVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocksVersion::V4 => write!(f, "socks4"),
            SocksVersion::V5 => write!(f, "socks5"),
        }
    }
}

/// An address a SOCKS client can ask a proxy to connect to.
///
/// Proxies accept either a literal socket address or a hostname with a
/// port; hostnames are resolved by the proxy, not by us.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TargetAddr {
    /// A literal IP address and port.
    Ip(SocketAddr),
    /// A hostname and port, to be resolved at the far end.
    Domain(String, u16),
}

impl From<SocketAddr> for TargetAddr {
    fn from(addr: SocketAddr) -> TargetAddr {
        TargetAddr::Ip(addr)
    }
}

impl Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{}", addr),
            TargetAddr::Domain(host, port) => write!(f, "{}:{}", host, port),
        }
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn version_labels() {
        assert_eq!("socks4".parse::<SocksVersion>().unwrap(), SocksVersion::V4);
        assert_eq!("socks5".parse::<SocksVersion>().unwrap(), SocksVersion::V5);
        assert!("socks6".parse::<SocksVersion>().is_err());
        assert!("SOCKS4".parse::<SocksVersion>().is_err());
        assert_eq!(SocksVersion::V4.to_string(), "socks4");
        assert_eq!(SocksVersion::V5.to_string(), "socks5");
    }

    #[test]
    fn target_display() {
        let ip: TargetAddr = "192.0.2.7:443".parse::<SocketAddr>().unwrap().into();
        assert_eq!(ip.to_string(), "192.0.2.7:443");
        let host = TargetAddr::Domain("bridge.example.com".into(), 8080);
        assert_eq!(host.to_string(), "bridge.example.com:8080");
    }
}
