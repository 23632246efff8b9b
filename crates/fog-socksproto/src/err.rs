//! Declare error types for the SOCKS handshakes.

use thiserror::Error;

/// An error from a SOCKS handshake.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The peer sent a version byte we were not expecting.
    #[error("Unexpected SOCKS version byte {0}")]
    BadProtocol(u8),

    /// A protocol label that names no SOCKS version we implement.
    #[error("Unrecognized SOCKS protocol label {0:?}")]
    BadProtocolLabel(String),

    /// A client asked us for a command other than CONNECT.
    #[error("Only the CONNECT command is supported (got command {0})")]
    UnsupportedCommand(u8),

    /// The proxy refused our CONNECT request.
    #[error("Proxy rejected the request (code {0})")]
    Rejected(u8),

    /// The proxy would not negotiate an authentication method with us.
    ///
    /// We only ever offer "no authentication"; a proxy that insists on
    /// anything else is not usable as a chain link.
    #[error("Proxy would not accept our authentication (method {0:#04x})")]
    AuthRefused(u8),

    /// A SOCKSv4 message cannot express the requested address.
    #[error("Address cannot be expressed in a SOCKSv4 message")]
    AddressNotSupported,

    /// A hostname that cannot be put on the wire (too long, embedded
    /// NUL, or not UTF-8 when parsing).
    #[error("Hostname not expressible in a SOCKS message")]
    BadHostname,

    /// A variable-length field exceeded our size cap.
    #[error("Field in SOCKS message too long")]
    FieldTooLong,

    /// The peer sent bytes that don't parse as the expected message.
    #[error("Malformed SOCKS message: {0}")]
    Syntax(&'static str),

    /// An IO error on the underlying stream.
    #[error("IO error while speaking SOCKS")]
    Io(#[from] std::io::Error),
}
