//! Declare error types for relays and chain building.

use std::net::SocketAddr;

use thiserror::Error;

/// An error from building a chain or relaying a connection through it.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// We could not bind a loopback listener.
    #[error("Could not bind a loopback listener")]
    Bind {
        /// The underlying bind error.
        #[source]
        source: std::io::Error,
    },

    /// Accepting an inbound connection failed.
    #[error("Could not accept an inbound connection")]
    Accept {
        /// The underlying accept error.
        #[source]
        source: std::io::Error,
    },

    /// We could not reach a transport's local SOCKS port.
    #[error("Could not connect to the transport SOCKS port at {addr}")]
    Connect {
        /// The address we dialed.
        addr: SocketAddr,
        /// The underlying connect error.
        #[source]
        source: std::io::Error,
    },

    /// A transport refused or bungled our SOCKS handshake.
    #[error("SOCKS handshake with transport {pt:?} failed")]
    Handshake {
        /// The transport we were talking to.
        pt: String,
        /// The underlying handshake error.
        #[source]
        source: fog_socksproto::Error,
    },

    /// Connecting through a transport took too long.
    #[error("Timed out while connecting through transport {pt:?}")]
    HandshakeTimeout {
        /// The transport we were waiting on.
        pt: String,
    },

    /// An established connection failed while bytes were flowing.
    #[error("Connection failed while relaying")]
    Splice {
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The application's SOCKS request could not be read.
    #[error("Could not read the application's SOCKS request")]
    AppRequest {
        /// The underlying protocol error.
        #[source]
        source: fog_socksproto::Error,
    },

    /// We could not answer the application's SOCKS request.
    #[error("Could not reply to the application's SOCKS request")]
    AppReply {
        /// The underlying protocol error.
        #[source]
        source: fog_socksproto::Error,
    },

    /// A chain with fewer than two transports cannot be built.
    #[error("A chain needs at least two transports")]
    ChainTooShort,
}
