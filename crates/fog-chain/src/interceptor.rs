//! The chain builder and its user-facing SOCKSv4 listener.
//!
//! An [`Interceptor`] is what the application connects to.  Its
//! listener is long-lived, but everything behind it is built per
//! connection: the destination the application asks for becomes the
//! bridge address at the tail, the relays are allocated tail-first so
//! each one knows the port of the link after it, and the whole
//! assembly is torn down when the connection ends.

use std::net::{Ipv4Addr, SocketAddr};

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::relay::{self, RelayHandle};
use crate::{Error, Result};
use fog_ptmgr::MethodSpec;
use fog_socksproto::{TargetAddr, v4};

/// Everything needed to run one chain: its alias and the announced
/// method specs of its transports, in traversal order.
#[derive(Debug, Clone)]
pub struct Chain {
    /// The chain alias, as the parent process requested it.
    alias: String,
    /// Method specs of the transports, head first.  Always at least
    /// two entries.
    methods: Vec<MethodSpec>,
}

impl Chain {
    /// Assemble a chain description.
    ///
    /// `methods` must hold at least two transports; a single transport
    /// needs no combiner.
    pub fn new(alias: impl Into<String>, methods: Vec<MethodSpec>) -> Result<Chain> {
        if methods.len() < 2 {
            return Err(Error::ChainTooShort);
        }
        Ok(Chain {
            alias: alias.into(),
            methods,
        })
    }

    /// Return the chain's alias.
    pub fn alias(&self) -> &str {
        &self.alias
    }
}

/// A running chain head: the SOCKSv4 listener the application talks to.
///
/// Dropping the interceptor closes the listener and every connection
/// currently traversing the chain.
#[derive(Debug)]
pub struct Interceptor {
    /// The loopback address we accept application connections on.
    local_addr: SocketAddr,
    /// The accept-loop task.
    task: JoinHandle<()>,
}

impl Interceptor {
    /// Bind a fresh loopback port for `chain` and start accepting.
    ///
    /// The returned address is what gets announced to the parent
    /// process as the chain's SOCKSv4 endpoint.
    pub async fn launch(chain: Chain) -> Result<Interceptor> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .map_err(|source| Error::Bind { source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| Error::Bind { source })?;
        info!(chain = %chain.alias, %local_addr, "chain is listening");
        let task = tokio::spawn(accept_loop(listener, chain));
        Ok(Interceptor { local_addr, task })
    }

    /// Return the address the application should connect to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for Interceptor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Accept application connections forever, one chain traversal each.
async fn accept_loop(listener: TcpListener, chain: Chain) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(chain = %chain.alias, %peer, "application connected");
                let chain = chain.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, &chain).await {
                        warn!(chain = %chain.alias, error = %e, "chain connection failed");
                    }
                });
            }
            Err(e) if accept_err_is_fatal(&e) => {
                error!(chain = %chain.alias, error = %e, "chain listener failed");
                return;
            }
            Err(e) => {
                warn!(chain = %chain.alias, error = %e, "transient accept failure");
            }
        }
    }
}

/// Carry one application connection across the chain.
async fn handle_connection(mut app: TcpStream, chain: &Chain) -> Result<()> {
    // The application's requested destination is the bridge at the far
    // end of the chain.
    let request = v4::read_request(&mut app)
        .await
        .map_err(|source| Error::AppRequest { source })?;
    let bridge = request.target;
    debug!(chain = %chain.alias, bridge = %bridge, "building chain");

    match build(chain, bridge).await {
        Ok((head, relays)) => {
            v4::send_reply(&mut app, v4::Status::Granted)
                .await
                .map_err(|source| Error::AppReply { source })?;
            run_connection(app, head, relays, chain).await
        }
        Err(e) => {
            // The application is still waiting on its SOCKS reply; let
            // it down gently before hanging up.
            let _ = v4::send_reply(&mut app, v4::Status::Rejected).await;
            Err(e)
        }
    }
}

/// Allocate the relays for one connection, tail first, and dial the
/// head transport.
///
/// Returns the connection through the first transport and the relay
/// handles for the rest of the chain.
async fn build(chain: &Chain, bridge: TargetAddr) -> Result<(TcpStream, Vec<RelayHandle>)> {
    let Some((head_method, rest)) = chain.methods.split_first() else {
        return Err(Error::ChainTooShort);
    };

    // The tail relay points at the bridge; every relay before it points
    // at the one just built.  The loop runs tail-first so each relay's
    // port exists before its downstream neighbor needs it.
    let mut upstream = bridge;
    let mut relays = Vec::with_capacity(rest.len());
    for method in rest.iter().rev() {
        let relay = relay::spawn(method.clone(), upstream, &chain.alias).await?;
        upstream = TargetAddr::Ip(SocketAddr::from((Ipv4Addr::LOCALHOST, relay.port)));
        relays.push(relay);
    }

    let head = relay::connect_through(head_method, &upstream, &chain.alias).await?;
    Ok((head, relays))
}

/// Splice the application against the head transport while watching
/// every relay of this connection.
///
/// A failed relay tears the whole connection down; a finished one is
/// just noted.  When the head splice ends, surviving relays are torn
/// down with it.
async fn run_connection(
    app: TcpStream,
    head: TcpStream,
    mut relays: Vec<RelayHandle>,
    chain: &Chain,
) -> Result<()> {
    let completions: Vec<_> = relays
        .iter_mut()
        .filter_map(|r| {
            let pt = r.pt_name.clone();
            r.completion().map(|rx| (pt, rx))
        })
        .collect();
    let mut completions: FuturesUnordered<_> = completions
        .into_iter()
        .map(|(pt, rx)| async move { (pt, rx.await) })
        .collect();

    let splice = relay::splice(app, head);
    tokio::pin!(splice);

    loop {
        tokio::select! {
            result = &mut splice => {
                match &result {
                    Ok((sent, received)) => {
                        debug!(chain = %chain.alias, sent, received, "connection finished");
                    }
                    Err(e) => {
                        warn!(chain = %chain.alias, error = %e, "connection ended with error");
                    }
                }
                drop(relays);
                return result.map(|_| ());
            }
            Some((pt, outcome)) = completions.next() => {
                match outcome {
                    Ok(Ok((sent, received))) => {
                        debug!(chain = %chain.alias, pt = %pt, sent, received, "relay finished");
                    }
                    Ok(Err(e)) => {
                        warn!(
                            chain = %chain.alias, pt = %pt, error = %e,
                            "relay failed; tearing down connection"
                        );
                        drop(relays);
                        return Err(e);
                    }
                    // The relay was already torn down; nothing to report.
                    Err(futures::channel::oneshot::Canceled) => {}
                }
            }
        }
    }
}

/// Return true if an accept error means the listener is beyond saving.
///
/// Running out of file descriptors is transient; most everything else
/// is not.
fn accept_err_is_fatal(err: &std::io::Error) -> bool {
    #![allow(clippy::match_like_matches_macro)]
    match err.raw_os_error() {
        #[cfg(unix)]
        Some(libc::EMFILE) | Some(libc::ENFILE) => false,
        _ => true,
    }
}
