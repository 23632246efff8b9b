//! The single-use SOCKS relay between two links of a chain.
//!
//! A relay is a loopback listener with a one-connection lifespan: the
//! first accept closes the listening port, after which the relay dials
//! the next transport's SOCKS endpoint, asks it to CONNECT to the
//! relay's upstream destination, and splices bytes until either side
//! reaches end-of-stream.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::channel::oneshot;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::{Error, Result};
use fog_ptmgr::MethodSpec;
use fog_socksproto::{SocksVersion, TargetAddr, v4, v5};

/// How long we will wait for an outbound connection plus its SOCKS
/// handshake before giving up on a relay.
pub(crate) const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// What a finished relay reports: bytes copied inbound-to-upstream and
/// upstream-to-inbound, or the failure that ended it.
pub type Outcome = std::result::Result<(u64, u64), Error>;

/// A running single-use relay.
///
/// Dropping the handle aborts the relay and closes whatever sockets it
/// still holds.
#[derive(Debug)]
pub struct RelayHandle {
    /// The loopback port the relay listens on until its first accept.
    pub port: u16,
    /// Name of the transport this relay dials.
    pub pt_name: String,
    /// Where the relay's one-shot outcome arrives.
    completion: Option<oneshot::Receiver<Outcome>>,
    /// The relay task itself.
    task: JoinHandle<()>,
}

impl RelayHandle {
    /// Take the completion receiver for this relay's one connection.
    ///
    /// Yields `Some` exactly once.
    pub fn completion(&mut self) -> Option<oneshot::Receiver<Outcome>> {
        self.completion.take()
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Bind and start one relay for the chain `chain_alias`.
///
/// The relay will accept a single connection on a fresh loopback port
/// (available as [`RelayHandle::port`] as soon as this returns), then
/// dial `downstream`'s SOCKS endpoint asking for a CONNECT to
/// `upstream`.
pub async fn spawn(
    downstream: MethodSpec,
    upstream: TargetAddr,
    chain_alias: &str,
) -> Result<RelayHandle> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .await
        .map_err(|source| Error::Bind { source })?;
    let port = listener
        .local_addr()
        .map_err(|source| Error::Bind { source })?
        .port();

    let (tx, rx) = oneshot::channel();
    let chain = chain_alias.to_owned();
    let pt_name = downstream.name.clone();
    let task = tokio::spawn(async move {
        let outcome = run(listener, &downstream, &upstream, &chain).await;
        match &outcome {
            Ok((sent, received)) => {
                debug!(
                    chain = %chain, pt = %downstream.name, port,
                    sent, received, "relay finished"
                );
            }
            Err(e) => {
                warn!(chain = %chain, pt = %downstream.name, port, error = %e, "relay failed");
            }
        }
        let _ = tx.send(outcome);
    });

    Ok(RelayHandle {
        port,
        pt_name,
        completion: Some(rx),
        task,
    })
}

/// Serve the relay's single connection.
async fn run(
    listener: TcpListener,
    downstream: &MethodSpec,
    upstream: &TargetAddr,
    chain: &str,
) -> Outcome {
    let (inbound, peer) = listener
        .accept()
        .await
        .map_err(|source| Error::Accept { source })?;
    // One connection is all we serve; give the port back immediately.
    drop(listener);
    trace!(chain, pt = %downstream.name, %peer, "relay accepted; listener closed");

    // The inbound socket stays untouched until the outbound handshake
    // is done.
    let outbound = connect_through(downstream, upstream, chain).await?;
    splice(inbound, outbound).await
}

/// Dial `method`'s SOCKS endpoint and ask it to CONNECT to `target`.
///
/// Connect and handshake together are bounded by
/// [`HANDSHAKE_TIMEOUT`]; a transport that stalls is treated like one
/// that refused.
pub(crate) async fn connect_through(
    method: &MethodSpec,
    target: &TargetAddr,
    chain: &str,
) -> Result<TcpStream> {
    trace!(chain, pt = %method.name, target = %target, "dialing transport");
    let attempt = async {
        let mut stream = TcpStream::connect(method.addr)
            .await
            .map_err(|source| Error::Connect {
                addr: method.addr,
                source,
            })?;
        match method.protocol {
            SocksVersion::V4 => v4::connect(&mut stream, target).await,
            SocksVersion::V5 => v5::connect(&mut stream, target).await,
            _ => unreachable!("SocksVersion has no other variants"),
        }
        .map_err(|source| Error::Handshake {
            pt: method.name.clone(),
            source,
        })?;
        Ok(stream)
    };
    match tokio::time::timeout(HANDSHAKE_TIMEOUT, attempt).await {
        Ok(outcome) => outcome,
        Err(_) => Err(Error::HandshakeTimeout {
            pt: method.name.clone(),
        }),
    }
}

/// Splice two established connections until either direction reaches
/// end-of-stream, then close both.
///
/// Returns the bytes copied a-to-b and b-to-a.  The direction that was
/// still in flight when the other ended is counted as far as it got.
pub(crate) async fn splice(a: TcpStream, b: TcpStream) -> Outcome {
    let a_to_b_count = AtomicU64::new(0);
    let b_to_a_count = AtomicU64::new(0);
    let (a_read, a_write) = a.into_split();
    let (b_read, b_write) = b.into_split();

    let a_to_b = copy_until_eof(a_read, b_write, &a_to_b_count);
    let b_to_a = copy_until_eof(b_read, a_write, &b_to_a_count);
    tokio::pin!(a_to_b);
    tokio::pin!(b_to_a);

    let first_result = tokio::select! {
        r = &mut a_to_b => r,
        r = &mut b_to_a => r,
    };
    let copied = (
        a_to_b_count.load(Ordering::Relaxed),
        b_to_a_count.load(Ordering::Relaxed),
    );
    match first_result {
        Ok(()) => Ok(copied),
        Err(source) => Err(Error::Splice { source }),
    }
}

/// Copy bytes from `reader` to `writer` until end-of-stream, keeping a
/// running count in `copied`.
async fn copy_until_eof<R, W>(
    mut reader: R,
    mut writer: W,
    copied: &AtomicU64,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0_u8; 2048];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        copied.fetch_add(n as u64, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use fog_socksproto::SocksVersion;

    /// Start a fake SOCKSv5 transport that accepts our handshake and
    /// then echoes everything back on the same connection.
    async fn fake_echo_pt() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => return,
                };
                tokio::spawn(async move {
                    let mut greeting = [0_u8; 2];
                    stream.read_exact(&mut greeting).await.unwrap();
                    let mut methods = vec![0_u8; usize::from(greeting[1])];
                    stream.read_exact(&mut methods).await.unwrap();
                    stream.write_all(&[5, 0]).await.unwrap();

                    let mut head = [0_u8; 4];
                    stream.read_exact(&mut head).await.unwrap();
                    assert_eq!(head[3], 1, "test transport only handles IPv4 targets");
                    let mut rest = [0_u8; 6];
                    stream.read_exact(&mut rest).await.unwrap();
                    stream
                        .write_all(&[5, 0, 0, 1, 0, 0, 0, 0, 0, 0])
                        .await
                        .unwrap();

                    let mut buf = [0_u8; 1024];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => {
                                if stream.write_all(&buf[..n]).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    /// Start a fake SOCKSv5 transport that refuses every CONNECT.
    async fn fake_refusing_pt() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => return,
                };
                tokio::spawn(async move {
                    let mut greeting = [0_u8; 2];
                    stream.read_exact(&mut greeting).await.unwrap();
                    let mut methods = vec![0_u8; usize::from(greeting[1])];
                    stream.read_exact(&mut methods).await.unwrap();
                    stream.write_all(&[5, 0]).await.unwrap();
                    let mut head = [0_u8; 4];
                    stream.read_exact(&mut head).await.unwrap();
                    let mut rest = [0_u8; 6];
                    stream.read_exact(&mut rest).await.unwrap();
                    // "connection refused"
                    stream
                        .write_all(&[5, 5, 0, 1, 0, 0, 0, 0, 0, 0])
                        .await
                        .unwrap();
                });
            }
        });
        addr
    }

    fn method_at(addr: SocketAddr) -> MethodSpec {
        MethodSpec::new("fakept", SocksVersion::V5, addr)
    }

    #[tokio::test]
    async fn relays_bytes_and_uses_port_once() {
        let pt = fake_echo_pt().await;
        let upstream: TargetAddr = "192.0.2.10:7".parse::<SocketAddr>().unwrap().into();
        let mut relay = spawn(method_at(pt), upstream, "testchain").await.unwrap();
        let completion = relay.completion().unwrap();
        assert!(relay.completion().is_none());

        let mut client = TcpStream::connect((Ipv4Addr::LOCALHOST, relay.port))
            .await
            .unwrap();
        client.write_all(b"through the fog").await.unwrap();
        let mut reply = [0_u8; 15];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"through the fog");

        // The port closed at first accept; nobody else can connect.
        assert!(
            TcpStream::connect((Ipv4Addr::LOCALHOST, relay.port))
                .await
                .is_err()
        );

        drop(client);
        let (sent, received) = completion.await.unwrap().unwrap();
        assert_eq!(sent, 15);
        assert_eq!(received, 15);
    }

    #[tokio::test]
    async fn same_method_spec_gets_distinct_ports() {
        let pt = fake_echo_pt().await;
        let upstream: TargetAddr = "192.0.2.10:7".parse::<SocketAddr>().unwrap().into();
        let one = spawn(method_at(pt), upstream.clone(), "twins").await.unwrap();
        let two = spawn(method_at(pt), upstream, "twins").await.unwrap();
        assert_ne!(one.port, two.port);
    }

    #[tokio::test]
    async fn refused_handshake_fails_completion() {
        let pt = fake_refusing_pt().await;
        let upstream: TargetAddr = "192.0.2.10:7".parse::<SocketAddr>().unwrap().into();
        let mut relay = spawn(method_at(pt), upstream, "testchain").await.unwrap();
        let completion = relay.completion().unwrap();

        let _client = TcpStream::connect((Ipv4Addr::LOCALHOST, relay.port))
            .await
            .unwrap();
        let outcome = completion.await.unwrap();
        assert!(matches!(
            outcome,
            Err(Error::Handshake { ref pt, .. }) if pt == "fakept"
        ));
    }

    #[tokio::test]
    async fn unreachable_transport_fails_completion() {
        // A port nobody listens on: bind one, then drop it.
        let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = unused.local_addr().unwrap();
        drop(unused);

        let upstream: TargetAddr = "192.0.2.10:7".parse::<SocketAddr>().unwrap().into();
        let mut relay = spawn(method_at(dead), upstream, "testchain").await.unwrap();
        let completion = relay.completion().unwrap();

        let _client = TcpStream::connect((Ipv4Addr::LOCALHOST, relay.port))
            .await
            .unwrap();
        let outcome = completion.await.unwrap();
        assert!(matches!(outcome, Err(Error::Connect { .. })));
    }
}
