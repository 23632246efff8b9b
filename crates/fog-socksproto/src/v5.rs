//! The client side of the SOCKSv5 handshake.
//!
//! SOCKSv5 needs two round trips: one to agree on an authentication
//! method (we only ever offer "none"), and one for the CONNECT request
//! itself.  We ignore the bound address in the reply; transports always
//! relay on the connection we already hold.

use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Error, Result, TargetAddr};

/// Version byte of every SOCKSv5 message.
const SOCKS_V5: u8 = 5;
/// Authentication method: none.
const AUTH_NONE: u8 = 0;
/// Command code for CONNECT.
const CMD_CONNECT: u8 = 1;
/// Address type: IPv4.
const ATYP_IPV4: u8 = 1;
/// Address type: hostname.
const ATYP_HOSTNAME: u8 = 3;
/// Address type: IPv6.
const ATYP_IPV6: u8 = 4;
/// Reply code: succeeded.
const REPLY_SUCCEEDED: u8 = 0;

/// Build the wire form of a SOCKSv5 CONNECT request for `target`.
fn encode_connect(target: &TargetAddr) -> Result<Vec<u8>> {
    let mut msg = Vec::with_capacity(32);
    msg.push(SOCKS_V5);
    msg.push(CMD_CONNECT);
    msg.push(0); // reserved
    match target {
        TargetAddr::Ip(SocketAddr::V4(addr)) => {
            msg.push(ATYP_IPV4);
            msg.extend_from_slice(&addr.ip().octets());
            msg.extend_from_slice(&addr.port().to_be_bytes());
        }
        TargetAddr::Ip(SocketAddr::V6(addr)) => {
            msg.push(ATYP_IPV6);
            msg.extend_from_slice(&addr.ip().octets());
            msg.extend_from_slice(&addr.port().to_be_bytes());
        }
        TargetAddr::Domain(host, port) => {
            let bytes = host.as_bytes();
            if bytes.is_empty() || bytes.len() > usize::from(u8::MAX) {
                return Err(Error::BadHostname);
            }
            msg.push(ATYP_HOSTNAME);
            msg.push(bytes.len() as u8);
            msg.extend_from_slice(bytes);
            msg.extend_from_slice(&port.to_be_bytes());
        }
    }
    Ok(msg)
}

/// Run the client side of a SOCKSv5 handshake on `stream`, asking the
/// proxy to CONNECT to `target`.
///
/// On success the proxy has accepted the request, and the stream now
/// carries the proxied connection.
pub async fn connect<S>(stream: &mut S, target: &TargetAddr) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Method negotiation: we offer exactly one method, "none".
    stream.write_all(&[SOCKS_V5, 1, AUTH_NONE]).await?;
    stream.flush().await?;

    let mut choice = [0_u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != SOCKS_V5 {
        return Err(Error::BadProtocol(choice[0]));
    }
    if choice[1] != AUTH_NONE {
        return Err(Error::AuthRefused(choice[1]));
    }

    let request = encode_connect(target)?;
    stream.write_all(&request).await?;
    stream.flush().await?;

    let mut head = [0_u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_V5 {
        return Err(Error::BadProtocol(head[0]));
    }
    if head[1] != REPLY_SUCCEEDED {
        return Err(Error::Rejected(head[1]));
    }
    // Drain the bound address; its content doesn't matter to us.
    let addr_len = match head[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_HOSTNAME => {
            let mut len = [0_u8; 1];
            stream.read_exact(&mut len).await?;
            usize::from(len[0])
        }
        _ => return Err(Error::Syntax("unknown address type in reply")),
    };
    let mut bound = vec![0_u8; addr_len + 2];
    stream.read_exact(&mut bound).await?;
    Ok(())
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use tokio::io::duplex;

    #[test]
    fn encode_ipv4() {
        let target: TargetAddr = "203.0.113.5:9001".parse::<SocketAddr>().unwrap().into();
        let msg = encode_connect(&target).unwrap();
        assert_eq!(msg, vec![5, 1, 0, 1, 203, 0, 113, 5, 0x23, 0x29]);
    }

    #[test]
    fn encode_ipv6() {
        let target: TargetAddr = "[2001:db8::2]:80".parse::<SocketAddr>().unwrap().into();
        let msg = encode_connect(&target).unwrap();
        assert_eq!(msg[3], ATYP_IPV6);
        assert_eq!(msg.len(), 4 + 16 + 2);
    }

    #[test]
    fn encode_hostname() {
        let msg = encode_connect(&TargetAddr::Domain("example.org".into(), 80)).unwrap();
        assert_eq!(&msg[..5], &[5, 1, 0, 3, 11]);
        assert_eq!(&msg[5..16], b"example.org");
        assert_eq!(&msg[16..], &[0, 80]);
    }

    #[tokio::test]
    async fn successful_connect() {
        let (mut client, mut server) = duplex(256);
        let target: TargetAddr = "198.51.100.1:443".parse::<SocketAddr>().unwrap().into();

        let proxy = tokio::spawn(async move {
            let mut greeting = [0_u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [5, 1, 0]);
            server.write_all(&[5, 0]).await.unwrap();

            let mut request = [0_u8; 10];
            server.read_exact(&mut request).await.unwrap();
            assert_eq!(&request[..4], &[5, 1, 0, 1]);
            server
                .write_all(&[5, 0, 0, 1, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        connect(&mut client, &target).await.unwrap();
        proxy.await.unwrap();
    }

    #[tokio::test]
    async fn refused_auth() {
        let (mut client, mut server) = duplex(64);
        let target: TargetAddr = "198.51.100.1:443".parse::<SocketAddr>().unwrap().into();
        server.write_all(&[5, 0xFF]).await.unwrap();
        assert!(matches!(
            connect(&mut client, &target).await,
            Err(Error::AuthRefused(0xFF))
        ));
    }

    #[tokio::test]
    async fn rejected_connect() {
        let (mut client, mut server) = duplex(256);
        let target = TargetAddr::Domain("example.org".into(), 80);

        let proxy = tokio::spawn(async move {
            let mut greeting = [0_u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            server.write_all(&[5, 0]).await.unwrap();
            let mut request = vec![0_u8; 18];
            server.read_exact(&mut request).await.unwrap();
            // "connection refused" with an empty IPv4 bound address.
            server
                .write_all(&[5, 5, 0, 1, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        assert!(matches!(
            connect(&mut client, &target).await,
            Err(Error::Rejected(5))
        ));
        proxy.await.unwrap();
    }
}
