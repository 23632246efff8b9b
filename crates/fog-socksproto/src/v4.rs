//! The SOCKSv4 and SOCKSv4a handshakes: client and server sides.
//!
//! SOCKSv4 has no negotiation phase: the client sends a single CONNECT
//! request, and the server answers with a single 8-byte reply.  The
//! "4a" extension marks the destination IP as `0.0.0.x` (x nonzero)
//! and appends a NUL-terminated hostname after the userid field.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Error, Result, TargetAddr};

/// Version byte of a SOCKSv4 request.
const SOCKS_V4: u8 = 4;
/// Version byte of a SOCKSv4 reply.
const REPLY_VERSION: u8 = 0;
/// Command code for CONNECT.
const CMD_CONNECT: u8 = 1;
/// Reply code: request granted.
const REQUEST_GRANTED: u8 = 90;
/// Reply code: request rejected or failed.
const REQUEST_REJECTED: u8 = 91;
/// Cap on the NUL-terminated variable-length fields we will read.
const MAX_FIELD_LEN: usize = 255;

/// Build the wire form of a SOCKSv4 CONNECT request for `target`.
///
/// Hostname targets use the v4a convention.  IPv6 targets are not
/// expressible in this protocol version.
fn encode_connect(target: &TargetAddr) -> Result<Vec<u8>> {
    let mut msg = Vec::with_capacity(16);
    msg.push(SOCKS_V4);
    msg.push(CMD_CONNECT);
    match target {
        TargetAddr::Ip(SocketAddr::V4(addr)) => {
            msg.extend_from_slice(&addr.port().to_be_bytes());
            msg.extend_from_slice(&addr.ip().octets());
            msg.push(0); // empty userid
        }
        TargetAddr::Ip(SocketAddr::V6(_)) => return Err(Error::AddressNotSupported),
        TargetAddr::Domain(host, port) => {
            if host.is_empty() || host.len() > MAX_FIELD_LEN || host.as_bytes().contains(&0) {
                return Err(Error::BadHostname);
            }
            msg.extend_from_slice(&port.to_be_bytes());
            msg.extend_from_slice(&[0, 0, 0, 1]);
            msg.push(0); // empty userid
            msg.extend_from_slice(host.as_bytes());
            msg.push(0);
        }
    }
    Ok(msg)
}

/// Run the client side of a SOCKSv4 handshake on `stream`, asking the
/// proxy to CONNECT to `target`.
///
/// On success the proxy has granted the request, and the stream now
/// carries the proxied connection.
pub async fn connect<S>(stream: &mut S, target: &TargetAddr) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = encode_connect(target)?;
    stream.write_all(&request).await?;
    stream.flush().await?;

    let mut reply = [0_u8; 8];
    stream.read_exact(&mut reply).await?;
    if reply[0] != REPLY_VERSION {
        return Err(Error::BadProtocol(reply[0]));
    }
    match reply[1] {
        REQUEST_GRANTED => Ok(()),
        code => Err(Error::Rejected(code)),
    }
}

/// A parsed SOCKSv4 CONNECT request, as seen by a server.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Request {
    /// Where the client wants us to connect.
    pub target: TargetAddr,
}

/// Read one SOCKSv4 CONNECT request from `stream`.
///
/// Accepts the v4a hostname form.  The userid field is read and
/// discarded; SOCKSv4 "authentication" carries no secret.
pub async fn read_request<S>(stream: &mut S) -> Result<Request>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0_u8; 8];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS_V4 {
        return Err(Error::BadProtocol(header[0]));
    }
    if header[1] != CMD_CONNECT {
        return Err(Error::UnsupportedCommand(header[1]));
    }
    let port = u16::from_be_bytes([header[2], header[3]]);
    let ip = Ipv4Addr::new(header[4], header[5], header[6], header[7]);
    let _userid = read_nul_terminated(stream).await?;

    let target = if is_hostname_marker(ip) {
        let host = read_nul_terminated(stream).await?;
        let host = String::from_utf8(host).map_err(|_| Error::BadHostname)?;
        if host.is_empty() {
            return Err(Error::BadHostname);
        }
        TargetAddr::Domain(host, port)
    } else {
        TargetAddr::Ip(SocketAddr::V4(SocketAddrV4::new(ip, port)))
    };
    Ok(Request { target })
}

/// Whether `ip` is the v4a marker address `0.0.0.x`, x nonzero.
fn is_hostname_marker(ip: Ipv4Addr) -> bool {
    let octets = ip.octets();
    octets[0] == 0 && octets[1] == 0 && octets[2] == 0 && octets[3] != 0
}

/// Read a NUL-terminated field of at most [`MAX_FIELD_LEN`] bytes.
async fn read_nul_terminated<S>(stream: &mut S) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut field = Vec::new();
    loop {
        let mut byte = [0_u8; 1];
        stream.read_exact(&mut byte).await?;
        if byte[0] == 0 {
            return Ok(field);
        }
        if field.len() >= MAX_FIELD_LEN {
            return Err(Error::FieldTooLong);
        }
        field.push(byte[0]);
    }
}

/// The outcome a SOCKSv4 server reports for a CONNECT request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Status {
    /// The request was granted; the proxied connection follows.
    Granted,
    /// The request was rejected or could not be carried out.
    Rejected,
}

/// Send a SOCKSv4 reply with the given status.
pub async fn send_reply<S>(stream: &mut S, status: Status) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let code = match status {
        Status::Granted => REQUEST_GRANTED,
        Status::Rejected => REQUEST_REJECTED,
    };
    // The address and port fields of a CONNECT reply are meaningless;
    // we send zeros like everybody else.
    let mut reply = [0_u8; 8];
    reply[1] = code;
    stream.write_all(&reply).await?;
    stream.flush().await?;
    Ok(())
}
