use crate::address::Address;
use crate::protocol::{MAX_DGRAM, ReplyCode, UdpHeader};
use anyhow::Result;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::{
    io::{AsyncReadExt, copy_bidirectional},
    net::{TcpStream, UdpSocket},
    select,
};
use tracing::{debug, info, warn};

/// TransportErrorKind classifies why an upstream channel could not be set up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    ConnectionRefused,
    TimedOut,
    ConnectionReset,
    Other,
}

/// Classify an io::Error by its kind
impl From<&io::Error> for TransportErrorKind {
    fn from(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => TransportErrorKind::ConnectionRefused,
            io::ErrorKind::TimedOut => TransportErrorKind::TimedOut,
            io::ErrorKind::ConnectionReset => TransportErrorKind::ConnectionReset,
            _ => TransportErrorKind::Other,
        }
    }
}

/// The one table from transport errors to reply codes
impl From<TransportErrorKind> for ReplyCode {
    fn from(kind: TransportErrorKind) -> Self {
        match kind {
            TransportErrorKind::ConnectionRefused => ReplyCode::ConnectionRefused,
            TransportErrorKind::TimedOut => ReplyCode::TtlExpired,
            TransportErrorKind::ConnectionReset => ReplyCode::HostUnreachable,
            TransportErrorKind::Other => ReplyCode::ServerFailure,
        }
    }
}

/// Relay is an upstream channel that has been set up for a request and
/// owns all I/O on the connection once the success reply is sent
pub enum Relay {
    Connect(Connect),
    UdpAssociate(UdpAssociation),
}

/// Relay implementation block
impl Relay {
    /// Address reported to the client in the success reply
    pub fn bound_addr(&self) -> Address {
        match self {
            Relay::Connect(connect) => connect.bound_addr().into(),
            Relay::UdpAssociate(udp) => udp.bound_addr().into(),
        }
    }

    /// run relays until the client or the upstream side is done
    pub async fn run(self, inbound: TcpStream) -> Result<()> {
        match self {
            Relay::Connect(connect) => connect.run(inbound).await,
            Relay::UdpAssociate(udp) => udp.run(inbound).await,
        }
    }
}

// ================
// CONNECT COMMAND
// ================

/// Connect holds the upstream stream of a CONNECT request
pub struct Connect {
    outbound: TcpStream,
    bound_addr: SocketAddr,
}

/// Connect implementation block
impl Connect {
    /// open connects to the destination, trying every resolved address for
    /// domain names
    pub async fn open(target: &Address) -> io::Result<Self> {
        // Literal IPs connect directly, domains go through the resolver
        let outbound = match target.socket_addr() {
            Some(addr) => TcpStream::connect(addr).await?,
            None => TcpStream::connect(target.to_string()).await?,
        };
        let bound_addr = outbound.local_addr()?;

        debug!("connected to {target} via {bound_addr}");

        Ok(Self {
            outbound,
            bound_addr,
        })
    }

    /// bound_addr is the local address of the upstream connection
    pub fn bound_addr(&self) -> SocketAddr {
        self.bound_addr
    }

    /// run copies bytes both ways until both directions reach end of stream
    /// or either side errors. Dropping the streams closes them.
    pub async fn run(mut self, mut inbound: TcpStream) -> Result<()> {
        // Copy both directions, half-closing on EOF
        let (from_client, from_server) =
            copy_bidirectional(&mut inbound, &mut self.outbound).await?;

        info!(
            "connection closed: {} bytes from client, {} bytes from server",
            from_client, from_server
        );

        Ok(())
    }
}

// ===============
// UDP ASSOCIATE
// ===============

/// UdpAssociation is the UDP relay of one UDP ASSOCIATE request.
///
/// Datagrams are told apart by source port only: a datagram whose source
/// port equals the client's is outbound, anything else is a reply from a
/// remote peer. This is not a full 5-tuple NAT table.
pub struct UdpAssociation {
    socket: UdpSocket,
    bound_addr: SocketAddr,
    peer_addr: SocketAddr,
    client_addr: Option<SocketAddr>,
}

/// UdpAssociation implementation block
impl UdpAssociation {
    /// open binds an ephemeral UDP socket in the family the request declared.
    /// `control` is the TCP connection the association belongs to.
    pub async fn open(declared: &Address, control: &TcpStream) -> io::Result<Self> {
        // Addresses of the TCP control connection
        let control_local = control.local_addr()?;
        let peer_addr = control.peer_addr()?;

        // Bind the wildcard of the declared family
        let wildcard = match declared.socket_addr() {
            Some(SocketAddr::V4(_)) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            Some(SocketAddr::V6(_)) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            // Domain names carry no family, follow the control connection
            None if control_local.is_ipv4() => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            None => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };

        let socket = UdpSocket::bind(SocketAddr::new(wildcard, 0)).await?;
        let local = socket.local_addr()?;

        // A wildcard bind is reachable on the IP the client already talks to
        let same_family = local.is_ipv4() == control_local.is_ipv4();
        let bound_addr = if local.ip().is_unspecified() && same_family {
            SocketAddr::new(control_local.ip(), local.port())
        } else {
            local
        };

        // A declared port fixes the client up front; otherwise the first
        // datagram from the control peer's IP does
        let client_addr = declared
            .socket_addr()
            .filter(|addr| addr.port() != 0)
            .map(|addr| {
                if addr.ip().is_unspecified() {
                    SocketAddr::new(peer_addr.ip(), addr.port())
                } else {
                    addr
                }
            });

        Ok(Self {
            socket,
            bound_addr,
            peer_addr,
            client_addr,
        })
    }

    /// bound_addr is the relay address announced to the client
    pub fn bound_addr(&self) -> SocketAddr {
        self.bound_addr
    }

    /// run relays datagrams until the control connection closes. The UDP
    /// socket is dropped, and so closed, when this returns.
    pub async fn run(self, mut control: TcpStream) -> Result<()> {
        let Self {
            socket,
            bound_addr,
            peer_addr,
            mut client_addr,
        } = self;

        info!("UDP relay started: server is listening on: {bound_addr}");

        // Whichever finishes first ends the association
        select! {
            closed = watch_control(&mut control) => match closed {
                Ok(()) => info!("client disconnected: terminating UDP association {bound_addr}"),
                Err(e) => warn!("TCP connection error: terminating UDP association {bound_addr}: {e}"),
            },
            relayed = relay_datagrams(&socket, peer_addr, &mut client_addr) => {
                relayed?;
            }
        }

        Ok(())
    }
}

/// watch_control resolves once the control connection reaches end of
/// stream or fails. Stray bytes are discarded.
async fn watch_control(control: &mut TcpStream) -> io::Result<()> {
    let mut buf = [0u8; 64];
    loop {
        match control.read(&mut buf).await? {
            0 => return Ok(()),
            n => debug!("discarding {n} unexpected bytes on UDP control connection"),
        }
    }
}

/// relay_datagrams is the receive loop of a UDP association. It only
/// returns when the socket itself fails.
async fn relay_datagrams(
    socket: &UdpSocket,
    peer_addr: SocketAddr,
    client_addr: &mut Option<SocketAddr>,
) -> io::Result<()> {
    let local = socket.local_addr()?;
    let mut buffer = vec![0u8; MAX_DGRAM];

    loop {
        // Receive datagram
        let (len, from) = socket.recv_from(&mut buffer).await?;
        let packet = &buffer[..len];

        // Fix the client on its first datagram if the request did not
        let client = match *client_addr {
            Some(client) => client,
            None if from.ip().to_canonical() == peer_addr.ip().to_canonical() => {
                debug!("UDP client address fixed to {from}");
                *client_addr = Some(from);
                from
            }
            None => {
                debug!("dropping {len} bytes from {from}: client has not sent yet");
                continue;
            }
        };

        // Classify by source port only
        let forwarded = if from.port() == client.port() {
            forward_to_remote(socket, &local, packet).await
        } else {
            forward_to_client(socket, packet, from, client).await
        };

        // A bad datagram is dropped, the association stays up
        if let Err(e) = forwarded {
            warn!("dropped UDP datagram from {from}: {e}");
        }
    }
}

/// forward_to_remote strips the SOCKS5 header and sends the payload to the
/// destination it names
async fn forward_to_remote(socket: &UdpSocket, local: &SocketAddr, packet: &[u8]) -> Result<()> {
    // Parse header and payload
    let (header, data) = UdpHeader::decode(packet)?;

    // Fragments are not reassembled
    if header.frag != 0x00 {
        anyhow::bail!("UDP fragmentation not supported");
    }

    // Resolve to the socket's family and send the bare payload
    let target = header.address.resolve_like(local).await?;
    socket.send_to(data, target).await?;

    debug!("forwarded {} bytes to {} ({target})", data.len(), header.address);

    Ok(())
}

/// forward_to_client wraps a remote peer's payload in a SOCKS5 header
/// naming that peer
async fn forward_to_client(
    socket: &UdpSocket,
    data: &[u8],
    from: SocketAddr,
    client: SocketAddr,
) -> Result<()> {
    // Header names the remote peer that sent the payload
    let packet = UdpHeader::new(Address::from(from)).encode(data);
    socket.send_to(&packet, client).await?;

    debug!("sent {} bytes from {from} to client {client}", data.len());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_map_to_reply_codes() {
        let cases = [
            (io::ErrorKind::ConnectionRefused, ReplyCode::ConnectionRefused),
            (io::ErrorKind::TimedOut, ReplyCode::TtlExpired),
            (io::ErrorKind::ConnectionReset, ReplyCode::HostUnreachable),
            (io::ErrorKind::PermissionDenied, ReplyCode::ServerFailure),
            (io::ErrorKind::NotFound, ReplyCode::ServerFailure),
        ];
        for (kind, code) in cases {
            let err = io::Error::from(kind);
            assert_eq!(ReplyCode::from(TransportErrorKind::from(&err)), code);
        }
    }
}
