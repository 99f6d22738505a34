use crate::auth::AuthRegistry;
use crate::protocol::{
    AddressType, AuthMethod, AuthReply, AuthStatus, Command, MethodReply, MethodRequest, Reply,
    ReplyCode, Request, Version,
};
use crate::relay::{Connect, Relay, TransportErrorKind, UdpAssociation};
use anyhow::Result;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time,
};
use tracing::{debug, info, warn};

/// IdleTimeout is returned when a client sends nothing for the whole idle
/// timeout before the relay starts
#[derive(Debug, Error)]
#[error("no data from client within {0:?}")]
pub struct IdleTimeout(pub Duration);

/// Phase is where a connection is in the SOCKS5 exchange. Phases only ever
/// move forward, in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    AwaitingMethods,
    AwaitingSubnegotiation { method: u8 },
    AwaitingRequest,
    Relaying,
    Closed,
}

/// Connection drives one accepted client through negotiation,
/// authentication and the request, then hands the socket to the relay
pub struct Connection {
    stream: TcpStream,
    peer_addr: SocketAddr,
    registry: Arc<AuthRegistry>,
    idle_timeout: Duration,
    phase: Phase,
}

/// Connection implementation block
impl Connection {
    /// new is a constructor for a freshly accepted client, awaiting its
    /// greeting
    pub fn new(
        stream: TcpStream,
        peer_addr: SocketAddr,
        registry: Arc<AuthRegistry>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            stream,
            peer_addr,
            registry,
            idle_timeout,
            phase: Phase::AwaitingMethods,
        }
    }

    /// run handles the full client/server SOCKS5 protocol flow
    pub async fn run(mut self) -> Result<()> {
        // Drive the pre-relay phases
        let relay = match self.handshake().await {
            Ok(Some(relay)) => relay,
            Ok(None) => {
                self.close();
                // The peer may already be gone, the reply was best effort
                let _ = self.stream.shutdown().await;
                return Ok(());
            }
            Err(e) if e.is::<IdleTimeout>() => {
                warn!("closing {} in {:?}: {e}", self.peer_addr, self.phase);
                self.close();
                return Ok(());
            }
            Err(e) if is_disconnect(&e) => {
                // Client hung up mid-handshake, not a server fault
                debug!("{} disconnected in {:?}: {e}", self.peer_addr, self.phase);
                self.close();
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        // Hand the socket over to the relay
        self.advance(Phase::Relaying);
        relay.run(self.stream).await
    }

    /// handshake runs the pre-relay phases and returns the relay to start,
    /// or `None` when the connection is to be closed
    async fn handshake(&mut self) -> Result<Option<Relay>> {
        loop {
            match self.phase {
                Phase::AwaitingMethods => {
                    let next = self.negotiate_method().await?;
                    self.advance(next);
                }
                Phase::AwaitingSubnegotiation { method } => {
                    let next = self.authenticate(method).await?;
                    self.advance(next);
                }
                Phase::AwaitingRequest => return self.handle_request().await,
                Phase::Relaying | Phase::Closed => return Ok(None),
            }
        }
    }

    /// advance moves to the next phase, never backwards
    fn advance(&mut self, next: Phase) {
        debug_assert!(next > self.phase, "{:?} -> {:?}", self.phase, next);
        debug!("{}: {:?} -> {:?}", self.peer_addr, self.phase, next);
        self.phase = next;
    }

    /// close moves to Closed unless already there
    fn close(&mut self) {
        if self.phase != Phase::Closed {
            self.advance(Phase::Closed);
        }
    }

    /// negotiate_method reads the client greeting and picks the first
    /// offered method the registry knows
    async fn negotiate_method(&mut self) -> Result<Phase> {
        // ClientHello, bounded by the idle timeout
        let frame = idle(self.idle_timeout, read_method_request(&mut self.stream)).await?;

        // Ensure version is 0x05 -> SOCKS5
        if frame.first() != Some(&(Version::SOCKS5 as u8)) {
            warn!("{}: not SOCKS5, version byte {:?}", self.peer_addr, frame.first());
            self.stream
                .write_all(&MethodReply::no_acceptable().encode())
                .await?;
            return Ok(Phase::Closed);
        }

        let request = MethodRequest::decode(&frame)?;

        // Retrieve desired method, in client preference order
        let Some(method) = self.registry.select(&request.methods) else {
            info!(
                "{}: no acceptable auth method in {:02x?}",
                self.peer_addr, request.methods
            );
            self.stream
                .write_all(&MethodReply::no_acceptable().encode())
                .await?;
            return Ok(Phase::Closed);
        };

        // Write response to client with selected method
        debug!("{}: auth method {method:#04x}", self.peer_addr);
        self.stream.write_all(&MethodReply { method }.encode()).await?;

        // NO AUTH skips the sub-negotiation
        if method == AuthMethod::NoAuth as u8 {
            Ok(Phase::AwaitingRequest)
        } else {
            Ok(Phase::AwaitingSubnegotiation { method })
        }
    }

    /// authenticate runs the selected method's strategy over one
    /// sub-negotiation frame
    async fn authenticate(&mut self, method: u8) -> Result<Phase> {
        let frame = idle(self.idle_timeout, read_subnegotiation(&mut self.stream)).await?;

        // Hand the raw frame to the registered strategy
        let authorized = self
            .registry
            .resolve(method)
            .is_some_and(|entry| entry.authorize(&frame));

        let status = if authorized {
            AuthStatus::Success
        } else {
            AuthStatus::Failure
        };
        self.stream.write_all(&AuthReply { status }.encode()).await?;

        if authorized {
            debug!("{}: authenticated", self.peer_addr);
            Ok(Phase::AwaitingRequest)
        } else {
            warn!("{}: authentication failed", self.peer_addr);
            Ok(Phase::Closed)
        }
    }

    /// handle_request validates the request and sets up its relay. Every
    /// refusal is answered with the matching reply code.
    async fn handle_request(&mut self) -> Result<Option<Relay>> {
        let frame = idle(self.idle_timeout, read_request(&mut self.stream)).await?;

        // Version, command and address are checked in that order
        let request = match Request::decode(&frame) {
            Ok(request) => request,
            Err(e) => {
                warn!("{}: refusing request: {e}", self.peer_addr);
                self.reply(Reply::failure(e.reply_code())).await?;
                return Ok(None);
            }
        };

        debug!(
            "{}: {:?} {}",
            self.peer_addr, request.command, request.address
        );

        // Set up the upstream side for the command
        let setup = match request.command {
            Command::Connect => Connect::open(&request.address).await.map(Relay::Connect),
            Command::UdpAssociate => UdpAssociation::open(&request.address, &self.stream)
                .await
                .map(Relay::UdpAssociate),
            Command::Bind => {
                info!("{}: BIND not supported", self.peer_addr);
                self.reply(Reply::failure(ReplyCode::CommandNotSupported))
                    .await?;
                return Ok(None);
            }
        };

        match setup {
            Ok(relay) => {
                self.reply(Reply::new(ReplyCode::Succeeded, relay.bound_addr()))
                    .await?;
                Ok(Some(relay))
            }
            Err(e) => {
                // Map the transport error onto a reply code
                let code = ReplyCode::from(TransportErrorKind::from(&e));
                info!(
                    "{}: {:?} {} failed: {e} ({code:?})",
                    self.peer_addr, request.command, request.address
                );
                self.reply(Reply::failure(code)).await?;
                Ok(None)
            }
        }
    }

    /// reply writes one request reply to the client
    async fn reply(&mut self, reply: Reply) -> io::Result<()> {
        self.stream.write_all(&reply.encode()).await
    }
}

/// idle bounds one protocol read by the idle timeout
async fn idle<T>(limit: Duration, read: impl Future<Output = io::Result<T>>) -> Result<T> {
    match time::timeout(limit, read).await {
        Ok(frame) => Ok(frame?),
        Err(_) => Err(IdleTimeout(limit).into()),
    }
}

/// is_disconnect reports whether a handshake error is the client going away
fn is_disconnect(err: &anyhow::Error) -> bool {
    err.downcast_ref::<io::Error>().is_some_and(|e| {
        matches!(
            e.kind(),
            io::ErrorKind::UnexpectedEof
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::BrokenPipe
        )
    })
}

/// read_method_request reads one greeting frame. A frame with the wrong
/// version is returned as just its two header bytes.
pub async fn read_method_request<R: AsyncRead + Unpin>(stream: &mut R) -> io::Result<Vec<u8>> {
    // VER and NMETHODS
    let mut frame = vec![0u8; 2];
    stream.read_exact(&mut frame).await?;

    if frame[0] != Version::SOCKS5 as u8 {
        return Ok(frame);
    }

    // METHODS
    let n_methods = frame[1] as usize;
    frame.resize(2 + n_methods, 0);
    stream.read_exact(&mut frame[2..]).await?;
    Ok(frame)
}

/// read_subnegotiation reads one RFC 1929 shaped frame:
/// VER ULEN UNAME PLEN PASSWD
pub async fn read_subnegotiation<R: AsyncRead + Unpin>(stream: &mut R) -> io::Result<Vec<u8>> {
    // VER and ULEN
    let mut frame = vec![0u8; 2];
    stream.read_exact(&mut frame).await?;

    // username plus the password length byte
    let ulen = frame[1] as usize;
    frame.resize(2 + ulen + 1, 0);
    stream.read_exact(&mut frame[2..]).await?;

    // password
    let plen = frame[2 + ulen] as usize;
    let start = frame.len();
    frame.resize(start + plen, 0);
    stream.read_exact(&mut frame[start..]).await?;
    Ok(frame)
}

/// read_request reads one request frame. An unknown address type ends the
/// frame after ATYP, since its length cannot be known.
pub async fn read_request<R: AsyncRead + Unpin>(stream: &mut R) -> io::Result<Vec<u8>> {
    // VER CMD RSV ATYP
    let mut frame = vec![0u8; 4];
    stream.read_exact(&mut frame).await?;

    // Remaining address bytes plus the two port bytes
    let rest = match AddressType::from_byte(frame[3]) {
        Some(AddressType::IPv4) => 4 + 2,
        Some(AddressType::IPv6) => 16 + 2,
        Some(AddressType::DomainName) => {
            let len = stream.read_u8().await?;
            frame.push(len);
            len as usize + 2
        }
        None => return Ok(frame),
    };

    let start = frame.len();
    frame.resize(start + rest, 0);
    stream.read_exact(&mut frame[start..]).await?;
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::protocol::UserPassRequest;

    #[tokio::test]
    async fn reads_greeting_across_partial_writes() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let reader = tokio::spawn(async move { read_method_request(&mut server).await });

        client.write_all(&[0x05, 0x02]).await.unwrap();
        tokio::task::yield_now().await;
        client.write_all(&[0x00]).await.unwrap();
        client.write_all(&[0x02]).await.unwrap();

        let frame = reader.await.unwrap().unwrap();
        assert_eq!(frame, vec![0x05, 0x02, 0x00, 0x02]);
    }

    #[tokio::test]
    async fn wrong_version_greeting_stops_after_header() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[0x04, 0x01]).await.unwrap();
        let frame = read_method_request(&mut server).await.unwrap();
        assert_eq!(frame, vec![0x04, 0x01]);
    }

    #[tokio::test]
    async fn reads_subnegotiation_frame() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let payload = UserPassRequest::new("user", "pass").encode();
        client.write_all(&payload).await.unwrap();
        client.write_all(b"trailing").await.unwrap();
        assert_eq!(read_subnegotiation(&mut server).await.unwrap(), payload);
    }

    #[tokio::test]
    async fn reads_domain_request_frame() {
        let (mut client, mut server) = tokio::io::duplex(128);
        let request = Request {
            command: Command::Connect,
            address: Address::domain("example.com", 80),
        };
        client.write_all(&request.encode()).await.unwrap();
        let frame = read_request(&mut server).await.unwrap();
        assert_eq!(Request::decode(&frame).unwrap(), request);
    }

    #[tokio::test]
    async fn unknown_address_type_frame_is_header_only() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[0x05, 0x01, 0x00, 0x09]).await.unwrap();
        let frame = read_request(&mut server).await.unwrap();
        assert_eq!(
            Request::decode(&frame).unwrap_err().reply_code(),
            ReplyCode::AddrTypeUnsupported
        );
    }

    #[tokio::test]
    async fn short_stream_is_an_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        drop(client);
        let err = read_request(&mut server).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn client_hangup_is_a_disconnect() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        let err: anyhow::Error = read_method_request(&mut server).await.unwrap_err().into();
        assert!(is_disconnect(&err));

        assert!(!is_disconnect(&IdleTimeout(Duration::from_secs(1)).into()));
        assert!(!is_disconnect(&io::Error::from(io::ErrorKind::PermissionDenied).into()));
    }

    #[test]
    fn phases_are_ordered() {
        assert!(Phase::AwaitingMethods < Phase::AwaitingSubnegotiation { method: 2 });
        assert!(Phase::AwaitingSubnegotiation { method: 2 } < Phase::AwaitingRequest);
        assert!(Phase::AwaitingRequest < Phase::Relaying);
        assert!(Phase::Relaying < Phase::Closed);
    }
}
