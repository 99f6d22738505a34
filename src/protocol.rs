//! SOCKS5 constants and the wire codec for every frame the server reads or writes.
//!
//! All decoding here is pure: a frame is decoded from a complete byte slice and
//! a short or malformed slice yields a [`DecodeError`], never a partial frame.
//! Reading the bytes of one frame off a stream lives in `connection`.

use crate::address::{Address, AddressError};
use thiserror::Error;

// RSV: Fields marked RESERVED (RSV) must be set to X'00'.
pub const RSV: u8 = 0x00;

/// Version byte of the RFC 1929 username/password sub-negotiation request
pub const SUBNEGOTIATION_VERSION: u8 = 0x01;

/// Largest UDP payload the relay will receive in one datagram
pub const MAX_DGRAM: usize = 65_535;

/// AddressType represents the SOCKS5 address types:
/// IPv4, Domain Name, IPv6
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressType {
    IPv4 = 0x01,
    DomainName = 0x03,
    IPv6 = 0x04,
}

impl AddressType {
    /// from_byte converts a byte to its related network address type
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(AddressType::IPv4),
            0x03 => Some(AddressType::DomainName),
            0x04 => Some(AddressType::IPv6),
            _ => None,
        }
    }
}

/// Version represents available SOCKS proxy versions
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    SOCKS5 = 0x05,
}

/// AuthMethod represents the SOCKS5 authentication methods the server
/// ships strategies for. Other method ids (e.g. private 0x80 - 0xFE) can
/// still be registered with a custom strategy.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthMethod {
    NoAuth = 0x00,
    UserPass = 0x02,
    // 0x03 - 0x7f: IANA reserved
    // 0x80 - 0xFE: private methods
    NoAcceptable = 0xFF,
}

impl AuthMethod {
    /// from_byte converts a byte to a known auth method
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(AuthMethod::NoAuth),
            0x02 => Some(AuthMethod::UserPass),
            0xFF => Some(AuthMethod::NoAcceptable),
            _ => None,
        }
    }
}

/// AuthStatus is the STATUS byte of the sub-negotiation reply
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    Success = 0x00,
    Failure = 0x01,
}

/// Command represents SOCKS5 protocol commands
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect = 0x01,
    Bind = 0x02,
    UdpAssociate = 0x03,
}

impl Command {
    /// from_byte converts a byte to its related SOCKS5 protocol command
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Command::Connect),
            0x02 => Some(Command::Bind),
            0x03 => Some(Command::UdpAssociate),
            _ => None,
        }
    }
}

/// ReplyCode is the REP field of a request reply
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyCode {
    Succeeded = 0x00,
    ServerFailure = 0x01,
    ConnectionNotAllowed = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddrTypeUnsupported = 0x08,
    // 0x09 - 0xFF: unassigned
}

impl ReplyCode {
    /// from_byte converts a byte to its reply code
    pub fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            0x00 => ReplyCode::Succeeded,
            0x01 => ReplyCode::ServerFailure,
            0x02 => ReplyCode::ConnectionNotAllowed,
            0x03 => ReplyCode::NetworkUnreachable,
            0x04 => ReplyCode::HostUnreachable,
            0x05 => ReplyCode::ConnectionRefused,
            0x06 => ReplyCode::TtlExpired,
            0x07 => ReplyCode::CommandNotSupported,
            0x08 => ReplyCode::AddrTypeUnsupported,
            _ => return None,
        })
    }
}

/// DecodeError reports a frame that is too short or internally inconsistent
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("{0} frame is truncated")]
    Truncated(&'static str),

    #[error("{0} field is not valid UTF-8")]
    Utf8(&'static str),

    #[error("unknown reply code: {0:#04x}")]
    UnknownReply(u8),

    #[error(transparent)]
    Address(#[from] AddressError),
}

/// RequestError is a request frame the server must refuse, paired with the
/// reply code it is refused with
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("request frame is truncated")]
    Truncated,

    #[error("unsupported request version: {0:#04x}")]
    Version(u8),

    #[error("unsupported command: {0:#04x}")]
    Command(u8),

    #[error("invalid destination: {0}")]
    Address(#[from] AddressError),
}

impl RequestError {
    /// reply_code is the REP the request is refused with
    pub fn reply_code(&self) -> ReplyCode {
        match self {
            RequestError::Truncated => ReplyCode::ServerFailure,
            RequestError::Version(_) => ReplyCode::ConnectionNotAllowed,
            RequestError::Command(_) => ReplyCode::CommandNotSupported,
            RequestError::Address(_) => ReplyCode::AddrTypeUnsupported,
        }
    }
}

/// MethodRequest is the client greeting
///
/// ```text
/// +----+----------+----------+
/// |VER | NMETHODS | METHODS  |
/// +----+----------+----------+
/// | 1  |    1     | 1 to 255 |
/// +----+----------+----------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodRequest {
    pub version: u8,
    pub methods: Vec<u8>,
}

impl MethodRequest {
    /// decode parses a greeting, NMETHODS must match the method bytes
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let [version, n_methods, rest @ ..] = buf else {
            return Err(DecodeError::Truncated("method request"));
        };
        let methods = rest
            .get(..*n_methods as usize)
            .ok_or(DecodeError::Truncated("method request"))?;
        Ok(Self {
            version: *version,
            methods: methods.to_vec(),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(2 + self.methods.len());
        buf.push(self.version);
        buf.push(self.methods.len() as u8);
        buf.extend_from_slice(&self.methods);
        buf
    }
}

/// MethodReply is the server's method selection
///
/// ```text
/// +----+--------+
/// |VER | METHOD |
/// +----+--------+
/// | 1  |   1    |
/// +----+--------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodReply {
    pub method: u8,
}

impl MethodReply {
    /// no_acceptable is the 0xFF refusal
    pub fn no_acceptable() -> Self {
        Self {
            method: AuthMethod::NoAcceptable as u8,
        }
    }

    pub fn encode(&self) -> [u8; 2] {
        [Version::SOCKS5 as u8, self.method]
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        match buf {
            [_, method, ..] => Ok(Self { method: *method }),
            _ => Err(DecodeError::Truncated("method reply")),
        }
    }
}

/// UserPassRequest is the RFC 1929 sub-negotiation request
///
/// ```text
/// +----+------+----------+------+----------+
/// |VER | ULEN |  UNAME   | PLEN |  PASSWD  |
/// +----+------+----------+------+----------+
/// | 1  |  1   | 1 to 255 |  1   | 1 to 255 |
/// +----+------+----------+------+----------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserPassRequest {
    pub version: u8,
    pub username: String,
    pub password: String,
}

impl UserPassRequest {
    /// new builds a version 0x01 request
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            version: SUBNEGOTIATION_VERSION,
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let [version, ulen, rest @ ..] = buf else {
            return Err(DecodeError::Truncated("username/password"));
        };
        let ulen = *ulen as usize;
        let username = rest
            .get(..ulen)
            .ok_or(DecodeError::Truncated("username/password"))?;
        let plen = *rest
            .get(ulen)
            .ok_or(DecodeError::Truncated("username/password"))? as usize;
        let password = rest
            .get(ulen + 1..ulen + 1 + plen)
            .ok_or(DecodeError::Truncated("username/password"))?;

        Ok(Self {
            version: *version,
            username: String::from_utf8(username.to_vec())
                .map_err(|_| DecodeError::Utf8("username"))?,
            password: String::from_utf8(password.to_vec())
                .map_err(|_| DecodeError::Utf8("password"))?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let username = &self.username.as_bytes()[..self.username.len().min(255)];
        let password = &self.password.as_bytes()[..self.password.len().min(255)];

        let mut buf = Vec::with_capacity(3 + username.len() + password.len());
        buf.push(self.version);
        buf.push(username.len() as u8);
        buf.extend_from_slice(username);
        buf.push(password.len() as u8);
        buf.extend_from_slice(password);
        buf
    }
}

/// AuthReply answers a sub-negotiation. The version byte is the SOCKS
/// version (0x05), not the RFC 1929 sub-negotiation version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthReply {
    pub status: AuthStatus,
}

impl AuthReply {
    pub fn encode(&self) -> [u8; 2] {
        [Version::SOCKS5 as u8, self.status as u8]
    }
}

/// Request is a validated client request
///
/// ```text
/// +----+-----+-------+------+----------+----------+
/// |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
/// +----+-----+-------+------+----------+----------+
/// | 1  |  1  | X'00' |  1   | Variable |    2     |
/// +----+-----+-------+------+----------+----------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: Command,
    pub address: Address,
}

impl Request {
    /// decode validates version, then command, then the destination, so the
    /// first problem found decides the reply code
    pub fn decode(buf: &[u8]) -> Result<Self, RequestError> {
        let [version, command, _rsv, addr @ ..] = buf else {
            return Err(RequestError::Truncated);
        };

        if *version != Version::SOCKS5 as u8 {
            return Err(RequestError::Version(*version));
        }

        let command = Command::from_byte(*command).ok_or(RequestError::Command(*command))?;
        let (address, _) = Address::parse(addr)?;

        Ok(Self { command, address })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(3 + self.address.encoded_len());
        buf.extend_from_slice(&[Version::SOCKS5 as u8, self.command as u8, RSV]);
        self.address.encode(&mut buf);
        buf
    }
}

/// Reply answers a request
///
/// ```text
/// +----+-----+-------+------+----------+----------+
/// |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
/// +----+-----+-------+------+----------+----------+
/// | 1  |  1  | X'00' |  1   | Variable |    2     |
/// +----+-----+-------+------+----------+----------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: ReplyCode,
    pub bound: Address,
}

impl Reply {
    /// new is a constructor for the Reply type
    pub fn new(status: ReplyCode, bound: Address) -> Self {
        Self { status, bound }
    }

    /// A failure reply carries the unspecified address
    pub fn failure(status: ReplyCode) -> Self {
        Self::new(status, Address::unspecified())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(3 + self.bound.encoded_len());
        buf.extend_from_slice(&[Version::SOCKS5 as u8, self.status as u8, RSV]);
        self.bound.encode(&mut buf);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let [_version, status, _rsv, addr @ ..] = buf else {
            return Err(DecodeError::Truncated("reply"));
        };
        let status = ReplyCode::from_byte(*status).ok_or(DecodeError::UnknownReply(*status))?;
        let (bound, _) = Address::parse(addr)?;
        Ok(Self { status, bound })
    }
}

/// UdpHeader prefixes every relayed datagram
///
/// ```text
/// +----+------+------+----------+----------+----------+
/// |RSV | FRAG | ATYP | DST.ADDR | DST.PORT |   DATA   |
/// +----+------+------+----------+----------+----------+
/// | 2  |  1   |  1   | Variable |    2     | Variable |
/// +----+------+------+----------+----------+----------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpHeader {
    pub frag: u8,
    pub address: Address,
}

impl UdpHeader {
    /// new builds an unfragmented header
    pub fn new(address: Address) -> Self {
        Self { frag: 0, address }
    }

    /// decode splits a datagram into its header and payload
    pub fn decode(packet: &[u8]) -> Result<(Self, &[u8]), DecodeError> {
        let [_, _, frag, addr @ ..] = packet else {
            return Err(DecodeError::Truncated("UDP header"));
        };
        let (address, used) = Address::parse(addr)?;
        Ok((
            Self {
                frag: *frag,
                address,
            },
            &addr[used..],
        ))
    }

    /// encode wraps `data` in the header
    pub fn encode(&self, data: &[u8]) -> Vec<u8> {
        let mut packet = Vec::with_capacity(3 + self.address.encoded_len() + data.len());
        packet.extend_from_slice(&[RSV, RSV, self.frag]);
        self.address.encode(&mut packet);
        packet.extend_from_slice(data);
        packet
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Host;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn method_request_decode() {
        let req = MethodRequest::decode(&[0x05, 0x02, 0x00, 0x02]).unwrap();
        assert_eq!(req.version, 0x05);
        assert_eq!(req.methods, vec![0x00, 0x02]);
        assert_eq!(req.encode(), vec![0x05, 0x02, 0x00, 0x02]);
    }

    #[test]
    fn method_request_short_is_error() {
        assert_eq!(
            MethodRequest::decode(&[0x05]),
            Err(DecodeError::Truncated("method request"))
        );
        assert!(MethodRequest::decode(&[0x05, 0x03, 0x00]).is_err());
    }

    #[test]
    fn userpass_decode() {
        let buf = UserPassRequest::new("u", "p").encode();
        assert_eq!(buf, vec![0x01, 1, b'u', 1, b'p']);
        let req = UserPassRequest::decode(&buf).unwrap();
        assert_eq!(req.username, "u");
        assert_eq!(req.password, "p");
    }

    #[test]
    fn userpass_truncated() {
        assert!(UserPassRequest::decode(&[0x01, 3, b'a']).is_err());
        assert!(UserPassRequest::decode(&[0x01, 1, b'a', 4, b'b']).is_err());
    }

    #[test]
    fn request_round_trip_all_address_kinds() {
        let addresses = [
            Address::new(Host::Ipv4(Ipv4Addr::new(10, 0, 0, 1)), 80),
            Address::domain("example.org", 443),
            Address::new(Host::Ipv6("fe80::1".parse::<Ipv6Addr>().unwrap()), 8080),
        ];
        for address in addresses {
            let req = Request {
                command: Command::Connect,
                address,
            };
            assert_eq!(Request::decode(&req.encode()).unwrap(), req);
        }
    }

    #[test]
    fn request_validation_order() {
        // bad version wins over bad command
        assert_eq!(
            Request::decode(&[0x04, 0x09, 0x00, 0x01, 1, 2, 3, 4, 0, 80]),
            Err(RequestError::Version(0x04))
        );
        assert_eq!(
            Request::decode(&[0x05, 0x09, 0x00, 0x07, 1, 2, 3, 4, 0, 80])
                .unwrap_err()
                .reply_code(),
            ReplyCode::CommandNotSupported
        );
        assert_eq!(
            Request::decode(&[0x05, 0x01, 0x00, 0x07, 1, 2, 3, 4, 0, 80])
                .unwrap_err()
                .reply_code(),
            ReplyCode::AddrTypeUnsupported
        );
    }

    #[test]
    fn bind_decodes_as_command() {
        let req = Request::decode(&[0x05, 0x02, 0x00, 0x01, 1, 2, 3, 4, 0, 80]).unwrap();
        assert_eq!(req.command, Command::Bind);
    }

    #[test]
    fn method_reply_codec() {
        assert_eq!(MethodReply::no_acceptable().encode(), [0x05, 0xFF]);
        let reply = MethodReply { method: 0x02 };
        assert_eq!(MethodReply::decode(&reply.encode()), Ok(reply));
        assert_eq!(
            MethodReply::decode(&[0x05]),
            Err(DecodeError::Truncated("method reply"))
        );
    }

    #[test]
    fn reply_encode() {
        let reply = Reply::failure(ReplyCode::ConnectionRefused);
        assert_eq!(reply.encode(), vec![0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
        assert_eq!(Reply::decode(&reply.encode()).unwrap(), reply);
    }

    #[test]
    fn udp_header_split() {
        let header = UdpHeader::new(Address::domain("localhost", 53));
        let packet = header.encode(b"ping");
        let (decoded, data) = UdpHeader::decode(&packet).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(data, b"ping");
    }

    #[test]
    fn udp_header_too_short() {
        assert!(UdpHeader::decode(&[0, 0, 0]).is_err());
        assert!(UdpHeader::decode(&[0, 0, 0, 0x01, 127, 0]).is_err());
    }
}
