use crate::protocol::AddressType;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;

/// AddressError is returned when an address field cannot be decoded
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("address type not supported: {0:#04x}")]
    Unsupported(u8),

    #[error("not enough data for {0} address and port")]
    Truncated(&'static str),

    #[error("domain length cannot be 0")]
    EmptyDomain,

    #[error("invalid domain: {0}")]
    InvalidDomain(String),
}

/// Host is the address part of a SOCKS5 destination
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Host {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Domain(String),
}

/// Address represents a SOCKS5 destination: an ATYP tagged host and a port
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    pub host: Host,
    pub port: u16,
}

impl Address {
    pub fn new(host: Host, port: u16) -> Self {
        Self { host, port }
    }

    pub fn domain(name: impl Into<String>, port: u16) -> Self {
        Self::new(Host::Domain(name.into()), port)
    }

    /// The all-zero IPv4 address used in failure replies
    pub fn unspecified() -> Self {
        Self::new(Host::Ipv4(Ipv4Addr::UNSPECIFIED), 0)
    }

    pub fn address_type(&self) -> AddressType {
        match self.host {
            Host::Ipv4(_) => AddressType::IPv4,
            Host::Ipv6(_) => AddressType::IPv6,
            Host::Domain(_) => AddressType::DomainName,
        }
    }

    /// Number of bytes `encode` will write, ATYP included
    pub fn encoded_len(&self) -> usize {
        1 + match &self.host {
            Host::Ipv4(_) => 4,
            Host::Ipv6(_) => 16,
            Host::Domain(name) => 1 + name.len(),
        } + 2
    }

    /// parse decodes `ATYP DST.ADDR DST.PORT` from the start of `buf` and
    /// returns the address with the number of bytes consumed
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), AddressError> {
        let atyp = *buf.first().ok_or(AddressError::Truncated("any"))?;

        let (host, mut offset) = match AddressType::from_byte(atyp) {
            Some(AddressType::IPv4) => {
                let octets: [u8; 4] = buf
                    .get(1..5)
                    .and_then(|b| b.try_into().ok())
                    .ok_or(AddressError::Truncated("IPv4"))?;
                (Host::Ipv4(Ipv4Addr::from(octets)), 5)
            }
            Some(AddressType::IPv6) => {
                let octets: [u8; 16] = buf
                    .get(1..17)
                    .and_then(|b| b.try_into().ok())
                    .ok_or(AddressError::Truncated("IPv6"))?;
                (Host::Ipv6(Ipv6Addr::from(octets)), 17)
            }
            Some(AddressType::DomainName) => {
                // First octet holds the number of octets to follow
                let len = *buf.get(1).ok_or(AddressError::Truncated("domain"))? as usize;
                if len == 0 {
                    return Err(AddressError::EmptyDomain);
                }
                let raw = buf
                    .get(2..2 + len)
                    .ok_or(AddressError::Truncated("domain"))?;
                let name = std::str::from_utf8(raw)
                    .map_err(|e| AddressError::InvalidDomain(e.to_string()))?;
                (Host::Domain(name.to_owned()), 2 + len)
            }
            None => return Err(AddressError::Unsupported(atyp)),
        };

        let port_bytes: [u8; 2] = buf
            .get(offset..offset + 2)
            .and_then(|b| b.try_into().ok())
            .ok_or(AddressError::Truncated(match host {
                Host::Ipv4(_) => "IPv4",
                Host::Ipv6(_) => "IPv6",
                Host::Domain(_) => "domain",
            }))?;
        offset += 2;

        Ok((Self::new(host, u16::from_be_bytes(port_bytes)), offset))
    }

    /// encode appends `ATYP DST.ADDR DST.PORT` to `buf`
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(self.address_type() as u8);
        match &self.host {
            Host::Ipv4(ip) => buf.extend_from_slice(&ip.octets()),
            Host::Ipv6(ip) => buf.extend_from_slice(&ip.octets()),
            Host::Domain(name) => {
                // Domains longer than 255 bytes cannot be framed; callers build
                // them from wire data or from names they control
                let name = &name.as_bytes()[..name.len().min(u8::MAX as usize)];
                buf.push(name.len() as u8);
                buf.extend_from_slice(name);
            }
        }
        buf.extend_from_slice(&self.port.to_be_bytes());
    }

    /// Returns the socket address directly when the host is an IP literal
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self.host {
            Host::Ipv4(ip) => Some(SocketAddr::new(IpAddr::V4(ip), self.port)),
            Host::Ipv6(ip) => Some(SocketAddr::new(IpAddr::V6(ip), self.port)),
            Host::Domain(_) => None,
        }
    }

    /// resolve turns the address into socket addresses, looking up domains
    pub async fn resolve(&self) -> io::Result<Vec<SocketAddr>> {
        match &self.host {
            Host::Ipv4(ip) => Ok(vec![SocketAddr::new(IpAddr::V4(*ip), self.port)]),
            Host::Ipv6(ip) => Ok(vec![SocketAddr::new(IpAddr::V6(*ip), self.port)]),
            Host::Domain(name) => {
                let addrs: Vec<SocketAddr> =
                    tokio::net::lookup_host((name.as_str(), self.port)).await?.collect();
                if addrs.is_empty() {
                    return Err(io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("no IP address found for '{name}'"),
                    ));
                }
                Ok(addrs)
            }
        }
    }

    /// resolve_like picks a resolved address of the same family as `local`,
    /// so a datagram can be sent from a socket bound to that family
    pub async fn resolve_like(&self, local: &SocketAddr) -> io::Result<SocketAddr> {
        let addrs = self.resolve().await?;
        addrs
            .iter()
            .find(|addr| addr.is_ipv4() == local.is_ipv4())
            .copied()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    format!("{self} has no address matching {local}"),
                )
            })
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => Self::new(Host::Ipv4(*v4.ip()), v4.port()),
            SocketAddr::V6(v6) => Self::new(Host::Ipv6(*v6.ip()), v6.port()),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            Host::Ipv4(ip) => write!(f, "{ip}:{}", self.port),
            Host::Ipv6(ip) => write!(f, "[{ip}]:{}", self.port),
            Host::Domain(name) => write!(f, "{name}:{}", self.port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ipv4_with_port() {
        let buf = [0x01, 192, 168, 1, 10, 0x1f, 0x90, 0xAA];
        let (addr, used) = Address::parse(&buf).unwrap();
        assert_eq!(addr, Address::new(Host::Ipv4(Ipv4Addr::new(192, 168, 1, 10)), 8080));
        assert_eq!(used, 7);
    }

    #[test]
    fn parses_domain() {
        let mut buf = vec![0x03, 11];
        buf.extend_from_slice(b"example.com");
        buf.extend_from_slice(&443u16.to_be_bytes());
        let (addr, used) = Address::parse(&buf).unwrap();
        assert_eq!(addr, Address::domain("example.com", 443));
        assert_eq!(used, buf.len());
        assert_eq!(addr.encoded_len(), used);
    }

    #[test]
    fn parses_ipv6() {
        let ip: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let mut buf = vec![0x04];
        buf.extend_from_slice(&ip.octets());
        buf.extend_from_slice(&53u16.to_be_bytes());
        let (addr, _) = Address::parse(&buf).unwrap();
        assert_eq!(addr.to_string(), "[2001:db8::1]:53");
    }

    #[test]
    fn rejects_unknown_type() {
        assert_eq!(
            Address::parse(&[0x02, 1, 2, 3, 4, 0, 80]),
            Err(AddressError::Unsupported(0x02))
        );
    }

    #[test]
    fn short_buffers_are_errors_not_panics() {
        assert!(Address::parse(&[]).is_err());
        assert!(Address::parse(&[0x01, 127, 0, 0]).is_err());
        assert!(Address::parse(&[0x01, 127, 0, 0, 1, 0]).is_err());
        assert!(Address::parse(&[0x04, 0, 0]).is_err());
        assert!(Address::parse(&[0x03, 10, b'a', b'b']).is_err());
        assert_eq!(Address::parse(&[0x03, 0, 0, 80]), Err(AddressError::EmptyDomain));
    }

    #[test]
    fn rejects_non_utf8_domain() {
        let buf = [0x03, 2, 0xff, 0xfe, 0, 80];
        assert!(matches!(
            Address::parse(&buf),
            Err(AddressError::InvalidDomain(_))
        ));
    }

    #[tokio::test]
    async fn resolve_like_matches_family() {
        let local: SocketAddr = "0.0.0.0:0".parse().unwrap();
        let addr = Address::new(Host::Ipv4(Ipv4Addr::LOCALHOST), 9000);
        assert_eq!(
            addr.resolve_like(&local).await.unwrap(),
            "127.0.0.1:9000".parse::<SocketAddr>().unwrap()
        );

        let v6 = Address::new(Host::Ipv6(Ipv6Addr::LOCALHOST), 9000);
        assert!(v6.resolve_like(&local).await.is_err());
    }
}
