// src/address.rs

//! Overlay address type.
//!
//! Both runtimes and the wire codec work in terms of this tagged address
//! rather than `std::net::SocketAddr`, because a packet can legitimately have
//! no address on one side (an upgrade request is filtered with a zeroed `to`
//! before the client knows its external address).

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Address {
    #[default]
    None,
    Ipv4 {
        ip: [u8; 4],
        port: u16,
    },
    Ipv6 {
        ip: [u16; 8],
        port: u16,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid address: {0}")]
pub struct AddressParseError(String);

impl Address {
    pub fn port(&self) -> u16 {
        match self {
            Address::None => 0,
            Address::Ipv4 { port, .. } | Address::Ipv6 { port, .. } => *port,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Address::None)
    }

    /// Canonical bytes fed into the chonkle and pittle filters. IPv4 yields
    /// the four dotted octets; IPv6 yields the sixteen bytes of the eight
    /// words in big-endian word order; `None` yields nothing.
    pub fn filter_bytes(&self) -> ([u8; 16], usize) {
        let mut out = [0u8; 16];
        match self {
            Address::None => (out, 0),
            Address::Ipv4 { ip, .. } => {
                out[..4].copy_from_slice(ip);
                (out, 4)
            }
            Address::Ipv6 { ip, .. } => {
                for (i, word) in ip.iter().enumerate() {
                    out[i * 2..i * 2 + 2].copy_from_slice(&word.to_be_bytes());
                }
                (out, 16)
            }
        }
    }

    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Address::None => None,
            Address::Ipv4 { ip, port } => {
                Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3])), *port))
            }
            Address::Ipv6 { ip, port } => Some(SocketAddr::new(
                IpAddr::V6(Ipv6Addr::new(ip[0], ip[1], ip[2], ip[3], ip[4], ip[5], ip[6], ip[7])),
                *port,
            )),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        match addr.ip() {
            IpAddr::V4(ip) => Address::Ipv4 { ip: ip.octets(), port: addr.port() },
            IpAddr::V6(ip) => Address::Ipv6 { ip: ip.segments(), port: addr.port() },
        }
    }
}

impl FromStr for Address {
    type Err = AddressParseError;

    /// Accepts `a.b.c.d`, `a.b.c.d:port`, `[v6]:port` and bare `v6`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(AddressParseError(s.to_string()));
        }

        // Bracketed IPv6 with port.
        if let Some(rest) = s.strip_prefix('[') {
            let (ip_str, port_str) = rest
                .split_once("]:")
                .ok_or_else(|| AddressParseError(s.to_string()))?;
            let ip: Ipv6Addr = ip_str.parse().map_err(|_| AddressParseError(s.to_string()))?;
            let port: u16 = port_str.parse().map_err(|_| AddressParseError(s.to_string()))?;
            return Ok(Address::Ipv6 { ip: ip.segments(), port });
        }

        // Bare IPv6 (more than one colon, no brackets).
        if s.matches(':').count() > 1 {
            let ip: Ipv6Addr = s.parse().map_err(|_| AddressParseError(s.to_string()))?;
            return Ok(Address::Ipv6 { ip: ip.segments(), port: 0 });
        }

        // IPv4 with optional port.
        let (ip_str, port) = match s.split_once(':') {
            Some((ip, port_str)) => {
                let port: u16 = port_str.parse().map_err(|_| AddressParseError(s.to_string()))?;
                (ip, port)
            }
            None => (s, 0),
        };
        let ip: Ipv4Addr = ip_str.parse().map_err(|_| AddressParseError(s.to_string()))?;
        Ok(Address::Ipv4 { ip: ip.octets(), port })
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::None => write!(f, "none"),
            Address::Ipv4 { ip, port } => {
                write!(f, "{}.{}.{}.{}:{}", ip[0], ip[1], ip[2], ip[3], port)
            }
            Address::Ipv6 { ip, port } => {
                let ip = Ipv6Addr::new(ip[0], ip[1], ip[2], ip[3], ip[4], ip[5], ip[6], ip[7]);
                write!(f, "[{}]:{}", ip, port)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ipv4() {
        let addr: Address = "1.2.3.4:5678".parse().unwrap();
        assert_eq!(addr, Address::Ipv4 { ip: [1, 2, 3, 4], port: 5678 });
        let addr: Address = "127.0.0.1".parse().unwrap();
        assert_eq!(addr, Address::Ipv4 { ip: [127, 0, 0, 1], port: 0 });
    }

    #[test]
    fn test_parse_ipv6() {
        let addr: Address = "[::1]:0".parse().unwrap();
        assert_eq!(addr, Address::Ipv6 { ip: [0, 0, 0, 0, 0, 0, 0, 1], port: 0 });
        let addr: Address = "2001:db8::1".parse().unwrap();
        assert_eq!(
            addr,
            Address::Ipv6 { ip: [0x2001, 0x0db8, 0, 0, 0, 0, 0, 1], port: 0 }
        );
    }

    #[test]
    fn test_parse_format_round_trip() {
        for s in ["1.2.3.4:5678", "[::1]:0", "2001:db8::1"] {
            let addr: Address = s.parse().unwrap();
            let formatted = addr.to_string();
            let reparsed: Address = formatted.parse().unwrap();
            assert_eq!(addr, reparsed);
        }
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for s in ["", "not an address", "1.2.3:99", "[::1]", "1.2.3.4:port"] {
            assert!(s.parse::<Address>().is_err(), "{s:?} should not parse");
        }
    }

    #[test]
    fn test_filter_bytes() {
        let v4: Address = "1.2.3.4:5678".parse().unwrap();
        let (bytes, len) = v4.filter_bytes();
        assert_eq!(len, 4);
        assert_eq!(&bytes[..4], &[1, 2, 3, 4]);

        let v6: Address = "[2001:db8::1]:40000".parse().unwrap();
        let (bytes, len) = v6.filter_bytes();
        assert_eq!(len, 16);
        assert_eq!(&bytes[..4], &[0x20, 0x01, 0x0d, 0xb8]);
        assert_eq!(bytes[15], 1);

        assert_eq!(Address::None.filter_bytes().1, 0);
    }

    #[test]
    fn test_socket_addr_round_trip() {
        let addr: Address = "10.0.0.1:30000".parse().unwrap();
        let sock = addr.to_socket_addr().unwrap();
        assert_eq!(Address::from(sock), addr);
        assert!(Address::None.to_socket_addr().is_none());
    }
}
