//! Address parsing (§6.3): dotted IPv4, colon-hex IPv6 (including `::`
//! compression), and unsigned 16-bit ports where `0` means "kernel
//! assigned". Returns a typed record, not a string.

use crate::error::{Error, Result};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

/// A parsed, typed network address — the "typed address record" the spec
/// calls for, as opposed to callers juggling strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Address {
    pub ip: IpAddr,
    pub port: u16,
}

impl Address {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    /// `0.0.0.0:0`, useful as a "bind to any, let the kernel pick" default.
    pub fn any_v4(port: u16) -> Self {
        Self { ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED), port }
    }

    pub fn any_v6(port: u16) -> Self {
        Self { ip: IpAddr::V6(Ipv6Addr::UNSPECIFIED), port }
    }

    pub fn is_kernel_assigned_port(&self) -> bool {
        self.port == 0
    }

    /// Parse `"host:port"` where `host` is a dotted IPv4 or colon-hex IPv6
    /// literal (bracketed, `[::1]:443`, per RFC 3986). Hostnames are not
    /// accepted here — that is the DNS module's job (§4.9 transport
    /// selection resolves names before constructing an `Address`).
    pub fn parse(s: &str) -> Result<Self> {
        let sock = SocketAddr::from_str(s)
            .map_err(|e| Error::argument(format!("invalid address {s:?}: {e}")))?;
        Ok(Self { ip: sock.ip(), port: sock.port() })
    }

    pub fn to_std(self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl From<SocketAddr> for Address {
    fn from(sock: SocketAddr) -> Self {
        Self { ip: sock.ip(), port: sock.port() }
    }
}

impl From<Address> for SocketAddr {
    fn from(addr: Address) -> Self {
        addr.to_std()
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_std())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ipv4_with_port() {
        let addr = Address::parse("127.0.0.1:8080").unwrap();
        assert_eq!(addr.port, 8080);
        assert!(addr.ip.is_ipv4());
    }

    #[test]
    fn parses_compressed_ipv6() {
        let addr = Address::parse("[::1]:443").unwrap();
        assert_eq!(addr.port, 443);
        assert!(addr.ip.is_ipv6());
    }

    #[test]
    fn zero_port_means_kernel_assigned() {
        let addr = Address::parse("0.0.0.0:0").unwrap();
        assert!(addr.is_kernel_assigned_port());
    }

    #[test]
    fn rejects_hostnames() {
        assert!(Address::parse("localhost:80").is_err());
    }
}
