//! A host-order `(IPv4, port)` pair with a canonical `"A.B.C.D:P"` string
//! form, used both as the wire address and as the connection-table key.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

#[derive(Debug, thiserror::Error)]
pub enum AddressError {
    #[error("address {0:?} is missing a ':port' suffix")]
    Malformed(String),
    #[error("invalid port in address {0:?}")]
    BadPort(String),
    #[error("invalid IPv4 address in {0:?}")]
    BadIp(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address {
    ip: Ipv4Addr,
    port: u16,
}

impl Address {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self { ip, port }
    }

    /// Build from host-order ip/port integers, matching the original
    /// `InetAddress(uint32 ip_host, uint16 port_host)` constructor.
    pub fn from_host_order(ip_host: u32, port_host: u16) -> Self {
        Self {
            ip: Ipv4Addr::from(ip_host),
            port: port_host,
        }
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The fallback-key helper used by the demultiplexer: this address with
    /// its IP replaced by `ip`, keeping the port.
    pub fn with_ip(&self, ip: Ipv4Addr) -> Self {
        Self { ip, port: self.port }
    }

    /// This address with its port replaced, keeping the IP.
    pub fn with_port(&self, port: u16) -> Self {
        Self { ip: self.ip, port }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ip_str, port_str) = s
            .rsplit_once(':')
            .ok_or_else(|| AddressError::Malformed(s.to_string()))?;
        let port: u16 = port_str
            .parse()
            .map_err(|_| AddressError::BadPort(s.to_string()))?;
        let ip: Ipv4Addr = ip_str
            .parse()
            .map_err(|_| AddressError::BadIp(s.to_string()))?;
        Ok(Self { ip, port })
    }
}
