use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::{TunnelError, TunnelResult};

/// Destination the proxy is asked to connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
    /// Left for the proxy to resolve.
    Domain(String),
}

impl TargetAddr {
    /// Accepts bare hosts as found in a URL, including bracketed IPv6 literals.
    pub fn parse(host: &str) -> TunnelResult<Self> {
        let host = host.trim();
        let unbracketed = host
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
            .unwrap_or(host);
        if unbracketed.is_empty() {
            return Err(TunnelError::Unsupported("empty target host".into()));
        }
        if let Ok(ip) = unbracketed.parse::<Ipv4Addr>() {
            return Ok(TargetAddr::V4(ip));
        }
        if let Ok(ip) = unbracketed.parse::<Ipv6Addr>() {
            return Ok(TargetAddr::V6(ip));
        }
        if unbracketed.len() > u8::MAX as usize {
            return Err(TunnelError::Unsupported(format!(
                "target host is {} bytes, proxies accept at most 255",
                unbracketed.len()
            )));
        }
        if unbracketed.bytes().any(|b| b == 0 || b.is_ascii_whitespace()) {
            return Err(TunnelError::Unsupported(format!(
                "target host {unbracketed:?} contains invalid characters"
            )));
        }
        Ok(TargetAddr::Domain(unbracketed.to_string()))
    }

    /// `host:port` as written in an HTTP CONNECT request line.
    pub fn authority(&self, port: u16) -> String {
        match self {
            TargetAddr::V6(ip) => format!("[{ip}]:{port}"),
            other => format!("{other}:{port}"),
        }
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::V4(ip) => write!(f, "{ip}"),
            TargetAddr::V6(ip) => write!(f, "{ip}"),
            TargetAddr::Domain(name) => f.write_str(name),
        }
    }
}
