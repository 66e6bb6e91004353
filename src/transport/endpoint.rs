//! Endpoint naming and address parsing.
//!
//! Local endpoints are opaque names decorated platform-specifically:
//! `\\.\pipe\<name>` on Windows, `/tmp/<name>` elsewhere. TCP
//! endpoints are `host:port` strings on IPv4; an empty host means
//! `0.0.0.0` when binding and `127.0.0.1` when connecting. A
//! non-positive or unparsable port is rejected.

use std::fmt;
use std::net::Ipv4Addr;

/// Address of a listener, local (pipe/socket) or TCP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Platform-local transport; holds the decorated path.
    Local(String),
    /// TCP on IPv4; holds the raw `host:port` string.
    Tcp(String),
}

impl Endpoint {
    /// A local endpoint for `name`, decorated for the platform.
    pub fn local(name: &str) -> Self {
        #[cfg(windows)]
        {
            Endpoint::Local(format!(r"\\.\pipe\{}", name))
        }
        #[cfg(not(windows))]
        {
            Endpoint::Local(format!("/tmp/{}", name))
        }
    }

    /// A TCP endpoint from a `host:port` string.
    pub fn tcp(addr: impl Into<String>) -> Self {
        Endpoint::Tcp(addr.into())
    }

    /// Check the endpoint is usable before spawning a loop thread.
    pub(crate) fn validate(&self) -> Result<(), String> {
        match self {
            Endpoint::Local(path) => {
                if path.is_empty() || bare_name(path).is_empty() {
                    Err("No endpoint specified.".to_string())
                } else {
                    Ok(())
                }
            }
            // Either role's parse catches the same malformations.
            Endpoint::Tcp(addr) => parse_tcp(addr, Ipv4Addr::LOCALHOST).map(|_| ()),
        }
    }

    /// Bind address for a TCP listener (empty host = `0.0.0.0`).
    pub(crate) fn tcp_bind_addr(addr: &str) -> Result<(Ipv4Addr, u16), String> {
        parse_tcp(addr, Ipv4Addr::UNSPECIFIED)
    }

    /// Connect address for a TCP client (empty host = `127.0.0.1`).
    pub(crate) fn tcp_connect_addr(addr: &str) -> Result<(Ipv4Addr, u16), String> {
        parse_tcp(addr, Ipv4Addr::LOCALHOST)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Local(path) => write!(f, "{}", path),
            Endpoint::Tcp(addr) => write!(f, "{}", addr),
        }
    }
}

/// The name portion of a decorated local path.
fn bare_name(path: &str) -> &str {
    let idx = path
        .rfind(['/', '\\'])
        .map(|i| i + 1)
        .unwrap_or(0);
    &path[idx..]
}

fn parse_tcp(addr: &str, default_host: Ipv4Addr) -> Result<(Ipv4Addr, u16), String> {
    const HINT: &str =
        "Invalid address. Should be something like \"127.0.0.1:10000\" or \":10000\"";

    let (host, port) = match addr.find(':') {
        Some(i) => (&addr[..i], &addr[i + 1..]),
        None => return Err(HINT.to_string()),
    };

    let port: u16 = match port.parse() {
        Ok(p) if p > 0 => p,
        _ => return Err(HINT.to_string()),
    };

    let host = if host.is_empty() {
        default_host
    } else {
        host.parse().map_err(|_| HINT.to_string())?
    };

    Ok((host, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_decoration() {
        let ep = Endpoint::local("my-service");
        #[cfg(windows)]
        assert_eq!(ep, Endpoint::Local(r"\\.\pipe\my-service".to_string()));
        #[cfg(not(windows))]
        assert_eq!(ep, Endpoint::Local("/tmp/my-service".to_string()));
    }

    #[test]
    fn test_empty_local_name_rejected() {
        assert!(Endpoint::local("").validate().is_err());
        assert!(Endpoint::local("svc").validate().is_ok());
    }

    #[test]
    fn test_tcp_full_address() {
        let (host, port) = Endpoint::tcp_connect_addr("127.0.0.1:10000").unwrap();
        assert_eq!(host, Ipv4Addr::LOCALHOST);
        assert_eq!(port, 10000);
    }

    #[test]
    fn test_tcp_empty_host_defaults() {
        let (host, _) = Endpoint::tcp_bind_addr(":9000").unwrap();
        assert_eq!(host, Ipv4Addr::UNSPECIFIED);

        let (host, _) = Endpoint::tcp_connect_addr(":9000").unwrap();
        assert_eq!(host, Ipv4Addr::LOCALHOST);
    }

    #[test]
    fn test_tcp_rejects_bad_ports() {
        for addr in ["127.0.0.1:0", "127.0.0.1:-1", "127.0.0.1:junk", "127.0.0.1:", "nocolon"] {
            assert!(Endpoint::tcp_connect_addr(addr).is_err(), "{}", addr);
        }
    }

    #[test]
    fn test_tcp_rejects_bad_host() {
        assert!(Endpoint::tcp_connect_addr("not-an-ip:1000").is_err());
        assert!(Endpoint::tcp_connect_addr("::1:1000").is_err()); // IPv4 only
    }

    #[test]
    fn test_tcp_validate() {
        assert!(Endpoint::tcp(":10000").validate().is_ok());
        assert!(Endpoint::tcp("10000").validate().is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(Endpoint::tcp(":9000").to_string(), ":9000");
        let ep = Endpoint::local("svc");
        assert!(ep.to_string().ends_with("svc"));
    }
}
