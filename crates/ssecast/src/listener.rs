//! Listening socket setup.

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

use mio::net::TcpListener;
use tracing::{debug, info};

use crate::errors::SetupError;

/// Turn `address` into a socket address.
///
/// Numeric addresses are parsed directly; anything else goes through the
/// system resolver and the first result is used.
pub fn resolve(address: &str, port: u16) -> Result<SocketAddr, SetupError> {
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    let mut addrs = (address, port)
        .to_socket_addrs()
        .map_err(|source| SetupError::Resolve {
            address: address.to_string(),
            source,
        })?;
    let addr = addrs
        .next()
        .ok_or_else(|| SetupError::NoAddress(address.to_string()))?;
    debug!(address, %addr, "resolved listen address");
    Ok(addr)
}

/// Bind a non-blocking listener on `address:port`.
///
/// `SO_REUSEADDR` is set before binding. Failure is not retried.
pub fn bind(address: &str, port: u16) -> Result<TcpListener, SetupError> {
    let addr = resolve(address, port)?;
    let listener = TcpListener::bind(addr).map_err(|source| SetupError::Bind { addr, source })?;
    let local = listener
        .local_addr()
        .map_err(|source| SetupError::Bind { addr, source })?;
    info!(addr = %local, "listening");
    Ok(listener)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn numeric_address_skips_resolver() {
        let addr = resolve("127.0.0.1", 9000).unwrap();
        assert_eq!(addr, "127.0.0.1:9000".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn ipv6_literal_is_numeric() {
        let addr = resolve("::1", 80).unwrap();
        assert!(addr.is_ipv6());
        assert_eq!(addr.port(), 80);
    }

    #[test]
    fn localhost_resolves() {
        let addr = resolve("localhost", 1234).unwrap();
        assert!(addr.ip().is_loopback());
        assert_eq!(addr.port(), 1234);
    }

    #[test]
    fn unresolvable_name_is_setup_error() {
        let err = resolve("no-such-host.invalid", 1).unwrap_err();
        assert_matches!(err, SetupError::Resolve { .. } | SetupError::NoAddress(_));
    }

    #[test]
    fn bind_ephemeral_port() {
        let listener = bind("127.0.0.1", 0).unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(addr.port() > 0);
    }

    #[test]
    fn bind_conflict_is_setup_error() {
        let first = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = first.local_addr().unwrap().port();
        let err = bind("127.0.0.1", port).unwrap_err();
        assert_matches!(err, SetupError::Bind { .. });
    }
}
