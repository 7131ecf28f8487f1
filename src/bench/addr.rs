use std::net::{SocketAddr, ToSocketAddrs};

use super::error::BenchError;

/// Addresses of a run, resolved once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedAddrs {
    /// Local address to bind to, if one was given.
    pub src: Option<SocketAddr>,
    /// Peer (client) or listening (server) address.
    pub dst: SocketAddr,
}

/// Resolve `host` with `port`, preferring IPv4 results.
pub fn resolve_one(host: &str, port: u16) -> Result<SocketAddr, BenchError> {
    let addrs: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| BenchError::Config(format!("{host} resolves to no address")))
}

/// Resolve the optional local address and the destination address. The
/// local address gets port 0, so the transport picks one.
pub fn resolve(src: Option<&str>, dst: &str, port: u16) -> Result<ResolvedAddrs, BenchError> {
    let src = src.map(|s| resolve_one(s, 0)).transpose()?;
    let dst = resolve_one(dst, port)?;
    log::debug!("rwbench: resolved {:?} -> {}", src, dst);
    Ok(ResolvedAddrs { src, dst })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_addresses() {
        let addrs = resolve(Some("127.0.0.1"), "127.0.0.2", 7471).unwrap();
        assert_eq!(addrs.src, Some("127.0.0.1:0".parse().unwrap()));
        assert_eq!(addrs.dst, "127.0.0.2:7471".parse().unwrap());

        let addrs = resolve(None, "::1", 9).unwrap();
        assert!(addrs.src.is_none());
        assert_eq!(addrs.dst.port(), 9);
    }
}
