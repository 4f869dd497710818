// src/resolve.rs

//! Async resolution of the backend hostname. Runs as its own task at server
//! startup; init cannot complete until it finishes, and repeated failure
//! drops the runtime into direct-only mode.

use crate::address::Address;
use crate::constants::{HOSTNAME_RESOLVE_RETRIES, HOSTNAME_RESOLVE_RETRY_TIME};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, warn};

/// Resolve `hostname:port` to a backend address. A literal address bypasses
/// DNS entirely. Otherwise up to `HOSTNAME_RESOLVE_RETRIES` lookups are made,
/// one second apart, preferring IPv4 results.
pub async fn resolve_backend_hostname(hostname: &str, port: u16) -> Option<Address> {
    if let Ok(mut literal) = hostname.parse::<Address>() {
        if let Address::Ipv4 { port: p, .. } | Address::Ipv6 { port: p, .. } = &mut literal {
            if *p == 0 {
                *p = port;
            }
        }
        debug!("backend hostname {hostname} is a literal address");
        return Some(literal);
    }

    for attempt in 0..HOSTNAME_RESOLVE_RETRIES {
        let lookup = tokio::time::timeout(
            Duration::from_secs_f64(HOSTNAME_RESOLVE_RETRY_TIME),
            tokio::net::lookup_host((hostname, port)),
        )
        .await;
        match lookup {
            Ok(Ok(addresses)) => {
                let addresses: Vec<SocketAddr> = addresses.collect();
                if let Some(addr) =
                    addresses.iter().find(|a| a.is_ipv4()).or_else(|| addresses.first())
                {
                    debug!("resolved backend hostname {hostname} to {addr}");
                    return Some(Address::from(*addr));
                }
            }
            Ok(Err(error)) => {
                debug!("backend hostname lookup failed (attempt {attempt}): {error}");
            }
            Err(_) => {
                debug!("backend hostname lookup timed out (attempt {attempt})");
            }
        }
        tokio::time::sleep(Duration::from_secs_f64(HOSTNAME_RESOLVE_RETRY_TIME)).await;
    }

    warn!("failed to resolve backend hostname {hostname} after {HOSTNAME_RESOLVE_RETRIES} attempts");
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_literal_address_short_circuits() {
        let addr = resolve_backend_hostname("127.0.0.1:45000", 40000).await.unwrap();
        assert_eq!(addr, "127.0.0.1:45000".parse().unwrap());
    }

    #[tokio::test]
    async fn test_literal_without_port_uses_default() {
        let addr = resolve_backend_hostname("10.2.3.4", 40000).await.unwrap();
        assert_eq!(addr, "10.2.3.4:40000".parse().unwrap());
    }

    #[tokio::test]
    async fn test_localhost_resolves() {
        let addr = resolve_backend_hostname("localhost", 40000).await;
        assert!(addr.is_some());
        assert_eq!(addr.unwrap().port(), 40000);
    }
}
