//! Hostname resolution via `tokio::net::lookup_host`.
//!
//! Relays resolve through the [`Resolve`] trait so the lookup can be swapped
//! out; [`DnsResolver`] is the production implementation.

use fwdproxy_core::{ProxyError, ProxyResult};
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use tokio::net;
use tracing::{debug, warn};

/// Future returned by [`Resolve::resolve`].
pub type ResolveFuture<'a> = Pin<Box<dyn Future<Output = ProxyResult<Vec<IpAddr>>> + Send + 'a>>;

/// Asynchronous hostname lookup.
pub trait Resolve: Send + Sync {
    /// Resolve `host` to an ordered, non-empty list of addresses.
    ///
    /// Relays connect to the first address returned.
    fn resolve<'a>(&'a self, host: &'a str) -> ResolveFuture<'a>;
}

/// Stateless system resolver.
pub struct DnsResolver;

impl DnsResolver {
    /// Resolve a hostname or IP literal, keeping the system's ordering and
    /// dropping duplicates.
    ///
    /// A dummy port (`:0`) is appended internally because `lookup_host`
    /// requires a `host:port` pair. Bracketed IPv6 literals (`[::1]`) work
    /// as-is.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Resolve`] if the lookup fails or yields no
    /// addresses.
    pub async fn lookup(host: &str) -> ProxyResult<Vec<IpAddr>> {
        let lookup_addr = format!("{}:0", host);

        let result = net::lookup_host(&lookup_addr).await;
        match result {
            Ok(addrs) => {
                let mut addresses: Vec<IpAddr> = Vec::new();
                for ip in addrs.map(|a| a.ip()) {
                    if !addresses.contains(&ip) {
                        addresses.push(ip);
                    }
                }

                if addresses.is_empty() {
                    debug!(host = %host, "no addresses found");
                    Err(ProxyError::Resolve(format!("no addresses found for {}", host)))
                } else {
                    debug!(host = %host, count = addresses.len(), "resolved");
                    Ok(addresses)
                }
            }
            Err(e) => {
                warn!(host = %host, error = %e, "DNS resolution failed");
                Err(ProxyError::Resolve(format!("{}: {}", host, e)))
            }
        }
    }
}

impl Resolve for DnsResolver {
    fn resolve<'a>(&'a self, host: &'a str) -> ResolveFuture<'a> {
        Box::pin(Self::lookup(host))
    }
}
