//! Proxy module — listener, per-connection relays, registry, and DNS.
//!
//! # Submodule Architecture
//!
//! - **[`listener`]** — The [`ProxyListener`] binds the listen socket, accepts
//!   connections, assigns connection ids, spawns one [`Relay`](relay::Relay)
//!   task per connection and keeps the
//!   [`RelayRegistry`](registry::RelayRegistry) in step with relay
//!   termination events.
//!
//! - **[`relay`]** — The [`Relay`](relay::Relay) owns a client socket and, once connected,
//!   its upstream socket. It sniffs the request head, resolves and connects
//!   to the target, answers CONNECT with the handshake response, then pumps
//!   bytes both ways until either side goes away.
//!
//! - **[`registry`]** — The [`RelayRegistry`](registry::RelayRegistry) maps connection ids to live
//!   relay handles. Bookkeeping and diagnostics only; nothing is routed
//!   through it.
//!
//! - **[`resolver`]** — The [`Resolve`] seam and the [`DnsResolver`]
//!   implementation over `tokio::net::lookup_host`.
//!
//! # Data Flow
//!
//! ```text
//! TcpListener::accept
//!   → ProxyListener::admit
//!     → RelayRegistry::insert
//!     → spawn Relay::run
//!         → parse_request / extract_target (fwdproxy-core)
//!         → Resolve::resolve
//!         → TcpStream::connect
//!         → pump both directions
//!         → Relay::terminate → RelayEvent::Terminated
//!   → ProxyListener::on_event
//!     → RelayRegistry::remove
//! ```

pub mod listener;
pub mod registry;
pub mod relay;
pub mod resolver;

pub use listener::ProxyListener;
pub use resolver::{DnsResolver, Resolve};

use fwdproxy_core::{ProxyAgent, ProxyResult};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

/// Connection identifier, unique for the lifetime of the process.
pub type ConnId = u64;

/// Name reported in the `Proxy-agent` header.
pub const AGENT_NAME: &str = "fwdproxy";

/// Shared, read-only state handed to the listener and every relay.
pub struct ProxyContext {
    /// Address the listener binds.
    pub listen: SocketAddr,
    /// Identity used in the CONNECT handshake response.
    pub agent: ProxyAgent,
    /// Hostname resolver used by relays.
    pub resolver: Arc<dyn Resolve>,
}

impl ProxyContext {
    pub fn new(listen: SocketAddr, resolver: Arc<dyn Resolve>) -> Self {
        Self {
            listen,
            agent: ProxyAgent::new(AGENT_NAME, env!("CARGO_PKG_VERSION")),
            resolver,
        }
    }
}

/// Notifications a relay sends back to the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEvent {
    /// The relay has closed both sockets. Sent exactly once per relay.
    Terminated { id: ConnId },
}

/// Bind the listener and serve until `shutdown` resolves.
///
/// # Errors
///
/// Returns [`fwdproxy_core::ProxyError::Bind`] if the listen socket cannot be
/// bound; nothing is served in that case.
pub async fn run<F>(ctx: Arc<ProxyContext>, shutdown: F) -> ProxyResult<()>
where
    F: Future<Output = ()>,
{
    let listener = ProxyListener::bind(ctx).await?;
    listener.serve(shutdown).await;
    Ok(())
}
