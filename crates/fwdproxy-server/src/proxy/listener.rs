//! Accept loop: one relay task per inbound connection.
//!
//! The listener is the only owner of the [`RelayRegistry`]. It inserts a
//! handle right after spawning each relay and removes it when that relay's
//! [`RelayEvent::Terminated`] arrives. Both happen on the same loop, so a
//! removal can never overtake its insertion.

use super::registry::{RelayHandle, RelayRegistry};
use super::relay::Relay;
use super::{ConnId, ProxyContext, RelayEvent};
use fwdproxy_core::{ProxyError, ProxyResult};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Capacity of the relay → listener event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Bound listen socket plus the bookkeeping for every live relay.
pub struct ProxyListener {
    ctx: Arc<ProxyContext>,
    listener: TcpListener,
    registry: RelayRegistry,
    /// Next connection id to hand out.
    next_id: ConnId,
    events_tx: mpsc::Sender<RelayEvent>,
    events_rx: mpsc::Receiver<RelayEvent>,
    /// Active-connection count, republished after every change.
    active_tx: watch::Sender<usize>,
}

impl ProxyListener {
    /// Bind the listen socket described by `ctx.listen`.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Bind`] if the address cannot be bound.
    pub async fn bind(ctx: Arc<ProxyContext>) -> ProxyResult<Self> {
        let listener = TcpListener::bind(ctx.listen)
            .await
            .map_err(|e| ProxyError::Bind(format!("{}: {}", ctx.listen, e)))?;

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (active_tx, _) = watch::channel(0);
        let bound = Self {
            ctx,
            listener,
            registry: RelayRegistry::new(),
            next_id: 1,
            events_tx,
            events_rx,
            active_tx,
        };
        info!(addr = %bound.local_addr()?, agent = %bound.ctx.agent, "proxy listening");
        Ok(bound)
    }

    /// Address the listener actually bound (useful with port 0).
    pub fn local_addr(&self) -> ProxyResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Subscribe to the active-connection count. The count is republished
    /// for diagnostics; only tests observe it today.
    #[cfg(test)]
    pub fn active_connections(&self) -> watch::Receiver<usize> {
        self.active_tx.subscribe()
    }

    /// Accept connections and process relay events until `shutdown`
    /// resolves. Relays still running at that point are aborted.
    pub async fn serve<F>(mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    if !self.registry.is_empty() {
                        debug!(live = self.registry.len(), "aborting live relays");
                    }
                    for row in self.registry.snapshot() {
                        debug!(
                            conn_id = row.id,
                            peer = %row.peer,
                            state = ?row.state,
                            age_ms = row.age.as_millis() as u64,
                            "aborting relay"
                        );
                    }
                    let aborted = self.registry.abort_all();
                    self.publish_active();
                    info!(aborted, "listener shut down");
                    break;
                }
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let setup = prepare_socket(&stream);
                            self.admit(stream, peer, setup);
                        }
                        Err(e) => warn!(error = %e, "accept failed"),
                    }
                }
                Some(event) = self.events_rx.recv() => self.on_event(event),
            }
        }
    }

    /// Register and spawn a relay for an accepted connection, or drop the
    /// connection if its socket setup failed. Returns the assigned id.
    fn admit(
        &mut self,
        stream: TcpStream,
        peer: SocketAddr,
        setup: ProxyResult<()>,
    ) -> Option<ConnId> {
        if let Err(e) = setup {
            warn!(peer = %peer, error = %e, "dropping connection");
            return None;
        }

        let id = self.next_id;
        self.next_id += 1;
        debug_assert!(!self.registry.contains(id), "connection id {id} reused");

        let (relay, state_rx) = Relay::new(id, stream, self.ctx.clone(), self.events_tx.clone());
        let task = tokio::spawn(relay.run());
        if !self.registry.insert(RelayHandle::new(id, peer, state_rx, task)) {
            return None;
        }
        self.publish_active();

        info!(
            conn_id = id,
            peer = %peer,
            active = self.registry.len(),
            "connection accepted"
        );
        Some(id)
    }

    fn on_event(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::Terminated { id } => {
                if self.registry.remove(id).is_some() {
                    self.publish_active();
                    info!(conn_id = id, active = self.registry.len(), "connection closed");
                } else {
                    debug!(conn_id = id, "termination for unregistered connection ignored");
                }
            }
        }
    }

    fn publish_active(&self) {
        self.active_tx.send_replace(self.registry.len());
    }
}

/// Per-connection socket setup applied before a relay takes ownership.
fn prepare_socket(stream: &TcpStream) -> ProxyResult<()> {
    stream
        .set_nodelay(true)
        .map_err(|e| ProxyError::AcceptSetup(e.to_string()))
}
