//! Registry of live relays, keyed by connection id.
//!
//! Owned by the listener loop, which is the only place entries are inserted
//! (on accept) and removed (on a relay's termination event). It is never
//! consulted to move data.

use super::relay::RelayState;
use super::ConnId;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// The registry's owning handle to one relay.
pub struct RelayHandle {
    /// Connection id assigned at accept time.
    pub id: ConnId,
    /// Address of the client.
    pub peer: SocketAddr,
    /// When the connection was accepted.
    pub accepted_at: Instant,
    /// Latest state published by the relay.
    state: watch::Receiver<RelayState>,
    /// The task running the relay.
    task: JoinHandle<()>,
}

impl RelayHandle {
    pub fn new(
        id: ConnId,
        peer: SocketAddr,
        state: watch::Receiver<RelayState>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            id,
            peer,
            accepted_at: Instant::now(),
            state,
            task,
        }
    }

    /// The relay's current state.
    pub fn state(&self) -> RelayState {
        *self.state.borrow()
    }
}

/// Point-in-time view of a registry entry.
#[derive(Debug, Clone)]
pub struct RelaySummary {
    pub id: ConnId,
    pub peer: SocketAddr,
    pub state: RelayState,
    pub age: Duration,
}

/// Map of connection id to live relay handles.
#[derive(Default)]
pub struct RelayRegistry {
    relays: HashMap<ConnId, RelayHandle>,
}

impl RelayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a relay. Returns `false` and keeps the existing entry if
    /// the id is already registered; the rejected relay's task is aborted.
    pub fn insert(&mut self, handle: RelayHandle) -> bool {
        if self.relays.contains_key(&handle.id) {
            warn!(conn_id = handle.id, "connection id already registered");
            handle.task.abort();
            return false;
        }
        debug!(conn_id = handle.id, peer = %handle.peer, "relay registered");
        self.relays.insert(handle.id, handle);
        true
    }

    /// Remove a relay. Removing an unknown id is a no-op returning `None`.
    pub fn remove(&mut self, id: ConnId) -> Option<RelayHandle> {
        let removed = self.relays.remove(&id);
        if removed.is_some() {
            debug!(conn_id = id, "relay unregistered");
        }
        removed
    }

    pub fn contains(&self, id: ConnId) -> bool {
        self.relays.contains_key(&id)
    }

    /// Number of registered relays.
    pub fn len(&self) -> usize {
        self.relays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relays.is_empty()
    }

    /// Abort every registered relay task and clear the registry. Used when
    /// the host shuts the listener down; aborted relays drop their sockets
    /// without sending a termination event.
    pub fn abort_all(&mut self) -> usize {
        let count = self.relays.len();
        for (_, handle) in self.relays.drain() {
            handle.task.abort();
        }
        count
    }

    /// Summaries of every registered relay, ordered by id.
    pub fn snapshot(&self) -> Vec<RelaySummary> {
        let mut rows: Vec<RelaySummary> = self
            .relays
            .values()
            .map(|h| RelaySummary {
                id: h.id,
                peer: h.peer,
                state: h.state(),
                age: h.accepted_at.elapsed(),
            })
            .collect();
        rows.sort_by_key(|r| r.id);
        rows
    }
}
