//! Shared connection and identity state.
//!
//! One mutex guards both maps. Lookups and mutations are mutually
//! exclusive, but the guard is always dropped before anything is sent:
//! the lock determines a target, the send happens outside it.

use std::collections::HashMap;

use relay_protocol::Envelope;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub type ConnectionId = Uuid;

#[derive(Default)]
struct HubInner {
    /// Every open downstream connection, keyed by its hub-assigned id. The
    /// sender feeds that connection's socket writer task.
    connections: HashMap<ConnectionId, mpsc::Sender<String>>,
    /// Identity label → the single connection currently holding it.
    identities: HashMap<String, ConnectionId>,
}

/// The broker state shared by every connection task and the feed pump.
#[derive(Default)]
pub struct Hub {
    inner: Mutex<HubInner>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new downstream connection under a fresh id. Identity
    /// comes later, via the identify handshake.
    pub async fn accept(&self, outbound: mpsc::Sender<String>) -> ConnectionId {
        let id = Uuid::new_v4();
        self.inner.lock().await.connections.insert(id, outbound);
        info!(conn_id = %id, "downstream connection registered");
        id
    }

    /// Bind `label` to `conn_id`, last writer wins. A superseded connection
    /// stays open but is no longer addressable by the label. A connection
    /// holds at most one label; re-identifying releases its previous one.
    pub async fn identify(&self, conn_id: ConnectionId, label: &str) {
        let superseded = {
            let mut inner = self.inner.lock().await;
            inner
                .identities
                .retain(|existing, id| *id != conn_id || existing == label);
            inner.identities.insert(label.to_string(), conn_id)
        };
        match superseded.filter(|prev| *prev != conn_id) {
            Some(prev) => {
                info!(label, conn_id = %conn_id, superseded = %prev, "identity label rebound")
            }
            None => info!(label, conn_id = %conn_id, "connection identified"),
        }
    }

    /// Deliver an envelope to the connection bound to `label`. A miss is a
    /// reported no-op; there is no guaranteed delivery for routed events.
    pub async fn route_to(&self, label: &str, envelope: &Envelope) -> bool {
        let target = {
            let inner = self.inner.lock().await;
            inner.identities.get(label).and_then(|id| {
                inner
                    .connections
                    .get(id)
                    .map(|outbound| (*id, outbound.clone()))
            })
        };
        let Some((conn_id, outbound)) = target else {
            warn!(label, cmd = %envelope.cmd, "no connection bound to label, dropping envelope");
            return false;
        };
        self.deliver(conn_id, &outbound, envelope.encode()).await
    }

    /// Deliver an envelope directly to one connection (identify acks).
    pub async fn send_to(&self, conn_id: ConnectionId, envelope: &Envelope) -> bool {
        let outbound = {
            let inner = self.inner.lock().await;
            inner.connections.get(&conn_id).cloned()
        };
        let Some(outbound) = outbound else {
            warn!(conn_id = %conn_id, "send to unknown connection, dropping envelope");
            return false;
        };
        self.deliver(conn_id, &outbound, envelope.encode()).await
    }

    /// Deliver to every open connection. One dead or saturated connection
    /// must not hold up the rest: delivery never awaits a full buffer, and
    /// connections that are closed or can no longer keep up are torn down
    /// afterwards.
    pub async fn broadcast(&self, envelope: &Envelope) {
        let targets: Vec<(ConnectionId, mpsc::Sender<String>)> = {
            let inner = self.inner.lock().await;
            inner
                .connections
                .iter()
                .map(|(id, outbound)| (*id, outbound.clone()))
                .collect()
        };
        let text = envelope.encode();
        let mut dead = Vec::new();
        for (id, outbound) in targets {
            match outbound.try_send(text.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(conn_id = %id, "broadcast buffer full, tearing down slow connection");
                    dead.push(id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    warn!(conn_id = %id, "broadcast hit a closed connection, tearing it down");
                    dead.push(id);
                }
            }
        }
        for id in dead {
            self.disconnect(id).await;
        }
    }

    /// Remove the connection and any identity label pointing at it.
    pub async fn disconnect(&self, conn_id: ConnectionId) {
        let mut inner = self.inner.lock().await;
        inner.connections.remove(&conn_id);
        inner.identities.retain(|_, id| *id != conn_id);
        debug!(conn_id = %conn_id, "downstream connection removed");
    }

    async fn deliver(
        &self,
        conn_id: ConnectionId,
        outbound: &mpsc::Sender<String>,
        text: String,
    ) -> bool {
        if outbound.send(text).await.is_err() {
            warn!(conn_id = %conn_id, "send to closed connection, tearing it down");
            self.disconnect(conn_id).await;
            return false;
        }
        true
    }

    #[cfg(test)]
    pub async fn connection_count(&self) -> usize {
        self.inner.lock().await.connections.len()
    }
}
