use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use relay_core::ids::{ConnectionId, OperatorId, VisitorId};
use relay_core::Role;

use crate::routing::Inbound;

/// The logical identity a connection is bound to after registration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Identity {
    Visitor(VisitorId),
    Operator(OperatorId),
}

impl Identity {
    pub fn role(&self) -> Role {
        match self {
            Self::Visitor(_) => Role::Visitor,
            Self::Operator(_) => Role::Operator,
        }
    }

    pub fn id_str(&self) -> &str {
        match self {
            Self::Visitor(id) => id.as_str(),
            Self::Operator(id) => id.as_str(),
        }
    }
}

/// A connected WebSocket client.
pub struct Connection {
    pub id: ConnectionId,
    identity: Mutex<Option<Identity>>,
    tx: mpsc::Sender<Arc<String>>,
    connected: AtomicBool,
    last_pong: AtomicU64,
    dropped: AtomicU64,
}

impl Connection {
    fn new(id: ConnectionId, tx: mpsc::Sender<Arc<String>>) -> Self {
        Self {
            id,
            identity: Mutex::new(None),
            tx,
            connected: AtomicBool::new(true),
            last_pong: AtomicU64::new(now_secs()),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn identity(&self) -> Option<Identity> {
        self.identity.lock().clone()
    }

    /// Bind the connection to an identity. Idempotent for the same identity;
    /// returns the identity the connection ends up bound to.
    pub fn bind(&self, identity: Identity) -> Identity {
        let mut slot = self.identity.lock();
        match &*slot {
            Some(existing) => existing.clone(),
            None => {
                *slot = Some(identity.clone());
                identity
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn record_pong(&self) {
        self.last_pong.store(now_secs(), Ordering::Relaxed);
    }

    fn is_alive(&self, timeout: Duration) -> bool {
        let last = self.last_pong.load(Ordering::Relaxed);
        now_secs().saturating_sub(last) < timeout.as_secs()
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Registry of all live connections and their identity bindings. The single
/// source of truth for "is this identity currently reachable".
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    max_send_queue: usize,
    client_timeout: Duration,
}

impl ConnectionRegistry {
    pub fn new(max_send_queue: usize, client_timeout: Duration) -> Self {
        Self {
            connections: DashMap::new(),
            max_send_queue,
            client_timeout,
        }
    }

    /// Register a new connection and return its id + outbound receiver.
    pub fn register(&self) -> (ConnectionId, mpsc::Receiver<Arc<String>>) {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        let connection = Arc::new(Connection::new(id.clone(), tx));
        self.connections.insert(id.clone(), connection);
        (id, rx)
    }

    /// Remove a connection by id.
    pub fn unregister(&self, id: &ConnectionId) {
        if let Some((_, connection)) = self.connections.remove(id) {
            connection.connected.store(false, Ordering::Relaxed);
        }
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(id).map(|c| c.clone())
    }

    /// O(1) identity lookup used to authorize every inbound event.
    pub fn resolve(&self, id: &ConnectionId) -> Option<Identity> {
        self.connections.get(id).and_then(|c| c.identity())
    }

    /// Bind a connection to an identity. Returns the effective binding, or
    /// None if the connection is gone.
    pub fn bind(&self, id: &ConnectionId, identity: Identity) -> Option<Identity> {
        self.connections.get(id).map(|c| c.bind(identity))
    }

    /// Send a serialized event to one connection. Never blocks: a full queue
    /// drops the event and counts the drop against the recipient.
    pub fn send_to(&self, id: &ConnectionId, payload: Arc<String>) -> bool {
        let Some(connection) = self.connections.get(id) else {
            return false;
        };
        match connection.tx.try_send(payload) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = connection.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(connection_id = %id, dropped, "send queue full, dropping event");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn find_visitor(&self, visitor_id: &VisitorId) -> Option<ConnectionId> {
        self.connections.iter().find_map(|entry| {
            match entry.value().identity() {
                Some(Identity::Visitor(v)) if v == *visitor_id => Some(entry.key().clone()),
                _ => None,
            }
        })
    }

    pub fn find_operator(&self, operator_id: &OperatorId) -> Option<ConnectionId> {
        self.connections.iter().find_map(|entry| {
            match entry.value().identity() {
                Some(Identity::Operator(o)) if o == *operator_id => Some(entry.key().clone()),
                _ => None,
            }
        })
    }

    /// Number of live connections.
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// (visitor, operator) connection counts.
    pub fn counts_by_role(&self) -> (usize, usize) {
        let mut visitors = 0;
        let mut operators = 0;
        for entry in self.connections.iter() {
            match entry.value().identity() {
                Some(Identity::Visitor(_)) => visitors += 1,
                Some(Identity::Operator(_)) => operators += 1,
                None => {}
            }
        }
        (visitors, operators)
    }

    /// Collect connections that missed the pong timeout. The caller posts a
    /// `Closed` for each so the routing engine observes the disconnect; the
    /// registry entry itself is removed there.
    pub fn dead_connections(&self) -> Vec<ConnectionId> {
        self.connections
            .iter()
            .filter(|entry| !entry.value().is_alive(self.client_timeout))
            .map(|entry| entry.key().clone())
            .collect()
    }
}

/// Handle a WebSocket connection: split into reader/writer, manage lifecycle
/// with heartbeat. Posts `Inbound::Closed` when either side ends so the
/// routing engine observes every disconnect.
pub async fn handle_ws_connection(
    socket: WebSocket,
    connection_id: ConnectionId,
    mut rx: mpsc::Receiver<Arc<String>>,
    registry: Arc<ConnectionRegistry>,
    inbound_tx: mpsc::Sender<Inbound>,
    heartbeat_interval: Duration,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer task: forward events from channel to WebSocket + periodic ping
    let writer_cid = connection_id.clone();
    let writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(heartbeat_interval);
        ping_interval.tick().await; // consume first immediate tick

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(payload) => {
                            if ws_tx.send(WsMessage::Text(payload.as_str().into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                    tracing::trace!(connection_id = %writer_cid, "sent ping");
                }
            }
        }
    });

    // Reader task: forward text frames to the routing loop, track pongs
    let reader_cid = connection_id.clone();
    let reader_registry = Arc::clone(&registry);
    let reader_inbound = inbound_tx.clone();
    let reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Text(text) => {
                    let _ = reader_inbound
                        .send(Inbound::Text {
                            connection: reader_cid.clone(),
                            raw: text.to_string(),
                        })
                        .await;
                }
                WsMessage::Pong(_) => {
                    if let Some(connection) = reader_registry.get(&reader_cid) {
                        connection.record_pong();
                    }
                }
                WsMessage::Close(_) => break,
                WsMessage::Ping(_) => {} // axum handles pong automatically
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = writer => {},
        _ = reader => {},
    }

    let _ = inbound_tx
        .send(Inbound::Closed { connection: connection_id })
        .await;
}

/// Periodically sweep connections that missed the pong timeout, reporting
/// each as a disconnect.
pub fn start_cleanup_task(
    registry: Arc<ConnectionRegistry>,
    inbound_tx: mpsc::Sender<Inbound>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let dead = registry.dead_connections();
            if !dead.is_empty() {
                tracing::info!(count = dead.len(), "dead connection sweep");
            }
            for id in dead {
                let _ = inbound_tx.send(Inbound::Closed { connection: id }).await;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ConnectionRegistry {
        ConnectionRegistry::new(32, Duration::from_secs(90))
    }

    #[test]
    fn register_and_unregister() {
        let reg = registry();
        assert_eq!(reg.count(), 0);

        let (id1, _rx1) = reg.register();
        let (id2, _rx2) = reg.register();
        assert_eq!(reg.count(), 2);

        reg.unregister(&id1);
        assert_eq!(reg.count(), 1);

        reg.unregister(&id2);
        assert_eq!(reg.count(), 0);
    }

    #[test]
    fn resolve_unbound_is_none() {
        let reg = registry();
        let (id, _rx) = reg.register();
        assert!(reg.resolve(&id).is_none());
    }

    #[test]
    fn bind_is_idempotent() {
        let reg = registry();
        let (id, _rx) = reg.register();
        let visitor = Identity::Visitor(VisitorId::from_raw("vis_1"));

        let bound = reg.bind(&id, visitor.clone()).unwrap();
        assert_eq!(bound, visitor);

        // A second bind keeps the original identity.
        let other = Identity::Visitor(VisitorId::from_raw("vis_other"));
        let rebound = reg.bind(&id, other).unwrap();
        assert_eq!(rebound, visitor);
        assert_eq!(reg.resolve(&id), Some(visitor));
    }

    #[test]
    fn send_to_delivers() {
        let reg = registry();
        let (id, mut rx) = reg.register();

        assert!(reg.send_to(&id, Arc::new("hello".to_string())));
        assert_eq!(*rx.try_recv().unwrap(), "hello");
    }

    #[test]
    fn send_to_unknown_connection_fails() {
        let reg = registry();
        assert!(!reg.send_to(&ConnectionId::new(), Arc::new("x".to_string())));
    }

    #[test]
    fn send_to_full_queue_drops_and_counts() {
        let reg = ConnectionRegistry::new(2, Duration::from_secs(90));
        let (id, _rx) = reg.register();

        assert!(reg.send_to(&id, Arc::new("one".to_string())));
        assert!(reg.send_to(&id, Arc::new("two".to_string())));
        assert!(!reg.send_to(&id, Arc::new("three".to_string())));

        let connection = reg.get(&id).unwrap();
        assert_eq!(connection.dropped_count(), 1);
    }

    #[test]
    fn find_by_identity() {
        let reg = registry();
        let (vis_conn, _rx1) = reg.register();
        let (op_conn, _rx2) = reg.register();
        reg.bind(&vis_conn, Identity::Visitor(VisitorId::from_raw("vis_1")));
        reg.bind(&op_conn, Identity::Operator(OperatorId::from_raw("op_1")));

        assert_eq!(reg.find_visitor(&VisitorId::from_raw("vis_1")), Some(vis_conn));
        assert_eq!(reg.find_operator(&OperatorId::from_raw("op_1")), Some(op_conn));
        assert!(reg.find_visitor(&VisitorId::from_raw("vis_none")).is_none());
    }

    #[test]
    fn counts_by_role() {
        let reg = registry();
        let (a, _rx1) = reg.register();
        let (b, _rx2) = reg.register();
        let (_c, _rx3) = reg.register(); // unbound
        reg.bind(&a, Identity::Visitor(VisitorId::from_raw("v")));
        reg.bind(&b, Identity::Operator(OperatorId::from_raw("o")));

        assert_eq!(reg.counts_by_role(), (1, 1));
    }

    #[test]
    fn dead_connection_sweep_finds_expired() {
        let reg = ConnectionRegistry::new(32, Duration::from_secs(90));
        let (id, _rx) = reg.register();

        assert!(reg.dead_connections().is_empty());

        reg.get(&id).unwrap().last_pong.store(0, Ordering::Relaxed);
        let dead = reg.dead_connections();
        assert_eq!(dead, vec![id.clone()]);

        // Sweep does not remove; the routing engine owns unregistration.
        assert_eq!(reg.count(), 1);
    }

    #[test]
    fn identity_role_and_id() {
        let v = Identity::Visitor(VisitorId::from_raw("vis_9"));
        assert_eq!(v.role(), Role::Visitor);
        assert_eq!(v.id_str(), "vis_9");

        let o = Identity::Operator(OperatorId::from_raw("op_9"));
        assert_eq!(o.role(), Role::Operator);
        assert_eq!(o.id_str(), "op_9");
    }
}
