use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::RwLock;
use switchboard_core::errors::BridgeError;
use switchboard_core::frame::Frame;
use switchboard_core::ids::{ConnectionId, Identity};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const CLIENT_TIMEOUT: Duration = Duration::from_secs(90);

/// Lifecycle of one streaming connection. `Disconnected` is terminal; a
/// returning client gets a fresh connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Unauthenticated = 0,
    Connected = 1,
    Disconnected = 2,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Unauthenticated,
            1 => Self::Connected,
            _ => Self::Disconnected,
        }
    }
}

/// A live streaming connection. Outbound frames go through a bounded queue
/// drained by the socket writer.
pub struct Connection {
    pub id: ConnectionId,
    identity: OnceLock<Identity>,
    tx: mpsc::Sender<String>,
    state: AtomicU8,
    last_pong: AtomicU64,
}

impl Connection {
    pub fn new(max_send_queue: usize) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(max_send_queue);
        let conn = Arc::new(Self {
            id: ConnectionId::new(),
            identity: OnceLock::new(),
            tx,
            state: AtomicU8::new(ConnectionState::Unauthenticated as u8),
            last_pong: AtomicU64::new(now_secs()),
        });
        (conn, rx)
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.get()
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Bind to `identity`. A connection belongs to one identity for its lifetime.
    fn bind(&self, identity: &Identity) -> bool {
        self.identity.get_or_init(|| identity.clone()) == identity
    }

    fn mark_connected(&self) {
        let _ = self.state.compare_exchange(
            ConnectionState::Unauthenticated as u8,
            ConnectionState::Connected as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub fn mark_disconnected(&self) {
        self.state
            .store(ConnectionState::Disconnected as u8, Ordering::Release);
    }

    pub fn record_pong(&self) {
        self.last_pong.store(now_secs(), Ordering::Relaxed);
    }

    pub fn is_alive(&self) -> bool {
        let last = self.last_pong.load(Ordering::Relaxed);
        now_secs().saturating_sub(last) < CLIENT_TIMEOUT.as_secs()
    }

    /// Queue a raw message without waiting. Fails if the connection is closed
    /// or its queue is full.
    pub fn send_raw(&self, message: String) -> Result<(), BridgeError> {
        if self.state() == ConnectionState::Disconnected {
            return Err(BridgeError::Delivery(format!("{} is disconnected", self.id)));
        }
        match self.tx.try_send(message) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(msg)) => {
                tracing::warn!(
                    connection_id = %self.id,
                    msg_len = msg.len(),
                    "Send queue full, dropping message"
                );
                Err(BridgeError::Delivery("send queue full".into()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(BridgeError::Delivery(format!("{} writer closed", self.id)))
            }
        }
    }

    pub fn send(&self, frame: &Frame) -> Result<(), BridgeError> {
        self.send_raw(frame.to_json()?)
    }

    #[cfg(test)]
    fn expire(&self) {
        self.last_pong.store(0, Ordering::Relaxed);
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Handle to one identity's connection that can only send named events.
#[derive(Clone)]
pub struct ScopedEmitter {
    connection: Arc<Connection>,
}

impl ScopedEmitter {
    pub(crate) fn new(connection: Arc<Connection>) -> Self {
        Self { connection }
    }

    pub fn emit(&self, event: &str, data: serde_json::Value) -> Result<(), BridgeError> {
        self.connection.send(&Frame::new(event, data))
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection.id
    }
}

#[derive(Default)]
struct Routes {
    by_identity: HashMap<Identity, Arc<Connection>>,
    by_connection: HashMap<ConnectionId, Identity>,
}

/// Identity ↔ connection mapping. Both directions live under one lock so a
/// reader never observes half of a connect or disconnect.
#[derive(Default)]
pub struct ConnectionRegistry {
    routes: RwLock<Routes>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `connection` for `identity`. Rejects a missing or blank identity
    /// and a connection already bound to someone else. A previous connection
    /// for the same identity stops being addressable but is left open.
    pub fn connect(&self, identity: Option<&str>, connection: Arc<Connection>) -> bool {
        let Some(identity) = Identity::parse(identity) else {
            tracing::warn!(connection_id = %connection.id, "Rejected connection without identity");
            return false;
        };
        if !connection.bind(&identity) {
            tracing::warn!(
                connection_id = %connection.id,
                identity = %identity,
                "Rejected connection already bound to another identity"
            );
            return false;
        }
        if connection.state() == ConnectionState::Disconnected {
            return false;
        }

        let superseded = {
            let mut routes = self.routes.write();
            let previous = routes
                .by_identity
                .insert(identity.clone(), Arc::clone(&connection));
            routes
                .by_connection
                .insert(connection.id.clone(), identity.clone());
            match previous {
                Some(old) if old.id != connection.id => {
                    routes.by_connection.remove(&old.id);
                    Some(old.id.clone())
                }
                _ => None,
            }
        };
        connection.mark_connected();

        match superseded {
            Some(old) => tracing::info!(
                identity = %identity,
                connection_id = %connection.id,
                superseded = %old,
                "User reconnected"
            ),
            None => tracing::info!(identity = %identity, connection_id = %connection.id, "User connected"),
        }
        true
    }

    /// Forget `connection_id`. Unknown handles are a no-op. The identity's
    /// forward mapping is only removed while it still points at this handle.
    pub fn disconnect(&self, connection_id: &ConnectionId) -> Option<Identity> {
        let (identity, removed) = {
            let mut routes = self.routes.write();
            let identity = routes.by_connection.remove(connection_id)?;
            let current = routes
                .by_identity
                .get(&identity)
                .is_some_and(|c| &c.id == connection_id);
            let removed = if current {
                routes.by_identity.remove(&identity)
            } else {
                None
            };
            (identity, removed)
        };

        if let Some(conn) = removed {
            conn.mark_disconnected();
        }
        tracing::info!(identity = %identity, connection_id = %connection_id, "User disconnected");
        Some(identity)
    }

    pub fn lookup(&self, identity: &Identity) -> Option<Arc<Connection>> {
        self.routes.read().by_identity.get(identity).cloned()
    }

    pub fn resolve_identity(&self, connection_id: &ConnectionId) -> Option<Identity> {
        self.routes.read().by_connection.get(connection_id).cloned()
    }

    /// Number of identities with an addressable connection.
    pub fn count(&self) -> usize {
        self.routes.read().by_identity.len()
    }

    /// Disconnect connections that stopped answering pings.
    pub fn cleanup_dead_connections(&self) -> usize {
        let dead: Vec<ConnectionId> = self
            .routes
            .read()
            .by_identity
            .values()
            .filter(|c| !c.is_alive())
            .map(|c| c.id.clone())
            .collect();

        let mut removed = 0;
        for id in dead {
            if self.disconnect(&id).is_some() {
                removed += 1;
                tracing::info!(connection_id = %id, "Cleaned up dead connection");
            }
        }
        removed
    }
}

/// Start a background task that periodically cleans up dead connections.
pub fn start_cleanup_task(
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = registry.cleanup_dead_connections();
                    if removed > 0 {
                        tracing::info!(removed = removed, "Dead connection cleanup");
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }
    })
}
