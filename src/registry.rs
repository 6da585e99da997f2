//! Live sessions and the device-identity registry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, RwLock};

use crate::protocol::{self, Role, ServerMessage};

/// Frames queued for a session's outbound forwarder task.
#[derive(Debug, Clone)]
pub enum Outbound {
    Message(ServerMessage),
    /// Liveness probe; the client's pong sets the alive flag.
    Ping,
    /// Close the transport after two missed probes.
    Shutdown,
}

/// Protocol state of one session. Role is set once and never changes.
#[derive(Debug, Default)]
pub struct SessionState {
    pub device_id: Option<String>,
    pub role: Option<Role>,
    pub paired_with: Option<String>,
    pub pair_code: Option<String>,
}

/// One live transport. Created at socket accept, destroyed on close.
#[derive(Debug)]
pub struct Session {
    pub conn_id: u64,
    tx: mpsc::UnboundedSender<Outbound>,
    alive: AtomicBool,
    pub state: RwLock<SessionState>,
}

impl Session {
    pub fn new(conn_id: u64, tx: mpsc::UnboundedSender<Outbound>) -> Arc<Self> {
        Arc::new(Self {
            conn_id,
            tx,
            alive: AtomicBool::new(true),
            state: RwLock::new(SessionState::default()),
        })
    }

    /// Queue a message for delivery. A closed transport drops it; relay
    /// messages are never queued for later.
    pub fn send(&self, message: ServerMessage) -> bool {
        self.tx.send(Outbound::Message(message)).is_ok()
    }

    pub fn ping(&self) -> bool {
        self.tx.send(Outbound::Ping).is_ok()
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(Outbound::Shutdown);
    }

    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    pub fn mark_alive(&self) {
        self.alive.store(true, Ordering::Relaxed);
    }

    /// Clear the alive flag and report whether it was set. A `false` return
    /// means the session missed the previous probe as well.
    pub fn probe(&self) -> bool {
        self.alive.swap(false, Ordering::Relaxed)
    }
}

/// Registered devices keyed by identity. Re-registration under an identity
/// overwrites the prior record: last registration wins.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    devices: DashMap<String, Arc<Session>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a fresh identity for `session` and insert it.
    pub fn register(&self, session: Arc<Session>) -> String {
        let device_id = protocol::generate_device_id();
        self.devices.insert(device_id.clone(), session);
        device_id
    }

    /// Re-insert a session under an identity it proved ownership of
    /// (reconnect path).
    pub fn restore(&self, device_id: &str, session: Arc<Session>) {
        self.devices.insert(device_id.to_string(), session);
    }

    pub fn lookup(&self, device_id: &str) -> Option<Arc<Session>> {
        self.devices.get(device_id).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, device_id: &str) -> Option<Arc<Session>> {
        self.devices.remove(device_id).map(|(_, session)| session)
    }

    /// Remove the entry only if it still points at `session`. Keeps a late
    /// disconnect of an evicted transport from deleting the registration
    /// that replaced it.
    pub fn remove_if_same(&self, device_id: &str, session: &Arc<Session>) -> bool {
        self.devices
            .remove_if(device_id, |_, current| Arc::ptr_eq(current, session))
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
