use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use super::{Connection, ConnectionDescriptor};

/// Owns at most one live [`Connection`] per descriptor.
pub struct TransportRegistry {
    token: Option<String>,
    backoff: Duration,
    connections: Mutex<HashMap<ConnectionDescriptor, Connection>>,
}

impl TransportRegistry {
    pub fn new(token: Option<String>, backoff: Duration) -> Self {
        Self { token, backoff, connections: Mutex::new(HashMap::new()) }
    }

    /// Returns the registered connection for `descriptor`, opening one if none
    /// exists or the registered one was closed.
    pub fn acquire(&self, descriptor: &ConnectionDescriptor) -> Connection {
        let mut connections = self.connections.lock();
        if let Some(existing) = connections.get(descriptor).filter(|c| !c.is_closed()) {
            debug!(endpoint = %descriptor, "reusing connection");
            return existing.clone();
        }
        let connection = Connection::open(descriptor.clone(), self.token.as_deref(), self.backoff);
        connections.insert(descriptor.clone(), connection.clone());
        connection
    }

    /// Closes and forgets the connection for `descriptor`. Returns whether one was registered.
    pub fn release(&self, descriptor: &ConnectionDescriptor) -> bool {
        let removed = self.connections.lock().remove(descriptor);
        match removed {
            Some(connection) => {
                connection.close();
                true
            }
            None => false,
        }
    }

    pub fn release_all(&self) {
        let drained: Vec<Connection> = self.connections.lock().drain().map(|(_, c)| c).collect();
        for connection in drained {
            connection.close();
        }
    }

    pub fn get(&self, descriptor: &ConnectionDescriptor) -> Option<Connection> {
        self.connections.lock().get(descriptor).cloned()
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for TransportRegistry {
    fn drop(&mut self) {
        self.release_all();
    }
}
