//! Table of admitted connections, keyed by token.
//!
//! The registry has no locking of its own; the admission controller owns it
//! behind the same lock as the wait queue and the stats so capacity checks and
//! inserts are atomic with respect to each other.
use std::collections::HashMap;

use crate::core::connection::{Connection, ConnectionToken};

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: HashMap<ConnectionToken, Connection>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection under its token. Returns the previous record if
    /// the token was already present, which the controller treats as a bug.
    pub fn insert(&mut self, connection: Connection) -> Option<Connection> {
        self.connections.insert(connection.token, connection)
    }

    pub fn remove(&mut self, token: &ConnectionToken) -> Option<Connection> {
        self.connections.remove(token)
    }

    pub fn get(&self, token: &ConnectionToken) -> Option<&Connection> {
        self.connections.get(token)
    }

    pub fn contains(&self, token: &ConnectionToken) -> bool {
        self.connections.contains_key(token)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
