//! Registry of live meta-connections.
//!
//! The registry is the exclusive owner of every [`Connection`] and is
//! itself owned by the main loop; nothing touches it from signal or
//! task context. Names are unique: binding a second connection to an
//! already-present name fails with `Duplicate`.

use crate::connection::{ConnId, Connection};
use crate::error::{Error, Result};
use crate::protocol::{format_line, Request};
use std::collections::HashMap;

/// Connection table with a unique-name index.
#[derive(Debug, Default)]
pub struct Registry {
    connections: HashMap<ConnId, Connection>,
    by_name: HashMap<String, ConnId>,
    next_id: ConnId,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next connection identifier.
    pub fn next_id(&mut self) -> ConnId {
        self.next_id += 1;
        self.next_id
    }

    /// Insert a connection that has not identified itself yet.
    pub fn insert(&mut self, conn: Connection) {
        debug_assert!(conn.name.is_none(), "insert() takes anonymous connections");
        self.connections.insert(conn.id, conn);
    }

    /// Bind a connection to its remote name once the peer's ID arrived.
    ///
    /// Fails with [`Error::Duplicate`] when another live connection
    /// already carries the name.
    pub fn bind_name(&mut self, id: ConnId, name: &str) -> Result<()> {
        if let Some(&holder) = self.by_name.get(name) {
            if holder != id {
                return Err(Error::Duplicate(format!(
                    "already connected to {name}"
                )));
            }
            return Ok(());
        }
        let conn = self
            .connections
            .get_mut(&id)
            .ok_or_else(|| Error::Protocol(format!("no connection {id}")))?;
        conn.name = Some(name.to_string());
        self.by_name.insert(name.to_string(), id);
        Ok(())
    }

    /// Remove a connection, releasing its cipher state. The caller
    /// recomputes nexthops afterwards.
    pub fn remove(&mut self, id: ConnId) -> Option<Connection> {
        let conn = self.connections.remove(&id)?;
        if let Some(name) = &conn.name {
            if self.by_name.get(name) == Some(&id) {
                self.by_name.remove(name);
            }
        }
        Some(conn)
    }

    pub fn get(&self, id: ConnId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    /// Look up a connection by remote name.
    pub fn lookup_by_name(&self, name: &str) -> Option<&Connection> {
        self.by_name.get(name).and_then(|id| self.connections.get(id))
    }

    /// Whether `name` is an adjacent authenticated peer (nexthop
    /// candidate).
    pub fn is_adjacent(&self, name: &str) -> bool {
        self.lookup_by_name(name)
            .map(|c| c.authenticated())
            .unwrap_or(false)
    }

    /// All connections, unordered.
    pub fn scan(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    /// All connections, mutable.
    pub fn scan_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.connections.values_mut()
    }

    /// All connection ids (for iteration that mutates the registry).
    pub fn ids(&self) -> Vec<ConnId> {
        self.connections.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Queue a raw line on every authenticated connection except
    /// `origin`. Used to fan rebroadcastable requests out verbatim.
    pub fn broadcast_line_except(&self, origin: Option<ConnId>, line: &str) {
        for conn in self.connections.values() {
            if Some(conn.id) == origin || !conn.authenticated() {
                continue;
            }
            if let Err(e) = conn.send_raw(line) {
                log::debug!("Broadcast to {} failed: {}", conn.label(), e);
            }
        }
    }

    /// Format a request and fan it out, origin suppressed.
    pub fn broadcast_except(&self, origin: Option<ConnId>, request: Request, args: &[&str]) {
        let line = format_line(request, args);
        self.broadcast_line_except(origin, &line);
    }
}
