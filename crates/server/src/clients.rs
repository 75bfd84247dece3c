//! Connection table, group membership and push fan-out.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use hubline_protocol::{HubMessage, HubProtocol, InvocationMessage};
use parking_lot::RwLock;

use crate::ServerError;
use crate::connection::Connection;

/// Which connections a push is delivered to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    All,
    Connection(String),
    Connections(Vec<String>),
    Group(String),
    /// Every connection except the listed ids.
    AllExcept(Vec<String>),
}

#[derive(Default)]
struct Tables {
    by_id: HashMap<String, Arc<Connection>>,
    /// connection token -> connection id
    by_token: HashMap<String, String>,
    groups: HashMap<String, HashSet<String>>,
}

/// All connections known to the server, live or still handshaking.
#[derive(Default)]
pub(crate) struct ConnectionTable {
    inner: RwLock<Tables>,
}

impl ConnectionTable {
    pub(crate) fn insert(&self, conn: Arc<Connection>) {
        let mut t = self.inner.write();
        t.by_token.insert(conn.token.clone(), conn.id.clone());
        t.by_id.insert(conn.id.clone(), conn);
    }

    pub(crate) fn get(&self, id: &str) -> Option<Arc<Connection>> {
        self.inner.read().by_id.get(id).cloned()
    }

    pub(crate) fn get_by_token(&self, token: &str) -> Option<Arc<Connection>> {
        let t = self.inner.read();
        t.by_token.get(token).and_then(|id| t.by_id.get(id)).cloned()
    }

    /// Removes a connection and its group memberships.
    pub(crate) fn remove(&self, id: &str) -> Option<Arc<Connection>> {
        let mut t = self.inner.write();
        let conn = t.by_id.remove(id)?;
        t.by_token.remove(&conn.token);
        t.groups.retain(|_, members| {
            members.remove(id);
            !members.is_empty()
        });
        Some(conn)
    }

    pub(crate) fn add_to_group(&self, id: &str, group: &str) -> Result<(), ServerError> {
        let mut t = self.inner.write();
        if !t.by_id.contains_key(id) {
            return Err(ServerError::NotFound(id.to_string()));
        }
        t.groups
            .entry(group.to_string())
            .or_default()
            .insert(id.to_string());
        Ok(())
    }

    pub(crate) fn remove_from_group(&self, id: &str, group: &str) -> Result<(), ServerError> {
        let mut t = self.inner.write();
        if !t.by_id.contains_key(id) {
            return Err(ServerError::NotFound(id.to_string()));
        }
        if let Some(members) = t.groups.get_mut(group) {
            members.remove(id);
            if members.is_empty() {
                t.groups.remove(group);
            }
        }
        Ok(())
    }

    /// Live connections matching `target`.
    pub(crate) fn select(&self, target: &Target) -> Vec<Arc<Connection>> {
        let t = self.inner.read();
        let picked: Vec<Arc<Connection>> = match target {
            Target::All => t.by_id.values().cloned().collect(),
            Target::Connection(id) => t.by_id.get(id).cloned().into_iter().collect(),
            Target::Connections(ids) => ids.iter().filter_map(|id| t.by_id.get(id).cloned()).collect(),
            Target::Group(group) => t
                .groups
                .get(group)
                .map(|members| members.iter().filter_map(|id| t.by_id.get(id).cloned()).collect())
                .unwrap_or_default(),
            Target::AllExcept(excluded) => t
                .by_id
                .values()
                .filter(|c| !excluded.contains(&c.id))
                .cloned()
                .collect(),
        };
        picked.into_iter().filter(|c| c.is_live()).collect()
    }

    pub(crate) fn all(&self) -> Vec<Arc<Connection>> {
        self.inner.read().by_id.values().cloned().collect()
    }

    /// Number of handshaken, open connections.
    pub(crate) fn live_count(&self) -> usize {
        self.inner.read().by_id.values().filter(|c| c.is_live()).count()
    }
}

/// Where pushes and group changes are carried out.
pub(crate) trait Fanout: Send + Sync {
    fn push(&self, target: Target, message: InvocationMessage);
    fn add_to_group(&self, connection_id: &str, group: &str) -> Result<(), ServerError>;
    fn remove_from_group(&self, connection_id: &str, group: &str) -> Result<(), ServerError>;
}

/// Fan-out to connections held by this process.
pub(crate) struct DirectFanout {
    table: Arc<ConnectionTable>,
}

impl DirectFanout {
    pub(crate) fn new(table: Arc<ConnectionTable>) -> Self {
        Self { table }
    }
}

impl Fanout for DirectFanout {
    fn push(&self, target: Target, message: InvocationMessage) {
        let recipients = self.table.select(&target);
        if recipients.is_empty() {
            tracing::debug!(target = %message.target, "push has no recipients");
            return;
        }

        // Encode at most once per hub protocol in use.
        let message = HubMessage::Invocation(message);
        let mut json: Option<Vec<u8>> = None;
        let mut msgpack: Option<Vec<u8>> = None;
        for conn in recipients {
            let Some(protocol) = conn.protocol() else {
                continue;
            };
            let slot = match protocol {
                HubProtocol::Json => &mut json,
                HubProtocol::MessagePack => &mut msgpack,
            };
            if slot.is_none() {
                match protocol.write(&message) {
                    Ok(bytes) => *slot = Some(bytes),
                    Err(e) => {
                        tracing::error!(%protocol, "failed to encode push: {e}");
                        continue;
                    }
                }
            }
            if let Some(bytes) = slot.as_ref() {
                conn.enqueue(bytes.clone());
            }
        }
    }

    fn add_to_group(&self, connection_id: &str, group: &str) -> Result<(), ServerError> {
        self.table.add_to_group(connection_id, group)
    }

    fn remove_from_group(&self, connection_id: &str, group: &str) -> Result<(), ServerError> {
        self.table.remove_from_group(connection_id, group)
    }
}
