//! Keyed connections for a cluster.
//!
//! The pool owns one connection per node key, tagged with the role it was
//! last used in. Membership changes emit `+node`/`-node`, and `drain`
//! fires when the last node leaves.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use rand::seq::IteratorRandom;
use redlink_core::{NodeAddr, NodeRole, RedisConfig};
use tracing::debug;

use crate::command::Command;
use crate::connection::Connection;
use crate::events::{Event, EventSink};

struct PoolNode {
    addr: NodeAddr,
    conn: Connection,
    role: NodeRole,
}

struct PoolInner {
    nodes: HashMap<String, PoolNode>,
}

/// Connection pool keyed by canonical node key.
#[derive(Clone)]
pub struct ConnectionPool {
    template: RedisConfig,
    sink: Arc<dyn EventSink>,
    inner: Arc<Mutex<PoolInner>>,
}

impl ConnectionPool {
    /// Empty pool. `template` carries the per-node options; host and port
    /// are overridden for each member.
    #[must_use]
    pub fn new(template: RedisConfig, sink: Arc<dyn EventSink>) -> Self {
        Self {
            template,
            sink,
            inner: Arc::new(Mutex::new(PoolInner {
                nodes: HashMap::new(),
            })),
        }
    }

    /// Reuse or create the connection for `addr`, atomically. When the
    /// cached role differs, the role command (`READONLY`/`READWRITE`) is
    /// issued in the background and the node changes view.
    pub fn find_or_create(&self, addr: &NodeAddr, role: NodeRole) -> Connection {
        let key = addr.key();
        let mut inner = self.inner.lock().expect("pool poisoned");
        if let Some(node) = inner.nodes.get_mut(&key) {
            if node.role != role {
                let verb = match role {
                    NodeRole::Primary => "readwrite",
                    NodeRole::Replica => "readonly",
                };
                node.conn.send(Command::internal(verb, Vec::<Bytes>::new()));
                node.role = role;
            }
            return node.conn.clone();
        }
        let conn = self.spawn_node(&mut inner, addr, role);
        drop(inner);
        self.sink.emit(Event::NodeAdded(key));
        conn
    }

    fn spawn_node(&self, inner: &mut PoolInner, addr: &NodeAddr, role: NodeRole) -> Connection {
        let key = addr.key();
        debug!(node = %key, ?role, "adding node to pool");
        let mut config = self.template.for_node(addr);
        config.read_only = role == NodeRole::Replica;
        let (conn, _streams) = Connection::spawn(config, Arc::new(PoolNodeSink));
        inner.nodes.insert(
            key.clone(),
            PoolNode {
                addr: addr.clone(),
                conn: conn.clone(),
                role,
            },
        );
        self.spawn_watcher(key, conn.clone());
        conn
    }

    /// Remove the node once its connection reaches `end`.
    fn spawn_watcher(&self, key: String, conn: Connection) {
        let pool = self.clone();
        tokio::spawn(async move {
            conn.wait_end().await;
            pool.remove(&key);
        });
    }

    /// Drop one node, emitting `-node` and possibly `drain`.
    pub fn remove(&self, key: &str) {
        let (removed, empty) = {
            let mut inner = self.inner.lock().expect("pool poisoned");
            let removed = inner.nodes.remove(key);
            (removed, inner.nodes.is_empty())
        };
        if let Some(node) = removed {
            debug!(node = %key, "removing node from pool");
            node.conn.disconnect(false);
            self.sink.emit(Event::NodeRemoved(key.to_string()));
            if empty {
                self.sink.emit(Event::Drain);
            }
        }
    }

    /// Reconcile membership with a fresh node set: connections for absent
    /// keys are closed, missing ones are created. Afterwards the pool's
    /// membership equals `nodes`; calling it again with the same set is a
    /// no-op.
    pub fn reset(&self, nodes: &[(NodeAddr, NodeRole)]) {
        // New members first: a full membership swap must never pass
        // through an empty pool, which would read as a drain.
        for (addr, role) in nodes {
            let _ = self.find_or_create(addr, *role);
        }
        let wanted: BTreeSet<String> = nodes.iter().map(|(addr, _)| addr.key()).collect();
        let stale: Vec<String> = {
            let inner = self.inner.lock().expect("pool poisoned");
            inner
                .nodes
                .keys()
                .filter(|key| !wanted.contains(*key))
                .cloned()
                .collect()
        };
        for key in stale {
            self.remove(&key);
        }
    }

    /// Uniformly random member of one role view.
    #[must_use]
    pub fn sample(&self, role: NodeRole) -> Option<(NodeAddr, Connection)> {
        let inner = self.inner.lock().expect("pool poisoned");
        inner
            .nodes
            .values()
            .filter(|node| node.role == role)
            .choose(&mut rand::thread_rng())
            .map(|node| (node.addr.clone(), node.conn.clone()))
    }

    /// Uniformly random member of the whole pool.
    #[must_use]
    pub fn sample_any(&self) -> Option<(NodeAddr, Connection)> {
        let inner = self.inner.lock().expect("pool poisoned");
        inner
            .nodes
            .values()
            .choose(&mut rand::thread_rng())
            .map(|node| (node.addr.clone(), node.conn.clone()))
    }

    /// Current membership keys.
    #[must_use]
    pub fn keys(&self) -> BTreeSet<String> {
        let inner = self.inner.lock().expect("pool poisoned");
        inner.nodes.keys().cloned().collect()
    }

    /// Number of members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("pool poisoned").nodes.len()
    }

    /// True when the pool has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Disconnect every member without reconnect; used at shutdown.
    pub fn disconnect_all(&self) {
        let keys: Vec<String> = {
            let inner = self.inner.lock().expect("pool poisoned");
            inner.nodes.keys().cloned().collect()
        };
        for key in keys {
            self.remove(&key);
        }
    }
}

/// Per-node connections report through the pool, not per-connection
/// listeners; their own lifecycle noise is dropped here.
struct PoolNodeSink;

impl EventSink for PoolNodeSink {
    fn emit(&self, _event: Event) {}
}
