//! Node addressing shared by the pool, the slot map and sentinel discovery.

use std::collections::HashMap;
use std::fmt;

/// Role of a node within a replicated setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    /// Accepts writes.
    Primary,
    /// Serves reads once `READONLY` has been issued.
    Replica,
}

/// Address of a server node.
///
/// The canonical `key()` rendering is what the pool and the slot map use to
/// identify a node; all lookups for one logical node converge on the same
/// key (IPv6 hosts are lowercased and bracketed, the port is always
/// included).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeAddr {
    /// Hostname or IP literal, without brackets.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl NodeAddr {
    /// Build an address from parts.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let mut host = host.into();
        if host.contains(':') {
            host = host.to_ascii_lowercase();
        }
        Self { host, port }
    }

    /// Parse a `host:port` pair, accepting bracketed IPv6 literals.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if let Some(rest) = s.strip_prefix('[') {
            let (host, rest) = rest.split_once(']')?;
            let port = rest.strip_prefix(':')?.parse().ok()?;
            return Some(Self::new(host, port));
        }
        let (host, port) = s.rsplit_once(':')?;
        let port = port.parse().ok()?;
        if host.is_empty() {
            return None;
        }
        Some(Self::new(host, port))
    }

    /// Canonical pool/slot-map key for this node.
    #[must_use]
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Rewrites discovered addresses when the client sits behind NAT.
///
/// Keyed by the address as announced by the server (`host:port`); the value
/// is the address the client should actually dial.
#[derive(Debug, Clone, Default)]
pub struct NatMap {
    entries: HashMap<String, NodeAddr>,
}

impl NatMap {
    /// Empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a translation from an announced address to a reachable one.
    pub fn insert(&mut self, announced: impl Into<String>, reachable: NodeAddr) {
        self.entries.insert(announced.into(), reachable);
    }

    /// Translate an announced address, returning it unchanged when no
    /// mapping exists.
    #[must_use]
    pub fn translate(&self, addr: &NodeAddr) -> NodeAddr {
        self.entries
            .get(&addr.key())
            .cloned()
            .unwrap_or_else(|| addr.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hostname_and_port() {
        let addr = NodeAddr::parse("cache-1.internal:6379").unwrap();
        assert_eq!(addr.host, "cache-1.internal");
        assert_eq!(addr.port, 6379);
        assert_eq!(addr.key(), "cache-1.internal:6379");
    }

    #[test]
    fn ipv6_keys_are_canonical() {
        let bracketed = NodeAddr::parse("[2001:DB8::1]:6379").unwrap();
        let bare = NodeAddr::new("2001:db8::1", 6379);
        assert_eq!(bracketed.key(), bare.key());
        assert_eq!(bracketed.key(), "[2001:db8::1]:6379");
    }

    #[test]
    fn rejects_garbage() {
        assert!(NodeAddr::parse("no-port").is_none());
        assert!(NodeAddr::parse(":6379").is_none());
        assert!(NodeAddr::parse("[::1]").is_none());
    }

    #[test]
    fn nat_map_translates_known_nodes_only() {
        let mut nat = NatMap::new();
        nat.insert("10.0.0.1:6379", NodeAddr::new("203.0.113.5", 16379));

        let inside = NodeAddr::new("10.0.0.1", 6379);
        let outside = nat.translate(&inside);
        assert_eq!(outside.key(), "203.0.113.5:16379");

        let unmapped = NodeAddr::new("10.0.0.2", 6379);
        assert_eq!(nat.translate(&unmapped), unmapped);
    }
}
