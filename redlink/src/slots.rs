//! Hash slots and the slot-to-node map.

use std::collections::{BTreeSet, HashMap};

use crc16::{State, XMODEM};
use redlink_core::{NatMap, NodeAddr, RedisError, RedisResult, Reply};

/// Number of hash slots in a cluster.
pub const SLOT_COUNT: u16 = 16384;

/// Slot for a key: CRC16/XMODEM over the hash tag (the content of the
/// first non-empty `{...}` group) or the whole key, mod 16384.
#[must_use]
pub fn key_slot(key: &[u8]) -> u16 {
    State::<XMODEM>::calculate(hash_tag(key)) % SLOT_COUNT
}

/// The part of the key that participates in hashing.
fn hash_tag(key: &[u8]) -> &[u8] {
    if let Some(open) = key.iter().position(|&b| b == b'{') {
        if let Some(close) = key[open + 1..].iter().position(|&b| b == b'}') {
            if close > 0 {
                return &key[open + 1..open + 1 + close];
            }
        }
    }
    key
}

/// Slot shared by every key, or `None` when the keys diverge (the caller
/// then fails with `CrossSlot`).
#[must_use]
pub fn slot_for_keys<'a, I>(keys: I) -> Option<Option<u16>>
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut slot = None;
    for key in keys {
        let s = key_slot(key);
        match slot {
            None => slot = Some(s),
            Some(prev) if prev != s => return None,
            Some(_) => {}
        }
    }
    Some(slot)
}

/// Immutable slot-to-node table; a refresh builds a new one and swaps it
/// in atomically.
///
/// Each slot maps to an ordered list of node keys, primary first.
#[derive(Debug, Clone, Default)]
pub struct SlotMap {
    slots: Vec<Vec<String>>,
    nodes: HashMap<String, NodeAddr>,
}

impl SlotMap {
    /// Empty map with no coverage.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: vec![Vec::new(); SLOT_COUNT as usize],
            nodes: HashMap::new(),
        }
    }

    /// Build from a `CLUSTER SLOTS` reply, rewriting announced addresses
    /// through the NAT map when one is configured.
    ///
    /// The reply is an array of ranges:
    /// `[start, end, [host, port, ...], [replica_host, replica_port, ...]*]`.
    pub fn from_cluster_slots(reply: &Reply, nat: Option<&NatMap>) -> RedisResult<Self> {
        let Reply::Array(ranges) = reply else {
            return Err(RedisError::Protocol(
                "CLUSTER SLOTS did not return an array".to_string(),
            ));
        };
        let mut map = Self::new();
        for range in ranges {
            let Reply::Array(fields) = range else {
                return Err(RedisError::Protocol(
                    "slot range is not an array".to_string(),
                ));
            };
            if fields.len() < 3 {
                return Err(RedisError::Protocol(
                    "slot range is missing its primary".to_string(),
                ));
            }
            let start = fields[0].as_int()?;
            let end = fields[1].as_int()?;
            if !(0..i64::from(SLOT_COUNT)).contains(&start) || end < start
                || end >= i64::from(SLOT_COUNT)
            {
                return Err(RedisError::Protocol(format!(
                    "slot range {start}-{end} out of bounds"
                )));
            }
            let mut keys = Vec::with_capacity(fields.len() - 2);
            for field in &fields[2..] {
                let addr = parse_slots_node(field)?;
                let addr = match nat {
                    Some(nat) => nat.translate(&addr),
                    None => addr,
                };
                let key = addr.key();
                map.nodes.entry(key.clone()).or_insert(addr);
                keys.push(key);
            }
            for slot in start..=end {
                map.slots[slot as usize] = keys.clone();
            }
        }
        Ok(map)
    }

    /// Node key of the primary for a slot.
    #[must_use]
    pub fn primary_of(&self, slot: u16) -> Option<&str> {
        self.slots
            .get(slot as usize)
            .and_then(|keys| keys.first())
            .map(String::as_str)
    }

    /// Node keys of the replicas for a slot.
    #[must_use]
    pub fn replicas_of(&self, slot: u16) -> &[String] {
        self.slots
            .get(slot as usize)
            .map_or(&[], |keys| keys.get(1..).unwrap_or(&[]))
    }

    /// Address behind a node key.
    #[must_use]
    pub fn addr_of(&self, key: &str) -> Option<&NodeAddr> {
        self.nodes.get(key)
    }

    /// Every known node key, primaries and replicas.
    #[must_use]
    pub fn node_keys(&self) -> BTreeSet<String> {
        self.nodes.keys().cloned().collect()
    }

    /// Keys of the primaries only.
    #[must_use]
    pub fn primary_keys(&self) -> BTreeSet<String> {
        self.slots
            .iter()
            .filter_map(|keys| keys.first().cloned())
            .collect()
    }

    /// True when no slot has an owner.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Copy of the map with one slot re-pointed at `addr`, as learned
    /// from a MOVED redirection. The full refresh follows asynchronously.
    #[must_use]
    pub fn with_moved(&self, slot: u16, addr: &NodeAddr) -> Self {
        let mut map = self.clone();
        let key = addr.key();
        map.nodes.entry(key.clone()).or_insert_with(|| addr.clone());
        if let Some(entry) = map.slots.get_mut(slot as usize) {
            *entry = vec![key];
        }
        map
    }
}

fn parse_slots_node(field: &Reply) -> RedisResult<NodeAddr> {
    let Reply::Array(parts) = field else {
        return Err(RedisError::Protocol(
            "slot node entry is not an array".to_string(),
        ));
    };
    if parts.len() < 2 {
        return Err(RedisError::Protocol(
            "slot node entry is missing host or port".to_string(),
        ));
    }
    let host = parts[0]
        .as_str()
        .map_err(|_| RedisError::Protocol("slot node host is not a string".to_string()))?;
    let port = parts[1].as_int()?;
    let port = u16::try_from(port)
        .map_err(|_| RedisError::Protocol(format!("slot node port {port} out of range")))?;
    Ok(NodeAddr::new(host, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(host: &str, port: i64) -> Reply {
        Reply::Array(vec![
            Reply::bulk(host.to_string()),
            Reply::Integer(port),
            Reply::bulk("0123456789abcdef0123456789abcdef01234567"),
        ])
    }

    fn two_node_reply() -> Reply {
        Reply::Array(vec![
            Reply::Array(vec![
                Reply::Integer(0),
                Reply::Integer(8191),
                node("10.0.0.1", 7000),
                node("10.0.0.2", 7001),
            ]),
            Reply::Array(vec![
                Reply::Integer(8192),
                Reply::Integer(16383),
                node("10.0.0.3", 7002),
            ]),
        ])
    }

    #[test]
    fn known_slot_vectors() {
        // Vector from the cluster specification.
        assert_eq!(key_slot(b"123456789"), 12739);
        assert!(key_slot(b"anything") < SLOT_COUNT);
    }

    #[test]
    fn hash_tags_restrict_hashing() {
        assert_eq!(key_slot(b"{user1000}.following"), key_slot(b"{user1000}.followers"));
        assert_eq!(key_slot(b"{user1000}.x"), key_slot(b"user1000"));
        // Empty tag is ignored, first tag wins.
        assert_eq!(hash_tag(b"foo{}{bar}"), b"foo{}{bar}");
        assert_eq!(hash_tag(b"a{b}{c}"), b"b");
        assert_eq!(hash_tag(b"no-tag"), b"no-tag");
        assert_eq!(hash_tag(b"open{only"), b"open{only");
    }

    #[test]
    fn slot_for_keys_detects_divergence() {
        let same: Vec<&[u8]> = vec![b"{u}:a", b"{u}:b"];
        assert_eq!(slot_for_keys(same), Some(Some(key_slot(b"u"))));

        let none: Vec<&[u8]> = vec![];
        assert_eq!(slot_for_keys(none), Some(None));

        let diverging: Vec<&[u8]> = vec![b"foo", b"bar"];
        assert_eq!(slot_for_keys(diverging), None);
    }

    #[test]
    fn builds_from_cluster_slots() {
        let map = SlotMap::from_cluster_slots(&two_node_reply(), None).unwrap();
        assert_eq!(map.primary_of(0), Some("10.0.0.1:7000"));
        assert_eq!(map.primary_of(8191), Some("10.0.0.1:7000"));
        assert_eq!(map.replicas_of(100), ["10.0.0.2:7001".to_string()]);
        assert_eq!(map.primary_of(8192), Some("10.0.0.3:7002"));
        assert!(map.replicas_of(9000).is_empty());
        assert_eq!(map.node_keys().len(), 3);
        assert_eq!(map.primary_keys().len(), 2);
        assert_eq!(
            map.addr_of("10.0.0.3:7002"),
            Some(&NodeAddr::new("10.0.0.3", 7002))
        );
    }

    #[test]
    fn nat_rewrites_announced_addresses() {
        let mut nat = NatMap::new();
        nat.insert("10.0.0.1:7000", NodeAddr::new("127.0.0.1", 17000));
        let map = SlotMap::from_cluster_slots(&two_node_reply(), Some(&nat)).unwrap();
        assert_eq!(map.primary_of(0), Some("127.0.0.1:17000"));
    }

    #[test]
    fn rejects_malformed_ranges() {
        let bad = Reply::Array(vec![Reply::Array(vec![
            Reply::Integer(10),
            Reply::Integer(5),
            node("a", 1),
        ])]);
        assert!(SlotMap::from_cluster_slots(&bad, None).is_err());

        let not_array = Reply::Simple("OK".to_string());
        assert!(SlotMap::from_cluster_slots(&not_array, None).is_err());
    }

    #[test]
    fn moved_patches_one_slot() {
        let map = SlotMap::from_cluster_slots(&two_node_reply(), None).unwrap();
        let patched = map.with_moved(100, &NodeAddr::new("10.0.0.9", 7009));
        assert_eq!(patched.primary_of(100), Some("10.0.0.9:7009"));
        // Neighbouring slots and the original map are untouched.
        assert_eq!(patched.primary_of(101), Some("10.0.0.1:7000"));
        assert_eq!(map.primary_of(100), Some("10.0.0.1:7000"));
    }
}
