//! Consistent-hash ring mapping window keys to the shard node that owns them.
//!
//! Each node occupies `virtual_nodes` positions on a 64-bit ring; a key belongs to the first
//! position at or clockwise after its hash. Adding or removing a node moves only the keys in the
//! arcs it gains or loses, about `1/node_count` of all keys.
//!
//! Routing is a pure function of the current snapshot and the key. Topology changes build a new
//! immutable [`RingSnapshot`] and swap it in, so concurrent `route` calls see the old ring or the
//! new one, never a partial one. Hashes are FNV-1a with a 64-bit finalizer mix, stable across
//! processes and releases, so every process sharing a store routes a key identically.

use crate::adaptive::DynamicConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// Identifier of a shard node (for example `"redis-2:6379"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stable 64-bit hash: FNV-1a over the bytes, then a murmur3-style finalizer so that keys
/// differing only in a trailing digit still land far apart on the ring.
pub fn stable_hash(bytes: &[u8]) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        h ^= u64::from(b);
        h = h.wrapping_mul(0x0000_0100_0000_01b3);
    }
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    h ^= h >> 33;
    h
}

fn position_hash(node: &NodeId, replica: u32) -> u64 {
    stable_hash(format!("{}#{}", node.as_str(), replica).as_bytes())
}

/// Immutable ring built from one node set.
#[derive(Debug, Clone, Default)]
pub struct RingSnapshot {
    points: Vec<(u64, NodeId)>,
    nodes: BTreeSet<NodeId>,
}

impl RingSnapshot {
    /// Build the ring for `nodes` with `virtual_nodes` positions each.
    pub fn build<I>(nodes: I, virtual_nodes: u32) -> Self
    where
        I: IntoIterator<Item = NodeId>,
    {
        let nodes: BTreeSet<NodeId> = nodes.into_iter().collect();
        let mut points = Vec::with_capacity(nodes.len() * virtual_nodes as usize);
        for node in &nodes {
            for replica in 0..virtual_nodes {
                points.push((position_hash(node, replica), node.clone()));
            }
        }
        // Ties broken by node id so the ring is identical regardless of insertion order.
        points.sort();
        Self { points, nodes }
    }

    /// Node owning `hash`: first position at or after it, wrapping to the start.
    pub fn owner_of(&self, hash: u64) -> Option<&NodeId> {
        if self.points.is_empty() {
            return None;
        }
        let idx = self.points.partition_point(|(h, _)| *h < hash);
        let idx = if idx >= self.points.len() { 0 } else { idx };
        Some(&self.points[idx].1)
    }

    /// Nodes on the ring, sorted.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.iter()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.nodes.contains(node)
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Routes storage keys to shard nodes; safe to share across tasks.
#[derive(Debug, Clone)]
pub struct ShardRouter {
    ring: DynamicConfig<RingSnapshot>,
    virtual_nodes: u32,
}

impl ShardRouter {
    /// Router over `nodes` with `virtual_nodes` ring positions per node (at least one).
    pub fn new<I>(nodes: I, virtual_nodes: u32) -> Self
    where
        I: IntoIterator<Item = NodeId>,
    {
        let virtual_nodes = virtual_nodes.max(1);
        Self { ring: DynamicConfig::new(RingSnapshot::build(nodes, virtual_nodes)), virtual_nodes }
    }

    /// Owner of `storage_key`, or `None` for an empty ring. Never blocks.
    pub fn route(&self, storage_key: &str) -> Option<NodeId> {
        self.ring.get().owner_of(stable_hash(storage_key.as_bytes())).cloned()
    }

    /// Current ring snapshot.
    pub fn snapshot(&self) -> Arc<RingSnapshot> {
        self.ring.get()
    }

    /// Add a node. Returns `false` when it was already present.
    pub fn add_node(&self, node: NodeId) -> bool {
        let mut added = false;
        self.ring.update(|ring| {
            added = !ring.contains(&node);
            RingSnapshot::build(ring.nodes().cloned().chain(std::iter::once(node.clone())), self.virtual_nodes)
        });
        if added {
            tracing::info!(node = %node, "shard node joined ring");
        }
        added
    }

    /// Remove a node; its keys fall to the next node clockwise. Returns `false` when absent.
    pub fn remove_node(&self, node: &NodeId) -> bool {
        let mut removed = false;
        self.ring.update(|ring| {
            removed = ring.contains(node);
            RingSnapshot::build(ring.nodes().filter(|n| *n != node).cloned(), self.virtual_nodes)
        });
        if removed {
            tracing::info!(node = %node, "shard node left ring");
        }
        removed
    }

    pub fn virtual_nodes(&self) -> u32 {
        self.virtual_nodes
    }
}
