//! Consistent hash ring over a fixed set of shard nodes.
//!
//! Every node owns `160 * weight` points. A key is served by the node owning
//! the first point at or after the key's hash, wrapping around to the
//! smallest point. Any change (nodes, weights, hashing, tag pattern) builds
//! a brand-new ring which is then swapped in, so concurrent lookups see
//! either the old ring or the new one and never a partial one.

use crate::error::{RedshardError, Result};
use crate::sharding::hashing::Hashing;
use crate::sharding::tag::TagPattern;

use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// Ring points per unit of weight.
pub const POINTS_PER_WEIGHT: usize = 160;

/// One shard: identity, weight and whatever hands out its connections.
#[derive(Debug)]
pub struct ShardNode<P> {
    id: String,
    weight: u32,
    provider: P,
}

impl<P> ShardNode<P> {
    /// Weight must be at least 1.
    pub fn new(id: impl Into<String>, weight: u32, provider: P) -> Result<Self> {
        let id = id.into();
        if weight == 0 {
            return Err(RedshardError::Config(format!("shard {id} has weight 0")));
        }
        Ok(Self {
            id,
            weight,
            provider,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }
}

/// An immutable, fully built ring.
#[derive(Debug)]
pub struct RingSnapshot<P> {
    nodes: Vec<Arc<ShardNode<P>>>,
    points: BTreeMap<u64, usize>,
    hashing: Hashing,
    tag_pattern: Option<TagPattern>,
}

impl<P> RingSnapshot<P> {
    fn build(
        nodes: Vec<Arc<ShardNode<P>>>,
        hashing: Hashing,
        tag_pattern: Option<TagPattern>,
    ) -> Result<Self> {
        let mut seen = HashSet::with_capacity(nodes.len());
        for node in &nodes {
            if !seen.insert(node.id.as_str()) {
                return Err(RedshardError::Config(format!(
                    "duplicate shard id: {}",
                    node.id
                )));
            }
        }

        let mut points = BTreeMap::new();
        for (idx, node) in nodes.iter().enumerate() {
            let replicas = POINTS_PER_WEIGHT * node.weight as usize;
            for replica in 0..replicas {
                let label = format!("{}{}", node.id, replica);
                // On a collision the later node takes the point.
                points.insert(hashing.hash(label.as_bytes()), idx);
            }
        }

        tracing::debug!(
            nodes = nodes.len(),
            points = points.len(),
            ?hashing,
            "built shard ring"
        );

        Ok(Self {
            nodes,
            points,
            hashing,
            tag_pattern,
        })
    }

    /// The bytes of `key` that are hashed.
    pub fn key_tag<'a>(&self, key: &'a [u8]) -> &'a [u8] {
        match &self.tag_pattern {
            Some(pattern) => pattern.extract(key),
            None => key,
        }
    }

    /// Index (into [`RingSnapshot::nodes`]) of the node serving `key`.
    pub fn node_index(&self, key: &[u8]) -> Result<usize> {
        let hash = self.hashing.hash(self.key_tag(key));
        self.points
            .range(hash..)
            .next()
            .or_else(|| self.points.iter().next())
            .map(|(_, &idx)| idx)
            .ok_or_else(|| RedshardError::Sharding("shard ring is empty".into()))
    }

    /// The node serving `key`.
    pub fn get_node(&self, key: &[u8]) -> Result<Arc<ShardNode<P>>> {
        let idx = self.node_index(key)?;
        Ok(Arc::clone(&self.nodes[idx]))
    }

    pub fn nodes(&self) -> &[Arc<ShardNode<P>>] {
        &self.nodes
    }

    pub fn point_count(&self) -> usize {
        self.points.len()
    }

    pub fn hashing(&self) -> Hashing {
        self.hashing
    }

    pub fn tag_pattern(&self) -> Option<TagPattern> {
        self.tag_pattern
    }
}

/// Shared, swappable ring.
pub struct ShardRing<P> {
    current: RwLock<Arc<RingSnapshot<P>>>,
}

impl<P> ShardRing<P> {
    pub fn new(
        nodes: Vec<ShardNode<P>>,
        hashing: Hashing,
        tag_pattern: Option<TagPattern>,
    ) -> Result<Self> {
        let nodes = nodes.into_iter().map(Arc::new).collect();
        let snapshot = RingSnapshot::build(nodes, hashing, tag_pattern)?;
        Ok(Self {
            current: RwLock::new(Arc::new(snapshot)),
        })
    }

    /// The ring as of now. Later rebuilds do not affect it.
    pub fn snapshot(&self) -> Arc<RingSnapshot<P>> {
        Arc::clone(&self.current.read())
    }

    /// The node serving `key`.
    pub fn get_node(&self, key: &[u8]) -> Result<Arc<ShardNode<P>>> {
        self.snapshot().get_node(key)
    }

    pub fn nodes(&self) -> Vec<Arc<ShardNode<P>>> {
        self.snapshot().nodes.clone()
    }

    pub fn hashing(&self) -> Hashing {
        self.snapshot().hashing
    }

    pub fn tag_pattern(&self) -> Option<TagPattern> {
        self.snapshot().tag_pattern
    }

    /// Replace the whole node set.
    pub fn set_nodes(&self, nodes: Vec<ShardNode<P>>) -> Result<()> {
        let nodes: Vec<_> = nodes.into_iter().map(Arc::new).collect();
        self.rebuild(|cur| Ok((nodes, cur.hashing, cur.tag_pattern)))
    }

    pub fn add_node(&self, node: ShardNode<P>) -> Result<()> {
        let node = Arc::new(node);
        self.rebuild(|cur| {
            let mut nodes = cur.nodes.clone();
            nodes.push(node);
            Ok((nodes, cur.hashing, cur.tag_pattern))
        })
    }

    /// Remove the node with `id`, returning it if it was present.
    pub fn remove_node(&self, id: &str) -> Result<Option<Arc<ShardNode<P>>>> {
        let mut removed = None;
        self.rebuild(|cur| {
            let mut nodes = cur.nodes.clone();
            if let Some(pos) = nodes.iter().position(|n| n.id == id) {
                removed = Some(nodes.remove(pos));
            }
            Ok((nodes, cur.hashing, cur.tag_pattern))
        })?;
        Ok(removed)
    }

    pub fn set_hashing(&self, hashing: Hashing) -> Result<()> {
        self.rebuild(|cur| Ok((cur.nodes.clone(), hashing, cur.tag_pattern)))
    }

    pub fn set_tag_pattern(&self, tag_pattern: Option<TagPattern>) -> Result<()> {
        self.rebuild(|cur| Ok((cur.nodes.clone(), cur.hashing, tag_pattern)))
    }

    /// Build a new ring from the current one and swap it in.
    ///
    /// Concurrent rebuilds are serialized by the upgradable read; lookups
    /// keep running against the old ring until the swap.
    fn rebuild<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(
            &RingSnapshot<P>,
        ) -> Result<(Vec<Arc<ShardNode<P>>>, Hashing, Option<TagPattern>)>,
    {
        let guard = self.current.upgradable_read();
        let (nodes, hashing, tag_pattern) = f(&guard)?;
        let next = Arc::new(RingSnapshot::build(nodes, hashing, tag_pattern)?);
        let mut write = RwLockUpgradableReadGuard::upgrade(guard);
        *write = next;
        Ok(())
    }
}

impl<P> std::fmt::Debug for ShardRing<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snap = self.snapshot();
        f.debug_struct("ShardRing")
            .field("nodes", &snap.nodes.iter().map(|n| n.id.as_str()).collect::<Vec<_>>())
            .field("points", &snap.points.len())
            .field("hashing", &snap.hashing)
            .finish()
    }
}

// ── Tests ──────────────────────────────────────────────────────────
