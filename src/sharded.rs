//! Client over a consistent-hash ring of servers.
//!
//! Every key is served by exactly one shard. Each shard has its own
//! [`ConnectionPool`]; commands for a key borrow a connection from the pool
//! of the shard that owns it.

use crate::client::run_pipeline;
use crate::config::ShardedConfig;
use crate::connection::pool::ConnectionPool;
use crate::error::{RedshardError, Result};
use crate::resp::command::Command;
use crate::resp::types::Reply;
use crate::sharding::{ShardNode, ShardRing};

use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;

pub type Shard = ShardNode<ConnectionPool>;

/// Client routing each command by key.
#[derive(Debug)]
pub struct ShardedClient {
    ring: ShardRing<ConnectionPool>,
}

impl ShardedClient {
    pub fn new(config: ShardedConfig) -> Result<Self> {
        let nodes = config
            .shards
            .into_iter()
            .map(|spec| ShardNode::new(spec.id, spec.weight, ConnectionPool::new(spec.config)))
            .collect::<Result<Vec<_>>>()?;
        let ring = ShardRing::new(nodes, config.hashing, config.tag_pattern)?;
        Ok(Self { ring })
    }

    /// Client for a `redis+shards://` URL.
    pub fn from_url(url: &str) -> Result<Self> {
        Self::new(ShardedConfig::from_url(url)?)
    }

    /// The ring, for inspecting or changing the node set.
    pub fn ring(&self) -> &ShardRing<ConnectionPool> {
        &self.ring
    }

    /// The shard that owns `key`.
    pub fn shard_for(&self, key: impl AsRef<[u8]>) -> Result<Arc<Shard>> {
        self.ring.get_node(key.as_ref())
    }

    /// Run `cmd` on the shard owning `key`.
    pub async fn execute(&self, key: impl AsRef<[u8]>, cmd: &Command) -> Result<Reply> {
        let shard = self.shard_for(key)?;
        let mut conn = shard.provider().get().await?;
        conn.send_command(cmd).await?;
        conn.read_reply().await
    }

    /// Run `cmd` on the shard owning its first argument.
    pub async fn execute_command(&self, cmd: &Command) -> Result<Reply> {
        let key = cmd.first_key().ok_or_else(|| {
            RedshardError::Usage(format!(
                "{} has no key to route by",
                String::from_utf8_lossy(cmd.verb())
            ))
        })?;
        self.execute(key, cmd).await
    }

    pub async fn set(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Result<()> {
        let key = key.as_ref();
        match self.execute(key, &Command::new("SET").arg(key).arg(value)).await? {
            Reply::Status(_) => Ok(()),
            other => Err(RedshardError::Type(format!(
                "expected status reply, got {}",
                other.type_name()
            ))),
        }
    }

    pub async fn get(&self, key: impl AsRef<[u8]>) -> Result<Option<Bytes>> {
        let key = key.as_ref();
        match self.execute(key, &Command::new("GET").arg(key)).await? {
            Reply::Bulk(b) => Ok(b),
            other => Err(RedshardError::Type(format!(
                "expected bulk reply, got {}",
                other.type_name()
            ))),
        }
    }

    /// Run a pipeline across shards.
    ///
    /// Commands are grouped by shard using one view of the ring; each group
    /// goes out as a single write. Replies come back in the order the
    /// commands were added.
    pub async fn pipeline(&self, pipeline: &ShardedPipeline) -> Result<Vec<Reply>> {
        if pipeline.is_empty() {
            return Ok(Vec::new());
        }
        let ring = self.ring.snapshot();

        let mut groups: BTreeMap<usize, (Vec<usize>, Vec<Command>)> = BTreeMap::new();
        for (pos, (key, cmd)) in pipeline.entries.iter().enumerate() {
            let (positions, commands) = groups.entry(ring.node_index(key)?).or_default();
            positions.push(pos);
            commands.push(cmd.clone());
        }

        let mut slots: Vec<Option<Reply>> = vec![None; pipeline.len()];
        for (node, (positions, commands)) in groups {
            let shard = &ring.nodes()[node];
            tracing::trace!(shard = shard.id(), commands = commands.len(), "sharded pipeline group");
            let mut conn = shard.provider().get().await?;
            let (replies, open) = run_pipeline(&mut conn, &commands).await?;
            if open {
                // Never hand a connection stuck in MULTI back to the pool.
                conn.close();
            }
            for (pos, reply) in positions.into_iter().zip(replies) {
                slots[pos] = Some(reply);
            }
        }

        slots
            .into_iter()
            .enumerate()
            .map(|(pos, slot)| {
                slot.ok_or(RedshardError::QueueMismatch {
                    expected: pipeline.len(),
                    actual: pos,
                })
            })
            .collect()
    }
}

/// Keyed commands for [`ShardedClient::pipeline`].
#[derive(Debug, Clone, Default)]
pub struct ShardedPipeline {
    entries: Vec<(Bytes, Command)>,
}

impl ShardedPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `cmd`, routed by `key`.
    pub fn add(&mut self, key: impl AsRef<[u8]>, cmd: Command) -> &mut Self {
        self.entries
            .push((Bytes::copy_from_slice(key.as_ref()), cmd));
        self
    }

    pub fn set(&mut self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> &mut Self {
        let key = key.as_ref();
        self.add(key, Command::new("SET").arg(key).arg(value))
    }

    pub fn get(&mut self, key: impl AsRef<[u8]>) -> &mut Self {
        let key = key.as_ref();
        self.add(key, Command::new("GET").arg(key))
    }

    pub fn incr(&mut self, key: impl AsRef<[u8]>) -> &mut Self {
        let key = key.as_ref();
        self.add(key, Command::new("INCR").arg(key))
    }

    pub fn del(&mut self, key: impl AsRef<[u8]>) -> &mut Self {
        let key = key.as_ref();
        self.add(key, Command::new("DEL").arg(key))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ── Tests ──────────────────────────────────────────────────────────
