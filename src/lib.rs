//! Async client for RESP key-value servers.
//!
//! - [`resp`]: binary-safe command encoder and reply decoder.
//! - [`connection`]: a socket plus read buffer that keeps count of owed
//!   replies, and the providers that hand connections out.
//! - [`client`]: single-connection client, `MULTI` / `EXEC` transactions and
//!   pipelines.
//! - [`sharding`] and [`sharded`]: consistent-hash ring and the client that
//!   routes by key over it.
//! - [`pubsub`]: subscription loop dispatching messages to listeners.
//!
//! ```no_run
//! # async fn demo() -> redshard::Result<()> {
//! let mut client = redshard::Client::from_url("redis://127.0.0.1:6379")?;
//! let mut tx = client.multi().await?;
//! tx.set("a", "1").await?;
//! tx.incr("a").await?;
//! let results = tx.exec().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod pubsub;
pub mod resp;
pub mod sharded;
pub mod sharding;

#[cfg(any(test, feature = "test-util"))]
#[doc(hidden)]
pub mod testing;

pub use client::{Client, Pipeline, Queued, Transaction, TransactionState};
pub use config::{ConnectionConfig, ShardedConfig, DEFAULT_PORT, DEFAULT_TIMEOUT_MS};
pub use connection::{Connection, ConnectionPool, ConnectionProvider, PooledConnection};
pub use error::{RedshardError, Result, ServerErrorKind};
pub use pubsub::{ListenerRegistry, Message, Subscriber, SubscriberHandle};
pub use resp::{Command, Reply};
pub use sharded::{ShardedClient, ShardedPipeline};
pub use sharding::{Hashing, ShardRing, TagPattern};
