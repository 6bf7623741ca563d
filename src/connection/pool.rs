//! Connection providers.
//!
//! [`ConnectionProvider`] is the seam between the protocol layer and whatever
//! hands out connections. [`PooledConnection`] borrows a connection from a
//! provider and gives it back when dropped. [`ConnectionPool`] is the default
//! provider: a semaphore bounds the number of connections checked out and a
//! deque keeps idle ones for reuse. The idle queue uses `parking_lot::Mutex`
//! (sync, held very briefly) so connections can be returned in `Drop`
//! without needing async.

use crate::config::ConnectionConfig;
use crate::connection::tcp::Connection;
use crate::error::{RedshardError, Result};

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::time::Duration;
use tokio::sync::Semaphore;

/// Source of connections to one server.
pub trait ConnectionProvider: Send + Sync {
    /// Hand out a connected connection.
    fn acquire(&self) -> impl Future<Output = Result<Connection>> + Send;

    /// Take back a healthy connection.
    fn release(&self, conn: Connection);

    /// Take back a connection that must not be reused.
    fn invalidate(&self, conn: Connection);

    /// A borrower kept its connection for good; free the slot it held.
    fn forget(&self);
}

/// A connection on loan from a provider.
///
/// Dropping it releases the connection, or invalidates it when it is broken.
pub struct PooledConnection<'a, P: ConnectionProvider> {
    conn: Option<Connection>,
    provider: &'a P,
}

impl<'a, P: ConnectionProvider> PooledConnection<'a, P> {
    pub async fn acquire(provider: &'a P) -> Result<Self> {
        let conn = provider.acquire().await?;
        Ok(Self {
            conn: Some(conn),
            provider,
        })
    }

    /// Take the connection out; it will not go back to the provider.
    pub fn detach(mut self) -> Connection {
        let conn = self.conn.take().expect("connection already taken");
        self.provider.forget();
        conn
    }
}

impl<P: ConnectionProvider> Deref for PooledConnection<'_, P> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection already taken")
    }
}

impl<P: ConnectionProvider> DerefMut for PooledConnection<'_, P> {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection already taken")
    }
}

impl<P: ConnectionProvider> Drop for PooledConnection<'_, P> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if conn.is_broken() {
                self.provider.invalidate(conn);
            } else {
                self.provider.release(conn);
            }
        }
    }
}

/// Bounded pool of connections to one server.
pub struct ConnectionPool {
    /// Idle connections ready for reuse (sync mutex, held very briefly).
    idle: Mutex<VecDeque<Connection>>,
    /// One permit per connection that may be checked out.
    semaphore: Semaphore,
    config: ConnectionConfig,
    max_size: usize,
    /// How long a connection can be idle before being dropped.
    idle_timeout: Duration,
}

impl ConnectionPool {
    pub fn new(config: ConnectionConfig) -> Self {
        let max_size = config.pool_size.max(1);
        let idle_timeout = Duration::from_millis(config.idle_timeout_ms);
        Self {
            idle: Mutex::new(VecDeque::with_capacity(max_size)),
            semaphore: Semaphore::new(max_size),
            config,
            max_size,
            idle_timeout,
        }
    }

    /// Borrow a connection until the returned guard is dropped.
    pub async fn get(&self) -> Result<PooledConnection<'_, Self>> {
        PooledConnection::acquire(self).await
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Number of currently idle connections.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Permits left (roughly `max_size` minus checked-out connections).
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    async fn create_connection(&self) -> Result<Connection> {
        let mut conn = Connection::new(self.config.clone());
        conn.connect().await?;
        Ok(conn)
    }

    /// Pop the most recently used idle connection that is still fresh.
    fn take_healthy_connection(&self) -> Option<Connection> {
        let mut idle = self.idle.lock();
        while let Some(conn) = idle.pop_back() {
            if conn.last_used.elapsed() > self.idle_timeout {
                tracing::trace!(addr = %self.config.addr(), "evicting stale connection");
                continue;
            }
            return Some(conn);
        }
        None
    }
}

impl ConnectionProvider for ConnectionPool {
    async fn acquire(&self) -> Result<Connection> {
        let permit = self.semaphore.acquire().await.map_err(|_| {
            RedshardError::Connection(std::io::Error::new(
                std::io::ErrorKind::Other,
                "pool semaphore closed",
            ))
        })?;

        let conn = match self.take_healthy_connection() {
            Some(conn) => conn,
            None => {
                let conn = self.create_connection().await?;
                tracing::debug!(addr = %self.config.addr(), "pool opened connection");
                conn
            }
        };
        // Given back explicitly by `release` / `invalidate` / `forget`.
        permit.forget();
        Ok(conn)
    }

    fn release(&self, mut conn: Connection) {
        // Unread replies would be handed to the next borrower.
        if conn.is_broken() || conn.pending() > 0 {
            self.invalidate(conn);
            return;
        }
        conn.rollback_timeout();
        if conn.last_used.elapsed() <= self.idle_timeout {
            let mut idle = self.idle.lock();
            if idle.len() < self.max_size {
                idle.push_back(conn);
            }
        }
        self.semaphore.add_permits(1);
    }

    fn invalidate(&self, conn: Connection) {
        tracing::debug!(
            addr = %self.config.addr(),
            broken = conn.is_broken(),
            pending = conn.pending(),
            "pool dropped connection"
        );
        drop(conn);
        self.semaphore.add_permits(1);
    }

    fn forget(&self) {
        tracing::debug!(addr = %self.config.addr(), "connection detached from pool");
        self.semaphore.add_permits(1);
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("addr", &self.config.addr())
            .field("max_size", &self.max_size)
            .field("available", &self.available())
            .finish()
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resp::command::Command;
    use crate::testing::{Action, MockServer};

    /// Answers every command with +OK, except `QUIT` which closes the socket.
    async fn ok_server() -> MockServer {
        MockServer::with_handler(|args| {
            if args.first().map(|a| &a[..]) == Some(&b"QUIT"[..]) {
                Action::Close
            } else {
                Action::Reply(b"+OK\r\n".to_vec())
            }
        })
        .await
    }

    fn test_config(server: &MockServer) -> ConnectionConfig {
        ConnectionConfig {
            pool_size: 3,
            connect_timeout_ms: 1000,
            idle_timeout_ms: 60_000,
            ..server.config()
        }
    }

    #[tokio::test]
    async fn pool_create_and_get() {
        let server = ok_server().await;
        let pool = ConnectionPool::new(test_config(&server));

        assert_eq!(pool.max_size(), 3);
        assert_eq!(pool.available(), 3);

        let mut conn = pool.get().await.unwrap();
        assert!(conn.is_connected());
        assert_eq!(pool.available(), 2);

        conn.send_command(&Command::new("PING")).await.unwrap();
        assert_eq!(conn.get_status_reply().await.unwrap(), "OK");

        drop(conn);
        assert_eq!(pool.available(), 3);
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn pool_reuses_connections() {
        let server = ok_server().await;
        let pool = ConnectionPool::new(test_config(&server));

        for _ in 0..5 {
            let mut conn = pool.get().await.unwrap();
            conn.send_command(&Command::new("PING")).await.unwrap();
            conn.read_reply().await.unwrap();
        }
        assert_eq!(pool.idle_count(), 1);
        assert_eq!(server.connections(), 1);
    }

    #[tokio::test]
    async fn pool_limits_connections() {
        let server = ok_server().await;
        let pool = ConnectionPool::new(test_config(&server));

        let g1 = pool.get().await.unwrap();
        let g2 = pool.get().await.unwrap();
        let g3 = pool.get().await.unwrap();
        assert_eq!(pool.available(), 0);

        let result = tokio::time::timeout(Duration::from_millis(50), pool.get()).await;
        assert!(result.is_err());

        drop(g1);
        assert_eq!(pool.available(), 1);
        let _g4 = pool.get().await.unwrap();

        drop(g2);
        drop(g3);
    }

    #[tokio::test]
    async fn detach_removes_from_pool() {
        let server = ok_server().await;
        let pool = ConnectionPool::new(test_config(&server));

        let first = pool.get().await.unwrap().detach();
        let second = pool.get().await.unwrap().detach();
        assert!(first.is_connected() && second.is_connected());
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.available(), 3);

        let result = tokio::time::timeout(Duration::from_millis(200), pool.get()).await;
        assert!(result.unwrap().is_ok());
        assert_eq!(server.connections(), 3);
    }

    #[tokio::test]
    async fn broken_connection_is_invalidated() {
        let server = ok_server().await;
        let pool = ConnectionPool::new(test_config(&server));

        {
            let mut conn = pool.get().await.unwrap();
            conn.send_command(&Command::new("QUIT")).await.unwrap();
            assert!(conn.read_reply().await.is_err());
            assert!(conn.is_broken());
        }
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.available(), 3);

        let mut conn = pool.get().await.unwrap();
        conn.send_command(&Command::new("PING")).await.unwrap();
        assert_eq!(conn.get_status_reply().await.unwrap(), "OK");
        assert_eq!(server.connections(), 2);
    }

    #[tokio::test]
    async fn unread_replies_are_not_reused() {
        let server = ok_server().await;
        let pool = ConnectionPool::new(test_config(&server));

        {
            let mut conn = pool.get().await.unwrap();
            conn.send_command(&Command::new("PING")).await.unwrap();
        }
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.available(), 3);
    }

    #[tokio::test]
    async fn pool_idle_timeout() {
        let server = ok_server().await;
        let mut config = test_config(&server);
        config.idle_timeout_ms = 50;
        let pool = ConnectionPool::new(config);

        drop(pool.get().await.unwrap());
        assert_eq!(pool.idle_count(), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut conn = pool.get().await.unwrap();
        conn.send_command(&Command::new("PING")).await.unwrap();
        conn.read_reply().await.unwrap();
        assert_eq!(server.connections(), 2);
    }

    #[tokio::test]
    async fn pool_connect_failure_returns_permit() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = ConnectionConfig {
            pool_size: 1,
            connect_timeout_ms: 100,
            ..ConnectionConfig::new("127.0.0.1", port)
        };
        let pool = ConnectionPool::new(config);
        assert!(pool.get().await.is_err());
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn cancelled_acquire_returns_permit() {
        // Never answers AUTH, so the handshake stalls.
        let server = MockServer::with_handler(|_| Action::Silent).await;
        let config = ConnectionConfig {
            pool_size: 1,
            password: Some("secret".into()),
            ..server.config()
        };
        let pool = ConnectionPool::new(config);

        let result = tokio::time::timeout(Duration::from_millis(100), pool.get()).await;
        assert!(result.is_err());
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.idle_count(), 0);
    }
}
