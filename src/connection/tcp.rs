//! Async TCP connection to a server.
//!
//! Wraps a `tokio::net::TcpStream` with an integrated read buffer and the
//! RESP parser, and keeps count of the replies the server still owes us.
//! The socket is opened lazily by the first write.

use crate::config::ConnectionConfig;
use crate::error::{RedshardError, Result};
use crate::resp::command::Command;
use crate::resp::parser::{into_result, parse};
use crate::resp::types::Reply;
use crate::resp::writer::{encode_command, encode_pipeline};

use bytes::{Bytes, BytesMut};
use std::ops::{Deref, DerefMut};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Default initial read buffer capacity (64 KB).
const DEFAULT_BUF_CAPACITY: usize = 64 * 1024;

/// A single connection to one server.
pub struct Connection {
    config: ConnectionConfig,
    stream: Option<TcpStream>,
    /// Bytes read from the socket but not yet consumed by the parser.
    buf: BytesMut,
    /// Commands written whose replies have not been read yet.
    pending: usize,
    /// `None` waits forever.
    read_timeout: Option<Duration>,
    /// Timeout saved by `set_timeout_infinite`.
    saved_timeout: Option<Option<Duration>>,
    broken: bool,
    /// Timestamp of last successful I/O (for idle checks).
    pub last_used: Instant,
}

impl Connection {
    /// Create an unconnected connection. Nothing touches the network yet.
    pub fn new(config: ConnectionConfig) -> Self {
        let read_timeout = match config.read_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };
        Self {
            config,
            stream: None,
            buf: BytesMut::new(),
            pending: 0,
            read_timeout,
            saved_timeout: None,
            broken: false,
            last_used: Instant::now(),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Open the socket and run the AUTH / SELECT handshake.
    ///
    /// Does nothing when already connected.
    pub async fn connect(&mut self) -> Result<()> {
        self.check_usable()?;
        if self.stream.is_some() {
            return Ok(());
        }

        let addr = self.config.addr();
        let limit = Duration::from_millis(self.config.connect_timeout_ms);
        let stream = match tokio::time::timeout(limit, TcpStream::connect(&addr)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(RedshardError::Timeout(format!(
                    "connection to {addr} timed out after {limit:?}"
                )))
            }
        };
        stream.set_nodelay(true).ok(); // Disable Nagle for low latency
        self.stream = Some(stream);
        self.buf = BytesMut::with_capacity(DEFAULT_BUF_CAPACITY);
        self.pending = 0;
        self.last_used = Instant::now();
        tracing::debug!(%addr, "connected");

        if let Err(e) = self.handshake().await {
            tracing::debug!(%addr, error = %e, "handshake failed");
            self.close();
            return Err(e);
        }
        Ok(())
    }

    async fn handshake(&mut self) -> Result<()> {
        if let Some(password) = self.config.password.clone() {
            let cmd = match self.config.username.clone() {
                Some(user) => Command::new("AUTH").arg(user).arg(password),
                None => Command::new("AUTH").arg(password),
            };
            self.write_raw(&encode_command(&cmd)).await?;
            self.pending += 1;
            self.expect_ok("AUTH").await?;
        }
        if self.config.db != 0 {
            let cmd = Command::new("SELECT").arg_int(self.config.db as i64);
            self.write_raw(&encode_command(&cmd)).await?;
            self.pending += 1;
            self.expect_ok("SELECT").await?;
        }
        Ok(())
    }

    async fn expect_ok(&mut self, what: &str) -> Result<()> {
        let status = self.get_status_reply().await?;
        if status != "OK" {
            return Err(RedshardError::Protocol(format!(
                "unexpected {what} reply: {status}"
            )));
        }
        Ok(())
    }

    // ── Writing ────────────────────────────────────────────────────

    /// Write one command. Its reply is owed until read.
    pub async fn send_command(&mut self, cmd: &Command) -> Result<()> {
        self.write(&encode_command(cmd)).await?;
        self.pending += 1;
        Ok(())
    }

    /// Write every command in a single write.
    pub async fn send_pipeline(&mut self, commands: &[Command]) -> Result<()> {
        if commands.is_empty() {
            return Ok(());
        }
        self.write(&encode_pipeline(commands)).await?;
        self.pending += commands.len();
        Ok(())
    }

    /// Write commands without expecting replies for them.
    ///
    /// On a subscribed connection the server answers with push messages
    /// instead of replies; those are read with [`Connection::read_push`].
    pub(crate) async fn send_untracked(&mut self, commands: &[Command]) -> Result<()> {
        self.write(&encode_pipeline(commands)).await
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.connect().await?;
        self.write_raw(data).await
    }

    async fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        let result = match self.stream.as_mut() {
            Some(stream) => stream.write_all(data).await.map_err(RedshardError::from),
            None => Err(not_connected()),
        };
        match result {
            Ok(()) => {
                self.last_used = Instant::now();
                Ok(())
            }
            Err(e) => {
                self.mark_broken(&e);
                Err(e)
            }
        }
    }

    // ── Reading ────────────────────────────────────────────────────

    /// Read one reply of any shape.
    ///
    /// A top-level error reply is returned as [`RedshardError::Server`];
    /// the connection stays usable.
    pub async fn read_reply(&mut self) -> Result<Reply> {
        let reply = self.read_tracked().await?;
        into_result(reply)
    }

    /// Read a status reply (`+OK`).
    pub async fn get_status_reply(&mut self) -> Result<String> {
        match self.read_reply().await? {
            Reply::Status(s) => Ok(s),
            other => Err(unexpected("status", &other)),
        }
    }

    /// Read an integer reply.
    pub async fn get_integer_reply(&mut self) -> Result<i64> {
        match self.read_reply().await? {
            Reply::Integer(n) => Ok(n),
            other => Err(unexpected("integer", &other)),
        }
    }

    /// Read a bulk reply; `None` for nil.
    pub async fn get_bulk_reply(&mut self) -> Result<Option<Bytes>> {
        match self.read_reply().await? {
            Reply::Bulk(b) => Ok(b),
            other => Err(unexpected("bulk", &other)),
        }
    }

    /// Read a multi-bulk reply; `None` for nil.
    pub async fn get_multi_bulk_reply(&mut self) -> Result<Option<Vec<Reply>>> {
        match self.read_reply().await? {
            Reply::MultiBulk(items) => Ok(items),
            other => Err(unexpected("multi_bulk", &other)),
        }
    }

    /// Drain every owed reply in the order the commands were sent.
    ///
    /// Error replies stay in place as [`Reply::Error`] so the result lines up
    /// with the commands.
    pub async fn get_all(&mut self) -> Result<Vec<Reply>> {
        let expected = self.pending;
        let mut replies = Vec::with_capacity(expected);
        while self.pending > 0 {
            replies.push(self.read_tracked().await?);
        }
        // Buffered bytes with nothing owed: the server answered more than asked.
        if !self.buf.is_empty() {
            let err = RedshardError::QueueMismatch {
                expected,
                actual: expected + 1,
            };
            self.mark_broken(&err);
            return Err(err);
        }
        Ok(replies)
    }

    /// Read one push message on a subscribed connection.
    pub(crate) async fn read_push(&mut self) -> Result<Reply> {
        let reply = self.read_frame().await?;
        into_result(reply)
    }

    async fn read_tracked(&mut self) -> Result<Reply> {
        if self.pending == 0 {
            return Err(RedshardError::QueueMismatch {
                expected: 0,
                actual: 1,
            });
        }
        let reply = self.read_frame().await?;
        self.pending -= 1;
        Ok(reply)
    }

    /// Read one complete frame. Cancel-safe: no buffered byte is lost when
    /// the future is dropped.
    async fn read_frame(&mut self) -> Result<Reply> {
        match self.read_frame_inner().await {
            Err(e) if e.is_fatal() => {
                self.mark_broken(&e);
                Err(e)
            }
            other => other,
        }
    }

    async fn read_frame_inner(&mut self) -> Result<Reply> {
        self.check_usable()?;
        loop {
            if !self.buf.is_empty() {
                // Freeze a view of the buffer so bulk payloads are sliced, not
                // copied. Unconsumed bytes go back into the buffer.
                let snapshot = self.buf.split().freeze();
                match parse(&snapshot) {
                    Ok((reply, consumed)) => {
                        if consumed < snapshot.len() {
                            self.buf.extend_from_slice(&snapshot[consumed..]);
                        }
                        self.last_used = Instant::now();
                        return Ok(reply);
                    }
                    Err(RedshardError::Incomplete) => {
                        self.buf.extend_from_slice(&snapshot);
                    }
                    Err(e) => {
                        self.buf.extend_from_slice(&snapshot);
                        return Err(e);
                    }
                }
            }

            self.reserve_read_space();
            let n = self.fill_buf().await?;
            let max = self.config.max_buffer_size;
            if self.buf.len() > max {
                return Err(RedshardError::Protocol(format!(
                    "reply too large: buffer would exceed {max} bytes"
                )));
            }
            if n == 0 {
                if self.buf.is_empty() {
                    return Err(RedshardError::Connection(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "connection closed by server",
                    )));
                }
                return Err(RedshardError::Protocol(
                    "connection closed mid-reply".into(),
                ));
            }
        }
    }

    fn reserve_read_space(&mut self) {
        if self.buf.capacity() - self.buf.len() < 4096 {
            let grow = self.buf.capacity().max(DEFAULT_BUF_CAPACITY);
            self.buf.reserve(grow);
        }
    }

    async fn fill_buf(&mut self) -> Result<usize> {
        let stream = self.stream.as_mut().ok_or_else(not_connected)?;
        let n = match self.read_timeout {
            Some(limit) => {
                match tokio::time::timeout(limit, stream.read_buf(&mut self.buf)).await {
                    Ok(result) => result?,
                    Err(_) => {
                        return Err(RedshardError::Timeout(format!(
                            "no reply from {} within {limit:?}",
                            self.config.addr()
                        )))
                    }
                }
            }
            None => stream.read_buf(&mut self.buf).await?,
        };
        Ok(n)
    }

    // ── Timeouts ───────────────────────────────────────────────────

    /// Wait forever on reads until [`Connection::rollback_timeout`].
    ///
    /// Used around blocking commands and subscriptions.
    pub fn set_timeout_infinite(&mut self) {
        if self.saved_timeout.is_none() {
            self.saved_timeout = Some(self.read_timeout);
        }
        self.read_timeout = None;
    }

    /// Restore the timeout in effect before `set_timeout_infinite`.
    pub fn rollback_timeout(&mut self) {
        if let Some(prior) = self.saved_timeout.take() {
            self.read_timeout = prior;
        }
    }

    /// Wait forever on reads for as long as the guard lives.
    pub fn infinite_timeout(&mut self) -> InfiniteTimeout<'_> {
        let prior = self.read_timeout;
        self.read_timeout = None;
        InfiniteTimeout { conn: self, prior }
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout
    }

    // ── State ──────────────────────────────────────────────────────

    /// Replies still owed by the server.
    pub fn pending(&self) -> usize {
        self.pending
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// True after a protocol, I/O or timeout failure. Such a connection
    /// refuses further I/O and must be discarded.
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Drop the socket. Safe to call any number of times.
    pub fn close(&mut self) {
        if self.stream.take().is_some() {
            tracing::debug!(addr = %self.config.addr(), "connection closed");
        }
        self.buf.clear();
        self.pending = 0;
    }

    pub(crate) fn mark_broken(&mut self, cause: &RedshardError) {
        if !self.broken {
            tracing::warn!(addr = %self.config.addr(), error = %cause, "connection broken");
        }
        self.broken = true;
        self.close();
    }

    fn check_usable(&self) -> Result<()> {
        if self.broken {
            return Err(RedshardError::Connection(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "connection is broken",
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("addr", &self.config.addr())
            .field("connected", &self.stream.is_some())
            .field("pending", &self.pending)
            .field("broken", &self.broken)
            .finish()
    }
}

fn not_connected() -> RedshardError {
    RedshardError::Connection(std::io::Error::new(
        std::io::ErrorKind::NotConnected,
        "not connected",
    ))
}

fn unexpected(wanted: &str, got: &Reply) -> RedshardError {
    RedshardError::Type(format!("expected {wanted} reply, got {}", got.type_name()))
}

/// Restores the prior read timeout when dropped.
pub struct InfiniteTimeout<'a> {
    conn: &'a mut Connection,
    prior: Option<Duration>,
}

impl Deref for InfiniteTimeout<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn
    }
}

impl DerefMut for InfiniteTimeout<'_> {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn
    }
}

impl Drop for InfiniteTimeout<'_> {
    fn drop(&mut self) {
        self.conn.read_timeout = self.prior;
    }
}

// ── Tests ──────────────────────────────────────────────────────────
