//! Single-connection client, transactions and pipelines.
//!
//! A [`Client`] owns one [`Connection`]. [`Client::multi`] hands out a
//! [`Transaction`] that mutably borrows the client, so nothing but queueing
//! can happen on the connection until the transaction is executed or
//! discarded. A [`Pipeline`] batches commands into a single write and may
//! itself contain `MULTI` / `EXEC`.

use crate::config::ConnectionConfig;
use crate::connection::tcp::Connection;
use crate::error::{RedshardError, Result};
use crate::resp::command::Command;
use crate::resp::types::Reply;

use bytes::Bytes;

/// Transaction state of a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Normal,
    /// `MULTI` sent; a [`Transaction`] handle is alive.
    Queueing,
    /// A transaction handle was dropped without `exec` or `discard`.
    /// The next operation discards it first.
    Abandoned,
}

/// Client over a single connection.
#[derive(Debug)]
pub struct Client {
    conn: Connection,
    state: TransactionState,
}

impl Client {
    /// Client for `config`. Connects on first use.
    pub fn new(config: ConnectionConfig) -> Self {
        Self::from_connection(Connection::new(config))
    }

    /// Client for a `redis://` URL.
    pub fn from_url(url: &str) -> Result<Self> {
        Ok(Self::new(ConnectionConfig::from_url(url)?))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn,
            state: TransactionState::Normal,
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Give up the client, keeping its connection (e.g. for a subscriber).
    pub fn into_connection(self) -> Connection {
        self.conn
    }

    pub fn transaction_state(&self) -> TransactionState {
        self.state
    }

    pub fn close(&mut self) {
        self.conn.close();
    }

    /// Clean up after an abandoned transaction.
    async fn ensure_normal(&mut self) -> Result<()> {
        if self.state != TransactionState::Abandoned {
            return Ok(());
        }
        // A cancelled queue() may have left its reply unread.
        if self.conn.pending() > 0 {
            self.conn.get_all().await?;
        }
        if self.conn.is_connected() {
            tracing::debug!("discarding abandoned transaction");
            self.conn.send_command(&Command::new("DISCARD")).await?;
            match self.conn.read_reply().await {
                Ok(_) | Err(RedshardError::Server { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        self.state = TransactionState::Normal;
        Ok(())
    }

    /// Send one command and read its reply.
    pub async fn execute(&mut self, cmd: &Command) -> Result<Reply> {
        self.ensure_normal().await?;
        self.conn.send_command(cmd).await?;
        self.conn.read_reply().await
    }

    pub async fn ping(&mut self) -> Result<String> {
        self.ensure_normal().await?;
        self.conn.send_command(&Command::new("PING")).await?;
        self.conn.get_status_reply().await
    }

    pub async fn set(&mut self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Result<()> {
        self.ensure_normal().await?;
        self.conn
            .send_command(&Command::new("SET").arg(key).arg(value))
            .await?;
        self.conn.get_status_reply().await.map(drop)
    }

    pub async fn get(&mut self, key: impl AsRef<[u8]>) -> Result<Option<Bytes>> {
        self.ensure_normal().await?;
        self.conn.send_command(&Command::new("GET").arg(key)).await?;
        self.conn.get_bulk_reply().await
    }

    /// Number of keys removed.
    pub async fn del<I, K>(&mut self, keys: I) -> Result<i64>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<[u8]>,
    {
        self.ensure_normal().await?;
        self.conn
            .send_command(&Command::new("DEL").args(keys))
            .await?;
        self.conn.get_integer_reply().await
    }

    pub async fn incr(&mut self, key: impl AsRef<[u8]>) -> Result<i64> {
        self.ensure_normal().await?;
        self.conn.send_command(&Command::new("INCR").arg(key)).await?;
        self.conn.get_integer_reply().await
    }

    /// Number of subscribers that received the message.
    pub async fn publish(
        &mut self,
        channel: impl AsRef<[u8]>,
        message: impl AsRef<[u8]>,
    ) -> Result<i64> {
        self.ensure_normal().await?;
        self.conn
            .send_command(&Command::new("PUBLISH").arg(channel).arg(message))
            .await?;
        self.conn.get_integer_reply().await
    }

    /// `BLPOP`: `(key, value)`, or `None` when `timeout_secs` elapsed
    /// (0 blocks forever). The read timeout is suspended while waiting.
    pub async fn blpop<I, K>(&mut self, keys: I, timeout_secs: i64) -> Result<Option<(Bytes, Bytes)>>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<[u8]>,
    {
        let cmd = Command::new("BLPOP").args(keys).arg_int(timeout_secs);
        self.blocking_pop(&cmd).await
    }

    /// `BRPOP`, see [`Client::blpop`].
    pub async fn brpop<I, K>(&mut self, keys: I, timeout_secs: i64) -> Result<Option<(Bytes, Bytes)>>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<[u8]>,
    {
        let cmd = Command::new("BRPOP").args(keys).arg_int(timeout_secs);
        self.blocking_pop(&cmd).await
    }

    async fn blocking_pop(&mut self, cmd: &Command) -> Result<Option<(Bytes, Bytes)>> {
        self.ensure_normal().await?;
        let mut conn = self.conn.infinite_timeout();
        conn.send_command(cmd).await?;
        let items = match conn.get_multi_bulk_reply().await? {
            Some(items) => items,
            None => return Ok(None),
        };
        match <[Reply; 2]>::try_from(items) {
            Ok([Reply::Bulk(Some(key)), Reply::Bulk(Some(value))]) => Ok(Some((key, value))),
            _ => Err(RedshardError::Type(
                "blocking pop reply is not a [key, value] pair".into(),
            )),
        }
    }

    pub async fn watch<I, K>(&mut self, keys: I) -> Result<()>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<[u8]>,
    {
        self.ensure_normal().await?;
        self.conn
            .send_command(&Command::new("WATCH").args(keys))
            .await?;
        self.conn.get_status_reply().await.map(drop)
    }

    pub async fn unwatch(&mut self) -> Result<()> {
        self.ensure_normal().await?;
        self.conn.send_command(&Command::new("UNWATCH")).await?;
        self.conn.get_status_reply().await.map(drop)
    }

    /// Start a transaction.
    pub async fn multi(&mut self) -> Result<Transaction<'_>> {
        self.ensure_normal().await?;
        self.conn.send_command(&Command::new("MULTI")).await?;
        self.conn.get_status_reply().await?;
        self.state = TransactionState::Queueing;
        Ok(Transaction {
            client: self,
            queued: 0,
            finished: false,
        })
    }

    /// Run every command of `pipeline` with a single write.
    ///
    /// Replies come back in issue order. See [`fold_transactions`] for how
    /// `MULTI` / `EXEC` inside the pipeline are reported.
    pub async fn pipeline(&mut self, pipeline: &Pipeline) -> Result<Vec<Reply>> {
        self.ensure_normal().await?;
        let (replies, open) = run_pipeline(&mut self.conn, pipeline.commands()).await?;
        if open {
            // Left inside MULTI on the server.
            self.state = TransactionState::Abandoned;
        }
        Ok(replies)
    }
}

/// Placeholder returned for a queued command.
///
/// Its real result is at [`Queued::index`] in the `exec` results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Queued {
    index: usize,
}

impl Queued {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Pick this command's result out of the `exec` results.
    pub fn get<'r>(&self, results: &'r [Reply]) -> Option<&'r Reply> {
        results.get(self.index)
    }
}

/// An open `MULTI` block.
///
/// Dropping it without [`Transaction::exec`] or [`Transaction::discard`]
/// leaves the client to send `DISCARD` before its next command.
#[derive(Debug)]
pub struct Transaction<'a> {
    client: &'a mut Client,
    queued: usize,
    finished: bool,
}

impl Transaction<'_> {
    /// Queue a command. Reads exactly one status reply (`QUEUED`).
    ///
    /// A server error here leaves the transaction open; the server will
    /// usually refuse the `EXEC` that follows.
    pub async fn queue(&mut self, cmd: &Command) -> Result<Queued> {
        let conn = &mut self.client.conn;
        conn.send_command(cmd).await?;
        let status = conn.get_status_reply().await?;
        if status != "QUEUED" {
            return Err(RedshardError::Type(format!(
                "expected QUEUED, got {status}"
            )));
        }
        let queued = Queued { index: self.queued };
        self.queued += 1;
        Ok(queued)
    }

    pub async fn set(&mut self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Result<Queued> {
        self.queue(&Command::new("SET").arg(key).arg(value)).await
    }

    pub async fn get(&mut self, key: impl AsRef<[u8]>) -> Result<Queued> {
        self.queue(&Command::new("GET").arg(key)).await
    }

    pub async fn del(&mut self, key: impl AsRef<[u8]>) -> Result<Queued> {
        self.queue(&Command::new("DEL").arg(key)).await
    }

    pub async fn incr(&mut self, key: impl AsRef<[u8]>) -> Result<Queued> {
        self.queue(&Command::new("INCR").arg(key)).await
    }

    /// Commands queued so far.
    pub fn len(&self) -> usize {
        self.queued
    }

    pub fn is_empty(&self) -> bool {
        self.queued == 0
    }

    /// Run the transaction.
    ///
    /// `Some(results)` holds one reply per queued command, in order; a
    /// command that failed inside the transaction is a [`Reply::Error`].
    /// `None` means the transaction was aborted (a watched key changed).
    pub async fn exec(mut self) -> Result<Option<Vec<Reply>>> {
        self.finish();
        let conn = &mut self.client.conn;
        conn.send_command(&Command::new("EXEC")).await?;
        match conn.get_multi_bulk_reply().await? {
            Some(results) if results.len() != self.queued => {
                let err = RedshardError::QueueMismatch {
                    expected: self.queued,
                    actual: results.len(),
                };
                conn.mark_broken(&err);
                Err(err)
            }
            Some(results) => Ok(Some(results)),
            None => {
                tracing::debug!(queued = self.queued, "transaction aborted");
                Ok(None)
            }
        }
    }

    /// Throw the queued commands away.
    pub async fn discard(mut self) -> Result<()> {
        self.finish();
        let conn = &mut self.client.conn;
        conn.send_command(&Command::new("DISCARD")).await?;
        conn.get_status_reply().await.map(drop)
    }

    fn finish(&mut self) {
        self.finished = true;
        self.client.state = TransactionState::Normal;
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!(queued = self.queued, "transaction dropped without exec or discard");
            self.client.state = TransactionState::Abandoned;
        }
    }
}

/// Commands to send in one write.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    commands: Vec<Command>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, cmd: Command) -> &mut Self {
        self.commands.push(cmd);
        self
    }

    pub fn set(&mut self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> &mut Self {
        self.add(Command::new("SET").arg(key).arg(value))
    }

    pub fn get(&mut self, key: impl AsRef<[u8]>) -> &mut Self {
        self.add(Command::new("GET").arg(key))
    }

    pub fn incr(&mut self, key: impl AsRef<[u8]>) -> &mut Self {
        self.add(Command::new("INCR").arg(key))
    }

    pub fn del(&mut self, key: impl AsRef<[u8]>) -> &mut Self {
        self.add(Command::new("DEL").arg(key))
    }

    /// Record `MULTI`; commands up to the next `exec` are queued.
    pub fn multi(&mut self) -> &mut Self {
        self.add(Command::new("MULTI"))
    }

    pub fn exec(&mut self) -> &mut Self {
        self.add(Command::new("EXEC"))
    }

    pub fn discard(&mut self) -> &mut Self {
        self.add(Command::new("DISCARD"))
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn clear(&mut self) {
        self.commands.clear();
    }
}

/// Write `commands` at once and drain their replies.
///
/// Returns the folded replies and whether a `MULTI` was left open.
pub(crate) async fn run_pipeline(
    conn: &mut Connection,
    commands: &[Command],
) -> Result<(Vec<Reply>, bool)> {
    if commands.is_empty() {
        return Ok((Vec::new(), false));
    }
    tracing::trace!(commands = commands.len(), "sending pipeline");
    conn.send_pipeline(commands).await?;
    let mut replies = conn.get_all().await?;
    let open = fold_transactions(commands, &mut replies);
    Ok((replies, open))
}

/// Replace the `QUEUED` placeholders of every `MULTI` … `EXEC` block with
/// the real results from the `EXEC` reply.
///
/// When `EXEC` was aborted (nil) or refused (error), the placeholders stay.
/// Commands refused at queue time keep their error and take no result slot.
/// Returns `true` when the last `MULTI` has no matching `EXEC` / `DISCARD`.
pub fn fold_transactions(commands: &[Command], replies: &mut [Reply]) -> bool {
    let mut queued_slots: Option<Vec<usize>> = None;

    for (i, cmd) in commands.iter().enumerate() {
        match queued_slots.as_mut() {
            None => {
                if cmd.is("MULTI") && !replies[i].is_error() {
                    queued_slots = Some(Vec::new());
                }
            }
            Some(slots) => {
                if cmd.is("EXEC") {
                    if let Reply::MultiBulk(Some(results)) = &replies[i] {
                        let results = results.clone();
                        for (&slot, result) in slots.iter().zip(results) {
                            replies[slot] = result;
                        }
                    }
                    queued_slots = None;
                } else if cmd.is("DISCARD") {
                    queued_slots = None;
                } else if matches!(&replies[i], Reply::Status(s) if s == "QUEUED") {
                    slots.push(i);
                }
            }
        }
    }

    queued_slots.is_some()
}

// ── Tests ──────────────────────────────────────────────────────────
