//! Scripted mock server for tests.
//!
//! Every complete command the server receives is recorded and handed to a
//! handler that decides what to write back. Built for the crate's own unit
//! tests and, with the `test-util` feature, for integration tests.

use crate::config::ConnectionConfig;
use crate::resp::parser::parse;
use crate::resp::types::Reply;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// What the server does after receiving a command.
pub enum Action {
    Reply(Vec<u8>),
    Silent,
    Close,
}

type Handler = Arc<dyn Fn(&[Bytes]) -> Action + Send + Sync>;

pub struct MockServer {
    port: u16,
    received: Arc<Mutex<Vec<Vec<Bytes>>>>,
    connections: Arc<AtomicUsize>,
}

impl MockServer {
    /// Answer the n-th command with the n-th response, then stay silent.
    pub async fn scripted(responses: Vec<Vec<u8>>) -> Self {
        let queue = Mutex::new(VecDeque::from(responses));
        Self::with_handler(move |_| match queue.lock().pop_front() {
            Some(bytes) => Action::Reply(bytes),
            None => Action::Silent,
        })
        .await
    }

    pub async fn with_handler<F>(handler: F) -> Self
    where
        F: Fn(&[Bytes]) -> Action + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let received = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));
        let handler: Handler = Arc::new(handler);

        let log = Arc::clone(&received);
        let count = Arc::clone(&connections);
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                count.fetch_add(1, Ordering::SeqCst);
                let handler = Arc::clone(&handler);
                let log = Arc::clone(&log);
                tokio::spawn(async move {
                    let mut buf = BytesMut::new();
                    loop {
                        match socket.read_buf(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(_) => {}
                        }
                        while let Ok((reply, used)) = parse(&Bytes::copy_from_slice(&buf)) {
                            let _ = buf.split_to(used);
                            let args = command_args(reply);
                            log.lock().push(args.clone());
                            match handler(&args) {
                                Action::Reply(bytes) => {
                                    if socket.write_all(&bytes).await.is_err() {
                                        return;
                                    }
                                }
                                Action::Silent => {}
                                Action::Close => return,
                            }
                        }
                    }
                });
            }
        });

        Self {
            port,
            received,
            connections,
        }
    }

    pub fn config(&self) -> ConnectionConfig {
        ConnectionConfig::new("127.0.0.1", self.port)
    }

    pub fn url(&self) -> String {
        format!("redis://127.0.0.1:{}", self.port)
    }

    /// Every command received so far, as argument lists.
    pub fn received(&self) -> Vec<Vec<Bytes>> {
        self.received.lock().clone()
    }

    /// Verbs of every command received, in order.
    pub fn verbs(&self) -> Vec<String> {
        self.received
            .lock()
            .iter()
            .map(|cmd| {
                cmd.first()
                    .map(|verb| String::from_utf8_lossy(verb).into_owned())
                    .unwrap_or_default()
            })
            .collect()
    }

    /// Connections accepted so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

fn command_args(reply: Reply) -> Vec<Bytes> {
    reply
        .into_array()
        .unwrap_or_default()
        .into_iter()
        .filter_map(|arg| match arg {
            Reply::Bulk(Some(b)) => Some(b),
            _ => None,
        })
        .collect()
}

/// `*n` push frame of bulk strings.
pub fn push(parts: &[&str]) -> Vec<u8> {
    let mut out = format!("*{}\r\n", parts.len()).into_bytes();
    for part in parts {
        out.extend_from_slice(format!("${}\r\n{}\r\n", part.len(), part).as_bytes());
    }
    out
}

/// Subscription ack: `[kind, channel, :count]`.
pub fn ack(kind: &str, channel: &str, count: i64) -> Vec<u8> {
    format!(
        "*3\r\n${}\r\n{}\r\n${}\r\n{}\r\n:{}\r\n",
        kind.len(),
        kind,
        channel.len(),
        channel,
        count
    )
    .into_bytes()
}
