//! Shared helpers for integration tests.
//!
//! Tests run against an in-process mock server that decodes each incoming
//! command and answers through a handler, so no real server is needed.

#![allow(dead_code)]

pub use redshard::testing::{ack, push, Action, MockServer};

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Once;

static TRACING: Once = Once::new();

/// Route `tracing` output through the test harness (`RUST_LOG` filters it).
pub fn init_tracing() {
    TRACING.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .init();
    });
}

/// Tiny in-memory store: GET / SET / INCR / DEL / MULTI / EXEC / DISCARD.
///
/// Enough to exercise transactions and pipelines end to end.
pub async fn kv_server() -> MockServer {
    init_tracing();
    let state = Mutex::new(KvState::default());
    MockServer::with_handler(move |args| Action::Reply(state.lock().apply(args)))
        .await
}

#[derive(Default)]
struct KvState {
    data: std::collections::HashMap<Bytes, Bytes>,
    queue: Option<Vec<Vec<Bytes>>>,
}

impl KvState {
    fn apply(&mut self, args: &[Bytes]) -> Vec<u8> {
        let verb = String::from_utf8_lossy(&args[0]).to_ascii_uppercase();
        match (verb.as_str(), self.queue.is_some()) {
            ("MULTI", false) => {
                self.queue = Some(Vec::new());
                b"+OK\r\n".to_vec()
            }
            ("MULTI", true) => b"-ERR MULTI calls can not be nested\r\n".to_vec(),
            ("EXEC", true) => {
                let queued = self.queue.take().unwrap_or_default();
                let mut out = format!("*{}\r\n", queued.len()).into_bytes();
                for cmd in queued {
                    out.extend(self.run(&cmd));
                }
                out
            }
            ("DISCARD", true) => {
                self.queue = None;
                b"+OK\r\n".to_vec()
            }
            ("EXEC" | "DISCARD", false) => format!("-ERR {verb} without MULTI\r\n").into_bytes(),
            (_, true) => {
                if let Some(queue) = self.queue.as_mut() {
                    queue.push(args.to_vec());
                }
                b"+QUEUED\r\n".to_vec()
            }
            (_, false) => self.run(args),
        }
    }

    fn run(&mut self, args: &[Bytes]) -> Vec<u8> {
        let verb = String::from_utf8_lossy(&args[0]).to_ascii_uppercase();
        match (verb.as_str(), &args[1..]) {
            ("PING", []) => b"+PONG\r\n".to_vec(),
            ("SET", [k, v]) => {
                self.data.insert(k.clone(), v.clone());
                b"+OK\r\n".to_vec()
            }
            ("GET", [k]) => match self.data.get(k) {
                Some(v) => bulk(v),
                None => b"$-1\r\n".to_vec(),
            },
            ("INCR", [k]) => {
                let current = self.data.get(k).cloned().unwrap_or_else(|| Bytes::from_static(b"0"));
                match std::str::from_utf8(&current).ok().and_then(|s| s.parse::<i64>().ok()) {
                    Some(n) => {
                        self.data.insert(k.clone(), Bytes::from((n + 1).to_string()));
                        format!(":{}\r\n", n + 1).into_bytes()
                    }
                    None => b"-ERR value is not an integer or out of range\r\n".to_vec(),
                }
            }
            ("DEL", keys) => {
                let removed = keys.iter().filter(|k| self.data.remove(*k).is_some()).count();
                format!(":{removed}\r\n").into_bytes()
            }
            _ => format!("-ERR unknown command '{verb}'\r\n").into_bytes(),
        }
    }
}

pub fn bulk(data: &[u8]) -> Vec<u8> {
    let mut out = format!("${}\r\n", data.len()).into_bytes();
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
    out
}
