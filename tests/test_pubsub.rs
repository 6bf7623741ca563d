//! Integration tests: subscriber loop over a client's connection.

mod common;

use bytes::Bytes;
use common::*;
use parking_lot::Mutex;
use redshard::{Client, ListenerRegistry, RedshardError, Subscriber};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Acks subscriptions and delivers three messages per channel.
async fn feed_server() -> MockServer {
    let active = Arc::new(Mutex::new(0i64));
    MockServer::with_handler(move |args| {
        let mut active = active.lock();
        let mut out = Vec::new();
        match &args[0][..] {
            b"PING" => out.extend(b"+PONG\r\n"),
            b"SUBSCRIBE" => {
                for ch in &args[1..] {
                    *active += 1;
                    let ch = std::str::from_utf8(ch).unwrap();
                    out.extend(ack("subscribe", ch, *active));
                    for n in 0..3 {
                        out.extend(push(&["message", ch, &format!("{ch}-{n}")]));
                    }
                }
            }
            b"UNSUBSCRIBE" => {
                for ch in &args[1..] {
                    *active -= 1;
                    out.extend(ack("unsubscribe", std::str::from_utf8(ch).unwrap(), *active));
                }
            }
            _ => out.extend(b"-ERR unexpected\r\n"),
        }
        Action::Reply(out)
    })
    .await
}

#[tokio::test]
async fn client_connection_becomes_subscriber() {
    let server = feed_server().await;
    let mut client = Client::new(server.config());
    assert_eq!(client.ping().await.unwrap(), "PONG");

    let (tx, mut rx) = mpsc::unbounded_channel::<(String, Bytes)>();
    let mut registry = ListenerRegistry::new();
    let news = tx.clone();
    registry.on_channel("news", move |m| {
        let _ = news.send(("news".into(), m.payload.clone()));
    });
    registry.on_channel("jobs", move |m| {
        let _ = tx.send(("jobs".into(), m.payload.clone()));
    });

    let subscriber = Subscriber::new(client.into_connection(), registry);
    let handle = subscriber.handle();
    let task = subscriber.spawn();

    let mut seen = Vec::new();
    while seen.len() < 6 {
        let got = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        seen.push(got);
    }
    for ch in ["news", "jobs"] {
        let payloads: Vec<_> = seen
            .iter()
            .filter(|(c, _)| c == ch)
            .map(|(_, p)| p.clone())
            .collect();
        assert_eq!(
            payloads,
            (0..3).map(|n| Bytes::from(format!("{ch}-{n}"))).collect::<Vec<_>>()
        );
    }

    handle.unsubscribe(["news", "jobs"]).unwrap();
    task.await.unwrap().unwrap();
    assert!(matches!(
        handle.unsubscribe(["news"]),
        Err(RedshardError::Usage(_))
    ));
    assert_eq!(server.verbs(), vec!["PING", "SUBSCRIBE", "UNSUBSCRIBE"]);
}
