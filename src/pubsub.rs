//! Pub/sub dispatch.
//!
//! A [`Subscriber`] takes over a connection, subscribes to every channel and
//! pattern in its [`ListenerRegistry`] and then reads push messages until no
//! subscription is left, calling the matching listener for each message.
//! Listeners run inline on the dispatch loop. While the loop runs, a
//! [`SubscriberHandle`] can add or drop subscriptions from other tasks.

use crate::connection::tcp::Connection;
use crate::error::{RedshardError, Result};
use crate::resp::command::Command;
use crate::resp::types::Reply;

use bytes::Bytes;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A message published to a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub channel: Bytes,
    /// The pattern that matched, for pattern subscriptions.
    pub pattern: Option<Bytes>,
    pub payload: Bytes,
}

impl Message {
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    pub fn channel_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.channel).ok()
    }
}

pub type Listener = Box<dyn FnMut(&Message) + Send>;
type PongListener = Box<dyn FnMut(&Bytes) + Send>;

/// Listeners by channel name and by pattern.
#[derive(Default)]
pub struct ListenerRegistry {
    channels: HashMap<Bytes, Listener>,
    patterns: HashMap<Bytes, Listener>,
    pong: Option<PongListener>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Call `listener` for every message on `channel`.
    pub fn on_channel<F>(&mut self, channel: impl AsRef<[u8]>, listener: F) -> &mut Self
    where
        F: FnMut(&Message) + Send + 'static,
    {
        self.channels
            .insert(Bytes::copy_from_slice(channel.as_ref()), Box::new(listener));
        self
    }

    /// Call `listener` for every message on a channel matching `pattern`.
    pub fn on_pattern<F>(&mut self, pattern: impl AsRef<[u8]>, listener: F) -> &mut Self
    where
        F: FnMut(&Message) + Send + 'static,
    {
        self.patterns
            .insert(Bytes::copy_from_slice(pattern.as_ref()), Box::new(listener));
        self
    }

    /// Call `listener` with the payload of every `PING` answer.
    pub fn on_pong<F>(&mut self, listener: F) -> &mut Self
    where
        F: FnMut(&Bytes) + Send + 'static,
    {
        self.pong = Some(Box::new(listener));
        self
    }

    pub fn channels(&self) -> impl Iterator<Item = &Bytes> {
        self.channels.keys()
    }

    pub fn patterns(&self) -> impl Iterator<Item = &Bytes> {
        self.patterns.keys()
    }

    /// True when there is nothing to subscribe to.
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty() && self.patterns.is_empty()
    }
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("channels", &self.channels.keys().collect::<Vec<_>>())
            .field("patterns", &self.patterns.keys().collect::<Vec<_>>())
            .finish()
    }
}

enum Control {
    Subscribe(Bytes, Listener),
    Unsubscribe(Vec<Bytes>),
    PSubscribe(Bytes, Listener),
    PUnsubscribe(Vec<Bytes>),
    Ping(Option<Bytes>),
}

/// Talks to a running [`Subscriber`]. Cheap to clone.
#[derive(Clone)]
pub struct SubscriberHandle {
    tx: mpsc::UnboundedSender<Control>,
}

impl SubscriberHandle {
    pub fn subscribe<F>(&self, channel: impl AsRef<[u8]>, listener: F) -> Result<()>
    where
        F: FnMut(&Message) + Send + 'static,
    {
        let channel = Bytes::copy_from_slice(channel.as_ref());
        self.send(Control::Subscribe(channel, Box::new(listener)))
    }

    /// Drop subscriptions; an empty list drops every channel.
    pub fn unsubscribe<I, C>(&self, channels: I) -> Result<()>
    where
        I: IntoIterator<Item = C>,
        C: AsRef<[u8]>,
    {
        self.send(Control::Unsubscribe(to_bytes(channels)))
    }

    pub fn psubscribe<F>(&self, pattern: impl AsRef<[u8]>, listener: F) -> Result<()>
    where
        F: FnMut(&Message) + Send + 'static,
    {
        let pattern = Bytes::copy_from_slice(pattern.as_ref());
        self.send(Control::PSubscribe(pattern, Box::new(listener)))
    }

    /// Drop pattern subscriptions; an empty list drops every pattern.
    pub fn punsubscribe<I, P>(&self, patterns: I) -> Result<()>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<[u8]>,
    {
        self.send(Control::PUnsubscribe(to_bytes(patterns)))
    }

    /// The answer goes to the registry's pong listener.
    pub fn ping(&self, payload: Option<&[u8]>) -> Result<()> {
        self.send(Control::Ping(payload.map(Bytes::copy_from_slice)))
    }

    fn send(&self, control: Control) -> Result<()> {
        self.tx
            .send(control)
            .map_err(|_| RedshardError::Usage("subscriber has stopped".into()))
    }
}

impl std::fmt::Debug for SubscriberHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberHandle")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

fn to_bytes<I, A>(items: I) -> Vec<Bytes>
where
    I: IntoIterator<Item = A>,
    A: AsRef<[u8]>,
{
    items
        .into_iter()
        .map(|a| Bytes::copy_from_slice(a.as_ref()))
        .collect()
}

/// Dispatch loop over one subscribed connection.
pub struct Subscriber {
    conn: Connection,
    registry: ListenerRegistry,
    control_tx: mpsc::UnboundedSender<Control>,
    control_rx: mpsc::UnboundedReceiver<Control>,
}

impl Subscriber {
    pub fn new(conn: Connection, registry: ListenerRegistry) -> Self {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        Self {
            conn,
            registry,
            control_tx,
            control_rx,
        }
    }

    pub fn handle(&self) -> SubscriberHandle {
        SubscriberHandle {
            tx: self.control_tx.clone(),
        }
    }

    /// Run the loop on its own task.
    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    /// Subscribe and dispatch until every subscription is gone.
    ///
    /// The connection is closed when the loop ends, whatever the outcome.
    pub async fn run(self) -> Result<()> {
        if self.registry.is_empty() {
            return Err(RedshardError::Usage(
                "nothing to subscribe to: register a channel or pattern first".into(),
            ));
        }
        let Self {
            mut conn,
            mut registry,
            control_tx,
            mut control_rx,
        } = self;
        // From here on the control channel closes with the last handle.
        drop(control_tx);

        let result = dispatch_loop(&mut conn, &mut registry, &mut control_rx).await;
        conn.close();
        tracing::debug!(ok = result.is_ok(), "subscriber stopped");
        result
    }
}

async fn dispatch_loop(
    conn: &mut Connection,
    registry: &mut ListenerRegistry,
    control_rx: &mut mpsc::UnboundedReceiver<Control>,
) -> Result<()> {
    let mut initial = Vec::new();
    if !registry.channels.is_empty() {
        initial.push(Command::new("SUBSCRIBE").args(registry.channels.keys()));
    }
    if !registry.patterns.is_empty() {
        initial.push(Command::new("PSUBSCRIBE").args(registry.patterns.keys()));
    }

    let mut conn = conn.infinite_timeout();
    conn.send_untracked(&initial).await?;
    tracing::debug!(
        channels = registry.channels.len(),
        patterns = registry.patterns.len(),
        "subscribed"
    );

    let mut subscriptions = 0;
    let mut controls_open = true;
    loop {
        tokio::select! {
            control = control_rx.recv(), if controls_open => match control {
                Some(control) => {
                    let cmd = apply_control(registry, control);
                    conn.send_untracked(&[cmd]).await?;
                }
                None => controls_open = false,
            },
            push = conn.read_push() => {
                if dispatch(registry, &mut subscriptions, push?)? {
                    return Ok(());
                }
            }
        }
    }
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("conn", &self.conn)
            .field("registry", &self.registry)
            .finish()
    }
}

fn apply_control(registry: &mut ListenerRegistry, control: Control) -> Command {
    match control {
        Control::Subscribe(channel, listener) => {
            let cmd = Command::new("SUBSCRIBE").arg(&channel);
            registry.channels.insert(channel, listener);
            cmd
        }
        Control::Unsubscribe(channels) => Command::new("UNSUBSCRIBE").args(channels),
        Control::PSubscribe(pattern, listener) => {
            let cmd = Command::new("PSUBSCRIBE").arg(&pattern);
            registry.patterns.insert(pattern, listener);
            cmd
        }
        Control::PUnsubscribe(patterns) => Command::new("PUNSUBSCRIBE").args(patterns),
        Control::Ping(payload) => match payload {
            Some(payload) => Command::new("PING").arg(payload),
            None => Command::new("PING"),
        },
    }
}

/// Handle one push message. Returns `true` when no subscription is left.
fn dispatch(registry: &mut ListenerRegistry, subscriptions: &mut i64, push: Reply) -> Result<bool> {
    let items = match push {
        Reply::MultiBulk(Some(items)) if !items.is_empty() => items,
        other => {
            return Err(RedshardError::Protocol(format!(
                "expected a push message, got {}",
                other.type_name()
            )))
        }
    };
    let kind = items[0]
        .as_str()
        .ok_or_else(|| RedshardError::Protocol("push message kind is not a string".into()))?
        .to_ascii_lowercase();

    match (kind.as_str(), items.as_slice()) {
        ("subscribe" | "psubscribe", [_, name, count]) => {
            *subscriptions = ack_count(count)?;
            tracing::trace!(kind = %kind, name = ?name.as_bytes(), count = *subscriptions, "subscription ack");
            Ok(false)
        }
        ("unsubscribe" | "punsubscribe", [_, name, count]) => {
            *subscriptions = ack_count(count)?;
            if let Some(name) = name.as_bytes() {
                if kind == "unsubscribe" {
                    registry.channels.remove(name);
                } else {
                    registry.patterns.remove(name);
                }
            }
            tracing::trace!(kind = %kind, count = *subscriptions, "unsubscription ack");
            Ok(*subscriptions == 0)
        }
        ("message", [_, channel, payload]) => {
            let message = Message {
                channel: bulk(channel)?,
                pattern: None,
                payload: bulk(payload)?,
            };
            match registry.channels.get_mut(&message.channel) {
                Some(listener) => listener(&message),
                None => tracing::trace!(channel = ?message.channel, "message without listener"),
            }
            Ok(false)
        }
        ("pmessage", [_, pattern, channel, payload]) => {
            let message = Message {
                channel: bulk(channel)?,
                pattern: Some(bulk(pattern)?),
                payload: bulk(payload)?,
            };
            let pattern = message.pattern.clone().unwrap_or_default();
            match registry.patterns.get_mut(&pattern) {
                Some(listener) => listener(&message),
                None => tracing::trace!(pattern = ?pattern, "pmessage without listener"),
            }
            Ok(false)
        }
        ("pong", [_, payload]) => {
            let payload = bulk(payload)?;
            if let Some(listener) = registry.pong.as_mut() {
                listener(&payload);
            }
            Ok(false)
        }
        _ => Err(RedshardError::Protocol(format!(
            "unexpected push message: {kind} with {} elements",
            items.len()
        ))),
    }
}

fn ack_count(reply: &Reply) -> Result<i64> {
    reply
        .as_int()
        .ok_or_else(|| RedshardError::Protocol("subscription count is not an integer".into()))
}

fn bulk(reply: &Reply) -> Result<Bytes> {
    match reply {
        Reply::Bulk(Some(b)) => Ok(b.clone()),
        other => Err(RedshardError::Protocol(format!(
            "expected bulk in push message, got {}",
            other.type_name()
        ))),
    }
}

// ── Tests ──────────────────────────────────────────────────────────
