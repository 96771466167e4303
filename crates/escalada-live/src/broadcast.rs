//! Realtime fan-out of box snapshots to connected viewers.
//!
//! Every connection owns a bounded queue. Publishing never waits: a full or
//! closed queue counts as a failed send, and a connection that keeps failing
//! is dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use escalada_store::{BoxId, BoxState};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::config::BroadcastConfig;
use crate::error::BroadcastError;
use crate::rules::RulesEngine;

pub type ConnectionId = u64;

/// Which stream a connection follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Full state for authorized operators.
    Box(BoxId),
    /// Read-only public projection.
    Public(BoxId),
}

impl Channel {
    pub fn box_id(self) -> BoxId {
        match self {
            Channel::Box(id) | Channel::Public(id) => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub box_id: BoxId,
    pub box_version: u64,
    pub session_id: String,
    pub time_criterion_enabled: bool,
    pub state: Value,
}

impl StateSnapshot {
    pub fn of(state: &BoxState, time_criterion_enabled: bool) -> Self {
        Self {
            box_id: state.box_id,
            box_version: state.box_version,
            session_id: state.session_id.clone(),
            time_criterion_enabled,
            state: state.state.clone(),
        }
    }

    /// Public projection, or `None` when the box is not public.
    pub fn public(
        state: &BoxState,
        rules: &dyn RulesEngine,
        time_criterion_enabled: bool,
    ) -> Option<Self> {
        if !rules.is_public(&state.state) {
            return None;
        }
        Some(Self {
            box_id: state.box_id,
            box_version: state.box_version,
            session_id: String::new(),
            time_criterion_enabled,
            state: rules.public_view(&state.state),
        })
    }
}

/// Server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    StateSnapshot(StateSnapshot),
    Ping { timestamp: u64 },
    Pong { timestamp: Option<Value> },
}

impl ServerMessage {
    pub fn encode(&self) -> Result<String, BroadcastError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Client to server. Anything else is ignored by the socket loop.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    Pong {
        #[serde(default)]
        timestamp: Option<Value>,
    },
    Ping {
        #[serde(default)]
        timestamp: Option<Value>,
    },
    RequestState {
        #[serde(default, rename = "boxId")]
        box_id: Option<BoxId>,
    },
}

struct Connection {
    tx: mpsc::Sender<Arc<str>>,
    failures: u32,
}

#[derive(Default)]
struct Registry {
    channels: HashMap<Channel, HashMap<ConnectionId, Connection>>,
}

struct Inner {
    config: BroadcastConfig,
    next_id: AtomicU64,
    registry: Mutex<Registry>,
}

impl Inner {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, channel: Channel, id: ConnectionId) -> bool {
        let mut registry = self.registry();
        let Some(conns) = registry.channels.get_mut(&channel) else {
            return false;
        };
        let removed = conns.remove(&id).is_some();
        if conns.is_empty() {
            registry.channels.remove(&channel);
        }
        removed
    }
}

#[derive(Clone)]
pub struct Broadcaster {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broadcaster")
            .field("connections", &self.total_connections())
            .finish()
    }
}

/// Receiving end of one connection. Dropping it deregisters the connection.
pub struct Subscription {
    id: ConnectionId,
    channel: Channel,
    rx: mpsc::Receiver<Arc<str>>,
    inner: Arc<Inner>,
}

impl Subscription {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Next encoded message; `None` once the broadcaster dropped this
    /// connection.
    pub async fn recv(&mut self) -> Option<Arc<str>> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<str>> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.inner.remove(self.channel, self.id) {
            tracing::debug!(connection = self.id, channel = ?self.channel, "connection closed");
        }
    }
}

impl Broadcaster {
    pub fn new(config: BroadcastConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                next_id: AtomicU64::new(1),
                registry: Mutex::new(Registry::default()),
            }),
        }
    }

    pub fn subscribe(&self, channel: Channel) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.config.queue_capacity.max(1));
        self.inner
            .registry()
            .channels
            .entry(channel)
            .or_default()
            .insert(id, Connection { tx, failures: 0 });
        tracing::debug!(connection = id, ?channel, "connection registered");
        Subscription {
            id,
            channel,
            rx,
            inner: Arc::clone(&self.inner),
        }
    }

    /// Queue a message for one connection.
    pub fn send_to(
        &self,
        channel: Channel,
        id: ConnectionId,
        message: &ServerMessage,
    ) -> Result<(), BroadcastError> {
        let encoded: Arc<str> = Arc::from(message.encode()?);
        let mut registry = self.inner.registry();
        let conn = registry
            .channels
            .get_mut(&channel)
            .and_then(|conns| conns.get_mut(&id))
            .ok_or(BroadcastError::Closed(id))?;
        match conn.tx.try_send(encoded) {
            Ok(()) => {
                conn.failures = 0;
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                conn.failures += 1;
                Err(BroadcastError::QueueFull(id))
            }
            Err(TrySendError::Closed(_)) => Err(BroadcastError::Closed(id)),
        }
    }

    /// Queue a message for every connection on `channel`; returns how many
    /// accepted it.
    pub fn publish(&self, channel: Channel, message: &ServerMessage) -> usize {
        let encoded: Arc<str> = match message.encode() {
            Ok(encoded) => Arc::from(encoded),
            Err(err) => {
                tracing::error!(?channel, "failed to encode broadcast: {err}");
                return 0;
            }
        };
        let max_failures = self.inner.config.max_send_failures.max(1);
        let mut registry = self.inner.registry();
        let Some(conns) = registry.channels.get_mut(&channel) else {
            return 0;
        };

        let mut delivered = 0;
        let mut dropped = Vec::new();
        for (id, conn) in conns.iter_mut() {
            match conn.tx.try_send(Arc::clone(&encoded)) {
                Ok(()) => {
                    conn.failures = 0;
                    delivered += 1;
                }
                Err(TrySendError::Full(_)) => {
                    conn.failures += 1;
                    if conn.failures >= max_failures {
                        tracing::warn!(
                            connection = id,
                            ?channel,
                            failures = conn.failures,
                            "dropping slow connection"
                        );
                        dropped.push(*id);
                    }
                }
                Err(TrySendError::Closed(_)) => dropped.push(*id),
            }
        }
        for id in dropped {
            conns.remove(&id);
        }
        if conns.is_empty() {
            registry.channels.remove(&channel);
        }
        delivered
    }

    /// Push a box's state to its operator channel and, when public, to its
    /// public channel.
    pub fn publish_state(
        &self,
        state: &BoxState,
        rules: &dyn RulesEngine,
        time_criterion_enabled: bool,
    ) -> usize {
        let mut delivered = self.publish(
            Channel::Box(state.box_id),
            &ServerMessage::StateSnapshot(StateSnapshot::of(state, time_criterion_enabled)),
        );
        if self.connection_count(Channel::Public(state.box_id)) > 0 {
            if let Some(public) = StateSnapshot::public(state, rules, time_criterion_enabled) {
                delivered += self.publish(
                    Channel::Public(state.box_id),
                    &ServerMessage::StateSnapshot(public),
                );
            }
        }
        delivered
    }

    pub fn connection_count(&self, channel: Channel) -> usize {
        self.inner
            .registry()
            .channels
            .get(&channel)
            .map_or(0, HashMap::len)
    }

    pub fn total_connections(&self) -> usize {
        self.inner
            .registry()
            .channels
            .values()
            .map(HashMap::len)
            .sum()
    }

    /// Boxes with at least one connection on either channel, ascending.
    pub fn watched_boxes(&self) -> Vec<BoxId> {
        let mut ids: Vec<BoxId> = self
            .inner
            .registry()
            .channels
            .keys()
            .map(|channel| channel.box_id())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}
