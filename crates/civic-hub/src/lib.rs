//! Topic-based real-time fan-out for live connections.
//!
//! The hub tracks which live connections belong to which [`Topic`] and
//! pushes serialized events to them. It holds no business logic: topic names
//! are conventions agreed between the ticket service and clients.
//!
//! # Delivery
//!
//! Delivery is best-effort and at-most-once. Each connection owns a bounded
//! outbound queue; a full queue drops the event for that connection only,
//! and a closed queue marks the connection dead so it is removed after the
//! publish. Events published to one topic reach a given connection in
//! publish order. Nothing is guaranteed across topics.
//!
//! # Lifecycle
//!
//! The hub is constructed once at process start and shared by cloning. On
//! [`PubSubHub::connect`] a connection joins `user:<id>` and, for staff and
//! admins, `role:staff-or-admin`. [`PubSubHub::disconnect`] removes it from
//! every topic immediately. [`PubSubHub::close`] ends the hub: all sessions
//! are dropped and later publishes fail with [`HubError::Closed`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use civic_types::{Role, Topic};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// Identifier of one live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Errors returned by hub operations.
#[derive(Debug, Error)]
pub enum HubError {
    /// The hub has been shut down.
    #[error("pub/sub hub is closed")]
    Closed,

    /// No live connection has this id.
    #[error("unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    /// The event payload could not be serialized.
    #[error("failed to serialize event: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Wire shape of every pushed event.
#[derive(Debug, Serialize)]
struct Envelope<'a, P: Serialize> {
    event: &'a str,
    topic: &'a Topic,
    payload: &'a P,
}

struct Session {
    user_id: String,
    sender: mpsc::Sender<String>,
    topics: HashSet<Topic>,
}

#[derive(Default)]
struct HubInner {
    /// Live sessions, keyed by connection. Each session carries the reverse
    /// index of its topics.
    sessions: RwLock<HashMap<ConnectionId, Session>>,
    /// Topic membership.
    topics: RwLock<HashMap<Topic, HashSet<ConnectionId>>>,
    closed: AtomicBool,
}

/// Subscription registry and publisher.
///
/// Lock ordering: `sessions` before `topics`, in every method.
#[derive(Clone, Default)]
pub struct PubSubHub {
    inner: Arc<HubInner>,
}

impl PubSubHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a live connection and joins its automatic topics.
    ///
    /// # Errors
    ///
    /// Returns `HubError::Closed` after [`PubSubHub::close`].
    pub async fn connect(
        &self,
        user_id: &str,
        role: Role,
        sender: mpsc::Sender<String>,
    ) -> Result<ConnectionId, HubError> {
        if self.is_closed() {
            return Err(HubError::Closed);
        }

        let id = ConnectionId::new();
        let mut auto_topics = HashSet::from([Topic::user(user_id)]);
        if role.is_staff_or_admin() {
            auto_topics.insert(Topic::StaffOrAdmin);
        }

        let mut sessions = self.inner.sessions.write().await;
        // `close` may have cleared the maps while we waited for the lock.
        if self.is_closed() {
            return Err(HubError::Closed);
        }
        let mut topics = self.inner.topics.write().await;
        for topic in &auto_topics {
            topics.entry(topic.clone()).or_default().insert(id);
        }
        sessions.insert(
            id,
            Session {
                user_id: user_id.to_string(),
                sender,
                topics: auto_topics,
            },
        );

        tracing::info!(
            connection_id = %id,
            user_id = %user_id,
            role = %role,
            "live connection registered"
        );
        Ok(id)
    }

    /// Removes a connection from every topic.
    ///
    /// Returns `false` if the connection was already gone.
    pub async fn disconnect(&self, id: ConnectionId) -> bool {
        let mut sessions = self.inner.sessions.write().await;
        let Some(session) = sessions.remove(&id) else {
            return false;
        };

        let mut topics = self.inner.topics.write().await;
        for topic in &session.topics {
            if let Some(members) = topics.get_mut(topic) {
                members.remove(&id);
                if members.is_empty() {
                    topics.remove(topic);
                }
            }
        }

        tracing::info!(
            connection_id = %id,
            user_id = %session.user_id,
            "live connection removed"
        );
        true
    }

    /// Adds a connection to `topic`. Joining twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `HubError::UnknownConnection` if the connection is not live.
    pub async fn join(&self, id: ConnectionId, topic: Topic) -> Result<(), HubError> {
        let mut sessions = self.inner.sessions.write().await;
        let session = sessions
            .get_mut(&id)
            .ok_or(HubError::UnknownConnection(id))?;

        let mut topics = self.inner.topics.write().await;
        topics.entry(topic.clone()).or_default().insert(id);
        tracing::debug!(connection_id = %id, topic = %topic, "joined topic");
        session.topics.insert(topic);
        Ok(())
    }

    /// Removes a connection from `topic`.
    ///
    /// Returns whether the connection was a member.
    ///
    /// # Errors
    ///
    /// Returns `HubError::UnknownConnection` if the connection is not live.
    pub async fn leave(&self, id: ConnectionId, topic: &Topic) -> Result<bool, HubError> {
        let mut sessions = self.inner.sessions.write().await;
        let session = sessions
            .get_mut(&id)
            .ok_or(HubError::UnknownConnection(id))?;
        let was_member = session.topics.remove(topic);

        let mut topics = self.inner.topics.write().await;
        if let Some(members) = topics.get_mut(topic) {
            members.remove(&id);
            if members.is_empty() {
                topics.remove(topic);
            }
        }
        Ok(was_member)
    }

    /// Pushes an event to every connection on `topic`.
    ///
    /// Returns how many connections accepted the event into their queue.
    /// Zero subscribers is not an error.
    ///
    /// # Errors
    ///
    /// Returns `HubError::Closed` after shutdown, or
    /// `HubError::Serialization` if `payload` cannot be encoded.
    pub async fn publish<P: Serialize>(
        &self,
        topic: &Topic,
        event: &str,
        payload: &P,
    ) -> Result<usize, HubError> {
        if self.is_closed() {
            return Err(HubError::Closed);
        }

        let frame = serde_json::to_string(&Envelope {
            event,
            topic,
            payload,
        })?;

        let mut delivered = 0;
        let mut dead = Vec::new();
        {
            let sessions = self.inner.sessions.read().await;
            let topics = self.inner.topics.read().await;
            let Some(members) = topics.get(topic) else {
                tracing::debug!(topic = %topic, event, "no live subscribers");
                return Ok(0);
            };

            for id in members {
                let Some(session) = sessions.get(id) else {
                    continue;
                };
                match session.sender.try_send(frame.clone()) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::warn!(
                            connection_id = %id,
                            topic = %topic,
                            event,
                            "dropping event for slow consumer"
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => dead.push(*id),
                }
            }
        }

        for id in dead {
            tracing::debug!(connection_id = %id, "pruning closed connection");
            self.disconnect(id).await;
        }

        Ok(delivered)
    }

    /// Shuts the hub down and drops every session.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let mut sessions = self.inner.sessions.write().await;
        let mut topics = self.inner.topics.write().await;
        let dropped = sessions.len();
        sessions.clear();
        topics.clear();
        tracing::info!(connections = dropped, "pub/sub hub closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Topics a connection currently belongs to, sorted.
    pub async fn topics_of(&self, id: ConnectionId) -> Option<Vec<Topic>> {
        let sessions = self.inner.sessions.read().await;
        sessions.get(&id).map(|session| {
            let mut topics: Vec<Topic> = session.topics.iter().cloned().collect();
            topics.sort();
            topics
        })
    }

    /// Number of connections on `topic`.
    pub async fn subscriber_count(&self, topic: &Topic) -> usize {
        let topics = self.inner.topics.read().await;
        topics.get(topic).map_or(0, HashSet::len)
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.sessions.read().await.len()
    }
}
