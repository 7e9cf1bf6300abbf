//! Group channel broker: attach/detach registry and chat fan-out.
//!
//! DESIGN
//! ======
//! One broker per process, cloned into every connection task. The registry
//! maps `group_id -> GroupChannel` and keeps a reverse `connection -> group`
//! index under the same lock, so a connection can be found and removed
//! without knowing its group, and can never sit in two channels.
//!
//! The registry stores a `Recipient` per connection: the sender's identity
//! and the bounded outbox feeding that connection's socket writer. It never
//! sees the socket itself.
//!
//! LIFECYCLE
//! =========
//! `Unattached -> Attached -> Closed`. `authorize` resolves the group through
//! the directory and yields an `AttachPermit`; `attach` consumes it. `detach`
//! is idempotent and always lands in `Closed`.
//!
//! BROADCAST
//! =========
//! Recipients are snapshotted under a read lock, the lock is released, and
//! each outbox gets an independent `try_send`. A closed or full outbox is an
//! implicit detach for that recipient only. Dropping a recipient's outbox
//! sender is what tells its connection task to shut down.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ChatConfig;
use crate::event::{ChatMessage, ErrorCode, GroupId, Identity, InboundMessage, Outbound};
use crate::services::groups::GroupDirectory;

pub type ConnectionId = Uuid;

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    #[error("unknown group: {0}")]
    UnknownGroup(GroupId),
    #[error("user {user_id} is not a member of group {group_id}")]
    NotMember { group_id: GroupId, user_id: i64 },
    #[error("connection error: {0}")]
    Connection(String),
    #[error("registry invariant violated: {0}")]
    RegistryInvariant(String),
    #[error("cannot attach a connection that is {0}")]
    InvalidTransition(ConnectionState),
    #[error("connection is not attached to a group")]
    NotAttached,
    #[error("group directory error: {0}")]
    Directory(#[from] sqlx::Error),
}

impl ErrorCode for ChatError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::MalformedMessage(_) => "E_MALFORMED_MESSAGE",
            Self::UnknownGroup(_) => "E_UNKNOWN_GROUP",
            Self::NotMember { .. } => "E_NOT_MEMBER",
            Self::Connection(_) => "E_CONNECTION",
            Self::RegistryInvariant(_) => "E_REGISTRY_INVARIANT",
            Self::InvalidTransition(_) | Self::NotAttached => "E_INVALID_STATE",
            Self::Directory(_) => "E_DIRECTORY",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Directory(_) | Self::Connection(_))
    }
}

// =============================================================================
// CONNECTION
// =============================================================================

/// Lifecycle position of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unattached,
    Attached(GroupId),
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unattached => f.write_str("unattached"),
            Self::Attached(group_id) => write!(f, "attached to group {group_id}"),
            Self::Closed => f.write_str("closed"),
        }
    }
}

/// One live chat session, owned by its connection task.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    identity: Identity,
    state: ConnectionState,
}

impl Connection {
    #[must_use]
    pub fn new(identity: Identity) -> Self {
        Self { id: Uuid::new_v4(), identity, state: ConnectionState::Unattached }
    }

    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    #[must_use]
    pub fn group_id(&self) -> Option<GroupId> {
        match self.state {
            ConnectionState::Attached(group_id) => Some(group_id),
            ConnectionState::Unattached | ConnectionState::Closed => None,
        }
    }
}

/// Proof that a user may attach to a group. Only `GroupBroker::authorize`
/// builds one.
#[derive(Debug)]
pub struct AttachPermit {
    group_id: GroupId,
    group_name: String,
    user_id: i64,
}

impl AttachPermit {
    #[must_use]
    pub fn group_id(&self) -> GroupId {
        self.group_id
    }

    #[must_use]
    pub fn group_name(&self) -> &str {
        &self.group_name
    }
}

// =============================================================================
// REGISTRY
// =============================================================================

/// Broker-level knobs, split out of [`ChatConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerPolicy {
    pub echo_to_sender: bool,
    pub require_membership: bool,
    pub max_message_chars: usize,
}

impl From<&ChatConfig> for BrokerPolicy {
    fn from(config: &ChatConfig) -> Self {
        Self {
            echo_to_sender: config.echo_to_sender,
            require_membership: config.require_membership,
            max_message_chars: config.max_message_chars,
        }
    }
}

#[derive(Clone)]
struct Recipient {
    identity: Identity,
    outbox: mpsc::Sender<Outbound>,
}

/// Connections sharing one group ID.
#[derive(Default)]
struct GroupChannel {
    members: HashMap<ConnectionId, Recipient>,
}

#[derive(Default)]
struct Registry {
    channels: HashMap<GroupId, GroupChannel>,
    /// Reverse index: which channel each connection sits in.
    index: HashMap<ConnectionId, GroupId>,
    /// Set by `close_all`; refuses further attaches.
    closed: bool,
}

impl Registry {
    /// Remove `connection_id` from `group_id`, dropping the channel if it
    /// empties. Only removes when `outbox` (if given) is the registered one.
    fn remove(
        &mut self,
        group_id: GroupId,
        connection_id: ConnectionId,
        outbox: Option<&mpsc::Sender<Outbound>>,
    ) -> Result<bool, ChatError> {
        let Some(channel) = self.channels.get_mut(&group_id) else {
            return if self.index.get(&connection_id) == Some(&group_id) {
                self.index.remove(&connection_id);
                Err(ChatError::RegistryInvariant(format!(
                    "connection {connection_id} indexed under missing group {group_id}"
                )))
            } else {
                Ok(false)
            };
        };

        let matches = match (channel.members.get(&connection_id), outbox) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(recipient), Some(tx)) => recipient.outbox.same_channel(tx),
        };
        if !matches {
            return Ok(false);
        }

        channel.members.remove(&connection_id);
        if channel.members.is_empty() {
            self.channels.remove(&group_id);
        }

        match self.index.remove(&connection_id) {
            Some(indexed) if indexed == group_id => Ok(true),
            Some(indexed) => Err(ChatError::RegistryInvariant(format!(
                "connection {connection_id} removed from group {group_id} but indexed under {indexed}"
            ))),
            None => Err(ChatError::RegistryInvariant(format!(
                "connection {connection_id} removed from group {group_id} without an index entry"
            ))),
        }
    }
}

// =============================================================================
// REPORTS
// =============================================================================

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Recipients whose outbox accepted the event.
    pub delivered: usize,
    /// Recipients dropped because their outbox was closed or full.
    pub evicted: usize,
}

/// Live chat participant, as served by the participants endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Participant {
    pub connection_id: ConnectionId,
    pub user_id: i64,
    pub username: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BrokerStats {
    pub groups: usize,
    pub connections: usize,
}

// =============================================================================
// BROKER
// =============================================================================

/// Process-wide chat router. Clone is cheap; all clones share one registry.
#[derive(Clone)]
pub struct GroupBroker {
    registry: Arc<RwLock<Registry>>,
    directory: Arc<dyn GroupDirectory>,
    policy: BrokerPolicy,
}

impl GroupBroker {
    #[must_use]
    pub fn new(directory: Arc<dyn GroupDirectory>, policy: BrokerPolicy) -> Self {
        Self { registry: Arc::new(RwLock::new(Registry::default())), directory, policy }
    }

    /// Resolve `group_id` and check that `identity` may listen on it.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::UnknownGroup`] if the group does not resolve,
    /// [`ChatError::NotMember`] if membership is required and missing, or
    /// [`ChatError::Directory`] if the directory lookup fails.
    pub async fn authorize(&self, group_id: GroupId, identity: &Identity) -> Result<AttachPermit, ChatError> {
        let Some(group) = self.directory.find_group(group_id).await? else {
            return Err(ChatError::UnknownGroup(group_id));
        };

        if self.policy.require_membership && !self.directory.is_member(group_id, identity.user_id).await? {
            return Err(ChatError::NotMember { group_id, user_id: identity.user_id });
        }

        Ok(AttachPermit { group_id: group.id, group_name: group.name, user_id: identity.user_id })
    }

    /// Register `conn` under the permit's group. Events for the group are
    /// delivered into `outbox` from now on.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::InvalidTransition`] unless `conn` is unattached,
    /// [`ChatError::NotMember`] if the permit was issued to another user, and
    /// [`ChatError::Connection`] once the broker has been shut down.
    pub async fn attach(
        &self,
        conn: &mut Connection,
        permit: AttachPermit,
        outbox: mpsc::Sender<Outbound>,
    ) -> Result<(), ChatError> {
        if conn.state != ConnectionState::Unattached {
            return Err(ChatError::InvalidTransition(conn.state));
        }
        if permit.user_id != conn.identity.user_id {
            return Err(ChatError::NotMember { group_id: permit.group_id, user_id: conn.identity.user_id });
        }

        let group_id = permit.group_id;
        let mut registry = self.registry.write().await;
        if registry.closed {
            return Err(ChatError::Connection("broker is shutting down".into()));
        }
        if let Some(existing) = registry.index.get(&conn.id) {
            return Err(ChatError::RegistryInvariant(format!(
                "connection {} already indexed under group {existing}",
                conn.id
            )));
        }

        let channel = registry.channels.entry(group_id).or_default();
        channel.members.insert(conn.id, Recipient { identity: conn.identity.clone(), outbox });
        let members = channel.members.len();
        registry.index.insert(conn.id, group_id);
        drop(registry);

        conn.state = ConnectionState::Attached(group_id);
        info!(connection_id = %conn.id, group_id, user = %conn.identity.username, members, "chat: attached");
        Ok(())
    }

    /// Remove `conn` from its channel. Safe to call any number of times and
    /// on connections that never attached; always leaves `conn` closed.
    pub async fn detach(&self, conn: &mut Connection) {
        if let ConnectionState::Attached(group_id) = conn.state {
            let result = self.registry.write().await.remove(group_id, conn.id, None);
            match result {
                Ok(true) => info!(connection_id = %conn.id, group_id, "chat: detached"),
                // Already evicted by a failed broadcast.
                Ok(false) => debug!(connection_id = %conn.id, group_id, "chat: detach after eviction"),
                Err(e) => warn!(connection_id = %conn.id, group_id, error = %e, "chat: detach"),
            }
        }
        conn.state = ConnectionState::Closed;
    }

    /// Parse one inbound frame from `conn` and fan it out to its group.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::NotAttached`] unless `conn` is attached and still
    /// registered (an evicted connection no longer is), and
    /// [`ChatError::MalformedMessage`] for payloads without a usable
    /// `message` string. Neither changes the connection's state.
    pub async fn dispatch(&self, conn: &Connection, raw: &str) -> Result<BroadcastReport, ChatError> {
        let ConnectionState::Attached(group_id) = conn.state else {
            return Err(ChatError::NotAttached);
        };
        if self.registry.read().await.index.get(&conn.id) != Some(&group_id) {
            debug!(connection_id = %conn.id, group_id, "chat: dispatch from evicted connection");
            return Err(ChatError::NotAttached);
        }

        let message = self.parse(&conn.identity, raw)?;
        if self.policy.echo_to_sender {
            Ok(self.broadcast(group_id, &message).await)
        } else {
            Ok(self.fan_out(group_id, &message, Some(conn.id)).await)
        }
    }

    /// Deliver `message` to every connection registered under `group_id`.
    pub async fn broadcast(&self, group_id: GroupId, message: &ChatMessage) -> BroadcastReport {
        self.fan_out(group_id, message, None).await
    }

    /// Drop every registered outbox and refuse new attaches. Each connection
    /// task sees its outbox close, exits, and detaches.
    pub async fn close_all(&self) -> usize {
        let mut registry = self.registry.write().await;
        registry.closed = true;
        let connections = registry.index.len();
        registry.channels.clear();
        registry.index.clear();
        info!(connections, "chat: broker closed");
        connections
    }

    /// Live participants of `group_id`, ordered by username.
    pub async fn participants(&self, group_id: GroupId) -> Vec<Participant> {
        let registry = self.registry.read().await;
        let Some(channel) = registry.channels.get(&group_id) else {
            return Vec::new();
        };
        let mut participants: Vec<Participant> = channel
            .members
            .iter()
            .map(|(connection_id, recipient)| Participant {
                connection_id: *connection_id,
                user_id: recipient.identity.user_id,
                username: recipient.identity.username.clone(),
            })
            .collect();
        participants.sort_by(|a, b| {
            a.username
                .cmp(&b.username)
                .then(a.connection_id.cmp(&b.connection_id))
        });
        participants
    }

    pub async fn stats(&self) -> BrokerStats {
        let registry = self.registry.read().await;
        BrokerStats { groups: registry.channels.len(), connections: registry.index.len() }
    }

    /// Whether `connection_id` is currently registered in any channel.
    #[cfg(test)]
    pub async fn is_registered(&self, connection_id: ConnectionId) -> bool {
        self.registry.read().await.index.contains_key(&connection_id)
    }

    // =========================================================================
    // INTERNALS
    // =========================================================================

    fn parse(&self, sender: &Identity, raw: &str) -> Result<ChatMessage, ChatError> {
        let inbound = InboundMessage::parse(raw).map_err(|e| ChatError::MalformedMessage(e.to_string()))?;
        let chars = inbound.message.chars().count();
        if chars > self.policy.max_message_chars {
            return Err(ChatError::MalformedMessage(format!(
                "message is {chars} characters, limit is {}",
                self.policy.max_message_chars
            )));
        }
        Ok(ChatMessage { sender: sender.clone(), text: inbound.message })
    }

    async fn fan_out(&self, group_id: GroupId, message: &ChatMessage, exclude: Option<ConnectionId>) -> BroadcastReport {
        // PHASE: SNAPSHOT RECIPIENTS
        // WHY: per-recipient sends happen without holding the registry lock.
        let recipients: Vec<(ConnectionId, mpsc::Sender<Outbound>)> = {
            let registry = self.registry.read().await;
            let Some(channel) = registry.channels.get(&group_id) else {
                return BroadcastReport::default();
            };
            channel
                .members
                .iter()
                .filter(|(connection_id, _)| exclude != Some(**connection_id))
                .map(|(connection_id, recipient)| (*connection_id, recipient.outbox.clone()))
                .collect()
        };

        // PHASE: INDEPENDENT DELIVERY
        let event = Outbound::from(message);
        let mut report = BroadcastReport::default();
        let mut failed = Vec::new();
        for (connection_id, outbox) in recipients {
            match outbox.try_send(event.clone()) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(%connection_id, group_id, "chat: recipient outbox full; evicting");
                    failed.push((connection_id, outbox));
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(%connection_id, group_id, "chat: recipient outbox closed; evicting");
                    failed.push((connection_id, outbox));
                }
            }
        }

        // PHASE: IMPLICIT DETACH
        if !failed.is_empty() {
            let mut registry = self.registry.write().await;
            for (connection_id, outbox) in &failed {
                match registry.remove(group_id, *connection_id, Some(outbox)) {
                    Ok(true) => report.evicted += 1,
                    Ok(false) => {}
                    Err(e) => warn!(%connection_id, group_id, error = %e, "chat: eviction"),
                }
            }
        }

        debug!(
            group_id,
            from = %message.sender.username,
            delivered = report.delivered,
            evicted = report.evicted,
            "chat: broadcast"
        );
        report
    }
}

#[cfg(test)]
#[path = "broker_test.rs"]
mod tests;
