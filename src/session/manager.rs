//! Session lifecycle, subscriptions and message routing
//!
//! The manager owns everything shared between connections: the match tree,
//! the registry of live sessions, the per-client mailboxes (queues of live
//! sessions and of offline persistent sessions) and the collaborators used
//! to persist state and announce events.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tracing::{debug, info, trace, warn};

use super::{CloseReason, Session, SessionChannels, SessionError, SessionInfo, SessionRegistry, SessionState};
use crate::auth::{AclAction, Authenticator};
use crate::config::Config;
use crate::events::{Event, EventBus, EventDetail, EventType};
use crate::message::{now_millis, Message};
use crate::protocol::{ProtocolVersion, QoS};
use crate::queue::{PersistentQueue, Queue, TransientQueue};
use crate::stats::{self, Stats};
use crate::storage::{SessionStore, StoredMessage, StoredSession, StoredSubscription};
use crate::topic::{Delivery, TopicTree};

/// How long a takeover waits for the previous session to close
const TAKEOVER_TIMEOUT: Duration = Duration::from_secs(5);

/// Queue a client's messages are routed into, live or offline
#[derive(Clone)]
struct Mailbox {
    queue: Arc<dyn Queue>,
    username: Option<String>,
    /// Session that created the mailbox, 0 for sessions restored from storage
    owner: u64,
}

/// Accepted CONNECT, after client id assignment and authentication
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub client_id: Arc<str>,
    pub protocol_version: ProtocolVersion,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub username: Option<String>,
    /// Will message, mount point already applied
    pub will: Option<Message>,
}

/// Result of a successful connect
pub struct Connected {
    pub session: Arc<Session>,
    pub session_present: bool,
    pub channels: SessionChannels,
}

pub struct SessionManager {
    config: Arc<Config>,
    broker_id: Arc<str>,
    tree: TopicTree,
    registry: SessionRegistry,
    mailboxes: DashMap<Arc<str>, Mailbox, ahash::RandomState>,
    store: Arc<dyn SessionStore>,
    auth: Arc<dyn Authenticator>,
    bus: Arc<EventBus>,
    stats: Arc<Stats>,
    next_session_id: AtomicU64,
}

impl SessionManager {
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn SessionStore>,
        auth: Arc<dyn Authenticator>,
        bus: Arc<EventBus>,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            broker_id: Arc::from(bus.broker_id()),
            tree: TopicTree::new(config.mqtt.upgrade_outgoing_qos),
            registry: SessionRegistry::new(),
            mailboxes: DashMap::default(),
            // Session ids stay unique across restarts
            next_session_id: AtomicU64::new(now_millis().max(1)),
            config,
            store,
            auth,
            bus,
            stats,
        }
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn broker_id(&self) -> &str {
        &self.broker_id
    }

    pub fn auth(&self) -> &Arc<dyn Authenticator> {
        &self.auth
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    pub fn topics(&self) -> &TopicTree {
        &self.tree
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    // ========================================================================
    // Startup
    // ========================================================================

    /// Rebuild subscriptions, offline mailboxes and retained messages from the store
    ///
    /// Clean sessions left behind by an unclean stop are deleted.
    pub async fn restore(&self) -> Result<(), SessionError> {
        let mut restored = 0usize;
        for mut stored in self.store.list_sessions().await? {
            if stored.clean_session {
                self.store.delete_session(&stored.client_id).await?;
                continue;
            }

            let client_id: Arc<str> = Arc::from(stored.client_id.as_str());
            for sub in self.store.find_subscriptions(&stored.client_id).await? {
                let qos = QoS::from_u8(sub.qos).unwrap_or_default();
                self.tree.subscribe(&client_id, &sub.filter, qos);
            }
            if stored.connected {
                stored.connected = false;
                stored.updated_at = now_millis();
                self.store.update_session(&stored).await?;
            }

            let queue = Arc::new(PersistentQueue::new(
                client_id.clone(),
                self.store.clone(),
                self.config.session.msg_queue_size,
            ));
            self.mailboxes.insert(
                client_id,
                Mailbox {
                    queue,
                    username: stored.username,
                    owner: 0,
                },
            );
            restored += 1;
        }

        let retained = self.store.find_retained().await?;
        let retained_count = retained.len();
        for message in retained {
            self.tree.set_retained(message.into_message());
        }

        info!(
            "Restored {} persistent sessions and {} retained messages",
            restored, retained_count
        );
        Ok(())
    }

    /// Register the handlers that apply peer broker events locally
    pub fn install_handlers(self: &Arc<Self>) {
        for event_type in [EventType::SessionCreated, EventType::SessionResumed] {
            let manager = Arc::downgrade(self);
            self.bus.subscribe_fn(event_type, move |event| {
                let manager = manager.clone();
                async move {
                    if let Some(manager) = manager.upgrade() {
                        manager.on_peer_session(&event);
                    }
                    Ok(())
                }
            });
        }

        let manager = Arc::downgrade(self);
        self.bus.subscribe_fn(EventType::TopicPublished, move |event| {
            let manager = manager.clone();
            async move {
                if let Some(manager) = manager.upgrade() {
                    manager.on_peer_publish(&event).await;
                }
                Ok(())
            }
        });
    }

    fn on_peer_session(&self, event: &Event) {
        if event.broker_id.as_str() == &*self.broker_id {
            return;
        }
        if let Some(session) = self.registry.get(&event.client_id) {
            info!(
                "{}: client connected to broker {}, closing local session",
                event.client_id, event.broker_id
            );
            session.kick(CloseReason::TakenOver);
        }
    }

    async fn on_peer_publish(&self, event: &Event) {
        if event.broker_id.as_str() == &*self.broker_id {
            return;
        }
        let message = Message::new(
            event.topic.as_str(),
            event.payload.clone(),
            event.qos,
            event.retain,
        );
        let delivered = self.route(&message).await;
        trace!(
            "{}: peer message on '{}' delivered to {} local clients",
            event.client_id,
            event.topic,
            delivered
        );
    }

    // ========================================================================
    // Connect / disconnect
    // ========================================================================

    /// Create or resume the session for an accepted CONNECT
    ///
    /// An existing live session with the same client id is taken over
    /// first. State is resumed only when both the stored session and the
    /// new CONNECT are persistent; otherwise all previous state is dropped.
    pub async fn connect(&self, request: ConnectRequest) -> Result<Connected, SessionError> {
        let client_id = request.client_id.clone();
        self.take_over(&client_id).await;

        let stored = self.store.find_session(&client_id).await?;
        let resume = !request.clean_session && stored.as_ref().is_some_and(|s| !s.clean_session);
        if !resume {
            self.discard(&client_id).await?;
        }

        let existing = self.mailboxes.get(&*client_id).map(|m| m.queue.clone());
        let queue: Arc<dyn Queue> = match existing {
            Some(queue) if resume => queue,
            _ if request.clean_session => Arc::new(TransientQueue::new(
                client_id.clone(),
                self.config.session.msg_queue_size,
            )),
            _ => Arc::new(PersistentQueue::new(
                client_id.clone(),
                self.store.clone(),
                self.config.session.msg_queue_size,
            )),
        };

        if resume {
            self.purge_unreadable(&client_id, request.username.clone()).await?;
        }

        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let info = SessionInfo {
            client_id: client_id.clone(),
            session_id,
            broker_id: self.broker_id.clone(),
            protocol_version: request.protocol_version,
            clean_session: request.clean_session,
            keep_alive: request.keep_alive,
            username: request.username.clone(),
        };
        let (session, channels) = Session::new(
            info,
            queue.clone(),
            request.will,
            self.config.session.queue_size,
        );
        let session = Arc::new(session);
        queue.register_observer(session.queue_observer());

        self.store
            .register_session(&StoredSession {
                client_id: client_id.to_string(),
                session_id: session_id.to_string(),
                broker_id: self.broker_id.to_string(),
                protocol_version: request.protocol_version as u8,
                clean_session: request.clean_session,
                keep_alive: request.keep_alive,
                username: request.username.clone(),
                connected: true,
                updated_at: now_millis(),
            })
            .await?;

        self.mailboxes.insert(
            client_id.clone(),
            Mailbox {
                queue,
                username: request.username,
                owner: session_id,
            },
        );
        self.registry.register(session.clone());
        session.transition(SessionState::Connected)?;

        self.stats.incr(stats::CONNECTIONS_ACTIVE);
        let event_type = if resume {
            EventType::SessionResumed
        } else {
            EventType::SessionCreated
        };
        self.bus.publish(
            Event::new(event_type, &*self.broker_id, &*client_id)
                .with_persistent(!request.clean_session)
                .with_detail(EventDetail::Session {
                    clean_session: request.clean_session,
                    protocol_version: request.protocol_version as u8,
                    session_present: resume,
                }),
        );
        self.publish_quota(stats::CONNECTIONS_ACTIVE);

        debug!(
            "{}: session {} {} (clean_session={})",
            client_id,
            session_id,
            if resume { "resumed" } else { "created" },
            request.clean_session
        );

        Ok(Connected {
            session,
            session_present: resume,
            channels,
        })
    }

    async fn take_over(&self, client_id: &str) {
        let Some(existing) = self.registry.get(client_id) else {
            return;
        };
        debug!("{}: taking over session {}", client_id, existing.session_id());
        existing.kick(CloseReason::TakenOver);
        if tokio::time::timeout(TAKEOVER_TIMEOUT, existing.wait_disconnected())
            .await
            .is_err()
        {
            warn!("{}: previous session did not close in time", client_id);
        }
    }

    /// Drop every trace of a client's previous session
    async fn discard(&self, client_id: &str) -> Result<(), SessionError> {
        self.tree.unsubscribe_all(client_id);
        if let Some((_, mailbox)) = self.mailboxes.remove(client_id) {
            mailbox.queue.close();
        }
        self.store.delete_session(client_id).await?;
        Ok(())
    }

    /// Remove stored messages the client is no longer allowed to read
    async fn purge_unreadable(
        &self,
        client_id: &Arc<str>,
        username: Option<String>,
    ) -> Result<(), SessionError> {
        let auth = self.auth.clone();
        let owner = client_id.clone();
        let validator = move |message: &StoredMessage| {
            auth.check_acl(&owner, username.as_deref(), &message.topic, AclAction::Read)
                .is_ok()
        };
        let purged = self
            .store
            .delete_message_with_validator(client_id, &validator)
            .await?;
        if purged > 0 {
            debug!("{}: purged {} messages no longer readable", client_id, purged);
        }
        Ok(())
    }

    /// Run the disconnect routine; calls after the first are no-ops
    ///
    /// The will is published only for an unclean close that was neither a
    /// takeover nor a broker shutdown.
    pub async fn disconnect(&self, session: &Arc<Session>, graceful: bool) {
        if session.transition(SessionState::Disconnecting).is_err() {
            return;
        }
        let client_id = session.client_id();
        let reason = session.close_reason();

        if let Some(will) = session.take_will() {
            if !graceful && reason.is_none() {
                self.publish_will(session, will).await;
            }
        }

        // A session that lost a takeover race must leave its successor's state alone
        let current = self
            .registry
            .get(client_id)
            .map_or(true, |s| s.session_id() == session.session_id());

        if session.clean_session() {
            self.mailboxes
                .remove_if(&**client_id, |_, m| m.owner == session.session_id());
            session.queue().close();
            if current {
                self.tree.unsubscribe_all(client_id);
                if let Err(e) = self.store.delete_session(client_id).await {
                    warn!("{}: failed to delete session: {}", client_id, e);
                }
            }
        } else {
            session.queue().clear_observer();
            if current {
                self.mark_offline(session).await;
            }
        }

        self.registry.remove_if(client_id, session.session_id());
        session.stop_sender();
        let _ = session.transition(SessionState::Disconnected);

        self.stats.sub(stats::CONNECTIONS_ACTIVE, 1);
        self.bus.publish(
            Event::new(EventType::SessionDestroyed, &*self.broker_id, &**client_id)
                .with_persistent(!session.clean_session()),
        );
        self.publish_quota(stats::CONNECTIONS_ACTIVE);

        debug!(
            "{}: session {} closed (graceful={}, reason={:?})",
            client_id,
            session.session_id(),
            graceful,
            reason
        );
    }

    async fn mark_offline(&self, session: &Session) {
        let info = session.info();
        let record = StoredSession {
            client_id: info.client_id.to_string(),
            session_id: info.session_id.to_string(),
            broker_id: self.broker_id.to_string(),
            protocol_version: info.protocol_version as u8,
            clean_session: false,
            keep_alive: info.keep_alive,
            username: info.username.clone(),
            connected: false,
            updated_at: now_millis(),
        };
        if let Err(e) = self.store.update_session(&record).await {
            warn!("{}: failed to update session: {}", info.client_id, e);
        }
    }

    async fn publish_will(&self, session: &Session, will: Message) {
        let client_id = session.client_id();
        if self
            .auth
            .check_acl(client_id, session.username(), &will.topic, AclAction::Write)
            .is_err()
        {
            debug!("{}: will topic '{}' not authorized", client_id, will.topic);
            return;
        }
        debug!("{}: publishing will on '{}'", client_id, will.topic);
        self.publish(client_id, will).await;
    }

    /// Ask every live session to close
    pub fn kick_all(&self, reason: CloseReason) {
        for session in self.registry.all() {
            session.kick(reason);
        }
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// Subscribe a session to a mounted filter at the granted QoS
    ///
    /// Returns the retained messages the session may read, ready to be
    /// queued after the SUBACK.
    pub async fn subscribe(
        &self,
        session: &Session,
        filter: &str,
        qos: QoS,
    ) -> Result<Vec<Message>, SessionError> {
        let client_id = session.client_id();
        self.tree.subscribe(client_id, filter, qos);
        if !session.clean_session() {
            self.store
                .add_subscription(
                    client_id,
                    &StoredSubscription {
                        filter: filter.to_string(),
                        qos: qos as u8,
                    },
                )
                .await?;
        }

        self.bus.publish(
            Event::new(EventType::TopicSubscribed, &*self.broker_id, &**client_id)
                .with_topic(filter)
                .with_message(Bytes::new(), qos, false)
                .with_persistent(!session.clean_session()),
        );

        let upgrade = self.config.mqtt.upgrade_outgoing_qos;
        let retained = self
            .tree
            .retained_for(filter)
            .into_iter()
            .filter(|m| {
                self.auth
                    .check_acl(client_id, session.username(), &m.topic, AclAction::Read)
                    .is_ok()
            })
            .map(|m| {
                let qos = if upgrade { qos } else { qos.min(m.qos) };
                m.for_subscriber(qos)
            })
            .collect();
        Ok(retained)
    }

    /// Remove a subscription; returns whether it existed
    pub async fn unsubscribe(&self, session: &Session, filter: &str) -> Result<bool, SessionError> {
        let client_id = session.client_id();
        let removed = self.tree.unsubscribe(client_id, filter);
        if !session.clean_session() {
            self.store.remove_subscription(client_id, filter).await?;
        }

        self.bus.publish(
            Event::new(EventType::TopicUnsubscribed, &*self.broker_id, &**client_id)
                .with_topic(filter)
                .with_persistent(!session.clean_session()),
        );
        Ok(removed)
    }

    // ========================================================================
    // Routing
    // ========================================================================

    /// Route a message published by a local client and announce it to the cluster
    ///
    /// Returns the number of local subscribers it was queued for.
    pub async fn publish(&self, client_id: &str, message: Message) -> usize {
        self.stats.incr(stats::MESSAGES_RECEIVED);
        let delivered = self.route(&message).await;

        self.bus.publish(
            Event::new(EventType::TopicPublished, &*self.broker_id, client_id)
                .with_topic(&*message.topic)
                .with_message(message.payload.clone(), message.qos, message.retain),
        );
        delivered
    }

    /// Deliver a message to the matching local subscribers
    ///
    /// Retained state in the tree and the store is updated first.
    pub async fn route(&self, message: &Message) -> usize {
        let deliveries = self.tree.publish(message);
        if message.retain {
            self.persist_retained(message).await;
        }

        let mut delivered = 0;
        for delivery in &deliveries {
            if self.deliver(delivery, message).await {
                delivered += 1;
            }
        }
        delivered
    }

    async fn deliver(&self, delivery: &Delivery, message: &Message) -> bool {
        let Some(mailbox) = self.mailboxes.get(&*delivery.client_id).map(|m| m.clone()) else {
            trace!("{}: no mailbox, dropping message", delivery.client_id);
            return false;
        };
        if self
            .auth
            .check_acl(
                &delivery.client_id,
                mailbox.username.as_deref(),
                &message.topic,
                AclAction::Read,
            )
            .is_err()
        {
            debug!(
                "{}: not authorized to read '{}'",
                delivery.client_id, message.topic
            );
            return false;
        }

        let mut copy = message.for_subscriber(delivery.qos);
        copy.retain = false;
        match mailbox.queue.write(copy).await {
            Ok(()) => true,
            Err(e) => {
                self.stats.incr(stats::MESSAGES_DROPPED);
                debug!("{}: dropping message: {}", delivery.client_id, e);
                false
            }
        }
    }

    async fn persist_retained(&self, message: &Message) {
        let stored = if message.payload.is_empty() {
            None
        } else {
            let mut retained = message.clone();
            retained.dup = false;
            retained.packet_id = None;
            Some(StoredMessage::from(&retained))
        };
        if let Err(e) = self
            .store
            .retain_subscription(&message.topic, stored.as_ref())
            .await
        {
            warn!("Failed to persist retained message on '{}': {}", message.topic, e);
        }
    }

    fn publish_quota(&self, counter: &str) {
        self.bus.publish(
            Event::new(EventType::QuotaChanged, &*self.broker_id, "").with_detail(
                EventDetail::Quota {
                    counter: counter.to_string(),
                    value: self.stats.get(counter),
                },
            ),
        );
    }
}
