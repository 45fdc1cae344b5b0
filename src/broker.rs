// Copyright 2022 Webb Technologies Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The message broker: publish, acknowledgement, retained-until-delivered
//! storage, and cross-node fan-out.
//!
//! The broker deliberately owns very little: the registry it consults for
//! local subscribers, and an [`OutboundSink`] it pushes deliveries
//! through. It never holds the session layer itself. Cross-node traffic
//! flows over the store's per-topic channels; one listener task per topic
//! of local interest turns remote notifications into local deliveries.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures::prelude::*;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::history::{RequestHistory, StoredRequest, StoredResponse};
use crate::probe;
use crate::registry::SubscriptionRegistry;
use crate::retry::with_store_retries;
use crate::rpc;
use crate::session::close_code;
use crate::store::{RelayStore, RetainedMessage, TopicEvent};
use crate::types::{MessageHash, NodeId, SocketId, SubscriptionId, Topic};

/// The one handle the broker has to the session layer: a way to push a
/// delivery onto a socket's outbound queue, and a way to close a socket
/// that failed delivery.
pub trait OutboundSink: Send + Sync + 'static {
    /// Enqueues a server-initiated request on the socket's outbound
    /// queue, without blocking.
    fn try_send_request(
        &self,
        socket_id: &SocketId,
        request: &rpc::SubscriptionRequest,
    ) -> crate::Result<()>;

    /// Closes the socket with the given close code.
    fn close(&self, socket_id: &SocketId, code: u16);
}

/// Structured broker events, observable by the operator. Handlers must
/// never call back into the broker.
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    /// A message entered retention.
    MessageRetained {
        /// The topic the message belongs to.
        topic: Topic,
        /// The content hash of the message.
        message_hash: MessageHash,
    },
    /// Every eligible subscriber acknowledged; retention was released.
    MessageSettled {
        /// The topic the message belonged to.
        topic: Topic,
        /// The content hash of the message.
        message_hash: MessageHash,
    },
    /// A retention window elapsed without a full acknowledgement.
    MessageExpired {
        /// The topic the message belonged to.
        topic: Topic,
        /// The content hash of the message.
        message_hash: MessageHash,
    },
    /// The broker degraded: either a store failure exhausted its retries
    /// or cross-node fan-out dropped to local-only mode.
    Degraded {
        /// What went wrong.
        reason: String,
    },
}

#[derive(Debug, Default)]
struct AckState {
    expires_at: u64,
    /// socket -> the id of the outstanding `relay_subscription` request.
    waiting: HashMap<SocketId, u64>,
    acked: HashSet<SocketId>,
}

/// The message broker of one relay node.
pub struct MessageBroker<S> {
    node_id: NodeId,
    store: S,
    registry: Arc<SubscriptionRegistry>,
    history: Arc<RequestHistory<S>>,
    sink: Arc<dyn OutboundSink>,
    max_ttl_secs: u64,
    pending: Mutex<HashMap<(Topic, MessageHash), AckState>>,
    topic_tasks: Mutex<HashMap<Topic, JoinHandle<()>>>,
    next_request_id: AtomicU64,
    degraded: AtomicBool,
    local_only: AtomicBool,
    events: broadcast::Sender<BrokerEvent>,
}

impl<S> Drop for MessageBroker<S> {
    fn drop(&mut self) {
        for (_, handle) in self.topic_tasks.lock().drain() {
            handle.abort();
        }
    }
}

impl<S: RelayStore> MessageBroker<S> {
    /// Creates a broker with a fresh node identity.
    pub fn new(
        store: S,
        registry: Arc<SubscriptionRegistry>,
        history: Arc<RequestHistory<S>>,
        sink: Arc<dyn OutboundSink>,
        max_ttl_secs: u64,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            node_id: NodeId::generate(),
            store,
            registry,
            history,
            sink,
            max_ttl_secs,
            pending: Mutex::new(HashMap::new()),
            topic_tasks: Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(1),
            degraded: AtomicBool::new(false),
            local_only: AtomicBool::new(false),
            events,
        })
    }

    /// The identity this broker uses on the cross-node channels.
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// The subscription registry this broker consults.
    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Subscribes to structured broker events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }

    /// Whether the broker is rejecting new publishes.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Accepts a publish: retains the message, fans it out to local
    /// subscribers (skipping the publisher), and notifies peer nodes.
    /// Returns the content hash the retention entry is keyed by.
    pub async fn publish(
        self: &Arc<Self>,
        from: Option<&SocketId>,
        topic: &Topic,
        payload: &str,
        ttl_secs: u64,
    ) -> crate::Result<MessageHash> {
        if self.is_degraded() {
            return Err(crate::Error::BrokerUnavailable);
        }
        let ttl = ttl_secs.min(self.max_ttl_secs);
        let message = RetainedMessage::new(payload.to_owned(), ttl);
        let hash = message.message_hash.clone();
        eprintln!("DIAG: publish before insert_message");
        let retained = {
            let message = message.clone();
            with_store_retries(|| {
                self.store.insert_message(topic, message.clone())
            })
            .await
        };
        eprintln!("DIAG: publish after insert_message");
        match retained {
            // false means an unexpired entry already held this hash: the
            // publish is a no-op for retention but still fans out, since
            // peers may legitimately republish to recover a lost ack.
            Ok(freshly_retained) => {
                if freshly_retained {
                    tracing::event!(
                        target: probe::TARGET,
                        tracing::Level::DEBUG,
                        kind = %probe::Kind::Broker,
                        retained = %hash,
                        topic = %topic,
                    );
                    let _ = self.events.send(BrokerEvent::MessageRetained {
                        topic: topic.clone(),
                        message_hash: hash.clone(),
                    });
                }
            }
            Err(e) => {
                self.emit_degraded(&e);
                if !e.is_transient() {
                    self.degraded.store(true, Ordering::Relaxed);
                }
                return Err(e);
            }
        }
        eprintln!("DIAG: publish before ensure_topic_task");
        if let Err(e) = self.ensure_topic_task(topic) {
            // fan-out to local subscribers still works without a listener
            self.emit_degraded(&e);
        }
        eprintln!("DIAG: publish before deliver_local");
        self.deliver_local(topic, &message, from).await;
        eprintln!("DIAG: publish before broadcast_event");
        self.broadcast_event(
            topic,
            TopicEvent::Published {
                origin: self.node_id.clone(),
                topic: topic.clone(),
                message_hash: hash.clone(),
                payload: message.payload.clone(),
                expires_at: message.expires_at,
            },
        );
        Ok(hash)
    }

    /// Marks `(socket, topic, hash)` acknowledged. Once every socket that
    /// was notified has acknowledged, the retention entry is released.
    pub async fn acknowledge(
        &self,
        socket_id: &SocketId,
        topic: &Topic,
        hash: &MessageHash,
    ) -> crate::Result<()> {
        let key = (topic.clone(), hash.clone());
        let (request_id, settled) = {
            let mut pending = self.pending.lock();
            let Some(state) = pending.get_mut(&key) else {
                tracing::trace!("ack without a pending delivery on {topic}");
                return Ok(());
            };
            let Some(request_id) = state.waiting.remove(socket_id) else {
                return Ok(());
            };
            state.acked.insert(socket_id.clone());
            let settled = state.waiting.is_empty();
            if settled {
                pending.remove(&key);
            }
            (request_id, settled)
        };
        self.history
            .update(
                topic,
                request_id,
                StoredResponse::Success {
                    result: serde_json::Value::Bool(true),
                },
            )
            .await?;
        if settled {
            with_store_retries(|| self.store.remove_message(topic, hash))
                .await?;
            tracing::event!(
                target: probe::TARGET,
                tracing::Level::DEBUG,
                kind = %probe::Kind::Broker,
                settled = %hash,
                topic = %topic,
            );
            let _ = self.events.send(BrokerEvent::MessageSettled {
                topic: topic.clone(),
                message_hash: hash.clone(),
            });
            self.maybe_stop_topic_task(topic);
        }
        Ok(())
    }

    /// Delivers every unexpired retained message for `topic` to a socket
    /// that just subscribed, adding it to each message's pending-ack set.
    pub async fn on_new_subscriber(
        &self,
        socket_id: &SocketId,
        topic: &Topic,
    ) -> crate::Result<()> {
        let retained =
            with_store_retries(|| self.store.retained_messages(topic)).await?;
        for message in retained {
            self.deliver_to_socket(topic, &message, socket_id).await;
        }
        Ok(())
    }

    /// Installs a subscription: registry entry, retained-message flush,
    /// and, on first local interest, a `subscribe_request` on the topic's
    /// channel so peers drain their pending messages to us.
    pub async fn subscribe(
        self: &Arc<Self>,
        socket_id: &SocketId,
        topic: &Topic,
    ) -> crate::Result<SubscriptionId> {
        let outcome = self.registry.subscribe(socket_id, topic);
        let flushed = match self.ensure_topic_task(topic) {
            Ok(()) => self.on_new_subscriber(socket_id, topic).await,
            Err(e) => Err(e),
        };
        if let Err(e) = flushed {
            // unwind the partially installed subscription
            if outcome.created {
                self.registry.unsubscribe(socket_id, &outcome.id);
            }
            return Err(e);
        }
        if outcome.created && outcome.first_for_topic {
            tracing::event!(
                target: probe::TARGET,
                tracing::Level::DEBUG,
                kind = %probe::Kind::Registry,
                first_subscriber = true,
                topic = %topic,
            );
            self.broadcast_event(
                topic,
                TopicEvent::SubscribeRequest {
                    origin: self.node_id.clone(),
                    topic: topic.clone(),
                },
            );
        }
        Ok(outcome.id)
    }

    /// Revokes one subscription; advisory `subscribe_release` on last
    /// local interest. Silent when the id is unknown.
    pub fn unsubscribe(&self, socket_id: &SocketId, id: &SubscriptionId) {
        let Some(outcome) = self.registry.unsubscribe(socket_id, id) else {
            return;
        };
        if outcome.last_for_topic {
            self.broadcast_event(
                &outcome.topic,
                TopicEvent::SubscribeRelease {
                    origin: self.node_id.clone(),
                    topic: outcome.topic.clone(),
                },
            );
            self.maybe_stop_topic_task(&outcome.topic);
        }
    }

    /// Tears down everything the socket held: registry entries and ack
    /// obligations. Retention is untouched; unacked messages transfer to
    /// future subscribers.
    pub fn on_socket_closed(&self, socket_id: &SocketId) {
        let removed = self.registry.on_close(socket_id);
        {
            let mut pending = self.pending.lock();
            for state in pending.values_mut() {
                state.waiting.remove(socket_id);
            }
        }
        for outcome in removed {
            if outcome.last_for_topic {
                self.broadcast_event(
                    &outcome.topic,
                    TopicEvent::SubscribeRelease {
                        origin: self.node_id.clone(),
                        topic: outcome.topic.clone(),
                    },
                );
                self.maybe_stop_topic_task(&outcome.topic);
            }
        }
    }

    /// Drops expired retention entries and their ack state. Driven by
    /// the server beat.
    pub async fn purge_expired(&self) -> crate::Result<usize> {
        let removed =
            with_store_retries(|| self.store.purge_expired()).await?;
        let now = crate::store::now_secs();
        let expired: Vec<(Topic, MessageHash)> = {
            let mut pending = self.pending.lock();
            let keys: Vec<_> = pending
                .iter()
                .filter(|(_, state)| state.expires_at <= now)
                .map(|(key, _)| key.clone())
                .collect();
            for key in &keys {
                pending.remove(key);
            }
            keys
        };
        for (topic, message_hash) in expired {
            tracing::event!(
                target: probe::TARGET,
                tracing::Level::DEBUG,
                kind = %probe::Kind::Broker,
                expired = %message_hash,
                topic = %topic,
            );
            let _ = self.events.send(BrokerEvent::MessageExpired {
                topic: topic.clone(),
                message_hash,
            });
            self.maybe_stop_topic_task(&topic);
        }
        Ok(removed)
    }

    async fn deliver_local(
        &self,
        topic: &Topic,
        message: &RetainedMessage,
        skip: Option<&SocketId>,
    ) {
        for socket_id in self.registry.sockets_for_topic(topic) {
            if Some(&socket_id) == skip {
                continue;
            }
            self.deliver_to_socket(topic, message, &socket_id).await;
        }
    }

    async fn deliver_to_socket(
        &self,
        topic: &Topic,
        message: &RetainedMessage,
        socket_id: &SocketId,
    ) {
        let Some(subscription) =
            self.registry.subscription_for(socket_id, topic)
        else {
            return;
        };
        // a socket already waiting on (or done with) this hash is skipped,
        // which keeps flush, live fan-out, and draining exactly-once
        let Some(request_id) =
            self.reserve_delivery(topic, message, socket_id)
        else {
            return;
        };
        let request = rpc::SubscriptionRequest::new(
            request_id,
            subscription,
            topic.clone(),
            message.payload.clone(),
            message.message_hash.clone(),
        );
        let recorded = StoredRequest {
            method: rpc::RELAY_SUBSCRIPTION.to_owned(),
            params: serde_json::to_value(&request.params)
                .unwrap_or_default(),
        };
        if let Err(e) =
            self.history.set(topic, request_id, recorded, None).await
        {
            tracing::warn!("Failed to record delivery in history: {e}");
        }
        if self.sink.try_send_request(socket_id, &request).is_err() {
            // treated as non-ack: the message stays retained and the
            // socket is torn down
            self.abandon_delivery(topic, &message.message_hash, socket_id);
            tracing::event!(
                target: probe::TARGET,
                tracing::Level::WARN,
                kind = %probe::Kind::Socket,
                delivery_failed = %socket_id,
                topic = %topic,
            );
            self.sink.close(socket_id, close_code::DELIVERY_FAILURE);
        }
    }

    fn reserve_delivery(
        &self,
        topic: &Topic,
        message: &RetainedMessage,
        socket_id: &SocketId,
    ) -> Option<u64> {
        let mut pending = self.pending.lock();
        let state = pending
            .entry((topic.clone(), message.message_hash.clone()))
            .or_default();
        state.expires_at = state.expires_at.max(message.expires_at);
        if state.waiting.contains_key(socket_id)
            || state.acked.contains(socket_id)
        {
            return None;
        }
        let request_id =
            self.next_request_id.fetch_add(1, Ordering::Relaxed);
        state.waiting.insert(socket_id.clone(), request_id);
        Some(request_id)
    }

    fn abandon_delivery(
        &self,
        topic: &Topic,
        hash: &MessageHash,
        socket_id: &SocketId,
    ) {
        let mut pending = self.pending.lock();
        if let Some(state) =
            pending.get_mut(&(topic.clone(), hash.clone()))
        {
            state.waiting.remove(socket_id);
        }
    }

    fn broadcast_event(&self, topic: &Topic, event: TopicEvent) {
        if self.local_only.load(Ordering::Relaxed) {
            return;
        }
        if let Err(e) = self.store.publish_event(topic, &event) {
            self.local_only.store(true, Ordering::Relaxed);
            tracing::event!(
                target: probe::TARGET,
                tracing::Level::WARN,
                kind = %probe::Kind::Degraded,
                local_only = true,
                error = %e,
            );
            let _ = self.events.send(BrokerEvent::Degraded {
                reason: format!("cross-node fan-out disabled: {e}"),
            });
        }
    }

    fn emit_degraded(&self, error: &crate::Error) {
        tracing::event!(
            target: probe::TARGET,
            tracing::Level::ERROR,
            kind = %probe::Kind::Degraded,
            error = %error,
        );
        let _ = self.events.send(BrokerEvent::Degraded {
            reason: error.to_string(),
        });
    }

    fn ensure_topic_task(self: &Arc<Self>, topic: &Topic) -> crate::Result<()> {
        let mut tasks = self.topic_tasks.lock();
        if tasks.contains_key(topic) {
            return Ok(());
        }
        let mut events = self.store.subscribe_events(topic)?;
        let broker = Arc::downgrade(self);
        let task_topic = topic.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let Some(broker) = broker.upgrade() else { break };
                broker.handle_topic_event(&task_topic, event).await;
            }
        });
        tasks.insert(topic.clone(), handle);
        Ok(())
    }

    fn maybe_stop_topic_task(&self, topic: &Topic) {
        if !self.registry.sockets_for_topic(topic).is_empty() {
            return;
        }
        if self.pending.lock().keys().any(|(t, _)| t == topic) {
            return;
        }
        // retained-but-undelivered messages still need the listener, so
        // a remote subscribe_request can drain them
        match self.store.retained_messages(topic) {
            Ok(retained) if retained.is_empty() => {}
            _ => return,
        }
        if let Some(handle) = self.topic_tasks.lock().remove(topic) {
            handle.abort();
        }
    }

    async fn handle_topic_event(&self, topic: &Topic, event: TopicEvent) {
        if event.origin() == &self.node_id {
            return;
        }
        match event {
            TopicEvent::Published {
                message_hash,
                payload,
                expires_at,
                ..
            } => {
                let message = RetainedMessage {
                    message_hash,
                    payload,
                    expires_at,
                };
                if message.is_expired() {
                    return;
                }
                self.deliver_local(topic, &message, None).await;
            }
            TopicEvent::SubscribeRequest { origin, .. } => {
                self.drain_pending(topic, &origin).await;
            }
            TopicEvent::SubscribeRelease { origin, .. } => {
                tracing::trace!(
                    "node {origin} released interest in {topic}"
                );
            }
        }
    }

    /// Republishes every unexpired message this node retains for
    /// `topic`, so the node that just gained a subscriber can deliver
    /// them locally. Retention is the source of truth here: a message
    /// published with no local subscribers has no ack state yet, but it
    /// is still owed to the new subscriber.
    async fn drain_pending(&self, topic: &Topic, origin: &NodeId) {
        let retained = match self.store.retained_messages(topic) {
            Ok(messages) => messages,
            Err(e) => {
                tracing::warn!("Failed to drain pending messages: {e}");
                return;
            }
        };
        if retained.is_empty() {
            return;
        }
        let mut drained = 0;
        for message in retained {
            self.broadcast_event(
                topic,
                TopicEvent::Published {
                    origin: self.node_id.clone(),
                    topic: topic.clone(),
                    message_hash: message.message_hash.clone(),
                    payload: message.payload,
                    expires_at: message.expires_at,
                },
            );
            drained += 1;
        }
        tracing::trace!(
            "drained {drained} pending message(s) on {topic} towards {origin}"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryStore, RetainedMessageStore};

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<(SocketId, rpc::SubscriptionRequest)>>,
        closed: Mutex<Vec<(SocketId, u16)>>,
    }

    impl OutboundSink for RecordingSink {
        fn try_send_request(
            &self,
            socket_id: &SocketId,
            request: &rpc::SubscriptionRequest,
        ) -> crate::Result<()> {
            self.sent
                .lock()
                .push((socket_id.clone(), request.clone()));
            Ok(())
        }

        fn close(&self, socket_id: &SocketId, code: u16) {
            self.closed.lock().push((socket_id.clone(), code));
        }
    }

    struct Fixture {
        broker: Arc<MessageBroker<InMemoryStore>>,
        sink: Arc<RecordingSink>,
        store: InMemoryStore,
    }

    async fn fixture() -> Fixture {
        let store = InMemoryStore::default();
        let registry = Arc::new(SubscriptionRegistry::new());
        let history =
            Arc::new(RequestHistory::new(store.clone(), "broker-test"));
        history.restore().await.unwrap();
        let sink = Arc::new(RecordingSink::default());
        let broker = MessageBroker::new(
            store.clone(),
            registry,
            history,
            sink.clone(),
            86_400,
        );
        Fixture {
            broker,
            sink,
            store,
        }
    }

    fn topic(byte: &str) -> Topic {
        byte.repeat(32).parse().unwrap()
    }

    #[tokio::test]
    async fn publish_fans_out_and_ack_settles_retention() {
        let f = fixture().await;
        let topic = topic("aa");
        let subscriber = SocketId::generate();
        let publisher = SocketId::generate();

        f.broker.subscribe(&subscriber, &topic).await.unwrap();
        let hash = f
            .broker
            .publish(Some(&publisher), &topic, "hello", 60)
            .await
            .unwrap();

        let sent = f.sink.sent.lock().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, subscriber);
        assert_eq!(sent[0].1.params.data.message, "hello");
        assert!(f.store.contains_message(&topic, &hash).unwrap());

        f.broker
            .acknowledge(&subscriber, &topic, &hash)
            .await
            .unwrap();
        assert!(!f.store.contains_message(&topic, &hash).unwrap());
    }

    #[tokio::test]
    async fn publisher_does_not_receive_its_own_message() {
        let f = fixture().await;
        let topic = topic("bb");
        let publisher = SocketId::generate();

        f.broker.subscribe(&publisher, &topic).await.unwrap();
        f.broker
            .publish(Some(&publisher), &topic, "echo?", 60)
            .await
            .unwrap();

        assert!(f.sink.sent.lock().is_empty());
        // and nothing asked the session layer to close it either
        assert!(f.sink.closed.lock().is_empty());
    }

    #[tokio::test]
    async fn late_subscriber_receives_retained_messages_in_order() {
        let f = fixture().await;
        let topic = topic("cc");
        let subscriber = SocketId::generate();

        f.broker
            .publish(None, &topic, "first", 60)
            .await
            .unwrap();
        f.broker
            .publish(None, &topic, "second", 60)
            .await
            .unwrap();
        f.broker.subscribe(&subscriber, &topic).await.unwrap();

        let sent = f.sink.sent.lock().clone();
        let payloads: Vec<_> = sent
            .iter()
            .map(|(_, r)| r.params.data.message.clone())
            .collect();
        assert_eq!(payloads, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn republish_is_a_retention_noop_but_still_fans_out() {
        let f = fixture().await;
        let topic = topic("dd");
        let a = SocketId::generate();

        f.broker.publish(None, &topic, "once", 60).await.unwrap();
        f.broker.subscribe(&a, &topic).await.unwrap();
        assert_eq!(f.sink.sent.lock().len(), 1);

        // the subscriber lost the delivery and the publisher republishes;
        // the pending reservation suppresses a duplicate push to `a`
        let hash =
            f.broker.publish(None, &topic, "once", 60).await.unwrap();
        assert_eq!(f.sink.sent.lock().len(), 1);
        assert!(f.store.contains_message(&topic, &hash).unwrap());
    }

    #[tokio::test]
    async fn disconnect_transfers_the_ack_obligation() {
        let f = fixture().await;
        let topic = topic("ee");
        let first = SocketId::generate();
        let second = SocketId::generate();

        eprintln!("DIAG: before subscribe first");
        f.broker.subscribe(&first, &topic).await.unwrap();
        eprintln!("DIAG: before publish");
        let hash = f
            .broker
            .publish(None, &topic, "carry on", 60)
            .await
            .unwrap();
        eprintln!("DIAG: before on_socket_closed");

        // the notified socket disconnects without acking
        f.broker.on_socket_closed(&first);
        eprintln!("DIAG: before contains_message 1");
        assert!(f.store.contains_message(&topic, &hash).unwrap());
        eprintln!("DIAG: before subscribe second");

        // the obligation transfers to the next subscriber
        f.broker.subscribe(&second, &topic).await.unwrap();
        eprintln!("DIAG: before acknowledge");
        f.broker
            .acknowledge(&second, &topic, &hash)
            .await
            .unwrap();
        eprintln!("DIAG: before contains_message 2");
        assert!(!f.store.contains_message(&topic, &hash).unwrap());
        eprintln!("DIAG: done");
    }

    #[tokio::test]
    async fn settlement_waits_for_every_notified_socket() {
        let f = fixture().await;
        let topic = topic("ff");
        let a = SocketId::generate();
        let b = SocketId::generate();

        f.broker.subscribe(&a, &topic).await.unwrap();
        f.broker.subscribe(&b, &topic).await.unwrap();
        let hash = f
            .broker
            .publish(None, &topic, "both of you", 60)
            .await
            .unwrap();

        f.broker.acknowledge(&a, &topic, &hash).await.unwrap();
        assert!(f.store.contains_message(&topic, &hash).unwrap());
        f.broker.acknowledge(&b, &topic, &hash).await.unwrap();
        assert!(!f.store.contains_message(&topic, &hash).unwrap());
    }
}
