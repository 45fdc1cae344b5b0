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
//
//! # Relay Store Module 🕸️
//!
//! A module for managing the storage of the relay.
//!
//! ## Overview
//!
//! The store is what turns several relay processes into one logical bus:
//! retained messages, history snapshots, and the per-topic notification
//! channels all live behind the traits defined here, with an in-memory
//! backend for tests and single-process deployments and a
//! [Sled](https://sled.rs)-based backend for everything else.

use std::time::{SystemTime, UNIX_EPOCH};

use futures::stream::BoxStream;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::types::{MessageHash, NodeId, Topic};

/// A module for managing in-memory storage of the relay.
pub mod mem;
/// A module for setting up and managing a [Sled](https://sled.rs)-based database.
pub mod sled;

pub use mem::InMemoryStore;
pub use sled::SledStore;

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// A message accepted by the broker but not yet acknowledged by at least
/// one eligible subscriber. Keyed by `(topic, message_hash)` in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetainedMessage {
    /// SHA-256 content hash of the payload.
    pub message_hash: MessageHash,
    /// The opaque ciphertext payload.
    pub payload: String,
    /// Unix seconds after which the message is no longer delivered.
    pub expires_at: u64,
}

impl RetainedMessage {
    /// Builds a retained entry for `payload` expiring `ttl_secs` from now.
    pub fn new(payload: String, ttl_secs: u64) -> Self {
        Self {
            message_hash: MessageHash::of(&payload),
            payload,
            expires_at: now_secs().saturating_add(ttl_secs),
        }
    }

    /// Whether the retention window has elapsed.
    pub fn is_expired(&self) -> bool {
        self.expires_at <= now_secs()
    }
}

/// A notification on a topic's cross-node channel (`sub:<topic>`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TopicEvent {
    /// A node accepted a publish; peers fan it out to their local
    /// subscribers.
    #[serde(rename_all = "camelCase")]
    Published {
        /// The node that accepted the publish.
        origin: NodeId,
        /// The topic the message belongs to.
        topic: Topic,
        /// Content hash of the payload.
        message_hash: MessageHash,
        /// The opaque ciphertext payload.
        payload: String,
        /// Unix seconds after which the message expires.
        expires_at: u64,
    },
    /// A node gained its first local subscriber for the topic; peers
    /// holding pending messages drain them back over the channel.
    #[serde(rename_all = "camelCase")]
    SubscribeRequest {
        /// The node that gained interest.
        origin: NodeId,
        /// The topic of interest.
        topic: Topic,
    },
    /// A node lost its last local subscriber for the topic. Advisory
    /// only; listeners hold no state for it.
    #[serde(rename_all = "camelCase")]
    SubscribeRelease {
        /// The node that lost interest.
        origin: NodeId,
        /// The released topic.
        topic: Topic,
    },
}

impl TopicEvent {
    /// The node that emitted the event.
    pub fn origin(&self) -> &NodeId {
        match self {
            TopicEvent::Published { origin, .. }
            | TopicEvent::SubscribeRequest { origin, .. }
            | TopicEvent::SubscribeRelease { origin, .. } => origin,
        }
    }
}

/// Storage for messages retained until acknowledged or expired.
///
/// At most one unexpired entry exists per `(topic, message_hash)`;
/// entries come back from [`retained_messages`](Self::retained_messages)
/// in arrival order.
pub trait RetainedMessageStore: Send + Sync {
    /// Inserts a retained message. Returns `false` when an unexpired
    /// entry with the same hash already exists (a republish recovering a
    /// lost ack); an expired entry is replaced.
    fn insert_message(
        &self,
        topic: &Topic,
        message: RetainedMessage,
    ) -> crate::Result<bool>;

    /// All unexpired retained messages for `topic`, oldest first.
    /// Expired entries found along the way are dropped.
    fn retained_messages(
        &self,
        topic: &Topic,
    ) -> crate::Result<Vec<RetainedMessage>>;

    /// Removes one retained message. Silent if absent.
    fn remove_message(
        &self,
        topic: &Topic,
        hash: &MessageHash,
    ) -> crate::Result<()>;

    /// Whether an unexpired entry exists for `(topic, hash)`.
    fn contains_message(
        &self,
        topic: &Topic,
        hash: &MessageHash,
    ) -> crate::Result<bool>;

    /// Drops every expired retained message, returning how many were
    /// removed.
    fn purge_expired(&self) -> crate::Result<usize>;
}

/// Snapshot storage for the JSON-RPC history, generic over the record
/// type so the store stays decoupled from the history's schema.
pub trait HistorySnapshotStore<R>: Send + Sync
where
    R: Serialize + DeserializeOwned,
{
    /// Replaces the snapshot stored under `key` with `records`.
    fn save_history(&self, key: &str, records: &[R]) -> crate::Result<()>;

    /// Loads the snapshot stored under `key`, or an empty list when no
    /// snapshot was ever written.
    fn load_history(&self, key: &str) -> crate::Result<Vec<R>>;
}

/// The cross-node notification bus. Delivery is at-least-once, in publish
/// order within a single topic channel.
pub trait TopicBus: Send + Sync {
    /// Publishes an event on the topic's channel.
    fn publish_event(
        &self,
        topic: &Topic,
        event: &TopicEvent,
    ) -> crate::Result<()>;

    /// Subscribes to the topic's channel. The stream ends when the store
    /// is dropped.
    fn subscribe_events(
        &self,
        topic: &Topic,
    ) -> crate::Result<BoxStream<'static, TopicEvent>>;
}

/// Everything the broker needs from a store backend, in one bound.
pub trait RelayStore:
    RetainedMessageStore
    + HistorySnapshotStore<crate::history::HistoryRecord>
    + TopicBus
    + Clone
    + Send
    + Sync
    + 'static
{
}

impl<T> RelayStore for T where
    T: RetainedMessageStore
        + HistorySnapshotStore<crate::history::HistoryRecord>
        + TopicBus
        + Clone
        + Send
        + Sync
        + 'static
{
}
