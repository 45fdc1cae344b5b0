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

use std::collections::HashMap;
use std::sync::Arc;

use futures::prelude::*;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::types::{MessageHash, Topic};

use super::{
    HistorySnapshotStore, RetainedMessage, RetainedMessageStore, TopicBus,
    TopicEvent,
};

const CHANNEL_CAPACITY: usize = 256;

/// InMemoryStore keeps everything in process memory.
///
/// Clones share state, so two relay nodes built over clones of one
/// `InMemoryStore` see each other's retained messages and channel
/// notifications exactly like two processes sharing one external store.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    retained: Arc<RwLock<HashMap<Topic, Vec<RetainedMessage>>>>,
    snapshots: Arc<RwLock<HashMap<String, Vec<u8>>>>,
    channels: Arc<RwLock<HashMap<String, broadcast::Sender<TopicEvent>>>>,
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore").finish()
    }
}

impl InMemoryStore {
    fn channel_sender(&self, topic: &Topic) -> broadcast::Sender<TopicEvent> {
        let mut channels = self.channels.write();
        channels
            .entry(topic.channel())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

impl RetainedMessageStore for InMemoryStore {
    #[tracing::instrument(skip(self, message))]
    fn insert_message(
        &self,
        topic: &Topic,
        message: RetainedMessage,
    ) -> crate::Result<bool> {
        let mut retained = self.retained.write();
        let entries = retained.entry(topic.clone()).or_default();
        if let Some(pos) = entries
            .iter()
            .position(|m| m.message_hash == message.message_hash)
        {
            if !entries[pos].is_expired() {
                return Ok(false);
            }
            // the expired entry loses its place in the arrival order
            entries.remove(pos);
        }
        entries.push(message);
        Ok(true)
    }

    fn retained_messages(
        &self,
        topic: &Topic,
    ) -> crate::Result<Vec<RetainedMessage>> {
        let mut retained = self.retained.write();
        let Some(entries) = retained.get_mut(topic) else {
            return Ok(Vec::new());
        };
        entries.retain(|m| !m.is_expired());
        Ok(entries.clone())
    }

    fn remove_message(
        &self,
        topic: &Topic,
        hash: &MessageHash,
    ) -> crate::Result<()> {
        let mut retained = self.retained.write();
        if let Some(entries) = retained.get_mut(topic) {
            entries.retain(|m| &m.message_hash != hash);
            if entries.is_empty() {
                retained.remove(topic);
            }
        }
        Ok(())
    }

    fn contains_message(
        &self,
        topic: &Topic,
        hash: &MessageHash,
    ) -> crate::Result<bool> {
        let retained = self.retained.read();
        Ok(retained
            .get(topic)
            .map(|entries| {
                entries
                    .iter()
                    .any(|m| &m.message_hash == hash && !m.is_expired())
            })
            .unwrap_or(false))
    }

    fn purge_expired(&self) -> crate::Result<usize> {
        let mut retained = self.retained.write();
        let mut removed = 0;
        retained.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|m| !m.is_expired());
            removed += before - entries.len();
            !entries.is_empty()
        });
        Ok(removed)
    }
}

impl<R> HistorySnapshotStore<R> for InMemoryStore
where
    R: Serialize + DeserializeOwned,
{
    fn save_history(&self, key: &str, records: &[R]) -> crate::Result<()> {
        let bytes = serde_json::to_vec(records)?;
        self.snapshots.write().insert(key.to_owned(), bytes);
        Ok(())
    }

    fn load_history(&self, key: &str) -> crate::Result<Vec<R>> {
        self.snapshots
            .read()
            .get(key)
            .map(|bytes| serde_json::from_slice(bytes))
            .transpose()
            .map(Option::unwrap_or_default)
            .map_err(Into::into)
    }
}

impl TopicBus for InMemoryStore {
    fn publish_event(
        &self,
        topic: &Topic,
        event: &TopicEvent,
    ) -> crate::Result<()> {
        // a send error only means no node is listening yet
        let _ = self.channel_sender(topic).send(event.clone());
        Ok(())
    }

    fn subscribe_events(
        &self,
        topic: &Topic,
    ) -> crate::Result<stream::BoxStream<'static, TopicEvent>> {
        let receiver = self.channel_sender(topic).subscribe();
        let stream = BroadcastStream::new(receiver)
            .filter_map(|event| future::ready(event.ok()));
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topic() -> Topic {
        "aa".repeat(32).parse().unwrap()
    }

    #[test]
    fn retention_is_content_addressed() {
        let store = InMemoryStore::default();
        let topic = topic();
        let message = RetainedMessage::new("msg1".into(), 60);

        assert!(store.insert_message(&topic, message.clone()).unwrap());
        // a republish of the same payload is accepted as a no-op
        assert!(!store.insert_message(&topic, message.clone()).unwrap());
        assert!(store
            .contains_message(&topic, &message.message_hash)
            .unwrap());

        store
            .remove_message(&topic, &message.message_hash)
            .unwrap();
        assert!(store.retained_messages(&topic).unwrap().is_empty());
    }

    #[test]
    fn expired_messages_are_dropped() {
        let store = InMemoryStore::default();
        let topic = topic();
        let expired = RetainedMessage {
            expires_at: 0,
            ..RetainedMessage::new("stale".into(), 60)
        };
        let fresh = RetainedMessage::new("fresh".into(), 60);
        store.insert_message(&topic, expired.clone()).unwrap();
        store.insert_message(&topic, fresh.clone()).unwrap();

        let alive = store.retained_messages(&topic).unwrap();
        assert_eq!(alive, vec![fresh]);
        // the expired slot is free for a replacement
        assert!(store.insert_message(&topic, expired).unwrap());
        assert_eq!(store.purge_expired().unwrap(), 1);
    }

    #[test]
    fn retained_messages_keep_arrival_order() {
        let store = InMemoryStore::default();
        let topic = topic();
        for payload in ["one", "two", "three"] {
            store
                .insert_message(
                    &topic,
                    RetainedMessage::new(payload.into(), 60),
                )
                .unwrap();
        }
        let payloads: Vec<_> = store
            .retained_messages(&topic)
            .unwrap()
            .into_iter()
            .map(|m| m.payload)
            .collect();
        assert_eq!(payloads, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn bus_fans_events_out_to_subscribers() {
        let store = InMemoryStore::default();
        let clone = store.clone();
        let topic = topic();
        let mut events = clone.subscribe_events(&topic).unwrap();

        let event = TopicEvent::SubscribeRequest {
            origin: crate::types::NodeId::generate(),
            topic: topic.clone(),
        };
        store.publish_event(&topic, &event).unwrap();

        match events.next().await {
            Some(TopicEvent::SubscribeRequest { topic: t, .. }) => {
                assert_eq!(t, topic)
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
