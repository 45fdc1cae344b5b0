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

use std::io;
use std::path::Path;

use futures::prelude::*;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::ConflictableTransactionError;

use crate::types::{MessageHash, Topic};

use super::{
    now_secs, HistorySnapshotStore, RetainedMessage, RetainedMessageStore,
    TopicBus, TopicEvent,
};

const HISTORY_TREE: &str = "history";
const CHANNELS_TREE: &str = "channels";
const RETAINED_TREE_PREFIX: &str = "retained:";

/// Key of the monotonic arrival counter inside a retained tree.
const LAST_IDX_KEY: &[u8] = b"last_idx";
/// Prefix of message item keys inside a retained tree.
const ITEM_PREFIX: &[u8] = b"m";

#[derive(Clone)]
pub struct SledStore {
    db: sled::Db,
}

impl std::fmt::Debug for SledStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledStore").finish()
    }
}

impl SledStore {
    /// Opens the store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let db = sled::Config::new()
            .path(path)
            .temporary(cfg!(test))
            .use_compression(true)
            .compression_factor(18)
            .open()?;
        Ok(Self { db })
    }

    /// Opens a store that is deleted when the process exits.
    pub fn temporary() -> crate::Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    fn retained_tree(&self, topic: &Topic) -> crate::Result<sled::Tree> {
        let tree = self
            .db
            .open_tree(format!("{}{}", RETAINED_TREE_PREFIX, topic.as_str()))?;
        Ok(tree)
    }

    fn alias_key(hash: &MessageHash) -> Vec<u8> {
        let mut key = Vec::with_capacity(2 + hash.as_str().len());
        key.extend_from_slice(b"h:");
        key.extend_from_slice(hash.as_str().as_bytes());
        key
    }

    fn item_key(idx: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(ITEM_PREFIX.len() + 8);
        key.extend_from_slice(ITEM_PREFIX);
        key.extend_from_slice(&idx.to_be_bytes());
        key
    }
}

impl RetainedMessageStore for SledStore {
    #[tracing::instrument(
        skip_all,
        fields(topic = %topic, message_hash = %message.message_hash)
    )]
    fn insert_message(
        &self,
        topic: &Topic,
        message: RetainedMessage,
    ) -> crate::Result<bool> {
        let tree = self.retained_tree(topic)?;
        let item_bytes = serde_json::to_vec(&message)?;
        let alias = Self::alias_key(&message.message_hash);
        let now = now_secs();
        // everything happens inside a single transaction, so a concurrent
        // publish of the same payload cannot produce two retention entries.
        let inserted = tree.transaction::<_, _, io::Error>(|tx| {
            if let Some(existing_key) = tx.get(&alias)? {
                if let Some(existing) = tx.get(&existing_key)? {
                    let existing: RetainedMessage =
                        serde_json::from_slice(&existing).map_err(|e| {
                            ConflictableTransactionError::Abort(io::Error::new(
                                io::ErrorKind::InvalidData,
                                e,
                            ))
                        })?;
                    if existing.expires_at > now {
                        // an unexpired entry already holds this hash
                        return Ok(false);
                    }
                    tx.remove(existing_key)?;
                }
                tx.remove(alias.as_slice())?;
            }
            let last_idx = match tx.get(LAST_IDX_KEY)? {
                Some(v) => v
                    .as_ref()
                    .try_into()
                    .map(u64::from_be_bytes)
                    .unwrap_or(0),
                None => 0,
            };
            let next_idx = last_idx + 1;
            tx.insert(LAST_IDX_KEY, &next_idx.to_be_bytes())?;
            let item_key = Self::item_key(next_idx);
            tx.insert(item_key, item_bytes.as_slice())?;
            tx.insert(alias.as_slice(), Self::item_key(next_idx))?;
            Ok(true)
        })?;
        Ok(inserted)
    }

    #[tracing::instrument(skip(self))]
    fn retained_messages(
        &self,
        topic: &Topic,
    ) -> crate::Result<Vec<RetainedMessage>> {
        let tree = self.retained_tree(topic)?;
        let now = now_secs();
        let mut alive = Vec::new();
        let mut expired = Vec::new();
        // item keys are big-endian counters, so the scan is arrival order
        for entry in tree.scan_prefix(ITEM_PREFIX) {
            let (key, value) = entry?;
            let message: RetainedMessage = serde_json::from_slice(&value)?;
            if message.expires_at > now {
                alive.push(message);
            } else {
                expired.push((key, message.message_hash));
            }
        }
        for (key, hash) in expired {
            tree.remove(key)?;
            tree.remove(Self::alias_key(&hash))?;
        }
        Ok(alive)
    }

    #[tracing::instrument(skip(self))]
    fn remove_message(
        &self,
        topic: &Topic,
        hash: &MessageHash,
    ) -> crate::Result<()> {
        let tree = self.retained_tree(topic)?;
        let alias = Self::alias_key(hash);
        if let Some(item_key) = tree.get(&alias)? {
            tree.remove(item_key)?;
            tree.remove(alias)?;
        }
        Ok(())
    }

    fn contains_message(
        &self,
        topic: &Topic,
        hash: &MessageHash,
    ) -> crate::Result<bool> {
        let tree = self.retained_tree(topic)?;
        let Some(item_key) = tree.get(Self::alias_key(hash))? else {
            return Ok(false);
        };
        let Some(value) = tree.get(item_key)? else {
            return Ok(false);
        };
        let message: RetainedMessage = serde_json::from_slice(&value)?;
        Ok(message.expires_at > now_secs())
    }

    fn purge_expired(&self) -> crate::Result<usize> {
        let now = now_secs();
        let mut removed = 0;
        for name in self.db.tree_names() {
            if !name.starts_with(RETAINED_TREE_PREFIX.as_bytes()) {
                continue;
            }
            let tree = self.db.open_tree(&name)?;
            let mut expired = Vec::new();
            for entry in tree.scan_prefix(ITEM_PREFIX) {
                let (key, value) = entry?;
                let message: RetainedMessage =
                    serde_json::from_slice(&value)?;
                if message.expires_at <= now {
                    expired.push((key, message.message_hash));
                }
            }
            for (key, hash) in expired {
                tree.remove(key)?;
                tree.remove(Self::alias_key(&hash))?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

impl<R> HistorySnapshotStore<R> for SledStore
where
    R: Serialize + DeserializeOwned,
{
    #[tracing::instrument(skip(self, records), fields(count = records.len()))]
    fn save_history(&self, key: &str, records: &[R]) -> crate::Result<()> {
        let tree = self.db.open_tree(HISTORY_TREE)?;
        tree.insert(key.as_bytes(), serde_json::to_vec(records)?)?;
        Ok(())
    }

    fn load_history(&self, key: &str) -> crate::Result<Vec<R>> {
        let tree = self.db.open_tree(HISTORY_TREE)?;
        match tree.get(key.as_bytes())? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(Vec::new()),
        }
    }
}

impl TopicBus for SledStore {
    fn publish_event(
        &self,
        topic: &Topic,
        event: &TopicEvent,
    ) -> crate::Result<()> {
        let tree = self.db.open_tree(CHANNELS_TREE)?;
        let mut key = format!("{}:", topic.channel()).into_bytes();
        key.extend_from_slice(&self.db.generate_id()?.to_be_bytes());
        tree.insert(key.as_slice(), serde_json::to_vec(event)?)?;
        // subscribers observe the insert; the entry itself is not needed
        tree.remove(key.as_slice())?;
        Ok(())
    }

    fn subscribe_events(
        &self,
        topic: &Topic,
    ) -> crate::Result<stream::BoxStream<'static, TopicEvent>> {
        let tree = self.db.open_tree(CHANNELS_TREE)?;
        let prefix = format!("{}:", topic.channel());
        let mut subscriber = tree.watch_prefix(prefix.into_bytes());
        let stream = async_stream::stream! {
            while let Some(event) = (&mut subscriber).await {
                if let sled::Event::Insert { value, .. } = event {
                    match serde_json::from_slice::<TopicEvent>(&value) {
                        Ok(event) => yield event,
                        Err(e) => tracing::warn!(
                            "Dropping malformed channel event: {e}"
                        ),
                    }
                }
            }
        };
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeId;

    fn topic() -> Topic {
        "cc".repeat(32).parse().unwrap()
    }

    #[test]
    fn retention_round_trip() {
        let store = SledStore::temporary().unwrap();
        let topic = topic();
        // it is now empty
        assert!(store.retained_messages(&topic).unwrap().is_empty());

        let msg1 = RetainedMessage::new("msg1".into(), 60);
        let msg2 = RetainedMessage::new("msg2".into(), 60);
        assert!(store.insert_message(&topic, msg1.clone()).unwrap());
        assert!(store.insert_message(&topic, msg2.clone()).unwrap());
        // a republish with the same payload is a no-op
        assert!(!store.insert_message(&topic, msg1.clone()).unwrap());

        let retained = store.retained_messages(&topic).unwrap();
        assert_eq!(retained, vec![msg1.clone(), msg2.clone()]);

        store.remove_message(&topic, &msg1.message_hash).unwrap();
        assert!(!store
            .contains_message(&topic, &msg1.message_hash)
            .unwrap());
        assert_eq!(store.retained_messages(&topic).unwrap(), vec![msg2]);
    }

    #[test]
    fn expired_entries_are_purged() {
        let store = SledStore::temporary().unwrap();
        let topic = topic();
        let stale = RetainedMessage {
            expires_at: 0,
            ..RetainedMessage::new("stale".into(), 60)
        };
        store.insert_message(&topic, stale.clone()).unwrap();
        store
            .insert_message(&topic, RetainedMessage::new("live".into(), 60))
            .unwrap();

        assert!(!store
            .contains_message(&topic, &stale.message_hash)
            .unwrap());
        assert_eq!(store.purge_expired().unwrap(), 1);
        assert_eq!(store.retained_messages(&topic).unwrap().len(), 1);
    }

    #[test]
    fn history_snapshots_round_trip() {
        let store = SledStore::temporary().unwrap();
        let key = "history:relay@1:test";
        let empty: Vec<String> = store.load_history(key).unwrap();
        assert!(empty.is_empty());

        let records = vec!["a".to_string(), "b".to_string()];
        store.save_history(key, &records).unwrap();
        let loaded: Vec<String> = store.load_history(key).unwrap();
        assert_eq!(loaded, records);
    }

    #[tokio::test]
    async fn channel_events_reach_watchers() {
        let store = SledStore::temporary().unwrap();
        let topic = topic();
        let mut events = store.subscribe_events(&topic).unwrap();

        let event = TopicEvent::SubscribeRelease {
            origin: NodeId::generate(),
            topic: topic.clone(),
        };
        store.publish_event(&topic, &event).unwrap();

        match events.next().await {
            Some(TopicEvent::SubscribeRelease { topic: t, .. }) => {
                assert_eq!(t, topic)
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
