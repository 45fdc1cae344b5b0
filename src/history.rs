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

//! The per-topic log of outstanding JSON-RPC requests.
//!
//! The relay records every `relay_subscription` request it sends and the
//! acknowledgement that eventually answers it, so a peer that dropped
//! mid-exchange can reconcile after reconnecting. The record set lives in
//! memory behind a restoration gate: every operation waits for the
//! snapshot restore to finish, and every mutation schedules an
//! asynchronous re-snapshot to the shared store.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};

use crate::probe;
use crate::retry::with_store_retries;
use crate::store::HistorySnapshotStore;
use crate::types::Topic;

/// The protocol part of the snapshot key.
pub const PROTOCOL: &str = "relay";
/// The protocol version part of the snapshot key.
pub const PROTOCOL_VERSION: u32 = 1;

/// The deterministic shared-store key the snapshot lives under.
pub fn snapshot_key(context: &str) -> String {
    format!("history:{}@{}:{}", PROTOCOL, PROTOCOL_VERSION, context)
}

/// The request half of a history record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredRequest {
    /// The JSON-RPC method of the outbound request.
    pub method: String,
    /// The params the request carried.
    #[serde(default)]
    pub params: serde_json::Value,
}

/// The response half of a history record, once one arrived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoredResponse {
    /// A successful response.
    Success {
        /// The JSON-RPC result value.
        result: serde_json::Value,
    },
    /// An error response.
    Failure {
        /// The JSON-RPC error value.
        error: serde_json::Value,
    },
}

/// One outbound request and, eventually, its response. A record is
/// "pending" while `response` is absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    /// The JSON-RPC id of the outbound request.
    pub id: u64,
    /// The topic the exchange belongs to.
    pub topic: Topic,
    /// The recorded request.
    pub request: StoredRequest,
    /// Optional chain id carried by the request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<String>,
    /// The response, absent while the request is outstanding. Transitions
    /// from absent to present exactly once.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<StoredResponse>,
}

impl HistoryRecord {
    /// Whether the record is still waiting for its response.
    pub fn is_pending(&self) -> bool {
        self.response.is_none()
    }
}

/// A pending request as reported by [`RequestHistory::pending`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEvent {
    /// The topic the request was sent on.
    pub topic: Topic,
    /// The JSON-RPC id of the request.
    pub id: u64,
    /// The request method.
    pub method: String,
    /// The request params.
    pub params: serde_json::Value,
    /// Optional chain id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<String>,
}

impl From<&HistoryRecord> for RequestEvent {
    fn from(record: &HistoryRecord) -> Self {
        Self {
            topic: record.topic.clone(),
            id: record.id,
            method: record.request.method.clone(),
            params: record.request.params.clone(),
            chain_id: record.chain_id.clone(),
        }
    }
}

/// Informational events for external observers. Handlers must never call
/// back into the history.
#[derive(Debug, Clone)]
pub enum HistoryEvent {
    /// A record was created.
    Created(HistoryRecord),
    /// A record received its response.
    Updated(HistoryRecord),
    /// A record was deleted.
    Deleted(HistoryRecord),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Restoring,
    Ready,
}

/// The JSON-RPC request history of one relay node.
pub struct RequestHistory<S> {
    store: S,
    snapshot_key: String,
    records: RwLock<HashMap<u64, HistoryRecord>>,
    state: watch::Sender<State>,
    events: broadcast::Sender<HistoryEvent>,
}

impl<S> RequestHistory<S>
where
    S: HistorySnapshotStore<HistoryRecord> + Clone + Send + Sync + 'static,
{
    /// Creates a history in the `Restoring` state; no operation makes
    /// progress until [`restore`](Self::restore) has run.
    pub fn new(store: S, context: &str) -> Self {
        let (state, _) = watch::channel(State::Restoring);
        let (events, _) = broadcast::channel(64);
        Self {
            store,
            snapshot_key: snapshot_key(context),
            records: RwLock::new(HashMap::new()),
            state,
            events,
        }
    }

    /// Subscribes to record lifecycle events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<HistoryEvent> {
        self.events.subscribe()
    }

    /// The one legitimate suspension point: waits for the restoration
    /// gate to open.
    async fn enabled(&self) -> crate::Result<()> {
        let mut state = self.state.subscribe();
        state
            .wait_for(|s| *s == State::Ready)
            .await
            .map_err(|_| crate::Error::Generic("history gate closed"))?;
        Ok(())
    }

    /// Loads the snapshot from the shared store and opens the gate.
    /// Fails with `RestoreWouldOverride` when records already exist in
    /// memory.
    pub async fn restore(&self) -> crate::Result<()> {
        let loaded =
            with_store_retries(|| self.store.load_history(&self.snapshot_key))
                .await?;
        let restored = {
            let mut records = self.records.write();
            if !records.is_empty() {
                return Err(crate::Error::RestoreWouldOverride {
                    count: records.len(),
                });
            }
            for record in loaded {
                records.insert(record.id, record);
            }
            records.len()
        };
        let _ = self.state.send(State::Ready);
        tracing::event!(
            target: probe::TARGET,
            tracing::Level::DEBUG,
            kind = %probe::Kind::History,
            restored,
        );
        Ok(())
    }

    /// Records an outbound request. Fails with `RecordAlreadyExists` when
    /// a record with the same id exists.
    pub async fn set(
        &self,
        topic: &Topic,
        id: u64,
        request: StoredRequest,
        chain_id: Option<String>,
    ) -> crate::Result<()> {
        self.enabled().await?;
        let record = {
            let mut records = self.records.write();
            if records.contains_key(&id) {
                return Err(crate::Error::RecordAlreadyExists { id });
            }
            let record = HistoryRecord {
                id,
                topic: topic.clone(),
                request,
                chain_id,
                response: None,
            };
            records.insert(id, record.clone());
            record
        };
        let _ = self.events.send(HistoryEvent::Created(record));
        self.schedule_snapshot();
        Ok(())
    }

    /// Attaches a response to the matching record. Silently returns when
    /// no record has the id, the topic disagrees, or the record already
    /// has a response.
    pub async fn update(
        &self,
        topic: &Topic,
        id: u64,
        response: StoredResponse,
    ) -> crate::Result<()> {
        self.enabled().await?;
        let updated = {
            let mut records = self.records.write();
            match records.get_mut(&id) {
                Some(record)
                    if &record.topic == topic && record.is_pending() =>
                {
                    record.response = Some(response);
                    Some(record.clone())
                }
                _ => None,
            }
        };
        if let Some(record) = updated {
            let _ = self.events.send(HistoryEvent::Updated(record));
            self.schedule_snapshot();
        }
        Ok(())
    }

    /// Looks a record up by topic and id.
    pub async fn get(
        &self,
        topic: &Topic,
        id: u64,
    ) -> crate::Result<HistoryRecord> {
        self.enabled().await?;
        let records = self.records.read();
        let record = records
            .get(&id)
            .ok_or(crate::Error::NoMatchingId { id })?;
        if &record.topic != topic {
            return Err(crate::Error::MismatchedTopic {
                id,
                expected: topic.to_string(),
                found: record.topic.to_string(),
            });
        }
        Ok(record.clone())
    }

    /// Whether a record exists for `(topic, id)`.
    pub async fn exists(&self, topic: &Topic, id: u64) -> crate::Result<bool> {
        self.enabled().await?;
        let records = self.records.read();
        Ok(records
            .get(&id)
            .map(|r| &r.topic == topic)
            .unwrap_or(false))
    }

    /// With `id`, removes exactly that record if its topic matches.
    /// Without, removes every record of the topic. One `Deleted` event is
    /// emitted per removed record.
    pub async fn delete(
        &self,
        topic: &Topic,
        id: Option<u64>,
    ) -> crate::Result<()> {
        self.enabled().await?;
        let removed: Vec<HistoryRecord> = {
            let mut records = self.records.write();
            match id {
                Some(id) => {
                    let matches = records
                        .get(&id)
                        .map(|r| &r.topic == topic)
                        .unwrap_or(false);
                    if matches {
                        records.remove(&id).into_iter().collect()
                    } else {
                        Vec::new()
                    }
                }
                None => {
                    let ids: Vec<u64> = records
                        .values()
                        .filter(|r| &r.topic == topic)
                        .map(|r| r.id)
                        .collect();
                    ids.into_iter()
                        .filter_map(|id| records.remove(&id))
                        .collect()
                }
            }
        };
        if removed.is_empty() {
            return Ok(());
        }
        for record in removed {
            let _ = self.events.send(HistoryEvent::Deleted(record));
        }
        self.schedule_snapshot();
        Ok(())
    }

    /// Every record whose response is still absent, ordered by id.
    pub async fn pending(&self) -> crate::Result<Vec<RequestEvent>> {
        self.enabled().await?;
        let records = self.records.read();
        let mut pending: Vec<RequestEvent> = records
            .values()
            .filter(|r| r.is_pending())
            .map(RequestEvent::from)
            .collect();
        pending.sort_by_key(|e| e.id);
        Ok(pending)
    }

    fn schedule_snapshot(&self) {
        let mut records: Vec<HistoryRecord> =
            self.records.read().values().cloned().collect();
        records.sort_by_key(|r| r.id);
        let store = self.store.clone();
        let key = self.snapshot_key.clone();
        tokio::spawn(async move {
            let result =
                with_store_retries(|| store.save_history(&key, &records))
                    .await;
            if let Err(e) = result {
                tracing::event!(
                    target: probe::TARGET,
                    tracing::Level::ERROR,
                    kind = %probe::Kind::History,
                    snapshot_failed = true,
                    error = %e,
                );
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::store::InMemoryStore;

    fn topic(byte: &str) -> Topic {
        byte.repeat(32).parse().unwrap()
    }

    fn request(method: &str) -> StoredRequest {
        StoredRequest {
            method: method.into(),
            params: json!(["0xdeadbeef"]),
        }
    }

    async fn ready_history() -> RequestHistory<InMemoryStore> {
        let history = RequestHistory::new(InMemoryStore::default(), "test");
        history.restore().await.unwrap();
        history
    }

    #[tokio::test]
    async fn set_update_get_round_trip() {
        let history = ready_history().await;
        let topic = topic("aa");
        history
            .set(&topic, 7, request("eth_sign"), Some("eip155:1".into()))
            .await
            .unwrap();
        assert!(history.exists(&topic, 7).await.unwrap());
        assert_eq!(history.pending().await.unwrap().len(), 1);

        let response = StoredResponse::Success {
            result: json!("0xsigned"),
        };
        history.update(&topic, 7, response.clone()).await.unwrap();

        let record = history.get(&topic, 7).await.unwrap();
        assert_eq!(record.response, Some(response));
        assert!(history.pending().await.unwrap().is_empty());

        // the response transitions absent -> present exactly once
        history
            .update(
                &topic,
                7,
                StoredResponse::Failure { error: json!("late") },
            )
            .await
            .unwrap();
        let record = history.get(&topic, 7).await.unwrap();
        assert_eq!(
            record.response,
            Some(StoredResponse::Success {
                result: json!("0xsigned")
            })
        );
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let history = ready_history().await;
        let topic = topic("bb");
        history
            .set(&topic, 1, request("eth_sign"), None)
            .await
            .unwrap();
        let err = history
            .set(&topic, 1, request("eth_sign"), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::Error::RecordAlreadyExists { id: 1 }
        ));
    }

    #[tokio::test]
    async fn updates_are_topic_isolated() {
        let history = ready_history().await;
        let topic = topic("cc");
        let other = self::topic("dd");
        history
            .set(&topic, 3, request("eth_sign"), None)
            .await
            .unwrap();

        // an update on a different topic is a no-op and corrupts nothing
        history
            .update(
                &other,
                3,
                StoredResponse::Success { result: json!(true) },
            )
            .await
            .unwrap();
        let record = history.get(&topic, 3).await.unwrap();
        assert!(record.is_pending());

        // reads enforce the stored topic too
        assert!(matches!(
            history.get(&other, 3).await.unwrap_err(),
            crate::Error::MismatchedTopic { .. }
        ));
        assert!(!history.exists(&other, 3).await.unwrap());
        assert!(matches!(
            history.get(&topic, 99).await.unwrap_err(),
            crate::Error::NoMatchingId { id: 99 }
        ));
    }

    #[tokio::test]
    async fn delete_without_id_clears_the_topic() {
        let history = ready_history().await;
        let topic = topic("ee");
        let other = self::topic("ff");
        let mut events = history.subscribe_events();
        history
            .set(&topic, 1, request("eth_sign"), None)
            .await
            .unwrap();
        history
            .set(&topic, 2, request("eth_sign"), None)
            .await
            .unwrap();
        history
            .set(&other, 3, request("eth_sign"), None)
            .await
            .unwrap();

        // a mismatched single delete is silent
        history.delete(&other, Some(1)).await.unwrap();
        assert!(history.exists(&topic, 1).await.unwrap());

        history.delete(&topic, None).await.unwrap();
        assert!(!history.exists(&topic, 1).await.unwrap());
        assert!(!history.exists(&topic, 2).await.unwrap());
        assert!(history.exists(&other, 3).await.unwrap());

        // three Created plus one Deleted per removed record
        let mut created = 0;
        let mut deleted = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                HistoryEvent::Created(_) => created += 1,
                HistoryEvent::Deleted(_) => deleted += 1,
                HistoryEvent::Updated(_) => {}
            }
        }
        assert_eq!(created, 3);
        assert_eq!(deleted, 2);
    }

    #[tokio::test]
    async fn operations_wait_for_the_restore_gate() {
        let history =
            Arc::new(RequestHistory::new(InMemoryStore::default(), "gate"));
        let topic = topic("aa");

        let pending_set = {
            let history = history.clone();
            let topic = topic.clone();
            tokio::spawn(async move {
                history.set(&topic, 5, request("eth_sign"), None).await
            })
        };
        // the mutation cannot make progress while restoring
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending_set.is_finished());

        history.restore().await.unwrap();
        pending_set.await.unwrap().unwrap();
        assert!(history.exists(&topic, 5).await.unwrap());
    }

    #[tokio::test]
    async fn restore_refuses_to_override() {
        let history = ready_history().await;
        let topic = topic("aa");
        history
            .set(&topic, 1, request("eth_sign"), None)
            .await
            .unwrap();
        assert!(matches!(
            history.restore().await.unwrap_err(),
            crate::Error::RestoreWouldOverride { count: 1 }
        ));
    }

    #[tokio::test]
    async fn snapshots_survive_a_restart() {
        let store = InMemoryStore::default();
        let topic = topic("ab");
        {
            let history = RequestHistory::new(store.clone(), "restart");
            history.restore().await.unwrap();
            history
                .set(&topic, 7, request("eth_sign"), None)
                .await
                .unwrap();
            // snapshots are asynchronous; let the spawned task land
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let history = RequestHistory::new(store, "restart");
        history.restore().await.unwrap();
        let record = history.get(&topic, 7).await.unwrap();
        assert!(record.is_pending());

        history
            .update(
                &topic,
                7,
                StoredResponse::Success { result: json!("0xok") },
            )
            .await
            .unwrap();
        assert!(!history.get(&topic, 7).await.unwrap().is_pending());
    }
}
