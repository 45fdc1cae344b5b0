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

//! The per-node topic ↔ socket index.
//!
//! All four mappings are maintained atomically under a single writer
//! lock, so a reader can never observe a subscription that is present in
//! one index and missing from another. Cross-node interest propagation is
//! not the registry's job; it only reports the first/last-subscriber
//! facts the broker needs to drive the channel notifications.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;

use crate::types::{SocketId, SubscriptionId, Topic};

/// One active subscription, resolvable by its id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// The subscribed socket.
    pub socket_id: SocketId,
    /// The subscribed topic.
    pub topic: Topic,
}

/// The outcome of a `subscribe` call.
#[derive(Debug, Clone)]
pub struct Subscribed {
    /// The handle the subscriber can later revoke.
    pub id: SubscriptionId,
    /// `false` when an identical (socket, topic) subscription already
    /// existed and its id was returned instead.
    pub created: bool,
    /// Whether this is the node's first local subscription to the topic.
    pub first_for_topic: bool,
}

/// The outcome of an `unsubscribe` (or close-driven) removal.
#[derive(Debug, Clone)]
pub struct Unsubscribed {
    /// The topic the removed subscription was on.
    pub topic: Topic,
    /// Whether the node now has no local subscription to the topic.
    pub last_for_topic: bool,
}

#[derive(Default)]
struct Index {
    by_topic: HashMap<Topic, HashSet<SubscriptionId>>,
    by_socket: HashMap<SocketId, HashSet<SubscriptionId>>,
    by_pair: HashMap<(SocketId, Topic), SubscriptionId>,
    resolve: HashMap<SubscriptionId, Subscription>,
}

impl Index {
    fn remove(&mut self, id: &SubscriptionId) -> Option<Unsubscribed> {
        let subscription = self.resolve.remove(id)?;
        let Subscription { socket_id, topic } = subscription;
        self.by_pair.remove(&(socket_id.clone(), topic.clone()));
        if let Some(ids) = self.by_socket.get_mut(&socket_id) {
            ids.remove(id);
            if ids.is_empty() {
                self.by_socket.remove(&socket_id);
            }
        }
        let mut last_for_topic = false;
        if let Some(ids) = self.by_topic.get_mut(&topic) {
            ids.remove(id);
            if ids.is_empty() {
                self.by_topic.remove(&topic);
                last_for_topic = true;
            }
        }
        Some(Unsubscribed {
            topic,
            last_for_topic,
        })
    }
}

/// The subscription registry of a single relay node.
#[derive(Default)]
pub struct SubscriptionRegistry {
    index: RwLock<Index>,
}

impl SubscriptionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes `socket_id` to `topic`. Idempotent per (socket, topic):
    /// a repeated call returns the existing id.
    pub fn subscribe(&self, socket_id: &SocketId, topic: &Topic) -> Subscribed {
        let mut index = self.index.write();
        let pair = (socket_id.clone(), topic.clone());
        if let Some(existing) = index.by_pair.get(&pair) {
            return Subscribed {
                id: existing.clone(),
                created: false,
                first_for_topic: false,
            };
        }
        let id = SubscriptionId::generate();
        let first_for_topic = !index.by_topic.contains_key(topic);
        index
            .by_topic
            .entry(topic.clone())
            .or_default()
            .insert(id.clone());
        index
            .by_socket
            .entry(socket_id.clone())
            .or_default()
            .insert(id.clone());
        index.by_pair.insert(pair, id.clone());
        index.resolve.insert(
            id.clone(),
            Subscription {
                socket_id: socket_id.clone(),
                topic: topic.clone(),
            },
        );
        Subscribed {
            id,
            created: true,
            first_for_topic,
        }
    }

    /// Removes exactly one subscription. Returns `None` (silently, from
    /// the peer's point of view) when the id is unknown or belongs to a
    /// different socket.
    pub fn unsubscribe(
        &self,
        socket_id: &SocketId,
        id: &SubscriptionId,
    ) -> Option<Unsubscribed> {
        let mut index = self.index.write();
        let owned = index
            .resolve
            .get(id)
            .map(|s| &s.socket_id == socket_id)
            .unwrap_or(false);
        if owned {
            index.remove(id)
        } else {
            None
        }
    }

    /// Every local socket currently subscribed to `topic`.
    pub fn sockets_for_topic(&self, topic: &Topic) -> HashSet<SocketId> {
        let index = self.index.read();
        index
            .by_topic
            .get(topic)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| index.resolve.get(id))
                    .map(|s| s.socket_id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every topic `socket_id` is currently subscribed to.
    pub fn topics_for_socket(&self, socket_id: &SocketId) -> HashSet<Topic> {
        let index = self.index.read();
        index
            .by_socket
            .get(socket_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| index.resolve.get(id))
                    .map(|s| s.topic.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Resolves a subscription by id.
    pub fn subscription(&self, id: &SubscriptionId) -> Option<Subscription> {
        self.index.read().resolve.get(id).cloned()
    }

    /// The subscription id held by `(socket_id, topic)`, if any.
    pub fn subscription_for(
        &self,
        socket_id: &SocketId,
        topic: &Topic,
    ) -> Option<SubscriptionId> {
        self.index
            .read()
            .by_pair
            .get(&(socket_id.clone(), topic.clone()))
            .cloned()
    }

    /// Removes every subscription of `socket_id`, returning one outcome
    /// per removed subscription.
    pub fn on_close(&self, socket_id: &SocketId) -> Vec<Unsubscribed> {
        let mut index = self.index.write();
        let ids: Vec<SubscriptionId> = index
            .by_socket
            .get(socket_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        ids.iter().filter_map(|id| index.remove(id)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topic(byte: &str) -> Topic {
        byte.repeat(32).parse().unwrap()
    }

    #[test]
    fn subscribe_is_idempotent_per_socket_and_topic() {
        let registry = SubscriptionRegistry::new();
        let socket = SocketId::generate();
        let topic = topic("aa");

        let first = registry.subscribe(&socket, &topic);
        assert!(first.created);
        assert!(first.first_for_topic);

        let again = registry.subscribe(&socket, &topic);
        assert_eq!(again.id, first.id);
        assert!(!again.created);
        assert!(!again.first_for_topic);

        assert_eq!(registry.sockets_for_topic(&topic).len(), 1);
    }

    #[test]
    fn first_and_last_interest_are_reported() {
        let registry = SubscriptionRegistry::new();
        let a = SocketId::generate();
        let b = SocketId::generate();
        let topic = topic("bb");

        let sub_a = registry.subscribe(&a, &topic);
        let sub_b = registry.subscribe(&b, &topic);
        assert!(sub_a.first_for_topic);
        assert!(!sub_b.first_for_topic);

        let out_a = registry.unsubscribe(&a, &sub_a.id).unwrap();
        assert!(!out_a.last_for_topic);
        let out_b = registry.unsubscribe(&b, &sub_b.id).unwrap();
        assert!(out_b.last_for_topic);
    }

    #[test]
    fn unsubscribe_is_silent_for_unknown_or_foreign_ids() {
        let registry = SubscriptionRegistry::new();
        let socket = SocketId::generate();
        let other = SocketId::generate();
        let topic = topic("cc");

        let sub = registry.subscribe(&socket, &topic);
        // a different socket cannot revoke it
        assert!(registry.unsubscribe(&other, &sub.id).is_none());
        assert!(registry.subscription(&sub.id).is_some());
        // unknown ids are ignored
        assert!(registry
            .unsubscribe(&socket, &SubscriptionId::generate())
            .is_none());
        // repeated unsubscribe is safe
        assert!(registry.unsubscribe(&socket, &sub.id).is_some());
        assert!(registry.unsubscribe(&socket, &sub.id).is_none());
    }

    #[test]
    fn on_close_removes_every_subscription_of_the_socket() {
        let registry = SubscriptionRegistry::new();
        let socket = SocketId::generate();
        let other = SocketId::generate();
        let t1 = topic("dd");
        let t2 = topic("ee");

        registry.subscribe(&socket, &t1);
        registry.subscribe(&socket, &t2);
        registry.subscribe(&other, &t1);

        let removed = registry.on_close(&socket);
        assert_eq!(removed.len(), 2);
        // t1 still has `other`, t2 is gone
        let t2_removed =
            removed.iter().find(|u| u.topic == t2).unwrap();
        assert!(t2_removed.last_for_topic);
        let t1_removed =
            removed.iter().find(|u| u.topic == t1).unwrap();
        assert!(!t1_removed.last_for_topic);

        assert!(registry.topics_for_socket(&socket).is_empty());
        assert_eq!(registry.sockets_for_topic(&t1).len(), 1);
    }
}
