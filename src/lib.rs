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
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! # Topic Relay Crate 🕸️
//!
//! A content-blind relay that mediates end-to-end encrypted JSON-RPC
//! traffic between mutually anonymous peers, typically a decentralized
//! application and a wallet.
//!
//! ## Overview
//!
//! Peers never address one another directly. Each publishes opaque
//! ciphertext payloads tagged with a shared topic (a 32-byte hex string
//! derived off-band), and the relay fans those payloads out to every
//! other peer currently subscribed to the same topic. The relay neither
//! decrypts nor inspects payloads; its value is the correctness of its
//! routing, subscription, acknowledgement, and persistence semantics
//! under concurrent connections and partial failure.
//!
//! The crate is composed of five cooperating components:
//!
//!   1. The shared [`store`]: retained messages, history snapshots, and
//!      the per-topic pub/sub channels that federate several relay nodes
//!      into one logical bus.
//!   2. The subscription [`registry`]: the per-node topic ↔ socket index.
//!   3. The message [`broker`]: publish/subscribe semantics, the
//!      acknowledgement protocol, and retained-until-delivered storage.
//!   4. The socket [`session`] layer: WebSocket lifecycle, JSON-RPC
//!      framing, heartbeat, and per-socket dispatch.
//!   5. The JSON-RPC [`history`]: the per-topic record of outstanding
//!      requests and their responses, persisted through the store.
//!
//! A message published to a topic is retained under its content hash
//! until every notified subscriber has acknowledged it with `relay_ack`,
//! or until its ttl elapses. A subscriber that arrives within the ttl
//! receives every retained message for the topic, in arrival order,
//! before anything published later.

/// The message broker.
pub mod broker;
/// Configuration loading and command-line entry points.
pub mod config;
/// The relay context: configuration plus the shutdown signal.
pub mod context;
mod error;
/// The JSON-RPC request history.
pub mod history;
/// A module used for debugging the relay lifecycle and state.
pub mod probe;
/// The subscription registry.
pub mod registry;
/// Retry functionality.
pub mod retry;
/// JSON-RPC wire types.
pub mod rpc;
/// Component wiring and background services.
pub mod service;
/// The WebSocket session layer.
pub mod session;
/// Storage backends.
pub mod store;
/// Core identifier types.
pub mod types;

pub use error::{Error, Result};
