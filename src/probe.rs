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

use derive_more::Display;
/// Target for logger
pub const TARGET: &str = "relay_probe";

/// The Kind of the Probe.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    /// When the Lifecycle of the Relay changes, like starting or shutting down.
    #[display(fmt = "lifecycle")]
    Lifecycle,
    /// Socket accept, liveness eviction, and teardown events.
    #[display(fmt = "socket")]
    Socket,
    /// Message broker state: retained, settled, and expired messages.
    #[display(fmt = "broker")]
    Broker,
    /// Subscription registry interest changes on a topic.
    #[display(fmt = "registry")]
    Registry,
    /// JSON-RPC history restore and snapshot events.
    #[display(fmt = "history")]
    History,
    /// When the relay will retry a store operation.
    #[display(fmt = "retry")]
    Retry,
    /// When the broker drops to local-only or degraded mode.
    #[display(fmt = "degraded")]
    Degraded,
}
