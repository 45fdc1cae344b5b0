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

use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};

fn fresh_hex_id() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

macro_rules! hex_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize,
        )]
        pub struct $name(String);

        impl $name {
            /// Generates a fresh identifier from the OS RNG.
            pub fn generate() -> Self {
                Self(fresh_hex_id())
            }

            /// Returns the hex-encoded identifier.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

hex_id! {
    /// A fresh 32-byte identifier assigned to a socket at connection accept.
    /// Unique within a relay process and never reused.
    SocketId
}

hex_id! {
    /// The revocable handle returned to a subscriber.
    SubscriptionId
}

hex_id! {
    /// Identifies a relay node on the cross-node channel, so a node can
    /// recognize (and skip) its own notifications.
    NodeId
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_fresh_hex() {
        let a = SocketId::generate();
        let b = SocketId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 64);
        assert!(a.as_str().bytes().all(|b| b.is_ascii_hexdigit()));
    }
}
