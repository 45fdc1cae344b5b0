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

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// The SHA-256 content hash of a published payload, hex-encoded.
///
/// Retention is keyed by `(topic, hash)`, which makes a republish of the
/// same ciphertext idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageHash(String);

impl MessageHash {
    /// Hashes the payload of a message.
    pub fn of(payload: &str) -> Self {
        let digest = Sha256::digest(payload.as_bytes());
        Self(hex::encode(digest))
    }

    /// Returns the hex-encoded hash.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashes_are_stable_and_content_addressed() {
        let a = MessageHash::of("hello");
        let b = MessageHash::of("hello");
        let c = MessageHash::of("world");
        assert_eq!(a, b);
        assert_ne!(a, c);
        // sha256("hello")
        assert_eq!(
            a.as_str(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }
}
