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
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A 32-byte routing tag shared off-band by two peers, hex-encoded.
///
/// The relay never interprets a topic; it is only the unit of addressing,
/// so the type is a validated string rather than raw bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Topic(String);

impl Topic {
    /// Length of the hex-encoded form: 32 bytes.
    pub const HEX_LEN: usize = 64;

    /// Returns the hex-encoded topic string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The shared-store channel name used for cross-node notifications
    /// about this topic.
    pub fn channel(&self) -> String {
        format!("sub:{}", self.0)
    }
}

impl TryFrom<String> for Topic {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        let valid = value.len() == Self::HEX_LEN
            && value
                .bytes()
                .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        if valid {
            Ok(Self(value))
        } else {
            Err(crate::Error::InvalidTopic { value })
        }
    }
}

impl FromStr for Topic {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::try_from(s.to_owned())
    }
}

impl From<Topic> for String {
    fn from(topic: Topic) -> Self {
        topic.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
