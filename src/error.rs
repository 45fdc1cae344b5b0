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

/// An enum of all possible errors that could be encountered during the
/// execution of the relay.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An Io error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// JSON Error occurred.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// Config loading error.
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    /// Error while parsing the config files.
    #[error("Config parse error: {}", _0)]
    ParseConfig(#[from] serde_path_to_error::Error<config::ConfigError>),
    /// Error while iterating over a glob pattern.
    #[error(transparent)]
    GlobPattern(#[from] glob::PatternError),
    /// Error from Glob Iterator.
    #[error(transparent)]
    Glob(#[from] glob::GlobError),
    /// Error in the underlying Http/Ws server.
    #[error(transparent)]
    Axum(#[from] axum::Error),
    /// HTTP Error
    #[error(transparent)]
    Hyper(#[from] hyper::Error),
    /// Sled database error.
    #[error(transparent)]
    Sled(#[from] sled::Error),
    /// Sled transaction error.
    #[error(transparent)]
    SledTransaction(
        #[from] sled::transaction::TransactionError<std::io::Error>,
    ),
    /// A topic that is not a 32-byte lowercase hex string.
    #[error("Invalid topic: {}", value)]
    InvalidTopic {
        /// The rejected input.
        value: String,
    },
    /// The broker is in degraded mode and cannot accept new publishes.
    #[error("broker unavailable")]
    BrokerUnavailable,
    /// Failed to send the response to the client.
    #[error("Failed to send response to the client")]
    FailedToSendResponse,
    /// The per-socket outbound queue is full.
    #[error("Outbound queue overflow for socket {}", socket_id)]
    SocketQueueFull {
        /// The socket whose queue overflowed.
        socket_id: String,
    },
    /// The socket is not (or no longer) registered with the session layer.
    #[error("Unknown socket {}", socket_id)]
    UnknownSocket {
        /// The socket that could not be resolved.
        socket_id: String,
    },
    /// A history record with the same id already exists.
    #[error("Record already exists for id {}", id)]
    RecordAlreadyExists {
        /// The duplicated JSON-RPC id.
        id: u64,
    },
    /// No history record matches the requested id.
    #[error("No matching record for id {}", id)]
    NoMatchingId {
        /// The unresolved JSON-RPC id.
        id: u64,
    },
    /// The stored record belongs to a different topic.
    #[error(
        "Mismatched topic for id {}: expected {}, found {}",
        id,
        expected,
        found
    )]
    MismatchedTopic {
        /// The JSON-RPC id of the record.
        id: u64,
        /// The topic carried by the request.
        expected: String,
        /// The topic stored on the record.
        found: String,
    },
    /// A restore was attempted over a non-empty in-memory record set.
    #[error("Restore would override {} in-memory records", count)]
    RestoreWouldOverride {
        /// How many records are already held in memory.
        count: usize,
    },
    /// Generic error.
    #[error("{}", _0)]
    Generic(&'static str),
}

impl Error {
    /// Whether the error is worth retrying with backoff.
    ///
    /// Only I/O-shaped store failures qualify; everything else is either a
    /// protocol-level or a record-level error and retrying cannot help.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Io(_) => true,
            Error::Sled(sled::Error::Io(_)) => true,
            Error::SledTransaction(
                sled::transaction::TransactionError::Storage(
                    sled::Error::Io(_),
                ),
            ) => true,
            _ => false,
        }
    }
}

/// A type alias for the result for the relay, that uses the `Error` enum.
pub type Result<T> = std::result::Result<T, Error>;
