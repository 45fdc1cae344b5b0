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

//! JSON-RPC 2.0 framing for the WebSocket wire.
//!
//! Every frame is one complete JSON document. Inbound frames are parsed
//! into [`InboundRequest`] first so a malformed `params` object can still
//! be answered with the caller's request id, and only then into the
//! per-method params types.

use serde::{Deserialize, Serialize};

use crate::types::{MessageHash, SubscriptionId, Topic};

/// The JSON-RPC protocol version the relay speaks.
pub const VERSION: &str = "2.0";

/// Inbound method: publish a payload to a topic.
pub const RELAY_PUBLISH: &str = "relay_publish";
/// Inbound method: subscribe the socket to a topic.
pub const RELAY_SUBSCRIBE: &str = "relay_subscribe";
/// Inbound method: revoke a subscription by id.
pub const RELAY_UNSUBSCRIBE: &str = "relay_unsubscribe";
/// Inbound method: acknowledge a delivered message.
pub const RELAY_ACK: &str = "relay_ack";
/// Server-initiated method carrying a delivered message.
pub const RELAY_SUBSCRIPTION: &str = "relay_subscription";

/// JSON-RPC error code for an unparseable frame.
pub const PARSE_ERROR: i64 = -32700;
/// JSON-RPC error code for a frame that is not a valid request.
pub const INVALID_REQUEST: i64 = -32600;
/// JSON-RPC error code for an unknown method.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// JSON-RPC error code for params that fail to parse for a known method.
pub const INVALID_PARAMS: i64 = -32602;
/// JSON-RPC error code for a server-side failure, including the
/// "broker unavailable" rejection in degraded mode.
pub const SERVER_ERROR: i64 = -32000;

/// A single inbound JSON-RPC request, with `params` left opaque.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundRequest {
    /// Protocol version; must be `"2.0"`.
    pub jsonrpc: String,
    /// Request id chosen by the peer.
    pub id: u64,
    /// Method name.
    pub method: String,
    /// Raw params, parsed per-method.
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Params of [`RELAY_PUBLISH`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishParams {
    /// The topic the payload is addressed to.
    pub topic: Topic,
    /// The opaque ciphertext payload.
    pub message: String,
    /// Retention window in seconds.
    pub ttl: u64,
}

/// Params of [`RELAY_SUBSCRIBE`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeParams {
    /// The topic to subscribe to.
    pub topic: Topic,
}

/// Params of [`RELAY_UNSUBSCRIBE`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribeParams {
    /// The topic the subscription was made on.
    pub topic: Topic,
    /// The subscription handle to revoke.
    pub id: SubscriptionId,
}

/// Params of [`RELAY_ACK`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckParams {
    /// The topic the message was delivered on.
    pub topic: Topic,
    /// The content hash of the acknowledged message.
    pub message_hash: MessageHash,
}

/// The delivered message inside a [`RELAY_SUBSCRIPTION`] request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionData {
    /// The topic the message was published to.
    pub topic: Topic,
    /// The opaque ciphertext payload.
    pub message: String,
    /// The content hash the subscriber must echo in its `relay_ack`.
    pub message_hash: MessageHash,
}

/// Params of a server-initiated [`RELAY_SUBSCRIPTION`] request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionParams {
    /// The subscription the delivery belongs to.
    pub id: SubscriptionId,
    /// The delivered message.
    pub data: SubscriptionData,
}

/// A server-initiated `relay_subscription` request.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionRequest {
    /// Protocol version; always `"2.0"`.
    pub jsonrpc: &'static str,
    /// Fresh request id assigned by the broker.
    pub id: u64,
    /// Always [`RELAY_SUBSCRIPTION`].
    pub method: &'static str,
    /// The delivery payload.
    pub params: SubscriptionParams,
}

impl SubscriptionRequest {
    /// Builds a delivery request for one subscriber.
    pub fn new(
        id: u64,
        subscription: SubscriptionId,
        topic: Topic,
        message: String,
        message_hash: MessageHash,
    ) -> Self {
        Self {
            jsonrpc: VERSION,
            id,
            method: RELAY_SUBSCRIPTION,
            params: SubscriptionParams {
                id: subscription,
                data: SubscriptionData {
                    topic,
                    message,
                    message_hash,
                },
            },
        }
    }
}

/// A successful JSON-RPC response.
#[derive(Debug, Clone, Serialize)]
pub struct SuccessResponse<T> {
    /// Protocol version; always `"2.0"`.
    pub jsonrpc: &'static str,
    /// The id of the request being answered.
    pub id: u64,
    /// The method result.
    pub result: T,
}

/// Builds a successful response for the given request id.
pub fn success<T: Serialize>(id: u64, result: T) -> SuccessResponse<T> {
    SuccessResponse {
        jsonrpc: VERSION,
        id,
        result,
    }
}

/// The error member of a JSON-RPC error response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorObject {
    /// One of the `*_ERROR` codes above.
    pub code: i64,
    /// Human-readable description.
    pub message: String,
}

/// A JSON-RPC error response. `id` is absent when the frame was too
/// malformed to recover one.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    /// Protocol version; always `"2.0"`.
    pub jsonrpc: &'static str,
    /// The id of the offending request, when recoverable.
    pub id: Option<u64>,
    /// The error description.
    pub error: ErrorObject,
}

/// Builds an error response.
pub fn failure(
    id: Option<u64>,
    code: i64,
    message: impl Into<String>,
) -> ErrorResponse {
    ErrorResponse {
        jsonrpc: VERSION,
        id,
        error: ErrorObject {
            code,
            message: message.into(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_publish_request() {
        let topic = "aa".repeat(32);
        let raw = format!(
            r#"{{"jsonrpc":"2.0","id":1,"method":"relay_publish","params":{{"topic":"{topic}","message":"0xdeadbeef","ttl":60}}}}"#
        );
        let request: InboundRequest = serde_json::from_str(&raw).unwrap();
        assert_eq!(request.method, RELAY_PUBLISH);
        let params: PublishParams =
            serde_json::from_value(request.params).unwrap();
        assert_eq!(params.topic.as_str(), topic);
        assert_eq!(params.ttl, 60);
    }

    #[test]
    fn rejects_garbage_frames() {
        assert!(serde_json::from_str::<InboundRequest>("not json").is_err());
        assert!(serde_json::from_str::<InboundRequest>("{}").is_err());
    }

    #[test]
    fn subscription_request_wire_shape() {
        let topic: Topic = "bb".repeat(32).parse().unwrap();
        let hash = MessageHash::of("payload");
        let request = SubscriptionRequest::new(
            42,
            SubscriptionId::generate(),
            topic.clone(),
            "payload".into(),
            hash.clone(),
        );
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["method"], RELAY_SUBSCRIPTION);
        assert_eq!(value["params"]["data"]["topic"], topic.as_str());
        assert_eq!(
            value["params"]["data"]["messageHash"],
            hash.as_str()
        );
    }

    #[test]
    fn error_response_keeps_null_id() {
        let response = failure(None, PARSE_ERROR, "empty frame");
        let value = serde_json::to_value(&response).unwrap();
        assert!(value["id"].is_null());
        assert_eq!(value["error"]["code"], PARSE_ERROR);
    }
}
