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

//! The WebSocket session layer: accept, framing, liveness, teardown.
//!
//! Each socket is one task running a single `select!` loop over the
//! inbound stream, the bounded outbound queue, the close signal, and the
//! server shutdown signal. Everything another task needs to reach a
//! socket goes through its [`SocketHandle`]; the handle's queue is the
//! only write path, so per-socket writes stay totally ordered.

use std::borrow::Cow;
use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::prelude::*;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::sync::Notify;

use crate::broker::OutboundSink;
use crate::probe;
use crate::rpc;
use crate::service::ServerState;
use crate::store::RelayStore;
use crate::types::SocketId;

/// WebSocket close codes the relay uses.
pub mod close_code {
    /// Normal teardown: the peer is going away or failed liveness.
    pub const NORMAL: u16 = 1001;
    /// The peer sent a frame above the size ceiling.
    pub const OVERSIZE: u16 = 1009;
    /// A delivery to the socket failed.
    pub const DELIVERY_FAILURE: u16 = 1011;
    /// The server is restarting.
    pub const RESTART: u16 = 1012;
    /// The socket's outbound queue overflowed.
    pub const OVERFLOW: u16 = 1013;
}

fn close_reason(code: u16) -> &'static str {
    match code {
        close_code::OVERSIZE => "message too big",
        close_code::DELIVERY_FAILURE => "delivery failure",
        close_code::RESTART => "server restart",
        close_code::OVERFLOW => "try again later",
        _ => "going away",
    }
}

/// Whether a read error is tungstenite rejecting a frame over its own
/// size ceiling. The error type is not exposed through axum, so this
/// matches on the capacity error messages ("Space limit exceeded:
/// Message too long: {size} > {max_size}").
fn is_oversize_error(error: &axum::Error) -> bool {
    let text = error.to_string();
    text.contains("Message too long") || text.contains("Space limit exceeded")
}

/// A shared handle to one live socket.
#[derive(Clone)]
pub struct SocketHandle {
    socket_id: SocketId,
    outbound: mpsc::Sender<Message>,
    is_alive: Arc<AtomicBool>,
    close_code: Arc<AtomicU16>,
    close_signal: Arc<Notify>,
}

impl SocketHandle {
    /// The socket this handle points at.
    pub fn socket_id(&self) -> &SocketId {
        &self.socket_id
    }

    /// Records liveness; called when a pong arrives.
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
    }

    /// Asks the socket task to close the connection with `code`.
    pub fn close(&self, code: u16) {
        self.close_code.store(code, Ordering::Relaxed);
        self.close_signal.notify_one();
    }

    /// Enqueues one frame on the socket's bounded outbound queue.
    pub fn try_send(&self, message: Message) -> crate::Result<()> {
        self.outbound.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                crate::Error::SocketQueueFull {
                    socket_id: self.socket_id.to_string(),
                }
            }
            mpsc::error::TrySendError::Closed(_) => {
                crate::Error::FailedToSendResponse
            }
        })
    }

    /// Clears the liveness flag, returning its previous value. One beat
    /// without a pong in between means the socket is gone.
    fn sweep_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Waits until a close has been requested for this socket.
    pub async fn closed(&self) {
        self.close_signal.notified().await;
    }

    fn close_frame(&self) -> Message {
        let code = match self.close_code.load(Ordering::Relaxed) {
            0 => close_code::NORMAL,
            code => code,
        };
        Message::Close(Some(CloseFrame {
            code,
            reason: Cow::from(close_reason(code)),
        }))
    }
}

/// The live set of sockets on this node, and the broker's outbound path
/// into them.
pub struct ActiveSockets {
    queue_depth: usize,
    sockets: RwLock<HashMap<SocketId, SocketHandle>>,
}

impl ActiveSockets {
    /// Creates an empty set; outbound queues get `queue_depth` slots.
    pub fn new(queue_depth: usize) -> Arc<Self> {
        Arc::new(Self {
            queue_depth,
            sockets: RwLock::new(HashMap::new()),
        })
    }

    /// Registers a fresh socket, returning its handle and the receive
    /// half of its outbound queue for the socket task to drain.
    pub fn register(
        &self,
        socket_id: SocketId,
    ) -> (SocketHandle, mpsc::Receiver<Message>) {
        let (outbound, rx) = mpsc::channel(self.queue_depth);
        let handle = SocketHandle {
            socket_id: socket_id.clone(),
            outbound,
            is_alive: Arc::new(AtomicBool::new(true)),
            close_code: Arc::new(AtomicU16::new(0)),
            close_signal: Arc::new(Notify::new()),
        };
        self.sockets.write().insert(socket_id, handle.clone());
        (handle, rx)
    }

    /// Drops a socket from the live set.
    pub fn remove(&self, socket_id: &SocketId) {
        self.sockets.write().remove(socket_id);
    }

    /// Resolves a live socket.
    pub fn get(&self, socket_id: &SocketId) -> Option<SocketHandle> {
        self.sockets.read().get(socket_id).cloned()
    }

    /// How many sockets are currently live.
    pub fn len(&self) -> usize {
        self.sockets.read().len()
    }

    /// Whether no socket is currently live.
    pub fn is_empty(&self) -> bool {
        self.sockets.read().is_empty()
    }

    /// One server beat: sockets that never ponged since the previous
    /// beat are closed, everyone else is pinged. Returns the evicted
    /// sockets.
    pub fn beat(&self) -> Vec<SocketId> {
        let handles: Vec<SocketHandle> =
            self.sockets.read().values().cloned().collect();
        let mut evicted = Vec::new();
        for handle in handles {
            if !handle.sweep_alive() {
                handle.close(close_code::NORMAL);
                evicted.push(handle.socket_id.clone());
            } else if handle.try_send(Message::Ping(Vec::new())).is_err() {
                handle.close(close_code::OVERFLOW);
            }
        }
        evicted
    }
}

impl OutboundSink for ActiveSockets {
    fn try_send_request(
        &self,
        socket_id: &SocketId,
        request: &rpc::SubscriptionRequest,
    ) -> crate::Result<()> {
        let handle =
            self.get(socket_id)
                .ok_or_else(|| crate::Error::UnknownSocket {
                    socket_id: socket_id.to_string(),
                })?;
        let text = serde_json::to_string(request)?;
        handle.try_send(Message::Text(text))
    }

    fn close(&self, socket_id: &SocketId, code: u16) {
        if let Some(handle) = self.get(socket_id) {
            handle.close(code);
        }
    }
}

/// Wait for websocket connection upgrade
pub async fn websocket_handler<S: RelayStore>(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ServerState<S>>>,
    headers: HeaderMap,
) -> Response {
    let allowed_origins = &state.ctx.config.allowed_origins;
    if !allowed_origins.is_empty() {
        let allowed = headers
            .get(header::ORIGIN)
            .and_then(|v| v.to_str().ok())
            .map(|origin| allowed_origins.iter().any(|a| a == origin))
            .unwrap_or(false);
        if !allowed {
            return (StatusCode::FORBIDDEN, "origin not allowed")
                .into_response();
        }
    }
    // the tungstenite ceiling sits above ours so the oversize close code
    // stays under our control
    let ceiling = state.ctx.config.max_frame_bytes.saturating_mul(2);
    ws.max_message_size(ceiling)
        .max_frame_size(ceiling)
        .on_upgrade(move |socket| accept_socket_connection(socket, state))
}

/// Runs one socket from accept to teardown.
async fn accept_socket_connection<S: RelayStore>(
    ws: WebSocket,
    state: Arc<ServerState<S>>,
) {
    let socket_id = SocketId::generate();
    let (handle, mut outbound) = state.sockets.register(socket_id.clone());
    tracing::event!(
        target: probe::TARGET,
        tracing::Level::DEBUG,
        kind = %probe::Kind::Socket,
        accepted = %socket_id,
    );
    let (mut ws_tx, mut ws_rx) = ws.split();
    let mut shutdown = state.ctx.shutdown_signal();
    loop {
        tokio::select! {
            frame = ws_rx.next() => match frame {
                Some(Ok(message)) => {
                    if handle_inbound(&state, &handle, message)
                        .await
                        .is_break()
                    {
                        break;
                    }
                }
                Some(Err(e)) => {
                    // frames past the transport ceiling never reach
                    // handle_frame; the peer still gets the oversize close
                    if is_oversize_error(&e) {
                        handle.close(close_code::OVERSIZE);
                        let _ = ws_tx.send(handle.close_frame()).await;
                    }
                    tracing::warn!("Websocket error on {socket_id}: {e}");
                    break;
                }
                None => break,
            },
            queued = outbound.recv() => match queued {
                Some(message) => {
                    if ws_tx.send(message).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            _ = handle.closed() => {
                let _ = ws_tx.send(handle.close_frame()).await;
                break;
            }
            _ = shutdown.recv() => {
                handle.close(close_code::RESTART);
                let _ = ws_tx.send(handle.close_frame()).await;
                break;
            }
        }
    }
    state.sockets.remove(&socket_id);
    state.broker.on_socket_closed(&socket_id);
    tracing::event!(
        target: probe::TARGET,
        tracing::Level::DEBUG,
        kind = %probe::Kind::Socket,
        closed = %socket_id,
    );
}

async fn handle_inbound<S: RelayStore>(
    state: &Arc<ServerState<S>>,
    handle: &SocketHandle,
    message: Message,
) -> ControlFlow<()> {
    match message {
        Message::Text(text) => handle_frame(state, handle, &text).await,
        Message::Ping(data) => {
            let _ = handle.try_send(Message::Pong(data));
            ControlFlow::Continue(())
        }
        Message::Pong(_) => {
            handle.mark_alive();
            ControlFlow::Continue(())
        }
        Message::Binary(_) => {
            enqueue(
                handle,
                &rpc::failure(
                    None,
                    rpc::INVALID_REQUEST,
                    "binary frames are not supported",
                ),
            );
            ControlFlow::Continue(())
        }
        Message::Close(_) => ControlFlow::Break(()),
    }
}

/// Handles one text frame. Protocol errors answer the peer and keep the
/// socket open; capacity errors schedule a close.
pub async fn handle_frame<S: RelayStore>(
    state: &Arc<ServerState<S>>,
    handle: &SocketHandle,
    text: &str,
) -> ControlFlow<()> {
    if text.len() > state.ctx.config.max_frame_bytes {
        handle.close(close_code::OVERSIZE);
        return ControlFlow::Continue(());
    }
    if text.trim().is_empty() {
        enqueue(
            handle,
            &rpc::failure(None, rpc::PARSE_ERROR, "empty frame"),
        );
        return ControlFlow::Continue(());
    }
    let request: rpc::InboundRequest = match serde_json::from_str(text) {
        Ok(request) => request,
        Err(e) => {
            tracing::debug!("Got invalid payload: {e}");
            enqueue(
                handle,
                &rpc::failure(None, rpc::PARSE_ERROR, e.to_string()),
            );
            return ControlFlow::Continue(());
        }
    };
    if request.jsonrpc != rpc::VERSION {
        enqueue(
            handle,
            &rpc::failure(
                Some(request.id),
                rpc::INVALID_REQUEST,
                "unsupported jsonrpc version",
            ),
        );
        return ControlFlow::Continue(());
    }
    dispatch(state, handle, request).await;
    ControlFlow::Continue(())
}

async fn dispatch<S: RelayStore>(
    state: &Arc<ServerState<S>>,
    handle: &SocketHandle,
    request: rpc::InboundRequest,
) {
    let id = request.id;
    match request.method.as_str() {
        rpc::RELAY_PUBLISH => {
            match serde_json::from_value::<rpc::PublishParams>(request.params)
            {
                Ok(params) => {
                    let published = state
                        .broker
                        .publish(
                            Some(handle.socket_id()),
                            &params.topic,
                            &params.message,
                            params.ttl,
                        )
                        .await;
                    match published {
                        Ok(_) => enqueue(handle, &rpc::success(id, true)),
                        Err(e) => enqueue(
                            handle,
                            &rpc::failure(
                                Some(id),
                                rpc::SERVER_ERROR,
                                e.to_string(),
                            ),
                        ),
                    }
                }
                Err(e) => enqueue(
                    handle,
                    &rpc::failure(
                        Some(id),
                        rpc::INVALID_PARAMS,
                        e.to_string(),
                    ),
                ),
            }
        }
        rpc::RELAY_SUBSCRIBE => {
            match serde_json::from_value::<rpc::SubscribeParams>(
                request.params,
            ) {
                Ok(params) => {
                    let subscribed = state
                        .broker
                        .subscribe(handle.socket_id(), &params.topic)
                        .await;
                    match subscribed {
                        Ok(subscription_id) => enqueue(
                            handle,
                            &rpc::success(id, subscription_id),
                        ),
                        Err(e) => enqueue(
                            handle,
                            &rpc::failure(
                                Some(id),
                                rpc::SERVER_ERROR,
                                e.to_string(),
                            ),
                        ),
                    }
                }
                Err(e) => enqueue(
                    handle,
                    &rpc::failure(
                        Some(id),
                        rpc::INVALID_PARAMS,
                        e.to_string(),
                    ),
                ),
            }
        }
        rpc::RELAY_UNSUBSCRIBE => {
            match serde_json::from_value::<rpc::UnsubscribeParams>(
                request.params,
            ) {
                Ok(params) => {
                    state.broker.unsubscribe(handle.socket_id(), &params.id);
                    enqueue(handle, &rpc::success(id, true));
                }
                Err(e) => enqueue(
                    handle,
                    &rpc::failure(
                        Some(id),
                        rpc::INVALID_PARAMS,
                        e.to_string(),
                    ),
                ),
            }
        }
        rpc::RELAY_ACK => {
            match serde_json::from_value::<rpc::AckParams>(request.params) {
                Ok(params) => {
                    let acked = state
                        .broker
                        .acknowledge(
                            handle.socket_id(),
                            &params.topic,
                            &params.message_hash,
                        )
                        .await;
                    match acked {
                        Ok(()) => enqueue(handle, &rpc::success(id, true)),
                        Err(e) => enqueue(
                            handle,
                            &rpc::failure(
                                Some(id),
                                rpc::SERVER_ERROR,
                                e.to_string(),
                            ),
                        ),
                    }
                }
                Err(e) => enqueue(
                    handle,
                    &rpc::failure(
                        Some(id),
                        rpc::INVALID_PARAMS,
                        e.to_string(),
                    ),
                ),
            }
        }
        unknown => enqueue(
            handle,
            &rpc::failure(
                Some(id),
                rpc::METHOD_NOT_FOUND,
                format!("unknown method {unknown}"),
            ),
        ),
    }
}

fn enqueue<T: serde::Serialize>(handle: &SocketHandle, response: &T) {
    match serde_json::to_string(response) {
        Ok(text) => {
            if let Err(e) = handle.try_send(Message::Text(text)) {
                if matches!(e, crate::Error::SocketQueueFull { .. }) {
                    handle.close(close_code::OVERFLOW);
                }
            }
        }
        Err(e) => tracing::error!("Failed to serialize response: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::RelayConfig;
    use crate::context::RelayContext;
    use crate::service;
    use crate::store::InMemoryStore;

    async fn state() -> Arc<ServerState<InMemoryStore>> {
        let ctx = RelayContext::new(RelayConfig::default());
        let (state, history) =
            service::build_state(ctx, InMemoryStore::default());
        history.restore().await.unwrap();
        state
    }

    fn recv_json(rx: &mut mpsc::Receiver<Message>) -> serde_json::Value {
        match rx.try_recv().expect("expected a queued frame") {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_frames_answer_and_keep_the_socket_open() {
        let state = state().await;
        let (handle, mut rx) =
            state.sockets.register(SocketId::generate());

        assert!(handle_frame(&state, &handle, "   ").await.is_continue());
        let response = recv_json(&mut rx);
        assert_eq!(response["error"]["code"], rpc::PARSE_ERROR);
        assert!(response["id"].is_null());

        assert!(handle_frame(&state, &handle, "not json")
            .await
            .is_continue());
        let response = recv_json(&mut rx);
        assert_eq!(response["error"]["code"], rpc::PARSE_ERROR);
    }

    #[tokio::test]
    async fn unknown_methods_and_bad_params_are_protocol_errors() {
        let state = state().await;
        let (handle, mut rx) =
            state.sockets.register(SocketId::generate());

        let frame =
            r#"{"jsonrpc":"2.0","id":9,"method":"relay_frobnicate","params":{}}"#;
        handle_frame(&state, &handle, frame).await;
        let response = recv_json(&mut rx);
        assert_eq!(response["id"], 9);
        assert_eq!(response["error"]["code"], rpc::METHOD_NOT_FOUND);

        // a known method with an invalid topic
        let frame = r#"{"jsonrpc":"2.0","id":10,"method":"relay_subscribe","params":{"topic":"short"}}"#;
        handle_frame(&state, &handle, frame).await;
        let response = recv_json(&mut rx);
        assert_eq!(response["error"]["code"], rpc::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn oversize_frames_schedule_an_oversize_close() {
        let state = state().await;
        let (handle, mut rx) =
            state.sockets.register(SocketId::generate());

        let frame = "a".repeat(state.ctx.config.max_frame_bytes + 1);
        assert!(handle_frame(&state, &handle, &frame).await.is_continue());
        // no response is queued; the socket task is asked to close
        assert!(rx.try_recv().is_err());
        tokio::time::timeout(Duration::from_millis(10), handle.closed())
            .await
            .expect("close was not scheduled");
    }

    #[tokio::test]
    async fn publish_subscribe_ack_dispatch_round_trip() {
        let state = state().await;
        let topic = "aa".repeat(32);

        let (subscriber, mut sub_rx) =
            state.sockets.register(SocketId::generate());
        let frame = format!(
            r#"{{"jsonrpc":"2.0","id":1,"method":"relay_subscribe","params":{{"topic":"{topic}"}}}}"#
        );
        handle_frame(&state, &subscriber, &frame).await;
        let response = recv_json(&mut sub_rx);
        assert_eq!(response["id"], 1);
        let subscription_id =
            response["result"].as_str().unwrap().to_string();
        assert_eq!(subscription_id.len(), 64);

        let (publisher, mut pub_rx) =
            state.sockets.register(SocketId::generate());
        let frame = format!(
            r#"{{"jsonrpc":"2.0","id":2,"method":"relay_publish","params":{{"topic":"{topic}","message":"hello","ttl":60}}}}"#
        );
        handle_frame(&state, &publisher, &frame).await;
        let response = recv_json(&mut pub_rx);
        assert_eq!(response["id"], 2);
        assert_eq!(response["result"], true);

        let delivery = recv_json(&mut sub_rx);
        assert_eq!(delivery["method"], "relay_subscription");
        assert_eq!(delivery["params"]["id"], subscription_id.as_str());
        let hash = delivery["params"]["data"]["messageHash"]
            .as_str()
            .unwrap()
            .to_string();

        let frame = format!(
            r#"{{"jsonrpc":"2.0","id":3,"method":"relay_ack","params":{{"topic":"{topic}","messageHash":"{hash}"}}}}"#
        );
        handle_frame(&state, &subscriber, &frame).await;
        let response = recv_json(&mut sub_rx);
        assert_eq!(response["result"], true);
    }

    #[tokio::test]
    async fn unsubscribe_stops_future_deliveries() {
        let state = state().await;
        let topic = "bb".repeat(32);

        let (subscriber, mut sub_rx) =
            state.sockets.register(SocketId::generate());
        let frame = format!(
            r#"{{"jsonrpc":"2.0","id":1,"method":"relay_subscribe","params":{{"topic":"{topic}"}}}}"#
        );
        handle_frame(&state, &subscriber, &frame).await;
        let response = recv_json(&mut sub_rx);
        let subscription_id =
            response["result"].as_str().unwrap().to_string();

        let frame = format!(
            r#"{{"jsonrpc":"2.0","id":2,"method":"relay_unsubscribe","params":{{"topic":"{topic}","id":"{subscription_id}"}}}}"#
        );
        handle_frame(&state, &subscriber, &frame).await;
        let response = recv_json(&mut sub_rx);
        assert_eq!(response["result"], true);

        let (publisher, mut pub_rx) =
            state.sockets.register(SocketId::generate());
        let frame = format!(
            r#"{{"jsonrpc":"2.0","id":3,"method":"relay_publish","params":{{"topic":"{topic}","message":"nobody home","ttl":60}}}}"#
        );
        handle_frame(&state, &publisher, &frame).await;
        let _ = recv_json(&mut pub_rx);
        // the revoked subscriber hears nothing
        assert!(sub_rx.try_recv().is_err());
    }
}

