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

//! A module for wiring the relay components together and starting the
//! long-running tasks: the WebSocket server, the beat task, and the
//! history restore.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use futures::Future;

use crate::broker::MessageBroker;
use crate::context::RelayContext;
use crate::history::RequestHistory;
use crate::probe;
use crate::registry::SubscriptionRegistry;
use crate::session::{self, ActiveSockets};
use crate::store::RelayStore;

/// Everything a socket task needs, shared behind one `Arc`.
pub struct ServerState<S> {
    /// The relay context (configuration + shutdown signal).
    pub ctx: RelayContext,
    /// The live socket set.
    pub sockets: Arc<ActiveSockets>,
    /// The message broker.
    pub broker: Arc<MessageBroker<S>>,
}

/// Builds the component graph of one relay node over the given store.
///
/// The history is returned separately because it must be restored (see
/// [`ignite`]) before the node starts serving.
pub fn build_state<S: RelayStore>(
    ctx: RelayContext,
    store: S,
) -> (Arc<ServerState<S>>, Arc<RequestHistory<S>>) {
    let registry = Arc::new(SubscriptionRegistry::new());
    let sockets = ActiveSockets::new(ctx.config.outbound_queue_depth);
    let history = Arc::new(RequestHistory::new(
        store.clone(),
        &ctx.config.history.context,
    ));
    let broker = MessageBroker::new(
        store,
        registry,
        history.clone(),
        sockets.clone(),
        ctx.config.max_ttl_secs,
    );
    (
        Arc::new(ServerState {
            ctx,
            sockets,
            broker,
        }),
        history,
    )
}

/// Builds the WebSocket endpoint (`GET /` with `Upgrade: websocket`) and
/// binds the server, returning the bound address and the server future.
pub fn build_web_services<S: RelayStore>(
    state: Arc<ServerState<S>>,
) -> crate::Result<(SocketAddr, impl Future<Output = ()> + 'static)> {
    let addr =
        SocketAddr::new(state.ctx.config.host, state.ctx.config.port);
    let mut shutdown = state.ctx.shutdown_signal();
    let app = Router::new()
        .route("/", get(session::websocket_handler::<S>))
        .with_state(state);
    let server =
        axum::Server::try_bind(&addr)?.serve(app.into_make_service());
    let local_addr = server.local_addr();
    let graceful = server.with_graceful_shutdown(async move {
        shutdown.recv().await;
    });
    let fut = async move {
        if let Err(e) = graceful.await {
            tracing::error!("Server error: {e}");
        }
    };
    Ok((local_addr, fut))
}

/// Restores the history and starts the background tasks of the node.
/// This does not block; the beat runs on its own task until shutdown.
pub async fn ignite<S: RelayStore>(
    state: &Arc<ServerState<S>>,
    history: &Arc<RequestHistory<S>>,
) -> crate::Result<()> {
    history.restore().await?;
    let beat = Duration::from_secs(state.ctx.config.beat_interval_secs.max(1));
    let sockets = state.sockets.clone();
    let broker = state.broker.clone();
    let mut shutdown = state.ctx.shutdown_signal();
    tokio::task::spawn(async move {
        let mut interval = tokio::time::interval(beat);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    for socket_id in sockets.beat() {
                        tracing::event!(
                            target: probe::TARGET,
                            tracing::Level::DEBUG,
                            kind = %probe::Kind::Socket,
                            evicted = %socket_id,
                        );
                    }
                    if let Err(e) = broker.purge_expired().await {
                        tracing::warn!("Retention sweep failed: {e}");
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    });
    Ok(())
}
