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

//! Topic Relay Binary.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::time::Duration;

use tokio::signal::unix;

use topic_relay::config::{create_store, load_config, setup_logger, Opts};
use topic_relay::context::RelayContext;
use topic_relay::{probe, service};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// The main entry point for the relay.
///
/// # Arguments
///
/// * `args` - The command line arguments.
#[paw::main]
#[tokio::main]
async fn main(args: Opts) -> anyhow::Result<()> {
    setup_logger(args.verbose, "topic_relay")?;
    match dotenv::dotenv() {
        Ok(_) => {
            tracing::trace!("Loaded .env file");
        }
        Err(e) => {
            tracing::warn!("Failed to load .env file: {}", e);
        }
    }

    // The configuration is validated and configured from the given directory
    let config = load_config(args.config_dir.clone())?;

    // The RelayContext takes a configuration, and populates objects that
    // are needed throughout the lifetime of the relay.
    let ctx = RelayContext::new(config);

    // persistent storage for the relay
    let store = create_store(&args).await?;

    let (state, history) = service::build_state(ctx.clone(), store);
    // restore the history and start the beat before accepting sockets.
    service::ignite(&state, &history).await?;

    let (addr, server) = service::build_web_services(state.clone())?;
    tracing::info!("Starting the server on {}", addr);
    // start the server.
    let server_handle = tokio::spawn(server);
    tracing::event!(
        target: probe::TARGET,
        tracing::Level::DEBUG,
        kind = %probe::Kind::Lifecycle,
        started = true
    );

    // watch for signals
    let mut ctrlc_signal = unix::signal(unix::SignalKind::interrupt())?;
    let mut termination_signal = unix::signal(unix::SignalKind::terminate())?;
    let mut quit_signal = unix::signal(unix::SignalKind::quit())?;
    tokio::select! {
        _ = ctrlc_signal.recv() => {
            tracing::warn!("Interrupted (Ctrl+C) ...");
        },
        _ = termination_signal.recv() => {
            tracing::warn!("Got Terminate signal ...");
        },
        _ = quit_signal.recv() => {
            tracing::warn!("Quitting ...");
        },
    }
    tracing::event!(
        target: probe::TARGET,
        tracing::Level::DEBUG,
        kind = %probe::Kind::Lifecycle,
        shutdown = true
    );
    tracing::warn!("Shutting down...");
    // every socket receives the shutdown signal and closes with 1012;
    // the server drains within the grace window or the process force-exits.
    ctx.shutdown();
    match tokio::time::timeout(SHUTDOWN_GRACE, server_handle).await {
        Ok(_) => {
            tracing::info!("Clean Exit ..");
        }
        Err(_) => {
            tracing::error!("Shutdown grace elapsed, forcing exit");
            std::process::exit(1);
        }
    }
    Ok(())
}
