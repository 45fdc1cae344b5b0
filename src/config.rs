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

//! Relay configuration: file discovery, environment overrides, and the
//! command-line entry points used by the binary.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use anyhow::Context;
use config::{Config, File};
use directories_next::ProjectDirs;
use serde::{Deserialize, Serialize};
use structopt::StructOpt;

use crate::store::SledStore;

/// Package identifier, where the default configuration & database are
/// defined. If the user does not start the relay with the `--config-dir`
/// it will default to read from the default location depending on the OS.
pub const PACKAGE_ID: [&str; 3] = ["tools", "webb", "topic-relay"];

const fn default_port() -> u16 {
    9955
}

const fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

const fn default_beat_interval_secs() -> u64 {
    5
}

const fn default_max_frame_bytes() -> usize {
    512 * 1024
}

const fn default_outbound_queue_depth() -> usize {
    64
}

const fn default_max_ttl_secs() -> u64 {
    86_400
}

fn default_history_context() -> String {
    "messages".to_string()
}

/// RelayConfig is the configuration for the relay.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct RelayConfig {
    /// WebSocket Server Port number
    ///
    /// default to 9955
    #[serde(default = "default_port")]
    pub port: u16,
    /// Address the server binds to; defaults to all interfaces.
    #[serde(default = "default_host")]
    pub host: IpAddr,
    /// Seconds between server beats. Every beat pings all sockets and
    /// evicts the ones that never answered the previous ping.
    #[serde(default = "default_beat_interval_secs")]
    pub beat_interval_secs: u64,
    /// Largest accepted WebSocket frame, in bytes.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// Frames a socket's outbound queue holds before the socket is
    /// closed for backpressure.
    #[serde(default = "default_outbound_queue_depth")]
    pub outbound_queue_depth: usize,
    /// Ceiling applied to the ttl of published messages, in seconds.
    #[serde(default = "default_max_ttl_secs")]
    pub max_ttl_secs: u64,
    /// Origins allowed to open a WebSocket. Empty allows every origin.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    /// JSON-RPC history settings.
    #[serde(default)]
    pub history: HistoryConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            beat_interval_secs: default_beat_interval_secs(),
            max_frame_bytes: default_max_frame_bytes(),
            outbound_queue_depth: default_outbound_queue_depth(),
            max_ttl_secs: default_max_ttl_secs(),
            allowed_origins: Vec::new(),
            history: HistoryConfig::default(),
        }
    }
}

/// Settings of the JSON-RPC history component.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct HistoryConfig {
    /// The context part of the history snapshot key, so several relays
    /// can share one store without clobbering each other's snapshots.
    #[serde(default = "default_history_context")]
    pub context: String,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            context: default_history_context(),
        }
    }
}

/// The Topic Relay Command-line tool
///
/// Start the relay from a config directory:
///
/// $ topic-relay -vvv -c <CONFIG_DIR>
#[derive(StructOpt)]
#[structopt(name = "Topic Relay")]
pub struct Opts {
    /// A level of verbosity, and can be used multiple times
    #[structopt(short, long, parse(from_occurrences))]
    pub verbose: i32,
    /// Directory that contains configration files.
    #[structopt(
        short = "c",
        long = "config-dir",
        value_name = "PATH",
        parse(from_os_str)
    )]
    pub config_dir: Option<PathBuf>,
    /// Create the Database Store in a temporary directory.
    /// and will be deleted when the process exits.
    #[structopt(long)]
    pub tmp: bool,
}

/// A helper function that will search for all config files in the given
/// directory and return them as a vec of the paths.
///
/// Supported file extensions are:
/// - `.toml`.
/// - `.json`.
pub fn search_config_files<P: AsRef<Path>>(
    base_dir: P,
) -> crate::Result<Vec<PathBuf>> {
    // A pattern that covers all toml or json files in the config
    // directory and subdirectories.
    let toml_pattern = format!("{}/**/*.toml", base_dir.as_ref().display());
    let json_pattern = format!("{}/**/*.json", base_dir.as_ref().display());
    tracing::trace!(
        "Loading config files from {} and {}",
        toml_pattern,
        json_pattern
    );
    let toml_files = glob::glob(&toml_pattern)?;
    let json_files = glob::glob(&json_pattern)?;
    toml_files
        .chain(json_files)
        .map(|v| v.map_err(crate::Error::from))
        .collect()
}

/// Try to parse the [`RelayConfig`] from the given config file(s).
pub fn parse_from_files(files: &[PathBuf]) -> crate::Result<RelayConfig> {
    let mut builder = Config::builder();
    for config_file in files {
        tracing::trace!("Loading config file: {}", config_file.display());
        let ext = config_file
            .extension()
            .map(|e| e.to_str().unwrap_or(""))
            .unwrap_or("");
        let format = match ext {
            "toml" => config::FileFormat::Toml,
            "json" => config::FileFormat::Json,
            _ => {
                tracing::warn!("Unknown file extension: {}", ext);
                continue;
            }
        };
        builder = builder
            .add_source(File::from(config_file.as_path()).format(format));
    }

    // also merge in the environment (with a prefix of RELAY).
    let builder = builder
        .add_source(config::Environment::with_prefix("RELAY").separator("_"));
    let cfg = builder.build()?;
    // and finally deserialize the config
    let config: Result<
        RelayConfig,
        serde_path_to_error::Error<config::ConfigError>,
    > = serde_path_to_error::deserialize(cfg);
    match config {
        Ok(c) => Ok(c),
        Err(e) => {
            tracing::error!("{}", e);
            Err(e.into())
        }
    }
}

/// Loads the configuration from the given directory. A missing directory
/// is not an error: the relay has workable defaults for every key.
pub fn load_config<P>(config_dir: Option<P>) -> anyhow::Result<RelayConfig>
where
    P: AsRef<Path>,
{
    tracing::debug!("Getting default dirs for the topic relay");
    let dirs = ProjectDirs::from(PACKAGE_ID[0], PACKAGE_ID[1], PACKAGE_ID[2])
        .context("failed to get config")?;
    let path = match config_dir {
        Some(p) => p.as_ref().to_path_buf(),
        None => dirs.config_dir().to_path_buf(),
    };
    if !path.is_dir() {
        tracing::warn!(
            "{} is not a directory, using the default configuration",
            path.display()
        );
        return Ok(RelayConfig::default());
    }
    tracing::trace!("Loading Config from {} ..", path.display());
    let config = parse_from_files(&search_config_files(path)?)?;
    tracing::trace!("Config loaded..");
    Ok(config)
}

/// Sets up the logger for the relay, based on the verbosity level passed
/// in.
///
/// Returns `Ok(())` on success, or `Err(anyhow::Error)` on failure.
///
/// # Arguments
///
/// * `verbosity` - An i32 integer representing the verbosity level.
/// * `filter` - The name of the crate to be filtered by the logger.
pub fn setup_logger(verbosity: i32, filter: &str) -> anyhow::Result<()> {
    use tracing::Level;
    let log_level = match verbosity {
        0 => Level::ERROR,
        1 => Level::WARN,
        2 => Level::INFO,
        3 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let directive_1 = format!("{}={}", filter, log_level)
        .parse()
        .context("valid log level")?;
    let env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(directive_1);
    tracing_subscriber::fmt()
        .with_target(true)
        .with_max_level(log_level)
        .with_env_filter(env_filter)
        .init();
    Ok(())
}

/// Creates a database store for the relay based on the configuration
/// passed in.
///
/// Returns `Ok(SledStore)` on success, or `Err(anyhow::Error)` on
/// failure.
pub async fn create_store(opts: &Opts) -> anyhow::Result<SledStore> {
    // check if we shall use the temp dir.
    if opts.tmp {
        tracing::debug!("Using temp dir for store");
        let store = SledStore::temporary()?;
        return Ok(store);
    }
    let dirs = ProjectDirs::from(PACKAGE_ID[0], PACKAGE_ID[1], PACKAGE_ID[2])
        .context("failed to get config")?;
    let p = match opts.config_dir.as_ref() {
        Some(p) => p.to_path_buf(),
        None => dirs.data_local_dir().to_path_buf(),
    };
    let db_path = match opts.config_dir.as_ref().zip(p.parent()) {
        Some((_, parent)) => parent.join("store"),
        None => p.join("store"),
    };

    let store = SledStore::open(db_path)?;
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = RelayConfig::default();
        assert_eq!(config.port, 9955);
        assert_eq!(config.max_frame_bytes, 512 * 1024);
        assert!(config.allowed_origins.is_empty());
        assert_eq!(config.history.context, "messages");
    }

    #[test]
    fn config_files_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("relay.toml"),
            "port = 9000\nbeat-interval-secs = 1\n",
        )
        .unwrap();
        let files = search_config_files(dir.path()).unwrap();
        assert_eq!(files.len(), 1);
        let config = parse_from_files(&files).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.beat_interval_secs, 1);
        // untouched keys keep their defaults
        assert_eq!(config.max_ttl_secs, 86_400);
    }
}
