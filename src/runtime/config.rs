use std::{fs, net::Ipv4Addr, path::Path};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::lan::protocol::{max_chunk_size, DEFAULT_CHUNK_SIZE, DEFAULT_PORT, MIN_CHUNK_SIZE};
use super::models::DEFAULT_HISTORY_CAPACITY;

const CONFIG_FILE: &str = "config.toml";

const CONFIG_TEMPLATE: &str = "# clippy-sync configuration\n\
# device_name = \"\"            # empty: use the hostname\n\
# port = 5555                  # every peer must use the same port\n\
# broadcast_address = \"255.255.255.255\"\n\
# poll_interval_ms = 500\n\
# chunk_size = 30000           # bytes per fragment and largest direct message\n\
# fragment_delay_ms = 50\n\
# reassembly_timeout_secs = 5\n\
# history_capacity = 20\n";

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_broadcast_address() -> Ipv4Addr {
    Ipv4Addr::BROADCAST
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_fragment_delay_ms() -> u64 {
    50
}

fn default_reassembly_timeout_secs() -> u64 {
    5
}

fn default_history_capacity() -> usize {
    DEFAULT_HISTORY_CAPACITY
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Name shown to peers. Empty string → hostname.
    #[serde(default)]
    pub device_name: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_broadcast_address")]
    pub broadcast_address: Ipv4Addr,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_fragment_delay_ms")]
    pub fragment_delay_ms: u64,
    #[serde(default = "default_reassembly_timeout_secs")]
    pub reassembly_timeout_secs: u64,
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_name: String::new(),
            port: default_port(),
            broadcast_address: default_broadcast_address(),
            poll_interval_ms: default_poll_interval_ms(),
            chunk_size: default_chunk_size(),
            fragment_delay_ms: default_fragment_delay_ms(),
            reassembly_timeout_secs: default_reassembly_timeout_secs(),
            history_capacity: default_history_capacity(),
        }
    }
}

impl Config {
    pub const MIN_POLL_INTERVAL_MS: u64 = 50;

    /// Read `config.toml` from the working directory.
    pub fn load() -> Result<Self> {
        let cwd = std::env::current_dir()?;
        Self::load_from_dir(&cwd)
    }

    /// Read `config.toml` from `dir`. A missing file is created from a
    /// commented template and the defaults are used.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let config_file = dir.join(CONFIG_FILE);
        if !config_file.exists() {
            fs::write(&config_file, CONFIG_TEMPLATE)
                .with_context(|| format!("failed to write default config to {:?}", config_file))?;
            log::info!("default config created at {:?}", config_file);
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&config_file)
            .with_context(|| format!("failed to read {:?}", config_file))?;
        let cfg: Config =
            toml::from_str(&content).with_context(|| format!("invalid config {:?}", config_file))?;
        Ok(cfg.normalized())
    }

    /// Clamp values into the ranges the protocol can honour.
    pub fn normalized(mut self) -> Self {
        self.chunk_size = self.chunk_size.clamp(MIN_CHUNK_SIZE, max_chunk_size());
        self.poll_interval_ms = self.poll_interval_ms.max(Self::MIN_POLL_INTERVAL_MS);
        self.reassembly_timeout_secs = self.reassembly_timeout_secs.max(1);
        self.history_capacity = self.history_capacity.max(1);
        self
    }

    /// The configured name, or the hostname when none is set.
    pub fn resolve_device_name(&self) -> String {
        let trimmed = self.device_name.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "clippy-sync".to_string())
    }
}
