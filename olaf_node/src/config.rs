// src/config.rs
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

const DEFAULT_UPLOAD_DIR: &str = "./uploads";
const DEFAULT_MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;
const DEFAULT_SWEEP_SECS: u64 = 10;

/// Everything a node needs to start. `--host`/`--port` come from the CLI;
/// the neighbourhood list and tuning knobs come from the environment, loaded
/// after `dotenvy`. Invalid configuration is fatal at startup.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub host: String,
    pub port: u16,
    /// Peer server addresses (`host:port`), self included or not.
    pub neighbourhood: Vec<String>,
    pub upload_dir: PathBuf,
    pub max_upload_bytes: usize,
    pub sweep_interval: Duration,
}

impl NodeConfig {
    pub fn from_env(host: String, port: u16) -> Result<Self> {
        if host.trim().is_empty() {
            bail!("--host must not be empty");
        }

        let neighbourhood = match std::env::var("NEIGHBOURHOOD") {
            Ok(raw) => parse_neighbourhood(&raw)?,
            Err(_) => Vec::new(),
        };

        let upload_dir = std::env::var("UPLOAD_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_UPLOAD_DIR));

        let max_upload_bytes = match std::env::var("MAX_UPLOAD_BYTES") {
            Ok(raw) => raw
                .trim()
                .parse::<usize>()
                .with_context(|| format!("MAX_UPLOAD_BYTES is not a byte count: '{raw}'"))?,
            Err(_) => DEFAULT_MAX_UPLOAD_BYTES,
        };
        if max_upload_bytes == 0 {
            bail!("MAX_UPLOAD_BYTES must be greater than zero");
        }

        Ok(Self {
            host,
            port,
            neighbourhood,
            upload_dir,
            max_upload_bytes,
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_SECS),
        })
    }

    /// The address other processes use to reach this node, given the port
    /// actually bound (which differs from `self.port` when that was 0).
    pub fn advertised(&self, bound_port: u16) -> String {
        format!("{}:{}", self.host, bound_port)
    }
}

fn parse_neighbourhood(raw: &str) -> Result<Vec<String>> {
    let mut peers = Vec::new();
    for entry in raw.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        validate_addr(entry)?;
        if !peers.iter().any(|p| p == entry) {
            peers.push(entry.to_string());
        }
    }
    Ok(peers)
}

fn validate_addr(addr: &str) -> Result<()> {
    let Some((host, port)) = addr.rsplit_once(':') else {
        bail!("neighbourhood entry '{addr}' is not host:port");
    };
    if host.is_empty() {
        bail!("neighbourhood entry '{addr}' has an empty host");
    }
    port.parse::<u16>()
        .with_context(|| format!("neighbourhood entry '{addr}' has an invalid port"))?;
    Ok(())
}
