//! Runtime configuration read from the environment (and `.env` via dotenv).

use crate::error::{Error, Result};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub worker_count: usize,
    pub lock_timeout: Duration,
    pub state_dir: PathBuf,
    pub ipam_file: PathBuf,
    /// Largest subnet (smallest prefix) AZ expansion will replicate.
    pub min_subnet_prefix: u8,
    pub max_subnet_prefix: u8,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            worker_count: 4,
            lock_timeout: Duration::from_secs(30),
            state_dir: PathBuf::from("state"),
            ipam_file: PathBuf::from("ipam_tree.json"),
            min_subnet_prefix: 16,
            max_subnet_prefix: 28,
        }
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("{key}={raw:?} is not valid"))),
    }
}

impl Config {
    /// Load from process environment variables.
    pub fn from_env() -> Result<Config> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using `lookup` for each `VPC_TOPOLOGY_*` key.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Config> {
        let defaults = Config::default();
        let config = Config {
            worker_count: parse_var(&lookup, "VPC_TOPOLOGY_WORKERS", defaults.worker_count)?,
            lock_timeout: Duration::from_secs(parse_var(
                &lookup,
                "VPC_TOPOLOGY_LOCK_TIMEOUT_SECS",
                defaults.lock_timeout.as_secs(),
            )?),
            state_dir: lookup("VPC_TOPOLOGY_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.state_dir),
            ipam_file: lookup("VPC_TOPOLOGY_IPAM_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.ipam_file),
            min_subnet_prefix: parse_var(
                &lookup,
                "VPC_TOPOLOGY_MIN_SUBNET_PREFIX",
                defaults.min_subnet_prefix,
            )?,
            max_subnet_prefix: parse_var(
                &lookup,
                "VPC_TOPOLOGY_MAX_SUBNET_PREFIX",
                defaults.max_subnet_prefix,
            )?,
        };
        if config.worker_count == 0 {
            return Err(Error::Config("VPC_TOPOLOGY_WORKERS must be at least 1".into()));
        }
        if config.min_subnet_prefix > config.max_subnet_prefix || config.max_subnet_prefix > 32 {
            return Err(Error::Config(format!(
                "subnet prefix range /{}../{} is invalid",
                config.min_subnet_prefix, config.max_subnet_prefix
            )));
        }
        log::debug!("Loaded config: {config:?}");
        Ok(config)
    }
}
