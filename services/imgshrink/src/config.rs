//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! API keys come from IMGSHRINK_API_KEYS or pool.keys_file, never from the
//! TOML itself.

use common::{Error, Secret};
use key_pool::CredentialConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};

const KEYS_ENV: &str = "IMGSHRINK_API_KEYS";
const CONFIG_ENV: &str = "IMGSHRINK_CONFIG";
const DEFAULT_CONFIG_FILE: &str = "imgshrink.toml";

/// Root configuration
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    /// Resolved from the environment or `pool.keys_file`.
    #[serde(skip)]
    pub keys: Vec<CredentialConfig>,
}

/// Remote API settings
#[derive(Debug, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_usage_header")]
    pub usage_header: String,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
}

/// Credential pool settings
#[derive(Debug, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_monthly_limit")]
    pub monthly_limit: u64,
    /// One `KEY` or `KEY LIMIT` per line.
    #[serde(default)]
    pub keys_file: Option<PathBuf>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            timeout_secs: default_timeout(),
            chunk_size: default_chunk_size(),
            usage_header: default_usage_header(),
            retry_base_ms: default_retry_base_ms(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            monthly_limit: default_monthly_limit(),
            keys_file: None,
        }
    }
}

fn default_endpoint() -> String {
    "https://api.tinify.com".to_string()
}

fn default_timeout() -> u64 {
    60
}

fn default_chunk_size() -> usize {
    transport::DEFAULT_CHUNK_SIZE
}

fn default_usage_header() -> String {
    transport::DEFAULT_USAGE_HEADER.to_string()
}

fn default_retry_base_ms() -> u64 {
    1000
}

fn default_monthly_limit() -> u64 {
    500
}

impl Config {
    /// Load configuration from a TOML file, then resolve API keys.
    ///
    /// A missing file means defaults. Key resolution order:
    /// 1. IMGSHRINK_API_KEYS env var (comma-separated)
    /// 2. keys_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let mut config = match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str::<Config>(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
            Err(e) => return Err(Error::io(path, e)),
        };

        config.validate()?;

        if let Ok(keys) = std::env::var(KEYS_ENV) {
            config.keys = keys
                .split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(CredentialConfig::new)
                .collect();
        } else if let Some(ref keys_file) = config.pool.keys_file {
            let contents =
                std::fs::read_to_string(keys_file).map_err(|e| Error::io(keys_file, e))?;
            config.keys = parse_keys(&contents)?;
        }

        if config.keys.is_empty() {
            return Err(Error::NoKeys);
        }
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if !self.api.endpoint.starts_with("http://") && !self.api.endpoint.starts_with("https://")
        {
            return Err(Error::Config(format!(
                "endpoint must start with http:// or https://, got: {}",
                self.api.endpoint
            )));
        }
        if self.api.timeout_secs == 0 {
            return Err(Error::Config("timeout_secs must be greater than 0".into()));
        }
        if self.api.chunk_size == 0 {
            return Err(Error::Config("chunk_size must be greater than 0".into()));
        }
        if self.pool.monthly_limit == 0 {
            return Err(Error::Config("monthly_limit must be greater than 0".into()));
        }
        Ok(())
    }

    /// Resolve config file path from CLI arg or IMGSHRINK_CONFIG env var.
    pub fn resolve_path(cli_path: Option<&Path>) -> PathBuf {
        if let Some(p) = cli_path {
            return p.to_path_buf();
        }
        if let Ok(p) = std::env::var(CONFIG_ENV) {
            return PathBuf::from(p);
        }
        PathBuf::from(DEFAULT_CONFIG_FILE)
    }
}

/// Parse a keys file. Blank lines and `#` comments are skipped.
fn parse_keys(contents: &str) -> common::Result<Vec<CredentialConfig>> {
    let mut keys = Vec::new();
    for (i, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let Some(key) = fields.next() else {
            continue;
        };
        let mut credential = CredentialConfig::new(Secret::new(key.to_string()));
        if let Some(limit) = fields.next() {
            let limit: u64 = limit.parse().map_err(|_| Error::KeyEntry {
                line: i + 1,
                reason: format!("limit `{limit}` is not a number"),
            })?;
            if limit == 0 {
                return Err(Error::KeyEntry {
                    line: i + 1,
                    reason: "limit must be greater than 0".into(),
                });
            }
            credential = credential.with_limit(limit);
        }
        if fields.next().is_some() {
            return Err(Error::KeyEntry {
                line: i + 1,
                reason: "expected `KEY` or `KEY LIMIT`".into(),
            });
        }
        keys.push(credential);
    }
    Ok(keys)
}
