//! Relay Configuration
//!
//! Reads the flat `key=value` config file with its single `[sources]` list
//! section. Required keys are `api_id`, `api_hash` and `send` (or the legacy
//! `destination`); everything else falls back to a default.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Environment variable overriding the config file location
pub const CONFIG_PATH_ENV: &str = "RELAY_CONFIG";

/// Config file used when `RELAY_CONFIG` is unset
pub const DEFAULT_CONFIG_PATH: &str = "config.txt";

/// Header line that opens the source list
pub const SOURCES_SECTION: &str = "[sources]";

pub const DEFAULT_BLACKLIST_FILE: &str = "blacklist.txt";
pub const DEFAULT_TRANSACTIONS_FILE: &str = "transactions_log.csv";
pub const DEFAULT_ENRICHMENT_URL: &str = "https://api.dexscreener.io/latest/dex/search";
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
pub const DEFAULT_INBOUND_CHANNEL: &str = "relay:inbound";
pub const DEFAULT_OUTBOUND_CHANNEL: &str = "relay:outbound";

/// Errors that can occur while loading the configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Missing required config key: {0}")]
    MissingKey(&'static str),

    #[error("Invalid api_id '{0}': expected an integer")]
    InvalidApiId(String),

    #[error("Invalid value for '{key}': {value}")]
    InvalidValue { key: &'static str, value: String },
}

/// Immutable relay configuration, created once at startup
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Platform application id, handed to the session layer
    pub api_id: i64,
    /// Platform application credential
    pub api_hash: String,
    /// Where qualifying identifiers are forwarded
    pub destination: String,
    /// Allowed source usernames or chat ids, in file order
    pub sources: Vec<String>,
    pub blacklist_path: PathBuf,
    pub transactions_path: PathBuf,
    /// Search endpoint queried with `?q=<ca>`
    pub enrichment_url: String,
    pub redis_url: String,
    pub inbound_channel: String,
    pub outbound_channel: String,
    /// Ring the terminal bell after each forward
    pub alert: bool,
}

/// Raw result of scanning the file, before required keys are checked
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RawConfig {
    pub values: HashMap<String, String>,
    pub sources: Vec<String>,
}

/// Scan config text into key/value pairs and the source list
///
/// Lines are trimmed. Inside `[sources]` every non-empty line is a source until
/// another bracketed header appears; that header line itself is consumed.
/// Outside the section only lines containing `=` are kept, split on the first `=`.
pub fn parse_raw(text: &str) -> RawConfig {
    let mut raw = RawConfig::default();
    let mut in_sources = false;

    for line in text.lines() {
        let line = line.trim();
        if line == SOURCES_SECTION {
            in_sources = true;
            continue;
        }
        if in_sources {
            if line.starts_with('[') {
                in_sources = false;
            } else if !line.is_empty() {
                raw.sources.push(line.to_string());
            }
        } else if let Some((key, value)) = line.split_once('=') {
            raw.values
                .insert(key.trim().to_string(), value.trim().to_string());
        }
    }

    raw
}

/// Strip a single leading `@` so `@alpha` and `alpha` name the same source
pub fn normalize_source(entry: &str) -> &str {
    entry.strip_prefix('@').unwrap_or(entry)
}

/// Expand ~ to home directory in path
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Location of the config file, honouring `RELAY_CONFIG`
pub fn config_path() -> PathBuf {
    std::env::var(CONFIG_PATH_ENV)
        .map(|p| expand_path(&p))
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: value.to_string(),
        }),
    }
}

impl Config {
    /// Load and validate the config file at `path`
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Build a config from file contents
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        Self::from_raw(parse_raw(text))
    }

    pub fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        let values = raw.values;
        let get = |key: &str| values.get(key).map(String::as_str);

        let api_id_raw = get("api_id").ok_or(ConfigError::MissingKey("api_id"))?;
        let api_id = api_id_raw
            .parse::<i64>()
            .map_err(|_| ConfigError::InvalidApiId(api_id_raw.to_string()))?;

        let api_hash = get("api_hash")
            .ok_or(ConfigError::MissingKey("api_hash"))?
            .to_string();

        let destination = get("send")
            .or_else(|| get("destination"))
            .ok_or(ConfigError::MissingKey("send"))?
            .to_string();

        let alert = match get("alert") {
            Some(v) => parse_bool("alert", v)?,
            None => true,
        };

        let sources = raw
            .sources
            .iter()
            .map(|s| normalize_source(s).to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Config {
            api_id,
            api_hash,
            destination,
            sources,
            blacklist_path: expand_path(get("blacklist_file").unwrap_or(DEFAULT_BLACKLIST_FILE)),
            transactions_path: expand_path(
                get("transactions_file").unwrap_or(DEFAULT_TRANSACTIONS_FILE),
            ),
            enrichment_url: get("enrichment_url")
                .unwrap_or(DEFAULT_ENRICHMENT_URL)
                .to_string(),
            redis_url: get("redis_url").unwrap_or(DEFAULT_REDIS_URL).to_string(),
            inbound_channel: get("inbound_channel")
                .unwrap_or(DEFAULT_INBOUND_CHANNEL)
                .to_string(),
            outbound_channel: get("outbound_channel")
                .unwrap_or(DEFAULT_OUTBOUND_CHANNEL)
                .to_string(),
            alert,
        })
    }

    /// The api hash with everything but the last four characters hidden
    pub fn masked_api_hash(&self) -> String {
        let len = self.api_hash.chars().count();
        let hidden = len.saturating_sub(4);
        let tail: String = self.api_hash.chars().skip(hidden).collect();
        format!("{}{}", "*".repeat(hidden), tail)
    }
}
