//! Process configuration, read from `EXPLORER_*` environment variables.
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::SyncError;
use crate::logging::LogFormat;

/// Default flush interval of the watermark cache.
pub const DEFAULT_WRITE_INTERVAL: Duration = Duration::from_millis(5_000);

/// Default CouchDB root when no backend is configured.
pub const DEFAULT_COUCHDB_URL: &str = "http://localhost:5984";

/// Default API port.
pub const DEFAULT_PORT: u16 = 4201;

/// Where a channel subscription starts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartBlock {
    /// Resume from the stored watermark.
    #[default]
    Auto,
    /// Explicit block height.
    Height(u64),
}

impl FromStr for StartBlock {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("auto") {
            return Ok(Self::Auto);
        }
        s.parse::<u64>()
            .map(Self::Height)
            .map_err(|_| SyncError::Config(format!("invalid start block {s:?}")))
    }
}

impl fmt::Display for StartBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Height(h) => write!(f, "{h}"),
        }
    }
}

/// A channel to synchronize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelOption {
    pub name: String,
    #[serde(default)]
    pub start_block: StartBlock,
}

impl ChannelOption {
    /// Channel starting from its stored watermark.
    pub fn auto(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            start_block: StartBlock::Auto,
        }
    }
}

impl FromStr for ChannelOption {
    type Err = SyncError;

    /// `name`, `name:auto` or `name:<height>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, start) = match s.split_once(':') {
            Some((name, start)) => (name.trim(), start.parse()?),
            None => (s.trim(), StartBlock::Auto),
        };
        if name.is_empty() {
            return Err(SyncError::Config(format!("empty channel name in {s:?}")));
        }
        Ok(Self {
            name: name.to_owned(),
            start_block: start,
        })
    }
}

/// Parse a comma-separated channel list, skipping blank items.
pub fn parse_channels(raw: &str) -> Result<Vec<ChannelOption>, SyncError> {
    raw.split(',')
        .filter(|item| !item.trim().is_empty())
        .map(str::parse)
        .collect()
}

/// Storage backend selection. `Debug` and `Display` never show URL credentials.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DatabaseConfig {
    Sqlite { path: PathBuf },
    CouchDb { url: String },
}

/// `url` with any `user:password@` userinfo replaced by `***@`.
pub fn redact_url(url: &str) -> String {
    let Some(scheme_end) = url.find("://").map(|i| i + 3) else {
        return url.to_owned();
    };
    let authority_end = url[scheme_end..]
        .find(['/', '?', '#'])
        .map_or(url.len(), |i| scheme_end + i);
    match url[scheme_end..authority_end].rfind('@') {
        Some(at) => format!(
            "{}***{}",
            &url[..scheme_end],
            &url[scheme_end + at..]
        ),
        None => url.to_owned(),
    }
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sqlite { path } => f.debug_struct("Sqlite").field("path", path).finish(),
            Self::CouchDb { url } => f
                .debug_struct("CouchDb")
                .field("url", &redact_url(url))
                .finish(),
        }
    }
}

impl fmt::Display for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sqlite { path } => write!(f, "sqlite {}", path.display()),
            Self::CouchDb { url } => write!(f, "couchdb {}", redact_url(url)),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self::CouchDb {
            url: DEFAULT_COUCHDB_URL.to_owned(),
        }
    }
}

/// Everything the explorer needs to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExplorerConfig {
    pub channels: Vec<ChannelOption>,
    pub write_interval: Duration,
    pub database: DatabaseConfig,
    pub api_bind: String,
    pub log_format: LogFormat,
}

impl Default for ExplorerConfig {
    fn default() -> Self {
        Self {
            channels: Vec::new(),
            write_interval: DEFAULT_WRITE_INTERVAL,
            database: DatabaseConfig::default(),
            api_bind: format!("0.0.0.0:{DEFAULT_PORT}"),
            log_format: LogFormat::default(),
        }
    }
}

impl ExplorerConfig {
    /// Read the process environment.
    pub fn from_env() -> Result<Self, SyncError> {
        Self::from_vars(std::env::vars().collect())
    }

    /// Build from an explicit variable map (unset or blank values use defaults).
    pub fn from_vars(vars: HashMap<String, String>) -> Result<Self, SyncError> {
        let get = |key: &str| {
            vars.get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
        };
        let mut config = Self::default();

        if let Some(raw) = get("EXPLORER_NETWORK_CHANNELS") {
            config.channels = parse_channels(raw)?;
        }

        if let Some(raw) = get("EXPLORER_WRITE_INTERVAL") {
            let ms: u64 = raw.parse().map_err(|_| {
                SyncError::Config(format!("EXPLORER_WRITE_INTERVAL must be milliseconds, got {raw:?}"))
            })?;
            if ms == 0 {
                return Err(SyncError::Config("EXPLORER_WRITE_INTERVAL must be > 0".into()));
            }
            config.write_interval = Duration::from_millis(ms);
        }

        if let Some(path) = get("EXPLORER_SQLITE_PATH") {
            config.database = DatabaseConfig::Sqlite { path: path.into() };
        } else if let Some(url) = get("EXPLORER_COUCHDB_URL") {
            config.database = DatabaseConfig::CouchDb { url: url.to_owned() };
        }

        if let Some(bind) = get("EXPLORER_API_BIND") {
            config.api_bind = bind.to_owned();
        } else if let Some(port) = get("PORT") {
            let port: u16 = port
                .parse()
                .map_err(|_| SyncError::Config(format!("PORT must be a port number, got {port:?}")))?;
            config.api_bind = format!("0.0.0.0:{port}");
        }

        if let Some(format) = get("EXPLORER_LOG_FORMAT") {
            config.log_format = format.parse()?;
        }

        Ok(config)
    }

    /// The channel list, or a config error when it is empty.
    pub fn require_channels(&self) -> Result<&[ChannelOption], SyncError> {
        if self.channels.is_empty() {
            return Err(SyncError::Config("unable to find any channels".into()));
        }
        Ok(&self.channels)
    }
}
