//! Socket options and the TOML connection profile.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tether_lifecycle::AbortSignal;
use thiserror::Error;

/// Options for [`Socket::open`](crate::Socket::open).
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    /// Sub-protocols offered during the handshake, in preference order.
    pub protocols: Vec<String>,
    /// Abandons the open when aborted.
    pub signal: Option<AbortSignal>,
}

impl OpenOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocols.push(protocol.into());
        self
    }

    #[must_use]
    pub fn protocols<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.protocols.extend(protocols.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }
}

/// Options for [`Socket::send`](crate::Socket::send).
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Stops waiting for the buffer to drain when aborted.
    pub signal: Option<AbortSignal>,
}

impl SendOptions {
    #[must_use]
    pub fn with_signal(signal: AbortSignal) -> Self {
        Self {
            signal: Some(signal),
        }
    }
}

/// Options for [`Socket::listen`](crate::Socket::listen).
#[derive(Debug, Clone, Default)]
pub struct ListenOptions {
    /// Unsubscribes the callback when aborted.
    pub signal: Option<AbortSignal>,
}

impl ListenOptions {
    #[must_use]
    pub fn with_signal(signal: AbortSignal) -> Self {
        Self {
            signal: Some(signal),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("url must not be empty")]
    EmptyUrl,
    #[error("connect_timeout_ms must be greater than zero")]
    ZeroTimeout,
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawProtocols {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSocketConfig {
    url: String,
    #[serde(default)]
    protocols: Option<RawProtocols>,
    #[serde(default)]
    connect_timeout_ms: Option<u64>,
}

/// A saved connection profile.
///
/// ```toml
/// url = "wss://echo.example.com/socket"
/// protocols = ["chat", "superchat"]   # or a single string
/// connect_timeout_ms = 5000
/// ```
///
/// Protocol names are checked when the socket opens, not here.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawSocketConfig")]
pub struct SocketConfig {
    url: String,
    protocols: Vec<String>,
    connect_timeout: Option<Duration>,
}

impl TryFrom<RawSocketConfig> for SocketConfig {
    type Error = ConfigError;

    fn try_from(raw: RawSocketConfig) -> Result<Self, Self::Error> {
        let url = raw.url.trim().to_owned();
        if url.is_empty() {
            return Err(ConfigError::EmptyUrl);
        }
        let protocols = match raw.protocols {
            None => Vec::new(),
            Some(RawProtocols::One(protocol)) => vec![protocol],
            Some(RawProtocols::Many(protocols)) => protocols,
        };
        let connect_timeout = match raw.connect_timeout_ms {
            Some(0) => return Err(ConfigError::ZeroTimeout),
            Some(ms) => Some(Duration::from_millis(ms)),
            None => None,
        };
        Ok(Self {
            url,
            protocols,
            connect_timeout,
        })
    }
}

impl SocketConfig {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            protocols: Vec::new(),
            connect_timeout: None,
        }
    }

    pub fn from_toml_str(input: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(input)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let input = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&input).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// `~/.tether/config.toml`, if a home directory is known.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".tether").join("config.toml"))
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    #[must_use]
    pub fn protocols(&self) -> &[String] {
        &self.protocols
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout
    }

    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    #[must_use]
    pub fn with_protocols(mut self, protocols: Vec<String>) -> Self {
        self.protocols = protocols;
        self
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Options for opening this profile. The connect timeout, if any, starts
    /// counting now; call this inside a tokio runtime.
    #[must_use]
    pub fn to_options(&self) -> OpenOptions {
        OpenOptions {
            protocols: self.protocols.clone(),
            signal: self.connect_timeout.map(AbortSignal::timeout),
        }
    }
}
