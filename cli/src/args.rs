//! Command-line arguments.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, bail};
use clap::Parser;
use tether_socket::SocketConfig;

#[derive(Debug, Parser)]
#[command(name = "tether", version)]
#[command(about = "Interactive WebSocket client")]
#[command(
    long_about = "Connects to a WebSocket endpoint, prints every inbound message to stdout, and \
                  sends each line read from stdin. Closes on end of input or Ctrl-C.\n\n\
                  Set RUST_LOG to control diagnostics on stderr (default: info)."
)]
pub struct Args {
    /// Endpoint to connect to (ws:// or wss://); overrides the profile's url
    pub url: Option<String>,

    /// Connection profile (defaults to ~/.tether/config.toml when present)
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Offer a sub-protocol; repeat for more
    #[arg(short, long = "protocol", value_name = "NAME")]
    pub protocols: Vec<String>,

    /// Give up opening after this many milliseconds
    #[arg(
        short,
        long = "timeout-ms",
        value_name = "MS",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub timeout_ms: Option<u64>,
}

impl Args {
    /// Merge the profile file with command-line overrides.
    ///
    /// An explicit `--config` must exist; the default profile is optional.
    pub fn resolve(self) -> Result<SocketConfig> {
        let profile = match &self.config {
            Some(path) => Some(SocketConfig::load(path)?),
            None => match SocketConfig::default_path() {
                Some(path) if path.exists() => {
                    tracing::debug!(path = %path.display(), "Loading default profile");
                    Some(SocketConfig::load(&path)?)
                }
                _ => None,
            },
        };

        let mut config = match (profile, self.url) {
            (Some(profile), Some(url)) => profile.with_url(url),
            (Some(profile), None) => profile,
            (None, Some(url)) => SocketConfig::new(url),
            (None, None) => bail!("no URL given and no profile found; see --help"),
        };
        if !self.protocols.is_empty() {
            config = config.with_protocols(self.protocols);
        }
        if let Some(ms) = self.timeout_ms {
            config = config.with_connect_timeout(Duration::from_millis(ms));
        }
        Ok(config)
    }
}
