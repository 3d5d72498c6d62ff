use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Settings consumed by hosts of the RTC layer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RtcSettings {
    pub peer: PeerConfig,
    pub logging: LoggingConfig,
    pub timeouts: NegotiationTimeouts,
}

/// Per peer connection configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Let the engine renegotiate on its own whenever tracks or channels change
    pub auto_negotiation: bool,
    /// Negotiate media transport even when no media track exists yet
    pub force_media_transport: bool,
    pub port_range: Option<PortRange>,
    /// Address rewrite applied to every description and candidate before
    /// it leaves this layer
    pub ip_override: Option<IpOverride>,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            auto_negotiation: false,
            force_media_transport: true,
            port_range: None,
            ip_override: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub begin: u16,
    pub end: u16,
}

impl PortRange {
    #[must_use]
    pub const fn contains(&self, port: u16) -> bool {
        port >= self.begin && port <= self.end
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpOverride {
    pub from: String,
    pub to: String,
}

impl IpOverride {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }

    #[must_use]
    pub fn apply(&self, text: &str) -> String {
        crate::sdp::rewrite_address(text, &self.from, &self.to)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json", "pretty" or "compact"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiationTimeouts {
    pub gathering_ms: u64,
    pub connect_ms: u64,
    pub open_ms: u64,
}

impl Default for NegotiationTimeouts {
    fn default() -> Self {
        Self {
            gathering_ms: 10_000,
            connect_ms: 15_000,
            open_ms: 10_000,
        }
    }
}

impl NegotiationTimeouts {
    #[must_use]
    pub const fn gathering(&self) -> Duration {
        Duration::from_millis(self.gathering_ms)
    }

    #[must_use]
    pub const fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    #[must_use]
    pub const fn open(&self) -> Duration {
        Duration::from_millis(self.open_ms)
    }
}

/// Load settings from multiple sources with priority:
/// 1. Environment variables (highest priority), `<PREFIX>_SECTION__FIELD`
/// 2. Config file (if provided and present)
/// 3. Defaults (lowest priority)
pub fn load_settings<T>(config_file: Option<&str>, env_prefix: &str) -> Result<T, ConfigError>
where
    T: DeserializeOwned,
{
    let mut builder = ConfigBuilder::builder();

    if let Some(path) = config_file {
        if Path::new(path).exists() {
            builder = builder.add_source(File::with_name(path));
        }
    }

    builder = builder.add_source(
        Environment::with_prefix(env_prefix)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

impl RtcSettings {
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        load_settings(config_file, "SYNCTV_RTC")
    }
}
