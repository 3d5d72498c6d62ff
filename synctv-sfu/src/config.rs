//! SFU Configuration

use config::ConfigError;
use serde::{Deserialize, Serialize};
use synctv_rtc::config::load_settings;
use synctv_rtc::RtcSettings;

/// SFU configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SfuConfig {
    /// Maximum peers per room (0 = unlimited)
    pub max_peers_per_room: usize,
    /// Prefix egress stream/track ids with the source peer id, so several
    /// sources can be forwarded to one egress peer without mid collisions
    pub namespace_by_source: bool,
    /// Relay key frame requests from egress receivers to the ingress sender
    pub propagate_key_frames: bool,
}

impl Default for SfuConfig {
    fn default() -> Self {
        Self {
            max_peers_per_room: 50,
            namespace_by_source: true,
            propagate_key_frames: true,
        }
    }
}

/// Everything an SFU host loads at startup
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SfuSettings {
    pub rtc: RtcSettings,
    pub sfu: SfuConfig,
}

impl SfuSettings {
    /// Defaults, then `config_file`, then `SYNCTV_SFU_*` environment variables
    /// (e.g. `SYNCTV_SFU_SFU__MAX_PEERS_PER_ROOM=8`).
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        load_settings(config_file, "SYNCTV_SFU")
    }
}
