use config::Config;
use serde::Deserialize;

use std::path::PathBuf;

mod host;
pub use host::HostConfig;

mod logger;
pub use logger::LoggerConfig;

mod protocol;
pub use protocol::{DesyncConfig, ProtocolConfig};

mod wlan;
pub use wlan::WlanConfig;

#[derive(Deserialize, Default)]
pub struct DaemonConfig {
    #[serde(default)]
    pub wlan: WlanConfig,

    #[serde(default)]
    pub host: HostConfig,

    /// Dump frames the RX pipeline rejected into this pcap file.
    #[serde(default)]
    pub dump: Option<PathBuf>,

    #[serde(default)]
    pub logger: LoggerConfig,

    #[serde(default)]
    pub protocol: ProtocolConfig,
}

impl DaemonConfig {
    pub fn from_path(path: PathBuf) -> eyre::Result<Self> {
        let config = Config::builder()
            .add_source(config::File::from(path))
            .build()?;

        Ok(config.try_deserialize()?)
    }

    pub fn validate(&self) -> eyre::Result<()> {
        if !crate::channel::is_supported(self.wlan.channel) {
            eyre::bail!(
                "unsupported channel {} (use 6, 44, or 149)",
                self.wlan.channel
            );
        }
        Ok(())
    }

    /// The protocol configuration handed to the state machine.
    pub fn core_config(&self) -> nan_core::Config {
        let defaults = nan_core::Config::default();
        nan_core::Config {
            master_preference: self.protocol.master_preference,
            promotion_requires_higher_rank: self.protocol.promotion_requires_higher_rank,
            fcs: self.wlan.fcs,
            desync: nan_core::config::DesyncConfig {
                offset_tu: self.protocol.desync.offset_tu,
                max_send_old_count: self.protocol.desync.max_send_old_count,
            },
            ..defaults
        }
    }
}
