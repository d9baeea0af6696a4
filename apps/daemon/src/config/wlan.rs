use serde::Deserialize;

#[derive(Deserialize)]
pub struct WlanConfig {
    /// Monitor-capable wireless interface to capture and inject on.
    #[serde(default = "default_interface")]
    pub interface: String,

    #[serde(default = "default_channel")]
    pub channel: u32,

    /// Append an FCS to injected frames.
    #[serde(default = "default_true")]
    pub fcs: bool,

    /// Assume monitor mode is already enabled.
    #[serde(default)]
    pub no_monitor: bool,

    /// Do not switch the interface channel.
    #[serde(default)]
    pub no_channel: bool,

    /// Do not toggle the interface up/down.
    #[serde(default)]
    pub no_updown: bool,
}

fn default_interface() -> String {
    "wlan0".to_owned()
}

fn default_channel() -> u32 {
    6
}

fn default_true() -> bool {
    true
}

impl Default for WlanConfig {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            channel: default_channel(),
            fcs: true,
            no_monitor: false,
            no_channel: false,
            no_updown: false,
        }
    }
}
