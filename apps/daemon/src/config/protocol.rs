use serde::Deserialize;

#[derive(Deserialize)]
pub struct ProtocolConfig {
    /// Master preference advertised after the first refresh.
    #[serde(default = "default_master_preference")]
    pub master_preference: u8,

    /// Literal promotion rule: only claim mastership while a higher-ranked
    /// peer is known.
    #[serde(default = "default_true")]
    pub promotion_requires_higher_rank: bool,

    #[serde(default)]
    pub desync: DesyncConfig,
}

#[derive(Deserialize)]
pub struct DesyncConfig {
    #[serde(default = "default_offset_tu")]
    pub offset_tu: i64,

    #[serde(default = "default_max_send_old_count")]
    pub max_send_old_count: u32,
}

fn default_master_preference() -> u8 {
    200
}

fn default_true() -> bool {
    true
}

fn default_offset_tu() -> i64 {
    50
}

fn default_max_send_old_count() -> u32 {
    3
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            master_preference: default_master_preference(),
            promotion_requires_higher_rank: true,
            desync: DesyncConfig::default(),
        }
    }
}

impl Default for DesyncConfig {
    fn default() -> Self {
        Self {
            offset_tu: default_offset_tu(),
            max_send_old_count: default_max_send_old_count(),
        }
    }
}
