use serde::Deserialize;

#[derive(Deserialize)]
pub struct HostConfig {
    /// Name of the virtual host-side interface.
    #[serde(default = "default_interface")]
    pub interface: String,
}

fn default_interface() -> String {
    "nan0".to_owned()
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            interface: default_interface(),
        }
    }
}
