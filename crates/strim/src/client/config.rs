use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How long the local player may take to open the host's stream.
    pub load_timeout: Duration,
    /// How long the initial seek may take to settle.
    pub seek_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            load_timeout: Duration::from_secs(30),
            seek_timeout: Duration::from_secs(10),
        }
    }
}
