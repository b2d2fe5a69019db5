use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::net::DEFAULT_PORT;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub viewer_queue_capacity: usize,
    pub path_timeout: Duration,
    pub event_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            viewer_queue_capacity: 64,
            path_timeout: Duration::from_secs(30),
            event_capacity: 256,
        }
    }
}
