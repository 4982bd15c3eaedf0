use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use crate::codec::{DEFAULT_MAX_FRAME_LEN, DEFAULT_MAX_OUTBOUND_FRAME_LEN};

pub const DEFAULT_PORT: u16 = 8888;
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Settings for one relay instance. Every [`crate::server::Server`] owns its
/// own copy, so several relays can run side by side in one process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    /// Largest inbound frame payload accepted from a client.
    pub max_frame_len: usize,
    /// Largest frame payload the relay writes. A roster or relayed message
    /// over this limit is dropped for that recipient.
    pub max_outbound_frame_len: usize,
    /// Deliveries that take longer than this count as a failed write.
    pub write_timeout: Duration,
    /// How long shutdown waits for session workers to finish.
    pub shutdown_grace: Duration,
}

impl ServerConfig {
    pub fn new(listen: SocketAddr) -> Self {
        Self {
            listen,
            ..Self::default()
        }
    }

    pub fn with_port(port: u16) -> Self {
        Self::new(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            max_outbound_frame_len: DEFAULT_MAX_OUTBOUND_FRAME_LEN,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_listens_on_all_interfaces_port_8888() {
        let config = ServerConfig::default();
        assert_eq!(config.listen, "0.0.0.0:8888".parse().unwrap());
        assert_eq!(config.max_frame_len, DEFAULT_MAX_FRAME_LEN);
        assert_eq!(config.max_outbound_frame_len, DEFAULT_MAX_OUTBOUND_FRAME_LEN);
    }

    #[test]
    fn shutdown_grace_outlasts_a_stalled_write() {
        let config = ServerConfig::default();
        assert!(config.shutdown_grace > config.write_timeout);
    }

    #[test]
    fn with_port_keeps_other_defaults() {
        let config = ServerConfig::with_port(9000);
        assert_eq!(config.listen.port(), 9000);
        assert_eq!(config.write_timeout, DEFAULT_WRITE_TIMEOUT);
        assert_eq!(config.shutdown_grace, DEFAULT_SHUTDOWN_GRACE);
    }
}
