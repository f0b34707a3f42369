use std::ops::RangeInclusive;
use std::time::Duration;

use anyhow::bail;

/// Version byte at the start of every stream dial request and response
pub const HANDSHAKE_PAYLOAD_VERSION: u8 = 2;

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_ACCEPT_BUFFER_SIZE: usize = 20;

pub const EPHEMERAL_PORTS: RangeInclusive<u16> = 49152..=u16::MAX;


/// Settings for the multiplexer that runs inside each session
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Number of bytes a sub-stream's peer may send without having them acknowledged. This is
    ///  the upper bound for what a slow reader causes to be buffered on the other side, and it
    ///  is what a relay server buffers per stream direction at most.
    pub window_size: u32,
    /// Maximum payload of a single data frame. Writes are split into frames no bigger than this.
    pub max_data_frame_size: u32,
    /// Number of sub-streams opened by the peer that are queued waiting to be accepted. When the
    ///  backlog is full, additional sub-streams are refused.
    pub accept_backlog: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        MuxConfig {
            window_size: 256*1024,
            max_data_frame_size: 16*1024,
            accept_backlog: 256,
        }
    }
}

impl MuxConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_data_frame_size == 0 {
            bail!("max data frame size must be positive");
        }
        if self.window_size < self.max_data_frame_size {
            bail!("window size must be at least the max data frame size");
        }
        if self.accept_backlog == 0 {
            bail!("accept backlog must be positive");
        }
        Ok(())
    }
}


#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// The client keeps trying to have at least this many sessions to relay servers
    pub min_sessions: usize,
    /// bound for the session handshake and for the stream dial request / response round trip
    pub handshake_timeout: Duration,
    /// number of accepted streams a listener queues before rejecting new ones
    pub accept_buffer_size: usize,
    /// initial delay for retrying after failing to reach discovery or a server
    pub reconnect_interval: Duration,
    pub max_reconnect_interval: Duration,
    pub mux: MuxConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            min_sessions: 1,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            accept_buffer_size: DEFAULT_ACCEPT_BUFFER_SIZE,
            reconnect_interval: Duration::from_secs(3),
            max_reconnect_interval: Duration::from_secs(60),
            mux: MuxConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.min_sessions == 0 {
            bail!("a client needs at least one session");
        }
        if self.accept_buffer_size == 0 {
            bail!("accept buffer size must be positive");
        }
        if self.reconnect_interval.is_zero() || self.max_reconnect_interval < self.reconnect_interval {
            bail!("reconnect interval must be positive and not exceed the max reconnect interval");
        }
        self.mux.validate()
    }
}


#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address clients use to reach this server, published to discovery. This can differ from the
    ///  address the server's listener is bound to (e.g. NAT or a wildcard bind address).
    pub public_address: String,
    /// Sessions beyond this number are refused
    pub max_sessions: usize,
    pub handshake_timeout: Duration,
    /// interval for re-publishing the server's discovery entry
    pub update_interval: Duration,
    pub mux: MuxConfig,
}

impl ServerConfig {
    pub fn new(public_address: impl Into<String>) -> ServerConfig {
        ServerConfig {
            public_address: public_address.into(),
            max_sessions: 100,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            update_interval: Duration::from_secs(15),
            mux: MuxConfig::default(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.public_address.is_empty() {
            bail!("public address must not be empty");
        }
        if self.max_sessions == 0 {
            bail!("max sessions must be positive");
        }
        // published to discovery as a u32
        if u32::try_from(self.max_sessions).is_err() {
            bail!("max sessions must not exceed {}", u32::MAX);
        }
        self.mux.validate()
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        ClientConfig::default().validate().unwrap();
        ServerConfig::new("127.0.0.1:8080").validate().unwrap();
        ServerConfig { max_sessions: u32::MAX as usize, ..ServerConfig::new("x") }.validate().unwrap();
    }

    #[rstest]
    #[case::no_sessions(ClientConfig { min_sessions: 0, ..Default::default() })]
    #[case::no_accept_buffer(ClientConfig { accept_buffer_size: 0, ..Default::default() })]
    #[case::zero_reconnect(ClientConfig { reconnect_interval: Duration::ZERO, ..Default::default() })]
    #[case::reconnect_above_max(ClientConfig { reconnect_interval: Duration::from_secs(100), ..Default::default() })]
    #[case::window_too_small(ClientConfig { mux: MuxConfig { window_size: 10, ..Default::default() }, ..Default::default() })]
    fn test_invalid_client_config(#[case] config: ClientConfig) {
        assert!(config.validate().is_err());
    }

    #[rstest]
    #[case::no_address(ServerConfig { public_address: "".to_string(), ..ServerConfig::new("x") })]
    #[case::no_sessions(ServerConfig { max_sessions: 0, ..ServerConfig::new("x") })]
    #[case::too_many_sessions(ServerConfig { max_sessions: u32::MAX as usize + 1, ..ServerConfig::new("x") })]
    fn test_invalid_server_config(#[case] config: ServerConfig) {
        assert!(config.validate().is_err());
    }
}
