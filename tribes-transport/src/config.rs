use std::net::IpAddr;
use std::time::Duration;

use config::builder::DefaultState;
use config::{File, FileFormat, Source};
use serde::{Deserialize, Serialize};

use tribes_core::config::{Config, ConfigBuilder};

use crate::TRANSPORT_CONFIG;

fn optional_millis(millis: i64) -> Option<Duration> {
    u64::try_from(millis).ok().map(Duration::from_millis)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    pub socket: SocketOptions,
    pub sender: SenderConfig,
    pub receiver: ReceiverConfig,
}

impl Config for TransportConfig {}

impl TransportConfig {
    pub fn builder() -> TransportConfigBuilder {
        TransportConfigBuilder::default()
    }

    pub fn reference() -> anyhow::Result<Self> {
        Self::builder().build()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketOptions {
    pub rx_buf_size: usize,
    pub tx_buf_size: usize,
    pub udp_rx_buf_size: usize,
    pub udp_tx_buf_size: usize,
    pub tcp_no_delay: bool,
    pub so_keep_alive: bool,
    pub so_reuse_address: bool,
    pub so_linger_on: bool,
    /// Seconds.
    pub so_linger_time: u64,
    pub so_traffic_class: u32,
    pub oob_inline: bool,
    /// Allocation hint kept for configuration compatibility, buffers are always heap backed.
    pub direct_buffer: bool,
    /// Upper bound for a pending non-blocking connect.
    pub timeout_ms: u64,
}

impl SocketOptions {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn linger(&self) -> Option<Duration> {
        if self.so_linger_on {
            Some(Duration::from_secs(self.so_linger_time))
        } else {
            None
        }
    }
}

/// Settings copied by value into every pooled fan-out sender and each of its connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderConfig {
    pub timeout_ms: u64,
    pub max_retry_attempts: u32,
    pub keep_alive_count: i64,
    pub keep_alive_time_ms: i64,
    pub throw_on_failed_ack: bool,
    pub select_timeout_ms: u64,
    pub max_pool_size: usize,
    pub max_wait_ms: u64,
}

impl SenderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn select_timeout(&self) -> Duration {
        Duration::from_millis(self.select_timeout_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    pub fn keep_alive_count(&self) -> Option<u64> {
        u64::try_from(self.keep_alive_count).ok()
    }

    pub fn keep_alive_time(&self) -> Option<Duration> {
        optional_millis(self.keep_alive_time_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiverConfig {
    pub address: IpAddr,
    pub port: u16,
    pub auto_bind: u16,
    pub udp_port: i32,
    pub selector_timeout_ms: u64,
    pub timeout_ms: u64,
    pub min_threads: usize,
    pub max_threads: usize,
    pub shutdown_wait_ms: u64,
    pub max_datagram_size: usize,
}

impl ReceiverConfig {
    pub fn udp_port(&self) -> Option<u16> {
        u16::try_from(self.udp_port).ok()
    }

    pub fn selector_timeout(&self) -> Duration {
        Duration::from_millis(self.selector_timeout_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn shutdown_wait(&self) -> Duration {
        Duration::from_millis(self.shutdown_wait_ms)
    }
}

#[derive(Debug, Default)]
pub struct TransportConfigBuilder {
    builder: config::ConfigBuilder<DefaultState>,
}

impl ConfigBuilder for TransportConfigBuilder {
    type C = TransportConfig;

    fn add_source<T>(self, source: T) -> anyhow::Result<Self>
    where
        T: Source + Send + Sync + 'static,
    {
        Ok(Self { builder: self.builder.add_source(source) })
    }

    fn build(self) -> anyhow::Result<Self::C> {
        let builder = config::ConfigBuilder::<DefaultState>::default()
            .add_source(File::from_str(TRANSPORT_CONFIG, FileFormat::Toml))
            .add_source(self.builder.build()?);
        let transport_config = builder.build()?.try_deserialize::<Self::C>()?;
        Ok(transport_config)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use config::{File, FileFormat};

    use tribes_core::config::ConfigBuilder;

    use crate::config::TransportConfig;

    #[test]
    fn test_reference_config() -> anyhow::Result<()> {
        let config = TransportConfig::reference()?;
        assert_eq!(config.receiver.port, 4000);
        assert_eq!(config.receiver.udp_port(), None);
        assert_eq!(config.sender.keep_alive_count(), None);
        assert_eq!(config.sender.keep_alive_time(), None);
        assert_eq!(config.sender.max_wait(), Duration::from_secs(3));
        assert_eq!(config.socket.linger(), None);
        Ok(())
    }

    #[test]
    fn test_override_source() -> anyhow::Result<()> {
        let overrides = r#"
            [sender]
            max_retry_attempts = 0
            keep_alive_count = 100
            [receiver]
            port = 0
            udp_port = 4500
        "#;
        let config = TransportConfig::builder()
            .add_source(File::from_str(overrides, FileFormat::Toml))?
            .build()?;
        assert_eq!(config.sender.max_retry_attempts, 0);
        assert_eq!(config.sender.keep_alive_count(), Some(100));
        assert_eq!(config.sender.timeout_ms, 3000);
        assert_eq!(config.receiver.port, 0);
        assert_eq!(config.receiver.udp_port(), Some(4500));
        Ok(())
    }
}
