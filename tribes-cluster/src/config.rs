use config::builder::DefaultState;
use config::{File, FileFormat, Source};
use serde::{Deserialize, Serialize};

use tribes_core::config::{Config, ConfigBuilder};
use tribes_core::options::SendOptions;

use crate::CLUSTER_CONFIG;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub cluster_name: String,
    pub host_name: String,
    pub channel_send_options: String,
    pub notify_on_failure: bool,
    pub heartbeat_background_enabled: bool,
    pub valve: ValveConfig,
}

impl Config for ClusterConfig {}

impl ClusterConfig {
    pub fn builder() -> ClusterConfigBuilder {
        ClusterConfigBuilder::default()
    }

    pub fn send_options(&self) -> anyhow::Result<SendOptions> {
        self.channel_send_options.parse()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValveConfig {
    /// Requests whose uri matches this pattern never trigger replication. Empty disables it.
    pub filter: String,
    pub primary_indicator: bool,
    pub primary_indicator_name: String,
    pub statistics: bool,
}

#[derive(Debug, Default)]
pub struct ClusterConfigBuilder {
    builder: config::ConfigBuilder<DefaultState>,
}

impl ConfigBuilder for ClusterConfigBuilder {
    type C = ClusterConfig;

    fn add_source<T>(self, source: T) -> anyhow::Result<Self>
    where
        T: Source + Send + Sync + 'static,
    {
        Ok(Self { builder: self.builder.add_source(source) })
    }

    fn build(self) -> anyhow::Result<Self::C> {
        let builder = config::ConfigBuilder::<DefaultState>::default()
            .add_source(File::from_str(CLUSTER_CONFIG, FileFormat::Toml))
            .add_source(self.builder.build()?);
        let cluster_config = builder.build()?.try_deserialize::<Self::C>()?;
        cluster_config.send_options()?;
        Ok(cluster_config)
    }
}
