use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use anyhow::{anyhow, bail, Context};
use arc_swap::ArcSwap;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use tribes_core::channel_data::ChannelData;
use tribes_core::ext::current_millis;
use tribes_core::member::Member;
use tribes_core::options::SendOptions;
use tribes_transport::channel::{ChannelListener, MembershipListener, ReplicationChannel};
use tribes_transport::config::TransportConfig;

use crate::config::ClusterConfig;
use crate::listener::ClusterListener;
use crate::manager::ClusterManager;
use crate::message::ClusterMessage;

/// Bridges channel callbacks back to the cluster without keeping it alive.
struct ClusterAdapter {
    cluster: Weak<SimpleTcpCluster>,
}

impl ChannelListener for ClusterAdapter {
    fn accept(&self, data: &ChannelData) -> bool {
        !data.options.contains(SendOptions::BYTE_MESSAGE)
    }

    fn message_received(&self, data: ChannelData) -> anyhow::Result<()> {
        let cluster = match self.cluster.upgrade() {
            Some(cluster) => cluster,
            None => return Ok(()),
        };
        let mut message = ClusterMessage::from_bytes(&data.message)
            .with_context(|| format!("unable to decode cluster message {} from {}", data.unique_id, data.address))?;
        message.address = Some(data.address);
        cluster.message_received(message)
    }
}

impl MembershipListener for ClusterAdapter {
    fn member_added(&self, member: &Member) {
        if let Some(cluster) = self.cluster.upgrade() {
            cluster.member_added(member);
        }
    }

    fn member_disappeared(&self, member: &Member) {
        if let Some(cluster) = self.cluster.upgrade() {
            cluster.member_disappeared(member);
        }
    }
}

/// Cluster coordinator: owns the channel, the registered session managers and the message
/// listeners, and replicates messages to every live member.
pub struct SimpleTcpCluster {
    config: ClusterConfig,
    send_options: SendOptions,
    channel: Arc<ReplicationChannel>,
    managers: DashMap<String, Arc<dyn ClusterManager>, ahash::RandomState>,
    listeners: ArcSwap<Vec<Arc<dyn ClusterListener>>>,
    has_members: AtomicBool,
    adapter: Mutex<Option<Arc<ClusterAdapter>>>,
}

impl SimpleTcpCluster {
    pub fn new(config: ClusterConfig, transport: TransportConfig) -> anyhow::Result<Arc<Self>> {
        Self::with_channel(config, Arc::new(ReplicationChannel::new(transport)))
    }

    pub fn with_channel(config: ClusterConfig, channel: Arc<ReplicationChannel>) -> anyhow::Result<Arc<Self>> {
        let send_options = config.send_options()?;
        let cluster = Self {
            config,
            send_options,
            channel,
            managers: DashMap::default(),
            listeners: ArcSwap::from_pointee(Vec::new()),
            has_members: AtomicBool::new(false),
            adapter: Mutex::new(None),
        };
        Ok(Arc::new(cluster))
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn channel(&self) -> &Arc<ReplicationChannel> {
        &self.channel
    }

    pub fn send_options(&self) -> SendOptions {
        self.send_options
    }

    /// Starts the channel. A receiver that cannot bind aborts the start.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<Member> {
        let adapter = Arc::new(ClusterAdapter { cluster: Arc::downgrade(self) });
        self.channel.add_channel_listener(adapter.clone());
        self.channel.add_membership_listener(adapter.clone());
        *self.adapter.lock() = Some(adapter);
        match self.channel.start().await {
            Ok(member) => {
                self.has_members.store(self.channel.has_members(), Ordering::Release);
                info!("cluster {} started, local member {}", self.config.cluster_name, member);
                Ok(member)
            }
            Err(error) => {
                self.remove_adapter();
                Err(error).context(format!("unable to start cluster {}", self.config.cluster_name))
            }
        }
    }

    pub async fn stop(&self) {
        self.remove_adapter();
        self.channel.stop().await;
        self.has_members.store(false, Ordering::Release);
        info!("cluster {} stopped", self.config.cluster_name);
    }

    fn remove_adapter(&self) {
        if let Some(adapter) = self.adapter.lock().take() {
            let channel_listener: Arc<dyn ChannelListener> = adapter.clone();
            let membership_listener: Arc<dyn MembershipListener> = adapter;
            self.channel.remove_channel_listener(&channel_listener);
            self.channel.remove_membership_listener(&membership_listener);
        }
    }

    pub fn local_member(&self) -> Option<Member> {
        self.channel.local_member()
    }

    pub fn members(&self) -> Vec<Member> {
        self.channel.members()
    }

    pub fn has_members(&self) -> bool {
        self.has_members.load(Ordering::Acquire)
    }

    pub fn add_member(&self, member: Member) {
        self.channel.add_member(member);
    }

    pub fn remove_member(&self, member: &Member) {
        self.channel.remove_member(member);
    }

    pub fn member_added(&self, member: &Member) {
        self.has_members.store(self.channel.has_members(), Ordering::Release);
        info!("replication member added: {}", member);
    }

    pub fn member_disappeared(&self, member: &Member) {
        self.has_members.store(self.channel.has_members(), Ordering::Release);
        info!("replication member disappeared: {}", member);
    }

    /// Name under which the manager of `context` is registered on every node.
    pub fn manager_name(&self, context: &str) -> String {
        format!("{}#{}", self.config.host_name, context)
    }

    pub fn register_manager(&self, manager: Arc<dyn ClusterManager>) -> anyhow::Result<()> {
        let name = manager.name().to_string();
        if self.managers.contains_key(&name) {
            bail!("manager {} already registered in cluster {}", name, self.config.cluster_name);
        }
        self.managers.insert(name.clone(), manager);
        info!("registered manager {} in cluster {}", name, self.config.cluster_name);
        Ok(())
    }

    pub fn remove_manager(&self, name: &str) -> Option<Arc<dyn ClusterManager>> {
        self.managers.remove(name).map(|(_, manager)| manager)
    }

    pub fn manager(&self, name: &str) -> Option<Arc<dyn ClusterManager>> {
        self.managers.get(name).map(|manager| manager.value().clone())
    }

    pub fn has_manager(&self, name: &str) -> bool {
        self.managers.contains_key(name)
    }

    pub fn add_cluster_listener(&self, listener: Arc<dyn ClusterListener>) {
        self.listeners.rcu(|listeners| {
            let mut listeners = (**listeners).clone();
            listeners.push(listener.clone());
            listeners
        });
    }

    pub fn remove_cluster_listener(&self, listener: &Arc<dyn ClusterListener>) {
        self.listeners.rcu(|listeners| {
            let mut listeners = (**listeners).clone();
            listeners.retain(|l| !Arc::ptr_eq(l, listener));
            listeners
        });
    }

    /// Replicates to every member with the configured send options.
    pub async fn send(&self, message: ClusterMessage) -> anyhow::Result<()> {
        self.send_with_options(message, None, self.send_options).await
    }

    pub async fn send_to(&self, message: ClusterMessage, destination: &Member) -> anyhow::Result<()> {
        self.send_with_options(message, Some(destination), self.send_options).await
    }

    pub async fn send_with_options(
        &self,
        mut message: ClusterMessage,
        destination: Option<&Member>,
        options: SendOptions,
    ) -> anyhow::Result<()> {
        let local = self
            .local_member()
            .ok_or_else(|| anyhow!("cluster {} is not started", self.config.cluster_name))?;
        message.address = Some(local.clone());
        let destinations = match destination {
            Some(destination) if destination == &local => {
                bail!("unable to send message {} to the local member {}", message.unique_id(), local);
            }
            Some(destination) => vec![destination.clone()],
            None => {
                let members = self.members();
                if members.is_empty() {
                    debug!("no members in cluster, ignoring message {}", message);
                    return Ok(());
                }
                members
            }
        };
        let bytes = message.to_bytes()?;
        if let Err(error) = self.channel.send(&destinations, bytes, options).await {
            error!("unable to send message {} through cluster sender: {}", message.unique_id(), error);
            return Err(error.into());
        }
        Ok(())
    }

    /// Dispatches an inbound message to every listener that accepts it.
    pub fn message_received(&self, message: ClusterMessage) -> anyhow::Result<()> {
        debug!(
            "assuming clocks are synched: replication for {} took {} ms",
            message.unique_id(),
            current_millis() - message.timestamp
        );
        let listeners = self.listeners.load();
        let mut accepted = false;
        let mut result = Ok(());
        for listener in listeners.iter().filter(|listener| listener.accept(&message)) {
            accepted = true;
            if let Err(error) = listener.message_received(self, message.clone()) {
                result = Err(error);
            }
        }
        if !accepted {
            let sender = message.address.as_ref().map(|m| m.name()).unwrap_or_default();
            if self.config.notify_on_failure {
                warn!("message {} from {} was not accepted by any cluster listener", message, sender);
            } else {
                debug!("message {} from {} was not accepted by any cluster listener", message, sender);
            }
        }
        result
    }

    /// Periodic work, heartbeats the channel when enabled.
    pub fn background_process(&self) {
        if self.config.heartbeat_background_enabled {
            self.channel.heartbeat();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use config::{File, FileFormat};

    use tribes_core::config::ConfigBuilder;
    use tribes_core::member::Member;
    use tribes_core::options::SendOptions;
    use tribes_transport::config::TransportConfig;

    use crate::cluster::SimpleTcpCluster;
    use crate::config::ClusterConfig;
    use crate::listener::ClusterSessionListener;
    use crate::manager::{ClusterManager, DeltaManager};
    use crate::message::{ClusterMessage, ClusterMessageBody};

    pub(crate) fn transport() -> anyhow::Result<TransportConfig> {
        let mut config = TransportConfig::builder().build()?;
        config.receiver.port = 0;
        config.receiver.shutdown_wait_ms = 1000;
        Ok(config)
    }

    pub(crate) fn cluster_config(send_options: &str) -> anyhow::Result<ClusterConfig> {
        ClusterConfig::builder()
            .add_source(File::from_str(&format!("channel_send_options = \"{}\"", send_options), FileFormat::Toml))?
            .build()
    }

    #[tokio::test]
    async fn test_replicate_delta() -> anyhow::Result<()> {
        let first = SimpleTcpCluster::new(cluster_config("use_ack|sync_ack")?, transport()?)?;
        let second = SimpleTcpCluster::new(cluster_config("use_ack|sync_ack")?, transport()?)?;
        let first_member = first.start().await?;
        let second_member = second.start().await?;
        first.add_member(second_member.clone());
        second.add_member(first_member.clone());
        assert!(first.has_members());

        let name = first.manager_name("/app");
        let source = Arc::new(DeltaManager::new(name.clone()));
        let replica = Arc::new(DeltaManager::new(name.clone()));
        first.register_manager(source.clone())?;
        second.register_manager(replica.clone())?;
        assert!(first.register_manager(source.clone()).is_err());
        second.add_cluster_listener(Arc::new(ClusterSessionListener));

        let id = source.create_session("S1");
        source.set_attribute(&id, "user", b"alice".to_vec())?;
        let message = source.request_completed(&id).ok_or(anyhow::anyhow!("no delta"))?;
        first.send(message).await?;
        assert_eq!(replica.attribute(&id, "user"), Some(b"alice".to_vec()));
        assert_eq!(replica.is_primary_session(&id), Some(false));

        first.remove_member(&second_member);
        assert!(!first.has_members());
        first.stop().await;
        second.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_send_guards() -> anyhow::Result<()> {
        let cluster = SimpleTcpCluster::new(cluster_config("use_ack")?, transport()?)?;
        let heartbeat = ClusterMessage::new("", ClusterMessageBody::Heartbeat);
        assert!(cluster.send(heartbeat.clone()).await.is_err());
        let local = cluster.start().await?;
        cluster.send(heartbeat.clone()).await?;
        assert!(cluster.send_to(heartbeat.clone(), &local).await.is_err());
        let unreachable = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
            Member::new(listener.local_addr()?)
        };
        assert!(cluster.send_to(heartbeat.clone(), &unreachable).await.is_err());
        cluster.message_received(heartbeat)?;
        cluster.background_process();
        cluster.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_async_send() -> anyhow::Result<()> {
        let first = SimpleTcpCluster::new(cluster_config("async")?, transport()?)?;
        let second = SimpleTcpCluster::new(cluster_config("async")?, transport()?)?;
        assert_eq!(first.send_options(), SendOptions::ASYNCHRONOUS);
        first.start().await?;
        let second_member = second.start().await?;
        first.add_member(second_member);
        let name = second.manager_name("/app");
        let replica = Arc::new(DeltaManager::new(name.clone()));
        second.register_manager(replica.clone())?;
        second.add_cluster_listener(Arc::new(ClusterSessionListener));
        let source = DeltaManager::new(name);
        let id = source.create_session("S9");
        source.set_attribute(&id, "k", vec![1])?;
        first.send(source.request_completed(&id).ok_or(anyhow::anyhow!("no delta"))?).await?;
        for _ in 0..100 {
            if replica.attribute(&id, "k").is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(replica.attribute(&id, "k"), Some(vec![1]));
        first.stop().await;
        second.stop().await;
        Ok(())
    }
}
