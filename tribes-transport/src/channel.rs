use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use tribes_core::channel_data::ChannelData;
use tribes_core::error::{ChannelError, SendError};
use tribes_core::member::Member;
use tribes_core::options::SendOptions;

use crate::config::TransportConfig;
use crate::pool::PooledParallelSender;
use crate::receiver::{MessageListener, NioReceiver, ReceiverHandle};
use crate::state::SenderStateRegistry;

pub trait MembershipListener: Send + Sync + 'static {
    fn member_added(&self, member: &Member);

    fn member_disappeared(&self, member: &Member);
}

pub trait ChannelListener: Send + Sync + 'static {
    fn accept(&self, data: &ChannelData) -> bool;

    fn message_received(&self, data: ChannelData) -> anyhow::Result<()>;
}

#[derive(Default)]
struct ChannelDispatcher {
    listeners: RwLock<Vec<Arc<dyn ChannelListener>>>,
}

impl MessageListener for ChannelDispatcher {
    fn message_received(&self, data: ChannelData) -> anyhow::Result<()> {
        let listeners = self.listeners.read().clone();
        let mut accepted = listeners.into_iter().filter(|listener| listener.accept(&data)).peekable();
        if accepted.peek().is_none() {
            warn!("no channel listener accepted message {} from {}", data.unique_id, data.address.name());
            return Ok(());
        }
        let mut result = Ok(());
        for listener in accepted {
            if let Err(error) = listener.message_received(data.clone()) {
                result = Err(error);
            }
        }
        result
    }
}

/// Group channel with a static member list: sends through the pooled fan-out sender and
/// receives through one [`NioReceiver`].
pub struct ReplicationChannel {
    config: TransportConfig,
    local_member: RwLock<Option<Member>>,
    members: RwLock<Vec<Member>>,
    sender: Arc<PooledParallelSender>,
    dispatcher: Arc<ChannelDispatcher>,
    membership_listeners: RwLock<Vec<Arc<dyn MembershipListener>>>,
    receiver: Mutex<Option<ReceiverHandle>>,
}

impl ReplicationChannel {
    pub fn new(config: TransportConfig) -> Self {
        Self::with_states(config, Arc::new(SenderStateRegistry::new()))
    }

    pub fn with_states(config: TransportConfig, states: Arc<SenderStateRegistry>) -> Self {
        let sender = PooledParallelSender::new(config.socket.clone(), config.sender.clone(), states);
        Self {
            config,
            local_member: RwLock::new(None),
            members: RwLock::new(Vec::new()),
            sender: Arc::new(sender),
            dispatcher: Arc::new(ChannelDispatcher::default()),
            membership_listeners: RwLock::new(Vec::new()),
            receiver: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn sender(&self) -> &Arc<PooledParallelSender> {
        &self.sender
    }

    /// Binds the receiver and connects the sender, returning the local member.
    pub async fn start(&self) -> anyhow::Result<Member> {
        let mut receiver = self.receiver.lock().await;
        if receiver.is_some() {
            if let Some(member) = self.local_member() {
                return Ok(member);
            }
        }
        let handle = NioReceiver::start(&self.config, self.dispatcher.clone()).await?;
        let mut member = Member::new(handle.local_addr());
        if let Some(udp) = handle.udp_addr() {
            member = member.with_udp_port(udp.port());
        }
        *receiver = Some(handle);
        *self.local_member.write() = Some(member.clone());
        self.sender.connect();
        info!("replication channel started as {}", member);
        Ok(member)
    }

    pub async fn stop(&self) {
        if let Some(handle) = self.receiver.lock().await.take() {
            handle.stop().await;
        }
        self.sender.disconnect();
        info!("replication channel stopped");
    }

    pub fn local_member(&self) -> Option<Member> {
        self.local_member.read().clone()
    }

    pub fn members(&self) -> Vec<Member> {
        self.members.read().clone()
    }

    pub fn has_members(&self) -> bool {
        !self.members.read().is_empty()
    }

    pub fn add_member(&self, member: Member) {
        {
            let mut members = self.members.write();
            if members.contains(&member) {
                return;
            }
            members.push(member.clone());
        }
        debug!("member added {}", member);
        for listener in self.membership_listeners.read().clone() {
            listener.member_added(&member);
        }
    }

    pub fn remove_member(&self, member: &Member) {
        let removed = {
            let mut members = self.members.write();
            let before = members.len();
            members.retain(|m| m != member);
            before != members.len()
        };
        if !removed {
            return;
        }
        self.sender.remove(member);
        debug!("member disappeared {}", member);
        for listener in self.membership_listeners.read().clone() {
            listener.member_disappeared(member);
        }
    }

    pub fn add_membership_listener(&self, listener: Arc<dyn MembershipListener>) {
        self.membership_listeners.write().push(listener);
    }

    pub fn remove_membership_listener(&self, listener: &Arc<dyn MembershipListener>) {
        self.membership_listeners.write().retain(|l| !Arc::ptr_eq(l, listener));
    }

    pub fn add_channel_listener(&self, listener: Arc<dyn ChannelListener>) {
        self.dispatcher.listeners.write().push(listener);
    }

    pub fn remove_channel_listener(&self, listener: &Arc<dyn ChannelListener>) {
        self.dispatcher.listeners.write().retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Sends to `destinations`. With [`SendOptions::ASYNCHRONOUS`] the delivery runs in the
    /// background and failures are only logged.
    pub async fn send(&self, destinations: &[Member], message: Vec<u8>, options: SendOptions) -> Result<(), ChannelError> {
        let local = match self.local_member() {
            Some(local) => local,
            None => {
                return Err(ChannelError::with_all("channel is not started", destinations, || {
                    SendError::SenderDisconnected
                }))
            }
        };
        let data = ChannelData::new(local, options, message);
        if options.is_asynchronous() {
            let sender = self.sender.clone();
            let destinations = destinations.to_vec();
            tokio::spawn(async move {
                if let Err(error) = sender.send_message(&destinations, &data).await {
                    warn!("asynchronous send of {} failed: {}", data.unique_id, error);
                }
            });
            Ok(())
        } else {
            self.sender.send_message(destinations, &data).await
        }
    }

    /// Periodic maintenance of cached sender connections.
    pub fn heartbeat(&self) {
        self.sender.keepalive();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use parking_lot::Mutex;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use tribes_core::channel_data::ChannelData;
    use tribes_core::config::ConfigBuilder;
    use tribes_core::error::SendError;
    use tribes_core::member::Member;
    use tribes_core::options::SendOptions;

    use crate::channel::{ChannelListener, MembershipListener, ReplicationChannel};
    use crate::config::TransportConfig;

    struct Forward {
        prefix: u8,
        tx: mpsc::UnboundedSender<Vec<u8>>,
    }

    impl ChannelListener for Forward {
        fn accept(&self, data: &ChannelData) -> bool {
            data.message.first() == Some(&self.prefix)
        }

        fn message_received(&self, data: ChannelData) -> anyhow::Result<()> {
            let _ = self.tx.send(data.message);
            Ok(())
        }
    }

    #[derive(Default)]
    struct Membership {
        events: Mutex<Vec<String>>,
    }

    impl MembershipListener for Membership {
        fn member_added(&self, member: &Member) {
            self.events.lock().push(format!("added {}", member.addr));
        }

        fn member_disappeared(&self, member: &Member) {
            self.events.lock().push(format!("gone {}", member.addr));
        }
    }

    fn config() -> anyhow::Result<TransportConfig> {
        let mut config = TransportConfig::builder().build()?;
        config.receiver.port = 0;
        config.receiver.shutdown_wait_ms = 1000;
        Ok(config)
    }

    #[tokio::test]
    async fn test_two_channels() -> anyhow::Result<()> {
        let first = ReplicationChannel::new(config()?);
        let second = ReplicationChannel::new(config()?);
        let first_member = first.start().await?;
        let second_member = second.start().await?;
        let membership = Arc::new(Membership::default());
        first.add_membership_listener(membership.clone());
        first.add_member(second_member.clone());
        first.add_member(second_member.clone());
        assert_eq!(first.members(), vec![second_member.clone()]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        second.add_channel_listener(Arc::new(Forward { prefix: 1, tx }));

        first.send(&[second_member.clone()], vec![1, 2, 3], SendOptions::USE_ACK).await?;
        assert_eq!(rx.recv().await, Some(vec![1, 2, 3]));
        first.send(&[second_member.clone()], vec![9], SendOptions::USE_ACK).await?;
        first
            .send(&[second_member.clone()], vec![1, 4], SendOptions::USE_ACK | SendOptions::ASYNCHRONOUS)
            .await?;
        assert_eq!(timeout(Duration::from_secs(2), rx.recv()).await?, Some(vec![1, 4]));

        first.heartbeat();
        first.remove_member(&second_member);
        assert!(!first.has_members());
        assert_eq!(
            *membership.events.lock(),
            vec![format!("added {}", second_member.addr), format!("gone {}", second_member.addr)]
        );
        assert_ne!(first_member, second_member);
        first.stop().await;
        second.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_send_before_start() -> anyhow::Result<()> {
        let channel = ReplicationChannel::new(config()?);
        let member = Member::new("127.0.0.1:4001".parse()?);
        let error = match channel.send(&[member], vec![1], SendOptions::USE_ACK).await {
            Ok(()) => anyhow::bail!("send on a stopped channel succeeded"),
            Err(error) => error,
        };
        assert!(matches!(error.faulty_members()[0].cause, SendError::SenderDisconnected));
        Ok(())
    }
}
