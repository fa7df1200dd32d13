use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio::time::timeout;
use tracing::{debug, warn};

use tribes_core::channel_data::ChannelData;
use tribes_core::error::{ChannelError, SendError};
use tribes_core::member::Member;

use crate::config::{SenderConfig, SocketOptions};
use crate::parallel::ParallelNioSender;
use crate::state::SenderStateRegistry;

/// Bounded pool of fan-out senders shared by concurrent callers.
#[derive(Debug)]
pub struct PooledParallelSender {
    options: SocketOptions,
    config: SenderConfig,
    states: Arc<SenderStateRegistry>,
    idle: Mutex<Vec<ParallelNioSender>>,
    removed: Mutex<Vec<(u64, Member)>>,
    epoch: AtomicU64,
    permits: Semaphore,
    in_use: AtomicUsize,
    shutdown: Arc<AtomicBool>,
}

/// A checked out sender, returned to the pool on drop.
pub struct PooledSender<'a> {
    pool: &'a PooledParallelSender,
    sender: Option<ParallelNioSender>,
    epoch: u64,
    in_flight: bool,
    _permit: SemaphorePermit<'a>,
}

impl PooledSender<'_> {
    pub fn get(&self) -> Option<&ParallelNioSender> {
        self.sender.as_ref()
    }

    pub fn get_mut(&mut self) -> Option<&mut ParallelNioSender> {
        self.sender.as_mut()
    }

    /// Sends through the checked out sender. A send that is dropped before it finishes leaves
    /// the sender disconnected when it goes back to the pool.
    pub async fn send_message(&mut self, destinations: &[Member], data: &ChannelData) -> Result<(), ChannelError> {
        let sender = match self.sender.as_mut() {
            Some(sender) => sender,
            None => {
                return Err(ChannelError::with_all("pooled sender already released", destinations, || {
                    SendError::SenderDisconnected
                }))
            }
        };
        if !sender.is_connected() {
            sender.connect();
        }
        self.in_flight = true;
        let result = sender.send_message(destinations, data).await;
        self.in_flight = false;
        match &result {
            Ok(()) => {
                sender.keepalive();
            }
            Err(_) => sender.disconnect(),
        }
        result
    }
}

impl Drop for PooledSender<'_> {
    fn drop(&mut self) {
        if let Some(mut sender) = self.sender.take() {
            if self.in_flight {
                debug!("pooled send dropped before completion, disconnecting its connections");
                sender.disconnect();
            }
            self.pool.return_sender(sender, self.epoch);
        }
    }
}

impl PooledParallelSender {
    pub fn new(options: SocketOptions, config: SenderConfig, states: Arc<SenderStateRegistry>) -> Self {
        let permits = Semaphore::new(config.max_pool_size.max(1));
        Self {
            options,
            config,
            states,
            idle: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
            epoch: AtomicU64::new(0),
            permits,
            in_use: AtomicUsize::new(0),
            shutdown: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn states(&self) -> &Arc<SenderStateRegistry> {
        &self.states
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }

    pub fn is_connected(&self) -> bool {
        !self.shutdown.load(Ordering::Acquire)
    }

    pub fn connect(&self) {
        self.shutdown.store(false, Ordering::Release);
    }

    pub fn disconnect(&self) {
        self.shutdown.store(true, Ordering::Release);
        for sender in self.idle.lock().iter_mut() {
            sender.disconnect();
        }
    }

    /// Waits up to `max_wait` for a free sender.
    pub async fn checkout(&self, max_wait: Duration) -> Option<PooledSender<'_>> {
        let permit = match timeout(max_wait, self.permits.acquire()).await {
            Ok(Ok(permit)) => permit,
            _ => return None,
        };
        let sender = self.idle.lock().pop().unwrap_or_else(|| self.new_sender());
        self.in_use.fetch_add(1, Ordering::AcqRel);
        Some(PooledSender {
            pool: self,
            sender: Some(sender),
            epoch: self.epoch.load(Ordering::Acquire),
            in_flight: false,
            _permit: permit,
        })
    }

    fn new_sender(&self) -> ParallelNioSender {
        ParallelNioSender::new(
            self.options.clone(),
            self.config.clone(),
            self.states.clone(),
            self.shutdown.clone(),
        )
    }

    /// Members removed after `epoch` lost their connections while the sender was checked out.
    fn return_sender(&self, mut sender: ParallelNioSender, epoch: u64) {
        if !self.is_connected() {
            sender.disconnect();
        }
        let mut removed = self.removed.lock();
        for (_, member) in removed.iter().filter(|(removed_at, _)| *removed_at > epoch) {
            sender.remove(member);
        }
        if self.in_use.fetch_sub(1, Ordering::AcqRel) == 1 {
            removed.clear();
        }
        self.idle.lock().push(sender);
    }

    pub async fn send_message(&self, destinations: &[Member], data: &ChannelData) -> Result<(), ChannelError> {
        let max_wait = self.config.max_wait();
        let mut sender = match self.checkout(max_wait).await {
            Some(sender) => sender,
            None => {
                warn!("unable to retrieve a sender from the pool within {:?}", max_wait);
                return Err(ChannelError::with_all(
                    "unable to retrieve a sender from the pool",
                    destinations,
                    || SendError::NoSenderAvailable(max_wait),
                ));
            }
        };
        sender.send_message(destinations, data).await
    }

    /// Runs the keep-alive sweep over every idle sender.
    pub fn keepalive(&self) -> bool {
        let mut changed = false;
        for sender in self.idle.lock().iter_mut() {
            changed |= sender.keepalive();
        }
        if changed {
            debug!("keep-alive sweep recycled pooled connections");
        }
        changed
    }

    /// Drops cached connections to a member that left the group. Checked out senders drop
    /// theirs when they come back.
    pub fn remove(&self, member: &Member) {
        let mut removed = self.removed.lock();
        for sender in self.idle.lock().iter_mut() {
            sender.remove(member);
        }
        if self.in_use() > 0 {
            let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
            removed.push((epoch, member.clone()));
        }
        drop(removed);
        self.states.remove(member);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use tribes_core::channel_data::ChannelData;
    use tribes_core::config::ConfigBuilder;
    use tribes_core::error::SendError;
    use tribes_core::member::Member;
    use tribes_core::options::SendOptions;

    use crate::codec::{FrameBuffer, ACK_COMMAND};
    use crate::config::TransportConfig;
    use crate::pool::PooledParallelSender;
    use crate::state::SenderStateRegistry;

    fn pool(size: usize) -> anyhow::Result<PooledParallelSender> {
        let mut config = TransportConfig::builder().build()?;
        config.sender.max_pool_size = size;
        config.sender.max_wait_ms = 100;
        let pool = PooledParallelSender::new(config.socket, config.sender, Arc::new(SenderStateRegistry::new()));
        pool.connect();
        Ok(pool)
    }

    #[tokio::test]
    async fn test_exhausted_pool() -> anyhow::Result<()> {
        let pool = pool(1)?;
        let members = vec![Member::new("127.0.0.1:4001".parse()?), Member::new("127.0.0.1:4002".parse()?)];
        let data = ChannelData::new(Member::new("127.0.0.1:4000".parse()?), SendOptions::USE_ACK, vec![1, 2, 3]);
        assert_eq!(pool.available(), 1);
        let held = pool.checkout(Duration::from_millis(10)).await;
        assert!(held.is_some());
        assert_eq!(pool.in_use(), 1);
        let error = match pool.send_message(&members, &data).await {
            Ok(()) => anyhow::bail!("send on an exhausted pool succeeded"),
            Err(error) => error,
        };
        assert_eq!(error.faulty_members().len(), 2);
        assert!(error
            .faulty_members()
            .iter()
            .all(|f| matches!(f.cause, SendError::NoSenderAvailable(_))));
        assert!(members.iter().all(|m| error.is_faulty(m)));
        drop(held);
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.idle(), 1);
        Ok(())
    }

    /// Acks only the first frame it ever sees, `delay` late, and ignores everything after it.
    async fn first_frame_peer(delay: Duration) -> anyhow::Result<Member> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let member = Member::new(listener.local_addr()?);
        let frames = Arc::new(AtomicUsize::new(0));
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let frames = frames.clone();
                tokio::spawn(async move {
                    let mut buffer = FrameBuffer::default();
                    let mut chunk = vec![0u8; 1024];
                    loop {
                        let n = stream.read(&mut chunk).await?;
                        if n == 0 {
                            return anyhow::Ok(());
                        }
                        buffer.append(&chunk[..n]);
                        while buffer.extract_package()?.is_some() {
                            if frames.fetch_add(1, Ordering::SeqCst) == 0 {
                                tokio::time::sleep(delay).await;
                                stream.write_all(&ACK_COMMAND).await?;
                            }
                        }
                    }
                });
            }
        });
        Ok(member)
    }

    #[tokio::test]
    async fn test_cancelled_send_not_reused() -> anyhow::Result<()> {
        let mut config = TransportConfig::builder().build()?;
        config.sender.max_pool_size = 1;
        config.sender.timeout_ms = 800;
        config.sender.max_retry_attempts = 0;
        let pool = PooledParallelSender::new(config.socket, config.sender, Arc::new(SenderStateRegistry::new()));
        pool.connect();
        let member = first_frame_peer(Duration::from_millis(300)).await?;
        let local = Member::new("127.0.0.1:4000".parse()?);
        let first = ChannelData::new(local.clone(), SendOptions::USE_ACK, vec![1]);
        let cancelled = tokio::time::timeout(Duration::from_millis(100), pool.send_message(&[member.clone()], &first)).await;
        assert!(cancelled.is_err());
        assert_eq!(pool.in_use(), 0);
        let second = ChannelData::new(local, SendOptions::USE_ACK, vec![2]);
        let error = match pool.send_message(&[member.clone()], &second).await {
            Ok(()) => anyhow::bail!("unacknowledged message reported as delivered"),
            Err(error) => error,
        };
        assert!(error.is_faulty(&member));
        Ok(())
    }

    #[tokio::test]
    async fn test_remove_while_checked_out() -> anyhow::Result<()> {
        let pool = pool(2)?;
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let member = Member::new(listener.local_addr()?);
        let mut held = match pool.checkout(Duration::from_millis(10)).await {
            Some(held) => held,
            None => anyhow::bail!("pool exhausted"),
        };
        let data = ChannelData::new(Member::new("127.0.0.1:4000".parse()?), SendOptions::NONE, vec![1]);
        held.send_message(&[member.clone()], &data).await?;
        assert_eq!(held.get().map(|sender| sender.cached_connections()), Some(1));
        pool.remove(&member);
        drop(held);
        let held = match pool.checkout(Duration::from_millis(10)).await {
            Some(held) => held,
            None => anyhow::bail!("pool exhausted"),
        };
        assert_eq!(held.get().map(|sender| sender.cached_connections()), Some(0));
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_send_returns_sender() -> anyhow::Result<()> {
        let pool = pool(2)?;
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let refused = Member::new(listener.local_addr()?);
        drop(listener);
        let data = ChannelData::new(Member::new("127.0.0.1:4000".parse()?), SendOptions::USE_ACK, vec![1]);
        assert!(pool.send_message(&[refused.clone()], &data).await.is_err());
        assert_eq!(pool.available(), 2);
        assert_eq!(pool.idle(), 1);
        pool.remove(&refused);
        assert!(pool.states().is_empty());
        Ok(())
    }
}
