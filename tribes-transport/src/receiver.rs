use std::collections::{HashMap, VecDeque};
use std::future::pending;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use socket2::SockRef;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use tribes_core::channel_data::ChannelData;

use crate::config::{ReceiverConfig, SocketOptions, TransportConfig};
use crate::socket::{bind_datagram, bind_listener, configure_tcp};
use crate::worker::{InboundConnection, WorkerPool};

const DATAGRAM_KEY: u64 = 0;

type Watch = BoxFuture<'static, (InboundConnection, io::Result<()>)>;

/// Callback for every message assembled by the receiver. An error turns a synchronous ack into
/// a failed ack.
pub trait MessageListener: Send + Sync + 'static {
    fn message_received(&self, data: ChannelData) -> anyhow::Result<()>;
}

#[derive(Debug)]
enum ReceiverEvent {
    Register(InboundConnection),
    Closed(u64),
    DatagramsDone,
}

/// Owns the listening sockets and multiplexes every inbound connection on one task.
pub struct NioReceiver {
    config: ReceiverConfig,
    options: SocketOptions,
    listener: TcpListener,
    datagram: Option<Arc<UdpSocket>>,
    datagram_busy: bool,
    workers: Arc<WorkerPool>,
    events_tx: mpsc::UnboundedSender<ReceiverEvent>,
    events_rx: mpsc::UnboundedReceiver<ReceiverEvent>,
    in_flight: HashMap<u64, Instant>,
    deferred: VecDeque<Deferred>,
    next_id: u64,
    last_sweep: Instant,
}

#[derive(Debug)]
enum Deferred {
    Stream(InboundConnection),
    Datagrams,
}

pub struct ReceiverHandle {
    local_addr: SocketAddr,
    udp_addr: Option<SocketAddr>,
    token: CancellationToken,
    task: JoinHandle<()>,
    shutdown_wait: Duration,
}

impl ReceiverHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.udp_addr
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Signals the loop to stop and waits a bounded time for it to exit.
    pub async fn stop(self) {
        self.token.cancel();
        let deadline = Instant::now() + self.shutdown_wait;
        while !self.task.is_finished() && Instant::now() < deadline {
            sleep(Duration::from_millis(20)).await;
        }
        if !self.task.is_finished() {
            warn!("receiver {} did not stop within {:?}, aborting", self.local_addr, self.shutdown_wait);
            self.task.abort();
        }
        info!("receiver {} stopped", self.local_addr);
    }
}

impl NioReceiver {
    /// Binds the listening sockets. Failure here is fatal for the node.
    pub fn bind(config: &TransportConfig, listener: Arc<dyn MessageListener>) -> anyhow::Result<Self> {
        let receiver = &config.receiver;
        let tcp = bind_listener(receiver, &config.socket)?;
        let datagram = bind_datagram(receiver, &config.socket)?.map(Arc::new);
        let read_buffer_size = config.socket.rx_buf_size.max(receiver.max_datagram_size);
        let workers = WorkerPool::new(receiver.min_threads, receiver.max_threads, read_buffer_size, listener);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(Self {
            config: receiver.clone(),
            options: config.socket.clone(),
            listener: tcp,
            datagram,
            datagram_busy: false,
            workers: Arc::new(workers),
            events_tx,
            events_rx,
            in_flight: HashMap::new(),
            deferred: VecDeque::new(),
            next_id: DATAGRAM_KEY + 1,
            last_sweep: Instant::now(),
        })
    }

    pub async fn start(config: &TransportConfig, listener: Arc<dyn MessageListener>) -> anyhow::Result<ReceiverHandle> {
        let receiver = Self::bind(config, listener)?;
        let local_addr = receiver.listener.local_addr()?;
        let udp_addr = match &receiver.datagram {
            Some(socket) => Some(socket.local_addr()?),
            None => None,
        };
        let token = CancellationToken::new();
        let shutdown_wait = receiver.config.shutdown_wait();
        let task = tokio::spawn(receiver.run(token.clone()));
        Ok(ReceiverHandle { local_addr, udp_addr, token, task, shutdown_wait })
    }

    async fn run(mut self, token: CancellationToken) {
        let mut watches: FuturesUnordered<Watch> = FuturesUnordered::new();
        let datagram = self.datagram.clone();
        loop {
            while let Ok(event) = self.events_rx.try_recv() {
                self.handle_event(event, &mut watches);
            }
            self.sweep();
            self.dispatch_deferred();
            let workers = self.workers.clone();
            tokio::select! {
                _ = token.cancelled() => break,
                Some(event) = self.events_rx.recv() => self.handle_event(event, &mut watches),
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(error) = configure_tcp(SockRef::from(&stream), &self.options) {
                            warn!("unable to configure connection from {}: {}", peer, error);
                        }
                        let id = self.next_id;
                        self.next_id += 1;
                        debug!("accepted replication connection {} from {}", id, peer);
                        watches.push(watch(InboundConnection::new(id, peer, stream)));
                    }
                    Err(error) => {
                        warn!("{} accept connection error {:?}", self.config.address, error);
                    }
                },
                Some((conn, readable)) = watches.next(), if !watches.is_empty() => match readable {
                    Ok(()) => self.dispatch(Deferred::Stream(conn)),
                    Err(error) => warn!("connection from {} failed: {}", conn.peer, error),
                },
                readable = datagram_readable(&datagram), if !self.datagram_busy => match readable {
                    Ok(()) => {
                        self.datagram_busy = true;
                        self.dispatch(Deferred::Datagrams);
                    }
                    Err(error) => warn!("udp receive error {:?}", error),
                },
                _ = workers.available(), if !self.deferred.is_empty() => {}
                _ = sleep(self.config.selector_timeout()) => {
                    trace!("receiver select timed out");
                }
            }
        }
        debug!(
            "receiver loop exiting, closing {} watched and {} deferred connections",
            watches.len(),
            self.deferred.len()
        );
    }

    fn handle_event(&mut self, event: ReceiverEvent, watches: &mut FuturesUnordered<Watch>) {
        match event {
            ReceiverEvent::Register(conn) => {
                self.in_flight.remove(&conn.id);
                watches.push(watch(conn));
            }
            ReceiverEvent::Closed(id) => {
                self.in_flight.remove(&id);
            }
            ReceiverEvent::DatagramsDone => {
                self.in_flight.remove(&DATAGRAM_KEY);
                self.datagram_busy = false;
            }
        }
    }

    /// Flags work that has been out with a worker longer than the timeout, nothing is cancelled.
    fn sweep(&mut self) {
        let now = Instant::now();
        if now.duration_since(self.last_sweep) < self.config.selector_timeout().min(self.config.timeout()) {
            return;
        }
        self.last_sweep = now;
        let timeout = self.config.timeout();
        for (id, since) in self.in_flight.iter_mut() {
            let busy = now.duration_since(*since);
            if busy > timeout {
                warn!("connection {} has been processing for {:?}, exceeding {:?}", id, busy, timeout);
                *since = now;
            }
        }
    }

    fn dispatch_deferred(&mut self) {
        while let Some(work) = self.deferred.pop_front() {
            if let Err(work) = self.try_dispatch(work) {
                self.deferred.push_front(work);
                break;
            }
        }
    }

    fn dispatch(&mut self, work: Deferred) {
        if let Err(work) = self.try_dispatch(work) {
            debug!("no replication worker available, deferring");
            self.deferred.push_back(work);
        }
    }

    fn try_dispatch(&mut self, work: Deferred) -> Result<(), Deferred> {
        let mut task = match self.workers.try_acquire() {
            Some(task) => task,
            None => return Err(work),
        };
        let workers = self.workers.clone();
        let events = self.events_tx.clone();
        match work {
            Deferred::Stream(mut conn) => {
                self.in_flight.insert(conn.id, Instant::now());
                tokio::spawn(async move {
                    let outcome = task.service(&mut conn).await;
                    workers.release(task);
                    let event = match outcome {
                        Ok(true) => ReceiverEvent::Register(conn),
                        Ok(false) => ReceiverEvent::Closed(conn.id),
                        Err(error) => {
                            debug!("closing connection from {}: {}", conn.peer, error);
                            ReceiverEvent::Closed(conn.id)
                        }
                    };
                    let _ = events.send(event);
                });
            }
            Deferred::Datagrams => {
                let socket = match self.datagram.clone() {
                    Some(socket) => socket,
                    None => {
                        workers.release(task);
                        return Ok(());
                    }
                };
                self.in_flight.insert(DATAGRAM_KEY, Instant::now());
                tokio::spawn(async move {
                    if let Err(error) = task.service_datagrams(&socket).await {
                        warn!("udp receive error {:?}", error);
                    }
                    workers.release(task);
                    let _ = events.send(ReceiverEvent::DatagramsDone);
                });
            }
        }
        Ok(())
    }
}

fn watch(conn: InboundConnection) -> Watch {
    async move {
        let readable = conn.stream.readable().await;
        (conn, readable)
    }
    .boxed()
}

async fn datagram_readable(socket: &Option<Arc<UdpSocket>>) -> io::Result<()> {
    match socket {
        Some(socket) => socket.readable().await,
        None => pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::time::Duration;

    use anyhow::anyhow;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use tribes_core::channel_data::ChannelData;
    use tribes_core::config::ConfigBuilder;
    use tribes_core::error::SendError;
    use tribes_core::member::Member;
    use tribes_core::options::SendOptions;

    use crate::config::TransportConfig;
    use crate::parallel::ParallelNioSender;
    use crate::receiver::{MessageListener, NioReceiver};
    use crate::state::SenderStateRegistry;

    struct Collector {
        tx: mpsc::UnboundedSender<ChannelData>,
        fail: bool,
    }

    impl MessageListener for Collector {
        fn message_received(&self, data: ChannelData) -> anyhow::Result<()> {
            let _ = self.tx.send(data);
            if self.fail {
                Err(anyhow!("rejected"))
            } else {
                Ok(())
            }
        }
    }

    fn config() -> anyhow::Result<TransportConfig> {
        let mut config = TransportConfig::builder().build()?;
        config.receiver.port = 0;
        config.receiver.shutdown_wait_ms = 1000;
        config.sender.timeout_ms = 2000;
        config.sender.max_retry_attempts = 0;
        Ok(config)
    }

    fn sender(config: &TransportConfig) -> ParallelNioSender {
        let mut sender = ParallelNioSender::new(
            config.socket.clone(),
            config.sender.clone(),
            Arc::new(SenderStateRegistry::new()),
            Arc::new(AtomicBool::new(false)),
        );
        sender.connect();
        sender
    }

    fn data(options: SendOptions, body: &[u8]) -> anyhow::Result<ChannelData> {
        Ok(ChannelData::new(Member::new("127.0.0.1:1".parse()?), options, body.to_vec()))
    }

    #[tokio::test]
    async fn test_receive_with_ack() -> anyhow::Result<()> {
        let config = config()?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = NioReceiver::start(&config, Arc::new(Collector { tx, fail: false })).await?;
        let member = Member::new(handle.local_addr());
        let mut sender = sender(&config);
        for i in 0..5u8 {
            sender.send_message(&[member.clone()], &data(SendOptions::USE_ACK, &[i; 64])?).await?;
        }
        sender
            .send_message(&[member.clone()], &data(SendOptions::USE_ACK | SendOptions::SYNCHRONIZED_ACK, b"sync")?)
            .await?;
        for i in 0..5u8 {
            let received = rx.recv().await.ok_or(anyhow!("receiver closed"))?;
            assert_eq!(received.message, vec![i; 64]);
        }
        assert_eq!(rx.recv().await.map(|d| d.message), Some(b"sync".to_vec()));
        handle.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_sync_ack_failure() -> anyhow::Result<()> {
        let config = config()?;
        let (tx, _rx) = mpsc::unbounded_channel();
        let handle = NioReceiver::start(&config, Arc::new(Collector { tx, fail: true })).await?;
        let member = Member::new(handle.local_addr());
        let mut sender = sender(&config);
        let options = SendOptions::USE_ACK | SendOptions::SYNCHRONIZED_ACK;
        let error = match sender.send_message(&[member.clone()], &data(options, b"x")?).await {
            Ok(()) => anyhow::bail!("failed ack was not reported"),
            Err(error) => error,
        };
        assert!(matches!(error.faulty_members()[0].cause, SendError::RemoteProcess));
        sender.connect();
        sender.send_message(&[member], &data(SendOptions::USE_ACK, b"async ack")?).await?;
        handle.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_udp_receive() -> anyhow::Result<()> {
        let mut config = config()?;
        config.receiver.udp_port = 0;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = NioReceiver::start(&config, Arc::new(Collector { tx, fail: false })).await?;
        let udp_port = handle.udp_addr().ok_or(anyhow!("no udp socket"))?.port();
        let member = Member::new(handle.local_addr()).with_udp_port(udp_port);
        let mut sender = sender(&config);
        sender
            .send_message(&[member.clone()], &data(SendOptions::USE_ACK | SendOptions::UDP, b"datagram")?)
            .await?;
        assert_eq!(rx.recv().await.map(|d| d.message), Some(b"datagram".to_vec()));
        handle.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_deferred_when_workers_busy() -> anyhow::Result<()> {
        let mut config = config()?;
        config.receiver.min_threads = 0;
        config.receiver.max_threads = 1;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = NioReceiver::start(&config, Arc::new(Collector { tx, fail: false })).await?;
        let member = Member::new(handle.local_addr());
        let mut senders: Vec<_> = (0..4).map(|_| sender(&config)).collect();
        let sends = senders.iter_mut().enumerate().map(|(i, sender)| {
            let member = member.clone();
            async move {
                let data = data(SendOptions::USE_ACK, &[i as u8; 32])?;
                sender.send_message(&[member], &data).await?;
                anyhow::Ok(())
            }
        });
        for result in futures::future::join_all(sends).await {
            result?;
        }
        let mut received = 0;
        while received < 4 {
            timeout(Duration::from_secs(2), rx.recv()).await?.ok_or(anyhow!("receiver closed"))?;
            received += 1;
        }
        handle.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_stop_closes_listener() -> anyhow::Result<()> {
        let config = config()?;
        let (tx, _rx) = mpsc::unbounded_channel();
        let handle = NioReceiver::start(&config, Arc::new(Collector { tx, fail: false })).await?;
        let addr = handle.local_addr();
        assert!(handle.is_running());
        handle.stop().await;
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
        Ok(())
    }
}
