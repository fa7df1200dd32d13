use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Notify;
use tracing::{debug, error, trace, warn};

use tribes_core::channel_data::ChannelData;

use crate::codec::{ack_kind, FrameBuffer, ACK_COMMAND, FAIL_ACK_COMMAND};
use crate::receiver::MessageListener;

/// An accepted stream together with the bytes of its partially received frame.
#[derive(Debug)]
pub struct InboundConnection {
    pub id: u64,
    pub peer: SocketAddr,
    pub stream: TcpStream,
    pub buffer: FrameBuffer,
}

impl InboundConnection {
    pub fn new(id: u64, peer: SocketAddr, stream: TcpStream) -> Self {
        Self { id, peer, stream, buffer: FrameBuffer::default() }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum AckReply {
    None,
    Ack,
    FailAck,
}

impl AckReply {
    /// Ack sent as soon as the frame is read, ahead of the listener.
    fn before_dispatch(data: &ChannelData) -> AckReply {
        if data.options.send_ack_async() {
            AckReply::Ack
        } else {
            AckReply::None
        }
    }

    fn bytes(&self) -> Option<&'static [u8]> {
        match self {
            AckReply::None => None,
            AckReply::Ack => Some(&ACK_COMMAND as &[u8]),
            AckReply::FailAck => Some(&FAIL_ACK_COMMAND as &[u8]),
        }
    }
}

/// Reusable unit of receive work. The read buffer lives as long as the task.
pub struct ReplicationTask {
    read_buf: Vec<u8>,
    datagram: FrameBuffer,
    listener: Arc<dyn MessageListener>,
}

impl ReplicationTask {
    fn new(read_buffer_size: usize, listener: Arc<dyn MessageListener>) -> Self {
        Self {
            read_buf: vec![0; read_buffer_size],
            datagram: FrameBuffer::default(),
            listener,
        }
    }

    /// Drains whatever the connection has buffered and dispatches every complete frame.
    /// Returns false once the peer closed the stream.
    pub async fn service(&mut self, conn: &mut InboundConnection) -> io::Result<bool> {
        let mut open = true;
        loop {
            match conn.stream.try_read(&mut self.read_buf) {
                Ok(0) => {
                    open = false;
                    break;
                }
                Ok(n) => {
                    conn.buffer.append(&self.read_buf[..n]);
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
                Err(error) => return Err(error),
            }
        }
        loop {
            let frame = match conn.buffer.extract_package() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(error) => {
                    warn!("dropping malformed data from {}: {}", conn.peer, error);
                    break;
                }
            };
            let data = match self.decode(&frame, conn.peer) {
                Some(data) => data,
                None => continue,
            };
            if let Some(ack) = AckReply::before_dispatch(&data).bytes() {
                conn.stream.write_all(ack).await?;
            }
            if let Some(ack) = self.deliver(data, conn.peer).bytes() {
                conn.stream.write_all(ack).await?;
            }
        }
        if !open {
            debug!("connection from {} closed", conn.peer);
        }
        Ok(open)
    }

    /// Reads every pending datagram, each one carries exactly one frame.
    pub async fn service_datagrams(&mut self, socket: &UdpSocket) -> io::Result<()> {
        loop {
            let (n, source) = match socket.try_recv_from(&mut self.read_buf) {
                Ok(received) => received,
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(error) => return Err(error),
            };
            self.datagram.clear();
            self.datagram.append(&self.read_buf[..n]);
            match self.datagram.extract_package() {
                Ok(Some(frame)) => {
                    let data = match self.decode(&frame, source) {
                        Some(data) => data,
                        None => continue,
                    };
                    if let Some(ack) = AckReply::before_dispatch(&data).bytes() {
                        socket.send_to(ack, source).await?;
                    }
                    if let Some(ack) = self.deliver(data, source).bytes() {
                        socket.send_to(ack, source).await?;
                    }
                }
                Ok(None) => warn!("discarding incomplete datagram of {} bytes from {}", n, source),
                Err(error) => warn!("discarding malformed datagram from {}: {}", source, error),
            }
        }
    }

    fn decode(&self, frame: &[u8], peer: SocketAddr) -> Option<ChannelData> {
        if ack_kind(frame).is_some() {
            trace!("ignoring stray ack from {}", peer);
            return None;
        }
        match ChannelData::from_bytes(frame) {
            Ok(data) => Some(data),
            Err(error) => {
                error!("unable to decode message from {}: {:?}", peer, error);
                None
            }
        }
    }

    /// Hands the message to the listener and returns the ack owed after dispatch.
    fn deliver(&self, data: ChannelData, peer: SocketAddr) -> AckReply {
        let options = data.options;
        let unique_id = data.unique_id;
        let result = self.listener.message_received(data);
        if let Err(error) = &result {
            error!("processing of message {} from {} failed: {:?}", unique_id, peer, error);
        }
        match (options.send_ack_sync(), result.is_ok()) {
            (true, true) => AckReply::Ack,
            (true, false) => AckReply::FailAck,
            (false, _) => AckReply::None,
        }
    }
}

/// Bounded set of reusable [`ReplicationTask`]s, acquiring never blocks.
pub struct WorkerPool {
    idle: Mutex<Vec<ReplicationTask>>,
    created: AtomicUsize,
    max: usize,
    read_buffer_size: usize,
    listener: Arc<dyn MessageListener>,
    notify: Notify,
}

impl WorkerPool {
    pub fn new(min: usize, max: usize, read_buffer_size: usize, listener: Arc<dyn MessageListener>) -> Self {
        let max = max.max(1);
        let idle = (0..min.min(max))
            .map(|_| ReplicationTask::new(read_buffer_size, listener.clone()))
            .collect::<Vec<_>>();
        Self {
            created: AtomicUsize::new(idle.len()),
            idle: Mutex::new(idle),
            max,
            read_buffer_size,
            listener,
            notify: Notify::new(),
        }
    }

    pub fn try_acquire(&self) -> Option<ReplicationTask> {
        if let Some(task) = self.idle.lock().pop() {
            return Some(task);
        }
        let created = self
            .created
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |created| {
                if created < self.max {
                    Some(created + 1)
                } else {
                    None
                }
            });
        match created {
            Ok(_) => Some(ReplicationTask::new(self.read_buffer_size, self.listener.clone())),
            Err(_) => None,
        }
    }

    pub fn release(&self, task: ReplicationTask) {
        self.idle.lock().push(task);
        self.notify.notify_one();
    }

    /// Resolves after some task was released.
    pub async fn available(&self) {
        self.notify.notified().await
    }

    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::Acquire)
    }
}
