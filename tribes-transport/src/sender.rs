use std::fmt::{Debug, Formatter};
use std::future::poll_fn;
use std::io;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::net::{TcpStream, UdpSocket};
use tracing::{trace, warn};

use tribes_core::error::SendError;
use tribes_core::member::Member;

use crate::codec::{ack_kind, Ack, FrameBuffer};
use crate::config::{SenderConfig, SocketOptions};
use crate::socket;

pub const MAX_UDP_SIZE: usize = 65507;
const READ_BUFFER_SIZE: usize = 4096;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionState {
    NotConnected,
    Connecting,
    Connected,
    Writing,
    WaitingForAck,
    Complete,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Interest {
    Connect,
    Write,
    Read,
}

/// One readiness event reported by the transport for a registered interest.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct Ready {
    pub connectable: bool,
    pub writable: bool,
    pub readable: bool,
}

impl Ready {
    pub const CONNECT: Ready = Ready { connectable: true, writable: false, readable: false };
    pub const WRITE: Ready = Ready { connectable: false, writable: true, readable: false };
    pub const READ: Ready = Ready { connectable: false, writable: false, readable: true };
}

/// Non-blocking byte channel driven by [`NioSender`].
pub trait Channel: Send + Sized + 'static {
    /// Starts connecting, the flag is true when the channel is usable right away.
    fn open(destination: &Member, udp: bool, options: &SocketOptions) -> io::Result<(Self, bool)>;

    fn poll_ready(&self, interest: Interest, cx: &mut Context<'_>) -> Poll<io::Result<Ready>>;

    fn finish_connect(&mut self) -> io::Result<bool>;

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize>;

    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn is_datagram(&self) -> bool;
}

#[derive(Debug)]
pub enum SocketChannel {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

impl Channel for SocketChannel {
    fn open(destination: &Member, udp: bool, options: &SocketOptions) -> io::Result<(Self, bool)> {
        if udp {
            let addr = destination.udp_addr().ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    format!("member {} has no udp port", destination.name()),
                )
            })?;
            let socket = socket::connect_udp(addr, options)?;
            Ok((SocketChannel::Udp(socket), true))
        } else {
            let (stream, connected) = socket::connect_tcp(destination.addr, options)?;
            Ok((SocketChannel::Tcp(stream), connected))
        }
    }

    fn poll_ready(&self, interest: Interest, cx: &mut Context<'_>) -> Poll<io::Result<Ready>> {
        let (poll, ready) = match (self, interest) {
            (SocketChannel::Tcp(stream), Interest::Connect) => (stream.poll_write_ready(cx), Ready::CONNECT),
            (SocketChannel::Tcp(stream), Interest::Write) => (stream.poll_write_ready(cx), Ready::WRITE),
            (SocketChannel::Tcp(stream), Interest::Read) => (stream.poll_read_ready(cx), Ready::READ),
            (SocketChannel::Udp(_), Interest::Connect) => return Poll::Ready(Ok(Ready::CONNECT)),
            (SocketChannel::Udp(socket), Interest::Write) => (socket.poll_send_ready(cx), Ready::WRITE),
            (SocketChannel::Udp(socket), Interest::Read) => (socket.poll_recv_ready(cx), Ready::READ),
        };
        poll.map_ok(|_| ready)
    }

    fn finish_connect(&mut self) -> io::Result<bool> {
        match self {
            SocketChannel::Tcp(stream) => socket::finish_connect(stream),
            SocketChannel::Udp(_) => Ok(true),
        }
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            SocketChannel::Tcp(stream) => stream.try_write(buf),
            SocketChannel::Udp(socket) => socket.try_send(buf),
        }
    }

    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            SocketChannel::Tcp(stream) => stream.try_read(buf),
            SocketChannel::Udp(socket) => socket.try_recv(buf),
        }
    }

    fn is_datagram(&self) -> bool {
        matches!(self, SocketChannel::Udp(_))
    }
}

/// Connection to one destination, re-armed for every message.
///
/// `NotConnected -> Connecting -> Connected -> Writing -> (WaitingForAck) -> Complete`, any I/O
/// failure tears the channel down and returns to `NotConnected`.
pub struct NioSender<C: Channel = SocketChannel> {
    destination: Member,
    options: SocketOptions,
    config: SenderConfig,
    udp: bool,
    state: ConnectionState,
    channel: Option<C>,
    current: Option<Bytes>,
    position: usize,
    ack_buf: FrameBuffer,
    read_buf: Vec<u8>,
    attempt: u32,
    request_count: u64,
    connect_time: Option<Instant>,
}

impl<C: Channel> Debug for NioSender<C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NioSender")
            .field("destination", &self.destination.name())
            .field("udp", &self.udp)
            .field("state", &self.state)
            .field("position", &self.position)
            .field("attempt", &self.attempt)
            .field("request_count", &self.request_count)
            .finish_non_exhaustive()
    }
}

impl<C: Channel> NioSender<C> {
    pub fn new(destination: Member, udp: bool, options: SocketOptions, config: SenderConfig) -> Self {
        Self {
            destination,
            options,
            config,
            udp,
            state: ConnectionState::NotConnected,
            channel: None,
            current: None,
            position: 0,
            ack_buf: FrameBuffer::default(),
            read_buf: vec![0; READ_BUFFER_SIZE],
            attempt: 0,
            request_count: 0,
            connect_time: None,
        }
    }

    pub fn destination(&self) -> &Member {
        &self.destination
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_udp(&self) -> bool {
        self.udp
    }

    /// Switching transports drops the current channel.
    pub fn set_udp(&mut self, udp: bool) {
        if self.udp != udp {
            self.disconnect();
            self.udp = udp;
        }
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_some() && self.state != ConnectionState::Connecting
    }

    pub fn is_complete(&self) -> bool {
        self.state == ConnectionState::Complete
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn set_attempt(&mut self, attempt: u32) {
        self.attempt = attempt;
    }

    pub fn request_count(&self) -> u64 {
        self.request_count
    }

    pub fn message(&self) -> Option<&Bytes> {
        self.current.as_ref()
    }

    pub fn channel(&self) -> Option<&C> {
        self.channel.as_ref()
    }

    /// Opens the channel unless it is already connecting or connected.
    pub fn connect(&mut self) -> Result<(), SendError> {
        if self.channel.is_some() {
            return Ok(());
        }
        let (channel, connected) = C::open(&self.destination, self.udp, &self.options)?;
        self.attach(channel, connected);
        Ok(())
    }

    pub fn attach(&mut self, channel: C, connected: bool) {
        self.channel = Some(channel);
        self.ack_buf.clear();
        if connected {
            self.on_connected();
        } else {
            self.state = ConnectionState::Connecting;
        }
    }

    fn on_connected(&mut self) {
        self.connect_time = Some(Instant::now());
        self.request_count = 0;
        self.state = if self.current.is_some() {
            ConnectionState::Writing
        } else {
            ConnectionState::Connected
        };
    }

    pub fn disconnect(&mut self) {
        if self.channel.take().is_some() {
            trace!("disconnected from {}", self.destination.name());
        }
        self.state = ConnectionState::NotConnected;
        self.connect_time = None;
        self.position = 0;
        self.ack_buf.clear();
    }

    /// Clears the message state so the connection can carry a new message. The channel is kept
    /// unless a previous message was abandoned mid-flight, its bytes or ack may still be on the wire.
    pub fn reset(&mut self) {
        if matches!(self.state, ConnectionState::Writing | ConnectionState::WaitingForAck) {
            trace!("dropping connection to {} with an abandoned message in flight", self.destination.name());
            self.disconnect();
        }
        self.current = None;
        self.position = 0;
        self.ack_buf.clear();
        self.attempt = 0;
        self.state = match (&self.channel, self.state) {
            (None, _) => ConnectionState::NotConnected,
            (Some(_), ConnectionState::Connecting) => ConnectionState::Connecting,
            (Some(_), _) => ConnectionState::Connected,
        };
    }

    pub fn connect_timeout(&self) -> Duration {
        self.options.timeout()
    }

    /// Queues a complete frame, only legal when no other message is in flight.
    pub fn set_message(&mut self, data: Bytes) -> Result<(), SendError> {
        if matches!(self.state, ConnectionState::Writing | ConnectionState::WaitingForAck) {
            return Err(SendError::Protocol(format!(
                "a message is already in flight to {}",
                self.destination.name()
            )));
        }
        if self.udp && data.len() > MAX_UDP_SIZE {
            return Err(SendError::Protocol(format!(
                "message of {} bytes exceeds the maximum datagram size {}",
                data.len(),
                MAX_UDP_SIZE
            )));
        }
        self.current = Some(data);
        self.position = 0;
        self.ack_buf.clear();
        if matches!(self.state, ConnectionState::Connected | ConnectionState::Complete) {
            self.state = ConnectionState::Writing;
        }
        Ok(())
    }

    pub fn interest(&self) -> Option<Interest> {
        match self.state {
            ConnectionState::Connecting => Some(Interest::Connect),
            ConnectionState::Writing => Some(Interest::Write),
            ConnectionState::WaitingForAck => Some(Interest::Read),
            ConnectionState::NotConnected | ConnectionState::Connected | ConnectionState::Complete => None,
        }
    }

    /// Waits until the channel is ready for the current interest.
    pub async fn ready(&self) -> io::Result<Ready> {
        let interest = self.interest().ok_or_else(|| {
            io::Error::new(io::ErrorKind::Other, format!("no interest registered in state {:?}", self.state))
        })?;
        let channel = self
            .channel
            .as_ref()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        poll_fn(|cx| channel.poll_ready(interest, cx)).await
    }

    /// Advances the state machine for one readiness event. Returns true once the message and,
    /// when required, its acknowledgement are complete. Any error disconnects the channel.
    pub fn process(&mut self, ready: Ready, wait_for_ack: bool) -> Result<bool, SendError> {
        let result = self.advance(ready, wait_for_ack);
        if result.is_err() {
            self.disconnect();
        }
        result
    }

    fn advance(&mut self, ready: Ready, wait_for_ack: bool) -> Result<bool, SendError> {
        if self.channel.is_none() {
            return Err(SendError::SenderDisconnected);
        }
        if ready.connectable && self.state == ConnectionState::Connecting {
            if self.finish_connect()? {
                self.on_connected();
            }
            Ok(false)
        } else if ready.writable && self.state == ConnectionState::Writing {
            if !self.write()? {
                return Ok(false);
            }
            if wait_for_ack {
                self.state = ConnectionState::WaitingForAck;
                Ok(false)
            } else {
                // no ack to read, this is the only chance to notice a closed peer
                self.probe()?;
                self.complete();
                Ok(true)
            }
        } else if ready.readable && self.state == ConnectionState::WaitingForAck {
            if self.read()? {
                self.complete();
                Ok(true)
            } else {
                Ok(false)
            }
        } else {
            Err(SendError::Protocol(format!(
                "data is in unknown state, {:?} with {:?}",
                self.state, ready
            )))
        }
    }

    fn complete(&mut self) {
        self.request_count += 1;
        self.state = ConnectionState::Complete;
    }

    fn finish_connect(&mut self) -> Result<bool, SendError> {
        match self.channel.as_mut() {
            Some(channel) => Ok(channel.finish_connect()?),
            None => Err(SendError::SenderDisconnected),
        }
    }

    fn write(&mut self) -> Result<bool, SendError> {
        let (channel, current) = match (self.channel.as_mut(), self.current.as_ref()) {
            (Some(channel), Some(current)) => (channel, current),
            (None, _) => return Err(SendError::SenderDisconnected),
            (_, None) => return Err(SendError::Protocol("no message to write".to_string())),
        };
        while self.position < current.len() {
            match channel.try_write(&current[self.position..]) {
                Ok(0) => return Err(SendError::ChannelClosed),
                Ok(n) if channel.is_datagram() && n < current.len() => {
                    return Err(SendError::Protocol(format!(
                        "datagram truncated, {} of {} bytes sent",
                        n,
                        current.len()
                    )));
                }
                Ok(n) => self.position += n,
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(error) => return Err(error.into()),
            }
        }
        Ok(true)
    }

    /// Reads acknowledgement bytes, true once an ack frame arrived.
    fn read(&mut self) -> Result<bool, SendError> {
        let channel = self.channel.as_mut().ok_or(SendError::SenderDisconnected)?;
        loop {
            match channel.try_read(&mut self.read_buf) {
                Ok(0) if !channel.is_datagram() => return Err(SendError::ChannelClosed),
                Ok(n) => {
                    self.ack_buf.append(&self.read_buf[..n]);
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
                Err(error) => return Err(error.into()),
            }
        }
        while let Some(payload) = self
            .ack_buf
            .extract_package()
            .map_err(|error| SendError::Protocol(error.to_string()))?
        {
            match ack_kind(&payload) {
                Some(Ack::Ack) => return Ok(true),
                Some(Ack::FailAck) => {
                    warn!("received a failed ack from {}", self.destination.name());
                    return Err(SendError::RemoteProcess);
                }
                None => {
                    warn!("ignoring {} byte frame from {} while waiting for ack", payload.len(), self.destination.name());
                }
            }
        }
        Ok(false)
    }

    /// Non-blocking health check of an idle stream connection.
    pub fn probe(&mut self) -> Result<(), SendError> {
        let channel = match self.channel.as_mut() {
            Some(channel) if !channel.is_datagram() => channel,
            _ => return Ok(()),
        };
        loop {
            match channel.try_read(&mut self.read_buf) {
                Ok(0) => return Err(SendError::ChannelClosed),
                Ok(n) => trace!("discarding {} unsolicited bytes from {}", n, self.destination.name()),
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(error) => return Err(error.into()),
            }
        }
    }

    /// Disconnects and returns true when the connection has served its keep-alive budget.
    pub fn keepalive(&mut self) -> bool {
        if self.channel.is_none() {
            return false;
        }
        let expired_count = self
            .config
            .keep_alive_count()
            .map_or(false, |count| self.request_count >= count);
        let expired_time = match (self.config.keep_alive_time(), self.connect_time) {
            (Some(time), Some(connected)) => connected.elapsed() >= time,
            _ => false,
        };
        if self.udp || expired_count || expired_time {
            trace!(
                "recycling connection to {} after {} requests",
                self.destination.name(),
                self.request_count
            );
            self.disconnect();
            true
        } else {
            false
        }
    }
}
