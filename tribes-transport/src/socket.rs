use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use anyhow::anyhow;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::{debug, info};

use crate::config::{ReceiverConfig, SocketOptions};

const BACKLOG: i32 = 1024;

pub fn configure_tcp(socket: SockRef<'_>, options: &SocketOptions) -> io::Result<()> {
    socket.set_recv_buffer_size(options.rx_buf_size)?;
    socket.set_send_buffer_size(options.tx_buf_size)?;
    socket.set_nodelay(options.tcp_no_delay)?;
    socket.set_keepalive(options.so_keep_alive)?;
    socket.set_reuse_address(options.so_reuse_address)?;
    socket.set_linger(options.linger())?;
    socket.set_out_of_band_inline(options.oob_inline)?;
    set_traffic_class(&socket, options);
    Ok(())
}

pub fn configure_udp(socket: SockRef<'_>, options: &SocketOptions) -> io::Result<()> {
    socket.set_recv_buffer_size(options.udp_rx_buf_size)?;
    socket.set_send_buffer_size(options.udp_tx_buf_size)?;
    socket.set_reuse_address(options.so_reuse_address)?;
    set_traffic_class(&socket, options);
    Ok(())
}

fn set_traffic_class(socket: &SockRef<'_>, options: &SocketOptions) {
    // not supported on every address family
    if let Err(error) = socket.set_tos(options.so_traffic_class) {
        debug!("unable to set traffic class {}: {}", options.so_traffic_class, error);
    }
}

fn is_in_progress(error: &io::Error) -> bool {
    error.kind() == io::ErrorKind::WouldBlock || error.raw_os_error() == Some(libc::EINPROGRESS)
}

/// Issues a non-blocking connect. The flag is true when the connection completed immediately,
/// otherwise the caller waits for write readiness and calls [`finish_connect`].
pub fn connect_tcp(addr: SocketAddr, options: &SocketOptions) -> io::Result<(TcpStream, bool)> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    configure_tcp(SockRef::from(&socket), options)?;
    socket.set_nonblocking(true)?;
    let connected = match socket.connect(&addr.into()) {
        Ok(()) => true,
        Err(error) if is_in_progress(&error) => false,
        Err(error) => return Err(error),
    };
    let stream = TcpStream::from_std(std::net::TcpStream::from(socket))?;
    Ok((stream, connected))
}

/// Completes a pending connect once the socket reported write readiness.
pub fn finish_connect(stream: &TcpStream) -> io::Result<bool> {
    if let Some(error) = stream.take_error()? {
        return Err(error);
    }
    match stream.peer_addr() {
        Ok(_) => Ok(true),
        Err(error) if error.kind() == io::ErrorKind::NotConnected => Ok(false),
        Err(error) => Err(error),
    }
}

fn unspecified(addr: &SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    }
}

pub fn connect_udp(addr: SocketAddr, options: &SocketOptions) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    configure_udp(SockRef::from(&socket), options)?;
    socket.set_nonblocking(true)?;
    socket.bind(&unspecified(&addr).into())?;
    socket.connect(&addr.into())?;
    UdpSocket::from_std(std::net::UdpSocket::from(socket))
}

fn candidate_ports(port: u16, auto_bind: u16) -> Vec<u16> {
    if port == 0 {
        vec![0]
    } else {
        (0..auto_bind.max(1)).filter_map(|offset| port.checked_add(offset)).collect()
    }
}

fn bind_tcp(addr: SocketAddr, options: &SocketOptions) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(options.so_reuse_address)?;
    socket.set_recv_buffer_size(options.rx_buf_size)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;
    TcpListener::from_std(std::net::TcpListener::from(socket))
}

fn bind_udp(addr: SocketAddr, options: &SocketOptions) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    configure_udp(SockRef::from(&socket), options)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(std::net::UdpSocket::from(socket))
}

/// Binds the receiver listener, walking up to `auto_bind` ports from the configured one.
pub fn bind_listener(config: &ReceiverConfig, options: &SocketOptions) -> anyhow::Result<TcpListener> {
    let mut last_error = None;
    for port in candidate_ports(config.port, config.auto_bind) {
        let addr = SocketAddr::new(config.address, port);
        match bind_tcp(addr, options) {
            Ok(listener) => {
                info!("receiver bound to tcp {}", listener.local_addr()?);
                return Ok(listener);
            }
            Err(error) => {
                debug!("unable to bind tcp {}: {}", addr, error);
                last_error = Some(error);
            }
        }
    }
    Err(anyhow!(
        "unable to bind receiver on {} from port {} with auto bind {}: {:?}",
        config.address,
        config.port,
        config.auto_bind,
        last_error
    ))
}

pub fn bind_datagram(config: &ReceiverConfig, options: &SocketOptions) -> anyhow::Result<Option<UdpSocket>> {
    let port = match config.udp_port() {
        Some(port) => port,
        None => return Ok(None),
    };
    let mut last_error = None;
    for port in candidate_ports(port, config.auto_bind) {
        let addr = SocketAddr::new(config.address, port);
        match bind_udp(addr, options) {
            Ok(socket) => {
                info!("receiver bound to udp {}", socket.local_addr()?);
                return Ok(Some(socket));
            }
            Err(error) => {
                debug!("unable to bind udp {}: {}", addr, error);
                last_error = Some(error);
            }
        }
    }
    Err(anyhow!("unable to bind udp receiver on {} from port {}: {:?}", config.address, port, last_error))
}
