pub mod udp_client;
pub mod udp_server;


use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use crate::error::Result;
use crate::rtp::RtpPack;

/// Receive buffer for UDP ingest loops.
pub const UDP_BUF_SIZE: usize = 1_048_576;

/// How a peer carries RTP: interleaved on the RTSP TCP connection, over
/// dedicated UDP sockets, or inside the process (recorder, VOD).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransType {
    Tcp,
    Udp,
    Internal,
}

impl fmt::Display for TransType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransType::Tcp => "TCP",
            TransType::Udp => "UDP",
            TransType::Internal => "Internal",
        };
        write!(f, "{s}")
    }
}

/// Callback invoked for every RTP packet a transport leg receives.
pub type RtpSink = Arc<dyn Fn(Arc<RtpPack>) + Send + Sync>;

/// Bind a UDP socket with the configured kernel buffer sizes.
///
/// Buffer sizing failures are logged and tolerated; the socket still works
/// with OS defaults.
pub(crate) fn bind_udp(addr: SocketAddr, network_buffer: usize) -> Result<UdpSocket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    if let Err(err) = socket.set_recv_buffer_size(network_buffer) {
        log::warn!("udp socket set read buffer error, {err}");
    }
    if let Err(err) = socket.set_send_buffer_size(network_buffer) {
        log::warn!("udp socket set write buffer error, {err}");
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(UdpSocket::from_std(socket.into())?)
}
