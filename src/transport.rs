//! Transport adapter consumed by the session engine.
//!
//! The engine never touches a socket directly; it talks to a [`Transport`],
//! which carries datagrams between (ip, port) transfer identifiers. The
//! bundled [`UdpTransport`] is the production implementation; tests substitute
//! an in-memory one.

use std::io;
use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::debug;

// Generous socket buffers reduce drops under bursts; the kernel may clamp
// these, which is fine.
const RECV_BUFFER_BYTES: usize = 1024 * 1024;
const SEND_BUFFER_BYTES: usize = 256 * 1024;

/// A UDP-like datagram primitive.
///
/// Datagrams are atomic: the transport neither reorders nor fragments within
/// a single datagram. Loss and duplication are possible and are the session
/// engine's problem. Receive deadlines are imposed by the caller.
pub trait Transport: Sized {
    /// The local transfer identifier this endpoint is bound to.
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Send one datagram to `to`.
    fn send(
        &self,
        to: SocketAddr,
        payload: &[u8],
    ) -> impl Future<Output = io::Result<()>> + Send;

    /// Receive one datagram, returning its length and source address.
    fn recv(
        &self,
        buf: &mut [u8],
    ) -> impl Future<Output = io::Result<(usize, SocketAddr)>> + Send;

    /// Allocate a fresh ephemeral transfer identifier on the same interface.
    ///
    /// RFC 1350 §4: a server must move each transfer onto its own TID so the
    /// well-known port stays free for new requests. Port selection is the
    /// transport's concern, not the engine's.
    fn open_session(&self) -> impl Future<Output = io::Result<Self>> + Send;
}

/// Production transport over a tokio UDP socket.
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Bind to `addr`. Port 0 selects an ephemeral TID.
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        // Faster restarts on the well-known port; harmless for session TIDs
        socket.set_reuse_address(true)?;
        // Buffer sizing is an optimization, not a requirement
        let _ = socket.set_recv_buffer_size(RECV_BUFFER_BYTES);
        let _ = socket.set_send_buffer_size(SEND_BUFFER_BYTES);
        socket.bind(&addr.into())?;
        socket.set_nonblocking(true)?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket)?;
        debug!(local = %socket.local_addr()?, "bound udp transport");
        Ok(Self { socket })
    }
}

impl Transport for UdpTransport {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    async fn send(&self, to: SocketAddr, payload: &[u8]) -> io::Result<()> {
        self.socket.send_to(payload, to).await?;
        Ok(())
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }

    async fn open_session(&self) -> io::Result<Self> {
        let ip = self.socket.local_addr()?.ip();
        Self::bind(SocketAddr::new(ip, 0))
    }
}
