//! Client role drivers: RRQ (GET) and WRQ (PUT).
//!
//! Each transfer binds its own ephemeral TID, sends the request to the
//! server's well-known port, runs the RFC 2347 handshake, and then hands
//! control to the session engine's lockstep halves.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Result, TftpError};
use crate::packet::Packet;
use crate::session::{BlockSink, BlockSource, Role, Session};
use crate::transport::{Transport, UdpTransport};
use crate::{TftpOptions, TransferMode};

/// Download `filename` from `server` into `sink`. Returns the number of
/// payload bytes delivered.
pub async fn fetch<T, S>(
    transport: T,
    server: SocketAddr,
    filename: &str,
    mode: TransferMode,
    options: TftpOptions,
    sink: &mut S,
    cancel: CancellationToken,
) -> Result<u64>
where
    T: Transport,
    S: BlockSink,
{
    // RFC 2347: options ride on the request only when the caller asked to
    // negotiate; without wait_oack the request is a plain RFC 1350 RRQ.
    let negotiating = options.wait_oack && !options.request_pairs().is_empty();
    let request = Packet::ReadRequest {
        filename: filename.to_string(),
        mode: mode.as_str().to_string(),
        options: if negotiating {
            options.request_pairs()
        } else {
            Vec::new()
        },
    }
    .encode()?;

    let mut session = Session::new(transport, server, Role::ClientReader, options).with_cancel(cancel);
    session.send_to_peer(&request).await?;
    debug!(%server, filename, "read request sent");

    let mut attempts = 0u32;
    loop {
        let deadline = Instant::now() + session.options().timeout;
        match session.recv_from_peer(deadline).await? {
            Some(Packet::Oack { options: pairs }) => {
                if !negotiating {
                    return Err(TftpError::Protocol(
                        "unsolicited option acknowledgment".to_string(),
                    ));
                }
                session.options_mut().absorb_oack(&pairs)?;
                debug!(?pairs, "options negotiated");
                let ack0 = Packet::Ack { block: 0 }.encode()?;
                session.send_to_peer(&ack0).await?;
                return session.recv_blocks(sink, ack0, None).await;
            }
            Some(first @ Packet::Data { block: 1, .. }) => {
                if negotiating {
                    // The server refused negotiation by answering with data;
                    // the transfer continues with default options
                    debug!("negotiation refused, continuing with defaults");
                    let defaults = TftpOptions::default();
                    session.options_mut().block_size = defaults.block_size;
                    session.options_mut().transfer_size = defaults.transfer_size;
                }
                return session.recv_blocks(sink, request.clone(), Some(first)).await;
            }
            Some(Packet::Error { code, message }) => {
                return Err(TftpError::Peer { code, message });
            }
            Some(other) => {
                return Err(TftpError::Protocol(format!(
                    "unexpected {} in reply to read request",
                    other.kind()
                )));
            }
            None => {
                attempts += 1;
                if attempts > session.options().retries {
                    return Err(TftpError::Timeout(
                        "no reply to read request".to_string(),
                    ));
                }
                debug!(attempts, "retransmitting read request");
                session.send_to_peer(&request).await?;
            }
        }
    }
}

/// Upload `source` to `server` as `filename`. Returns the number of payload
/// bytes sent.
pub async fn store<T, S>(
    transport: T,
    server: SocketAddr,
    filename: &str,
    mode: TransferMode,
    options: TftpOptions,
    source: &mut S,
    cancel: CancellationToken,
) -> Result<u64>
where
    T: Transport,
    S: BlockSource,
{
    let negotiating = options.wait_oack && !options.request_pairs().is_empty();
    let request = Packet::WriteRequest {
        filename: filename.to_string(),
        mode: mode.as_str().to_string(),
        options: if negotiating {
            options.request_pairs()
        } else {
            Vec::new()
        },
    }
    .encode()?;

    let mut session = Session::new(transport, server, Role::ClientWriter, options).with_cancel(cancel);
    session.send_to_peer(&request).await?;
    debug!(%server, filename, "write request sent");

    let mut attempts = 0u32;
    loop {
        let deadline = Instant::now() + session.options().timeout;
        match session.recv_from_peer(deadline).await? {
            Some(Packet::Ack { block: 0 }) => {
                if negotiating {
                    debug!("negotiation refused, continuing with defaults");
                    let defaults = TftpOptions::default();
                    session.options_mut().block_size = defaults.block_size;
                    session.options_mut().transfer_size = defaults.transfer_size;
                }
                break;
            }
            Some(Packet::Oack { options: pairs }) => {
                if !negotiating {
                    return Err(TftpError::Protocol(
                        "unsolicited option acknowledgment".to_string(),
                    ));
                }
                session.options_mut().absorb_oack(&pairs)?;
                debug!(?pairs, "options negotiated");
                // Confirm the negotiated set before the first data block
                let ack0 = Packet::Ack { block: 0 }.encode()?;
                session.send_to_peer(&ack0).await?;
                break;
            }
            Some(Packet::Error { code, message }) => {
                return Err(TftpError::Peer { code, message });
            }
            Some(other) => {
                return Err(TftpError::Protocol(format!(
                    "unexpected {} in reply to write request",
                    other.kind()
                )));
            }
            None => {
                attempts += 1;
                if attempts > session.options().retries {
                    return Err(TftpError::Timeout(
                        "no reply to write request".to_string(),
                    ));
                }
                debug!(attempts, "retransmitting write request");
                session.send_to_peer(&request).await?;
            }
        }
    }

    session.send_blocks(source).await
}

/// Convenience client that binds a fresh UDP transfer identifier per call.
pub struct TftpClient {
    server: SocketAddr,
    options: TftpOptions,
    cancel: CancellationToken,
}

impl TftpClient {
    pub fn new(server: SocketAddr) -> Self {
        Self {
            server,
            options: TftpOptions::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_options(mut self, options: TftpOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Download a file from the server (RRQ).
    pub async fn get<S: BlockSink>(
        &self,
        filename: &str,
        mode: TransferMode,
        sink: &mut S,
    ) -> Result<u64> {
        let transport = bind_ephemeral(self.server)?;
        fetch(
            transport,
            self.server,
            filename,
            mode,
            self.options.clone(),
            sink,
            self.cancel.child_token(),
        )
        .await
    }

    /// Upload a file to the server (WRQ).
    pub async fn put<S: BlockSource>(
        &self,
        filename: &str,
        mode: TransferMode,
        source: &mut S,
    ) -> Result<u64> {
        let transport = bind_ephemeral(self.server)?;
        store(
            transport,
            self.server,
            filename,
            mode,
            self.options.clone(),
            source,
            self.cancel.child_token(),
        )
        .await
    }
}

fn bind_ephemeral(server: SocketAddr) -> std::io::Result<UdpTransport> {
    let local = if server.is_ipv4() {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
    } else {
        SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
    };
    UdpTransport::bind(local)
}
