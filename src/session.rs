//! Per-transfer session engine.
//!
//! One [`Session`] drives exactly one transfer through the RFC 1350 lockstep
//! protocol: at most one unacknowledged DATA or control packet is ever in
//! flight. The engine owns its transport (and with it the local transfer
//! identifier) for the lifetime of the driver call and releases it on every
//! exit path.
//!
//! The engine never touches a filesystem. Payload bytes flow through the
//! caller-supplied [`BlockSource`] and [`BlockSink`] implementations.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{Instant, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Result, TftpError};
use crate::packet::Packet;
use crate::transport::Transport;
use crate::{ErrorCode, MAX_PACKET_SIZE, TftpOptions};

/// Which side of which transfer a session is driving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Client side of an RRQ (receives data)
    ClientReader,
    /// Client side of a WRQ (sends data)
    ClientWriter,
    /// Server side of an RRQ (sends data)
    ServerReader,
    /// Server side of a WRQ (receives data)
    ServerWriter,
}

/// Producer of payload blocks for the sending half.
///
/// `fill` is called at most once per block and never retried; a short (or
/// zero) count marks the end of the stream.
pub trait BlockSource: Send {
    fn fill(&mut self, buf: &mut [u8]) -> impl Future<Output = Result<usize>> + Send;

    /// Total stream length when known, for tsize negotiation.
    fn size_hint(&self) -> Option<u64> {
        None
    }
}

/// Consumer of payload blocks for the receiving half.
///
/// `accept` is called exactly once per accepted block, in block-number
/// order. An error makes the engine notify the peer and abort the transfer.
/// `finish` runs once after the terminal block has been acknowledged.
pub trait BlockSink: Send {
    fn accept(&mut self, block: &[u8]) -> impl Future<Output = Result<()>> + Send;

    fn finish(&mut self) -> impl Future<Output = Result<()>> + Send {
        async { Ok(()) }
    }
}

impl BlockSource for &[u8] {
    async fn fill(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = buf.len().min(self.len());
        buf[..n].copy_from_slice(&self[..n]);
        *self = &self[n..];
        Ok(n)
    }

    fn size_hint(&self) -> Option<u64> {
        Some(self.len() as u64)
    }
}

impl BlockSink for Vec<u8> {
    async fn accept(&mut self, block: &[u8]) -> Result<()> {
        self.extend_from_slice(block);
        Ok(())
    }
}

/// File-backed block producer with a known length for tsize replies.
pub struct FileSource {
    file: File,
    len: u64,
}

impl FileSource {
    pub async fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = File::open(path).await?;
        let len = file.metadata().await?.len();
        Ok(Self { file, len })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl BlockSource for FileSource {
    async fn fill(&mut self, buf: &mut [u8]) -> Result<usize> {
        // A short read mid-file would be mistaken for end of stream, so keep
        // reading until the block is full or the file ends.
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    fn size_hint(&self) -> Option<u64> {
        Some(self.len)
    }
}

/// File-backed block consumer.
///
/// Data lands in a temporary sibling that is renamed into place by `finish`,
/// so an aborted transfer never leaves a truncated file at the destination.
pub struct FileSink {
    file: Option<File>,
    tmp_path: PathBuf,
    dest: PathBuf,
    finished: bool,
}

impl FileSink {
    pub async fn create(dest: impl AsRef<Path>) -> std::io::Result<Self> {
        let dest = dest.as_ref().to_path_buf();
        let mut tmp = dest.as_os_str().to_owned();
        tmp.push(".tftp-tmp");
        let tmp_path = PathBuf::from(tmp);
        let file = File::create(&tmp_path).await?;
        Ok(Self {
            file: Some(file),
            tmp_path,
            dest,
            finished: false,
        })
    }
}

impl BlockSink for FileSink {
    async fn accept(&mut self, block: &[u8]) -> Result<()> {
        match self.file.as_mut() {
            Some(file) => {
                file.write_all(block).await?;
                Ok(())
            }
            None => Err(TftpError::Rejected("sink already finished".to_string())),
        }
    }

    async fn finish(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            drop(file);
            tokio::fs::rename(&self.tmp_path, &self.dest).await?;
            self.finished = true;
        }
        Ok(())
    }
}

impl Drop for FileSink {
    fn drop(&mut self) {
        if !self.finished {
            self.file.take();
            let _ = std::fs::remove_file(&self.tmp_path);
        }
    }
}

/// State for one in-flight transfer.
pub struct Session<T: Transport> {
    transport: T,
    peer: SocketAddr,
    peer_locked: bool,
    role: Role,
    options: TftpOptions,
    cancel: CancellationToken,
    // Single datagram staging buffer, sized for the largest legal packet
    buf: Vec<u8>,
}

impl<T: Transport> Session<T> {
    /// Create a session against `peer`.
    ///
    /// Server roles know the peer's TID from the request datagram, so it is
    /// locked from the start; client roles lock it on the first valid reply.
    pub fn new(transport: T, peer: SocketAddr, role: Role, options: TftpOptions) -> Self {
        let peer_locked = matches!(role, Role::ServerReader | Role::ServerWriter);
        Self {
            transport,
            peer,
            peer_locked,
            role,
            options,
            cancel: CancellationToken::new(),
            buf: vec![0u8; MAX_PACKET_SIZE],
        }
    }

    /// Attach a cancellation token checked at every suspension boundary.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn options(&self) -> &TftpOptions {
        &self.options
    }

    pub fn options_mut(&mut self) -> &mut TftpOptions {
        &mut self.options
    }

    pub(crate) async fn send_to_peer(&self, wire: &[u8]) -> Result<()> {
        self.transport.send(self.peer, wire).await?;
        Ok(())
    }

    /// Receive the next packet for this session, or `None` when `deadline`
    /// expires.
    ///
    /// TID discipline (RFC 1350 §4): before the peer TID is locked, the first
    /// well-formed reply locks it; afterwards a datagram from any other
    /// (ip, port) is answered with ERROR(5) and otherwise ignored, and a
    /// malformed datagram from the locked peer is a fatal protocol error.
    pub(crate) async fn recv_from_peer(&mut self, deadline: Instant) -> Result<Option<Packet>> {
        loop {
            let received = tokio::select! {
                _ = self.cancel.cancelled() => return Err(TftpError::Cancelled),
                r = timeout_at(deadline, self.transport.recv(&mut self.buf)) => r,
            };
            let (len, from) = match received {
                Ok(Ok(pair)) => pair,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Ok(None),
            };

            if self.peer_locked && from != self.peer {
                warn!(%from, "datagram from unknown transfer id");
                let stray = Packet::Error {
                    code: ErrorCode::UnknownTransferId as u16,
                    message: ErrorCode::UnknownTransferId.as_str().to_string(),
                }
                .encode()?;
                self.transport.send(from, &stray).await?;
                continue;
            }

            let packet = match Packet::decode(&self.buf[..len]) {
                Ok(p) => p,
                Err(e) if self.peer_locked => return Err(e),
                Err(e) => {
                    debug!(%from, "ignoring malformed datagram before tid lock: {e}");
                    continue;
                }
            };

            if !self.peer_locked {
                match packet {
                    Packet::Data { .. }
                    | Packet::Ack { .. }
                    | Packet::Oack { .. }
                    | Packet::Error { .. } => {
                        debug!(%from, "peer transfer id locked");
                        self.peer = from;
                        self.peer_locked = true;
                    }
                    // A request cannot open a reply; keep waiting
                    _ => continue,
                }
            }

            return Ok(Some(packet));
        }
    }

    /// Transmit `wire` and wait for `ACK{block}` from the locked peer,
    /// retransmitting the same datagram on each deadline expiry until the
    /// retry budget is spent. Used for DATA blocks and for an OACK awaiting
    /// its ACK 0.
    pub(crate) async fn send_until_acked(&mut self, wire: &Bytes, block: u16) -> Result<()> {
        let mut retries = 0u32;
        loop {
            self.transport.send(self.peer, wire).await?;
            let deadline = Instant::now() + self.options.timeout;
            loop {
                match self.recv_from_peer(deadline).await? {
                    Some(Packet::Ack { block: acked }) if acked == block => return Ok(()),
                    Some(Packet::Ack { block: stale }) => {
                        // Reacting to a stale ACK would re-open the
                        // Sorcerer's Apprentice cascade; drop it.
                        debug!(stale, expected = block, "stale ack discarded");
                    }
                    Some(Packet::Oack { .. }) => {
                        debug!("handshake retransmission discarded");
                    }
                    Some(Packet::Error { code, message }) => {
                        return Err(TftpError::Peer { code, message });
                    }
                    Some(other) => {
                        return Err(TftpError::Protocol(format!(
                            "unexpected {} while waiting for ack {}",
                            other.kind(),
                            block
                        )));
                    }
                    None => break,
                }
            }
            retries += 1;
            if retries > self.options.retries {
                return Err(TftpError::Timeout(format!(
                    "no ack for block {block} after {retries} attempts"
                )));
            }
            debug!(block, retries, "retransmitting");
        }
    }

    /// Sender half: pull blocks from `source` and run the lockstep
    /// send-DATA/await-ACK loop until the terminal short block is
    /// acknowledged. Returns the number of payload bytes transferred.
    pub async fn send_blocks<S: BlockSource>(&mut self, source: &mut S) -> Result<u64> {
        let block_size = self.options.block_size;
        let mut chunk = vec![0u8; block_size];
        let mut block: u16 = 1;
        let mut total: u64 = 0;
        loop {
            let n = source.fill(&mut chunk).await?;
            // RFC 1350: a block shorter than blksize (possibly empty) is the
            // terminal block
            let terminal = n < block_size;
            let wire = Packet::Data {
                block,
                payload: Bytes::copy_from_slice(&chunk[..n]),
            }
            .encode()?;
            self.send_until_acked(&wire, block).await?;
            total += n as u64;
            debug!(block, len = n, total, "block acknowledged");
            if terminal {
                debug!(blocks = block, total, "transfer complete");
                return Ok(total);
            }
            // Block numbers wrap modulo 2^16 and the transfer continues
            block = block.wrapping_add(1);
        }
    }

    /// Receiver half: run the lockstep await-DATA/send-ACK loop, delivering
    /// each accepted block to `sink`, until the terminal short block.
    ///
    /// `last_reply` is the datagram retransmitted on a timeout before any
    /// block has been acknowledged (the initial RRQ, an ACK 0, or a server
    /// OACK); after the first block it is always the most recent ACK.
    /// `first` is a DATA packet the handshake already consumed, if any.
    pub async fn recv_blocks<S: BlockSink>(
        &mut self,
        sink: &mut S,
        mut last_reply: Bytes,
        first: Option<Packet>,
    ) -> Result<u64> {
        let block_size = self.options.block_size;
        let mut expected: u16 = 1;
        let mut total: u64 = 0;
        let mut retries = 0u32;
        let mut pending = first;
        loop {
            let packet = match pending.take() {
                Some(p) => Some(p),
                None => {
                    let deadline = Instant::now() + self.options.timeout;
                    self.recv_from_peer(deadline).await?
                }
            };
            match packet {
                Some(Packet::Data { block, payload }) if block == expected => {
                    retries = 0;
                    if let Err(e) = sink.accept(&payload).await {
                        // Notify the peer before surfacing the rejection
                        let refusal = Packet::Error {
                            code: ErrorCode::AccessViolation as u16,
                            message: ErrorCode::AccessViolation.as_str().to_string(),
                        }
                        .encode()?;
                        let _ = self.transport.send(self.peer, &refusal).await;
                        return Err(TftpError::Rejected(e.to_string()));
                    }
                    total += payload.len() as u64;
                    let ack = Packet::Ack { block }.encode()?;
                    self.transport.send(self.peer, &ack).await?;
                    last_reply = ack;
                    if payload.len() < block_size {
                        sink.finish().await?;
                        debug!(blocks = block, total, "transfer complete");
                        return Ok(total);
                    }
                    expected = expected.wrapping_add(1);
                }
                Some(Packet::Data { block, .. }) if block == expected.wrapping_sub(1) => {
                    // Retransmission of the block we already acknowledged:
                    // repeat the ACK, never the consumer call
                    debug!(block, "duplicate data, repeating ack");
                    self.transport.send(self.peer, &last_reply).await?;
                }
                Some(Packet::Data { block, .. }) => {
                    debug!(block, expected, "out-of-sequence data discarded");
                }
                Some(Packet::Oack { .. }) => {
                    // The peer did not see our handshake reply; repeat it
                    debug!("handshake retransmission, repeating last reply");
                    self.transport.send(self.peer, &last_reply).await?;
                }
                Some(Packet::Ack { block }) => {
                    // An option-confirming ACK 0 can trail a server OACK
                    debug!(block, "ignoring ack in receive state");
                }
                Some(Packet::Error { code, message }) => {
                    return Err(TftpError::Peer { code, message });
                }
                Some(other) => {
                    return Err(TftpError::Protocol(format!(
                        "unexpected {} while waiting for data {}",
                        other.kind(),
                        expected
                    )));
                }
                None => {
                    retries += 1;
                    if retries > self.options.retries {
                        return Err(TftpError::Timeout(format!(
                            "no data for block {expected} after {retries} attempts"
                        )));
                    }
                    debug!(expected, retries, "retransmitting last reply");
                    self.transport.send(self.peer, &last_reply).await?;
                }
            }
        }
    }
}
