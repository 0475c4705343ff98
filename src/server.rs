//! Server dispatch and the filesystem-backed request handler.
//!
//! The server receives requests on the well-known port, then moves every
//! transfer onto a fresh ephemeral TID so the request port stays free
//! (RFC 1350 §4). Sessions are driven one at a time; embedders that want
//! concurrency run several servers or dispatch to tasks themselves.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audit::AuditLogger;
use crate::config::WriteConfig;
use crate::error::{Result, TftpError};
use crate::packet::Packet;
use crate::session::{BlockSink, BlockSource, FileSink, FileSource, Role, Session};
use crate::transport::Transport;
use crate::{
    ErrorCode, MAX_BLOCK_SIZE, MAX_PACKET_SIZE, MIN_BLOCK_SIZE, TftpOptions, TransferMode,
};

/// A handler's reason for turning a request away, carried verbatim into the
/// wire ERROR packet.
#[derive(Debug, Clone)]
pub struct Refusal {
    pub code: ErrorCode,
    pub message: String,
}

impl Refusal {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn not_found() -> Self {
        Self::new(ErrorCode::FileNotFound, ErrorCode::FileNotFound.as_str())
    }

    pub fn access_violation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::AccessViolation, message)
    }
}

/// Embedder-supplied data callbacks, one pair per request.
///
/// `open_read` produces the block source serving an RRQ; `open_write`
/// produces the block sink consuming a WRQ. The filename is the one parsed
/// from the request.
pub trait Handler: Send {
    type Source: BlockSource;
    type Sink: BlockSink;

    fn open_read(
        &mut self,
        peer: SocketAddr,
        filename: &str,
        mode: TransferMode,
    ) -> impl Future<Output = std::result::Result<Self::Source, Refusal>> + Send;

    fn open_write(
        &mut self,
        peer: SocketAddr,
        filename: &str,
        mode: TransferMode,
    ) -> impl Future<Output = std::result::Result<Self::Sink, Refusal>> + Send;
}

/// TFTP server: one listening transport plus a request handler.
pub struct TftpServer<T: Transport, H: Handler> {
    listener: T,
    handler: H,
    defaults: TftpOptions,
    audit_enabled: bool,
    cancel: CancellationToken,
}

impl<T: Transport, H: Handler> TftpServer<T, H> {
    pub fn new(listener: T, handler: H) -> Self {
        Self {
            listener,
            handler,
            defaults: TftpOptions::default(),
            audit_enabled: false,
            cancel: CancellationToken::new(),
        }
    }

    /// Session defaults applied before option negotiation.
    pub fn with_defaults(mut self, defaults: TftpOptions) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_audit(mut self, enabled: bool) -> Self {
        self.audit_enabled = enabled;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept requests until cancelled.
    pub async fn serve(&mut self) -> Result<()> {
        loop {
            match self.serve_once().await {
                Ok(()) => {}
                Err(TftpError::Cancelled) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    /// Receive one datagram on the well-known port and drive the resulting
    /// session to completion. Per-transfer failures are logged and audited,
    /// not propagated; only listener-level failures surface.
    pub async fn serve_once(&mut self) -> Result<()> {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        let (len, peer) = tokio::select! {
            _ = self.cancel.cancelled() => return Err(TftpError::Cancelled),
            r = self.listener.recv(&mut buf) => r?,
        };

        let packet = match Packet::decode(&buf[..len]) {
            Ok(p) => p,
            Err(e) => {
                debug!(%peer, "ignoring undecodable request: {e}");
                return Ok(());
            }
        };

        match packet {
            Packet::ReadRequest {
                filename,
                mode,
                options,
            } => self.handle_read(peer, filename, mode, options).await,
            Packet::WriteRequest {
                filename,
                mode,
                options,
            } => self.handle_write(peer, filename, mode, options).await,
            other => {
                warn!(%peer, packet = other.kind(), "unexpected opcode on request port");
                if self.audit_enabled {
                    AuditLogger::protocol_violation(
                        peer,
                        &format!("{} on request port", other.kind()),
                    );
                }
                let wire = Packet::Error {
                    code: ErrorCode::IllegalOperation as u16,
                    message: ErrorCode::IllegalOperation.as_str().to_string(),
                }
                .encode()?;
                self.listener.send(peer, &wire).await?;
                Ok(())
            }
        }
    }

    async fn handle_read(
        &mut self,
        peer: SocketAddr,
        filename: String,
        mode_str: String,
        pairs: Vec<(String, String)>,
    ) -> Result<()> {
        debug!(%peer, filename, mode = %mode_str, ?pairs, "read request");
        if self.audit_enabled {
            AuditLogger::read_request(peer, &filename, &mode_str, options_json(&pairs));
        }

        let mode = match self.screen_mode(peer, &mode_str).await? {
            Some(m) => m,
            None => return Ok(()),
        };

        let (options, mut accepted) = negotiate(&self.defaults, &pairs, peer);
        let session_transport = self.listener.open_session().await?;

        let mut source = match self.handler.open_read(peer, &filename, mode).await {
            Ok(source) => source,
            Err(refusal) => {
                warn!(%peer, filename, reason = %refusal.message, "read refused");
                if self.audit_enabled {
                    if filename.contains("..") {
                        AuditLogger::path_traversal_attempt(peer, &filename);
                    }
                    AuditLogger::read_denied(peer, &filename, &refusal.message);
                }
                let wire = Packet::Error {
                    code: refusal.code as u16,
                    message: refusal.message,
                }
                .encode()?;
                session_transport.send(peer, &wire).await?;
                return Ok(());
            }
        };

        // RFC 2349: a tsize probe on an RRQ is answered with the actual size
        if let Some(slot) = accepted.iter_mut().find(|(name, _)| name == "tsize") {
            slot.1 = source.size_hint().unwrap_or(0).to_string();
        }

        if self.audit_enabled {
            AuditLogger::transfer_started(
                peer,
                &filename,
                source.size_hint().unwrap_or(0),
                mode.as_str(),
                options.block_size,
            );
        }

        let started = Instant::now();
        let mut session = Session::new(session_transport, peer, Role::ServerReader, options)
            .with_cancel(self.cancel.child_token());
        let outcome = async {
            if !accepted.is_empty() {
                // RFC 2347: the client confirms the option set with ACK 0
                // before the first data block
                let oack = Packet::Oack { options: accepted }.encode()?;
                session.send_until_acked(&oack, 0).await?;
            }
            session.send_blocks(&mut source).await
        }
        .await;

        match outcome {
            Ok(total) => {
                info!(%peer, filename, total, "read transfer complete");
                if self.audit_enabled {
                    AuditLogger::transfer_completed(
                        peer,
                        &filename,
                        total,
                        started.elapsed().as_millis() as u64,
                    );
                }
            }
            Err(e) => {
                warn!(%peer, filename, "read transfer failed: {e}");
                if self.audit_enabled {
                    AuditLogger::transfer_failed(peer, &filename, &e.to_string());
                }
            }
        }
        Ok(())
    }

    async fn handle_write(
        &mut self,
        peer: SocketAddr,
        filename: String,
        mode_str: String,
        pairs: Vec<(String, String)>,
    ) -> Result<()> {
        debug!(%peer, filename, mode = %mode_str, ?pairs, "write request");
        if self.audit_enabled {
            AuditLogger::write_request(peer, &filename, &mode_str, options_json(&pairs));
        }

        let mode = match self.screen_mode(peer, &mode_str).await? {
            Some(m) => m,
            None => return Ok(()),
        };

        let (options, accepted) = negotiate(&self.defaults, &pairs, peer);
        let session_transport = self.listener.open_session().await?;

        let mut sink = match self.handler.open_write(peer, &filename, mode).await {
            Ok(sink) => sink,
            Err(refusal) => {
                warn!(%peer, filename, reason = %refusal.message, "write refused");
                if self.audit_enabled {
                    if filename.contains("..") {
                        AuditLogger::path_traversal_attempt(peer, &filename);
                    }
                    AuditLogger::write_denied(peer, &filename, &refusal.message);
                }
                let wire = Packet::Error {
                    code: refusal.code as u16,
                    message: refusal.message,
                }
                .encode()?;
                session_transport.send(peer, &wire).await?;
                return Ok(());
            }
        };

        let started = Instant::now();
        let mut session = Session::new(session_transport, peer, Role::ServerWriter, options)
            .with_cancel(self.cancel.child_token());
        let outcome = async {
            // The reply that invites DATA#1 doubles as the retransmitted
            // packet while waiting for it
            let invite = if accepted.is_empty() {
                Packet::Ack { block: 0 }.encode()?
            } else {
                Packet::Oack { options: accepted }.encode()?
            };
            session.send_to_peer(&invite).await?;
            session.recv_blocks(&mut sink, invite, None).await
        }
        .await;

        match outcome {
            Ok(total) => {
                info!(%peer, filename, total, "write transfer complete");
                if self.audit_enabled {
                    AuditLogger::write_completed(
                        peer,
                        &filename,
                        total,
                        started.elapsed().as_millis() as u64,
                    );
                }
            }
            Err(e) => {
                warn!(%peer, filename, "write transfer failed: {e}");
                if self.audit_enabled {
                    AuditLogger::write_failed(peer, &filename, &e.to_string());
                }
            }
        }
        Ok(())
    }

    /// Validate the request's transfer mode, refusing MAIL and anything
    /// unrecognized on the request port.
    async fn screen_mode(&self, peer: SocketAddr, mode_str: &str) -> Result<Option<TransferMode>> {
        match TransferMode::parse(mode_str) {
            Ok(TransferMode::Mail) => {
                // RFC 1350: MAIL is obsolete
                warn!(%peer, "MAIL mode refused");
                let wire = Packet::Error {
                    code: ErrorCode::IllegalOperation as u16,
                    message: "MAIL mode not supported".to_string(),
                }
                .encode()?;
                self.listener.send(peer, &wire).await?;
                Ok(None)
            }
            Ok(mode) => Ok(Some(mode)),
            Err(_) => {
                warn!(%peer, mode = %mode_str, "unknown transfer mode refused");
                let wire = Packet::Error {
                    code: ErrorCode::IllegalOperation as u16,
                    message: format!("Unknown transfer mode: {mode_str}"),
                }
                .encode()?;
                self.listener.send(peer, &wire).await?;
                Ok(None)
            }
        }
    }
}

/// RFC 2347 negotiation: accept each recognized, in-range option and echo it
/// in the OACK; anything invalid is omitted and the default stands.
fn negotiate(
    defaults: &TftpOptions,
    pairs: &[(String, String)],
    peer: SocketAddr,
) -> (TftpOptions, Vec<(String, String)>) {
    let mut options = defaults.clone();
    let mut accepted = Vec::new();
    for (name, value) in pairs {
        match name.to_ascii_lowercase().as_str() {
            "blksize" => match value.parse::<usize>() {
                // RFC 2348 - valid range 8..=65464
                Ok(size) if (MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&size) => {
                    options.block_size = size;
                    accepted.push(("blksize".to_string(), size.to_string()));
                }
                _ => warn!(%peer, blksize = %value, "invalid blksize ignored"),
            },
            "timeout" => match value.parse::<u64>() {
                // RFC 2349 - valid range 1..=255 seconds
                Ok(secs) if (1..=255).contains(&secs) => {
                    options.timeout = Duration::from_secs(secs);
                    accepted.push(("timeout".to_string(), secs.to_string()));
                }
                _ => warn!(%peer, timeout = %value, "invalid timeout ignored"),
            },
            "tsize" => match value.parse::<u64>() {
                // RFC 2349 - on a WRQ this is the declared upload size; on an
                // RRQ the echoed value is patched with the actual file size
                Ok(size) => {
                    options.transfer_size = size;
                    accepted.push(("tsize".to_string(), value.clone()));
                }
                Err(_) => warn!(%peer, tsize = %value, "invalid tsize ignored"),
            },
            other => debug!(%peer, option = other, "unknown option ignored"),
        }
    }
    (options, accepted)
}

fn options_json(pairs: &[(String, String)]) -> serde_json::Value {
    serde_json::Value::Object(
        pairs
            .iter()
            .map(|(name, value)| (name.clone(), serde_json::Value::String(value.clone())))
            .collect(),
    )
}

/// Filesystem-backed [`Handler`] rooted at a directory.
pub struct FsHandler {
    root: PathBuf,
    write: WriteConfig,
    max_file_size: u64,
}

impl FsHandler {
    /// `max_file_size` of 0 means unlimited.
    pub fn new(root: impl Into<PathBuf>, write: WriteConfig, max_file_size: u64) -> Self {
        Self {
            root: root.into(),
            write,
            max_file_size,
        }
    }
}

impl Handler for FsHandler {
    type Source = FileSource;
    type Sink = BoundedSink<FileSink>;

    async fn open_read(
        &mut self,
        _peer: SocketAddr,
        filename: &str,
        _mode: TransferMode,
    ) -> std::result::Result<FileSource, Refusal> {
        let path = resolve_path(&self.root, filename).map_err(Refusal::access_violation)?;
        let source = FileSource::open(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Refusal::not_found()
            } else {
                Refusal::access_violation(ErrorCode::AccessViolation.as_str())
            }
        })?;
        if self.max_file_size > 0 && source.len() > self.max_file_size {
            return Err(Refusal::new(ErrorCode::DiskFull, "File too large"));
        }
        Ok(source)
    }

    async fn open_write(
        &mut self,
        _peer: SocketAddr,
        filename: &str,
        _mode: TransferMode,
    ) -> std::result::Result<Self::Sink, Refusal> {
        if !self.write.enabled {
            return Err(Refusal::access_violation("Write not supported"));
        }
        let path = resolve_path(&self.root, filename).map_err(Refusal::access_violation)?;
        if !write_allowed(&path, &self.root, &self.write) {
            return Err(Refusal::access_violation("File not allowed for writing"));
        }
        if path.exists() && !self.write.allow_overwrite {
            return Err(Refusal::new(
                ErrorCode::FileAlreadyExists,
                ErrorCode::FileAlreadyExists.as_str(),
            ));
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|_| Refusal::access_violation(ErrorCode::AccessViolation.as_str()))?;
        }
        let sink = FileSink::create(&path)
            .await
            .map_err(|_| Refusal::access_violation(ErrorCode::AccessViolation.as_str()))?;
        Ok(BoundedSink::new(sink, self.max_file_size))
    }
}

/// Sink wrapper enforcing a cumulative size cap. A cap of 0 means unlimited.
pub struct BoundedSink<S> {
    inner: S,
    written: u64,
    limit: u64,
}

impl<S> BoundedSink<S> {
    pub fn new(inner: S, limit: u64) -> Self {
        Self {
            inner,
            written: 0,
            limit,
        }
    }
}

impl<S: BlockSink> BlockSink for BoundedSink<S> {
    async fn accept(&mut self, block: &[u8]) -> Result<()> {
        self.written += block.len() as u64;
        if self.limit > 0 && self.written > self.limit {
            return Err(TftpError::Rejected(format!(
                "upload exceeds the {} byte limit",
                self.limit
            )));
        }
        self.inner.accept(block).await
    }

    async fn finish(&mut self) -> Result<()> {
        self.inner.finish().await
    }
}

/// Resolve `filename` under `root`, rejecting traversal and symlinks.
fn resolve_path(root: &Path, filename: &str) -> std::result::Result<PathBuf, String> {
    let filename = filename.replace('\\', "/");
    if filename.contains("..") {
        return Err("Invalid filename".to_string());
    }

    let path = root.join(filename.trim_start_matches('/'));

    // Reject symlinks so a transfer can never follow one out of the root
    match std::fs::symlink_metadata(&path) {
        Ok(meta) if meta.file_type().is_symlink() => {
            return Err("Symlinks are not allowed".to_string());
        }
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
            return Err("Access denied".to_string());
        }
        _ => {}
    }

    // The resolved path must stay inside the canonical root, whether or not
    // the file exists yet
    let canonical_root = root
        .canonicalize()
        .map_err(|_| "Root directory error".to_string())?;
    if let Ok(canonical) = path.canonicalize() {
        if !canonical.starts_with(&canonical_root) {
            return Err("Access denied".to_string());
        }
    } else if let Some(parent) = path.parent()
        && let Ok(canonical_parent) = parent.canonicalize()
        && !canonical_parent.starts_with(&canonical_root)
    {
        return Err("Access denied".to_string());
    }

    Ok(path)
}

/// Check a write target against the configured glob allowlist.
fn write_allowed(path: &Path, root: &Path, write: &WriteConfig) -> bool {
    let relative = match path.strip_prefix(root) {
        Ok(p) => p,
        Err(_) => return false,
    };
    let Some(path_str) = relative.to_str() else {
        return false;
    };
    write.allowed_patterns.iter().any(|pattern| {
        glob::Pattern::new(pattern)
            .map(|p| p.matches(path_str))
            .unwrap_or(false)
    })
}
