//! Shared test fixtures: an in-memory datagram network with scriptable loss,
//! and a memory-backed request handler.
#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::mpsc;

use tftpx::server::{Handler, Refusal};
use tftpx::session::{BlockSink, BlockSource};
use tftpx::transport::Transport;
use tftpx::{Result, TransferMode};

type Datagram = (Bytes, SocketAddr);

/// Returns true when the datagram should be delivered.
pub type DeliveryFilter = Box<dyn FnMut(&[u8], SocketAddr, SocketAddr) -> bool + Send>;

#[derive(Default)]
struct NetworkInner {
    endpoints: Mutex<HashMap<SocketAddr, mpsc::UnboundedSender<Datagram>>>,
    filter: Mutex<Option<DeliveryFilter>>,
    // Every send attempt: (from, to, payload), including dropped datagrams
    log: Mutex<Vec<(SocketAddr, SocketAddr, Bytes)>>,
    next_port: AtomicU16,
}

/// Loss-free unless a filter says otherwise; datagrams to unknown addresses
/// vanish, exactly like UDP.
#[derive(Clone)]
pub struct Network {
    inner: Arc<NetworkInner>,
}

impl Network {
    pub fn new() -> Self {
        let inner = NetworkInner {
            next_port: AtomicU16::new(49152),
            ..NetworkInner::default()
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Register an endpoint on a fresh ephemeral address.
    pub fn endpoint(&self) -> MemoryTransport {
        let port = self.inner.next_port.fetch_add(1, Ordering::Relaxed);
        self.endpoint_at(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port))
    }

    pub fn endpoint_at(&self, addr: SocketAddr) -> MemoryTransport {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.endpoints.lock().unwrap().insert(addr, tx);
        MemoryTransport {
            net: self.clone(),
            addr,
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    /// Install a delivery filter; return false from it to drop a datagram.
    pub fn set_filter(
        &self,
        filter: impl FnMut(&[u8], SocketAddr, SocketAddr) -> bool + Send + 'static,
    ) {
        *self.inner.filter.lock().unwrap() = Some(Box::new(filter));
    }

    /// All send attempts so far, in order.
    pub fn sent_log(&self) -> Vec<(SocketAddr, SocketAddr, Bytes)> {
        self.inner.log.lock().unwrap().clone()
    }

    /// Payloads sent from `from`, decoded lazily by the caller.
    pub fn sent_from(&self, from: SocketAddr) -> Vec<Bytes> {
        self.sent_log()
            .into_iter()
            .filter(|(src, _, _)| *src == from)
            .map(|(_, _, payload)| payload)
            .collect()
    }
}

pub struct MemoryTransport {
    net: Network,
    addr: SocketAddr,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Datagram>>,
}

impl MemoryTransport {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Transport for MemoryTransport {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }

    async fn send(&self, to: SocketAddr, payload: &[u8]) -> io::Result<()> {
        self.net
            .inner
            .log
            .lock()
            .unwrap()
            .push((self.addr, to, Bytes::copy_from_slice(payload)));
        let deliver = {
            let mut filter = self.net.inner.filter.lock().unwrap();
            match filter.as_mut() {
                Some(f) => f(payload, self.addr, to),
                None => true,
            }
        };
        if deliver
            && let Some(tx) = self.net.inner.endpoints.lock().unwrap().get(&to)
        {
            let _ = tx.send((Bytes::copy_from_slice(payload), self.addr));
        }
        Ok(())
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some((payload, from)) => {
                buf[..payload.len()].copy_from_slice(&payload);
                Ok((payload.len(), from))
            }
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "network closed")),
        }
    }

    async fn open_session(&self) -> io::Result<Self> {
        Ok(self.net.endpoint())
    }
}

/// In-memory file store for driving the server without a filesystem.
#[derive(Clone)]
pub struct MemHandler {
    pub files: Arc<Mutex<HashMap<String, Bytes>>>,
    pub writable: bool,
}

impl MemHandler {
    pub fn new() -> Self {
        Self {
            files: Arc::new(Mutex::new(HashMap::new())),
            writable: true,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.writable = false;
        self
    }

    pub fn insert(&self, name: &str, data: impl Into<Bytes>) {
        self.files.lock().unwrap().insert(name.to_string(), data.into());
    }

    pub fn get(&self, name: &str) -> Option<Bytes> {
        self.files.lock().unwrap().get(name).cloned()
    }
}

impl Handler for MemHandler {
    type Source = MemSource;
    type Sink = MemSink;

    async fn open_read(
        &mut self,
        _peer: SocketAddr,
        filename: &str,
        _mode: TransferMode,
    ) -> std::result::Result<MemSource, Refusal> {
        match self.get(filename) {
            Some(data) => Ok(MemSource { data, pos: 0 }),
            None => Err(Refusal::not_found()),
        }
    }

    async fn open_write(
        &mut self,
        _peer: SocketAddr,
        filename: &str,
        _mode: TransferMode,
    ) -> std::result::Result<MemSink, Refusal> {
        if !self.writable {
            return Err(Refusal::access_violation("Write not supported"));
        }
        Ok(MemSink {
            files: self.files.clone(),
            name: filename.to_string(),
            buf: Vec::new(),
        })
    }
}

pub struct MemSource {
    data: Bytes,
    pos: usize,
}

impl BlockSource for MemSource {
    async fn fill(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = buf.len().min(self.data.len() - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    fn size_hint(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }
}

pub struct MemSink {
    files: Arc<Mutex<HashMap<String, Bytes>>>,
    name: String,
    buf: Vec<u8>,
}

impl BlockSink for MemSink {
    async fn accept(&mut self, block: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(block);
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        self.files
            .lock()
            .unwrap()
            .insert(self.name.clone(), Bytes::from(std::mem::take(&mut self.buf)));
        Ok(())
    }
}

/// A payload with enough structure that misordered blocks would be caught.
pub fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
