// Public modules - shared between server and client
pub mod audit;
pub mod client;
pub mod config;
pub mod error;
pub mod packet;
pub mod server;
pub mod session;
pub mod transport;

// Re-export commonly used types
pub use client::TftpClient;
pub use error::{Result, TftpError};
pub use packet::Packet;
pub use server::{FsHandler, Handler, Refusal, TftpServer};
pub use session::{BlockSink, BlockSource, Role, Session};
pub use transport::{Transport, UdpTransport};

use std::time::Duration;

// RFC 1350 - The TFTP Protocol (Revision 2)
pub const DEFAULT_SERVER_PORT: u16 = 69;
pub const DEFAULT_BLOCK_SIZE: usize = 512; // RFC 1350 standard for compatibility
pub const MIN_BLOCK_SIZE: usize = 8; // RFC 2348 minimum block size
pub const MAX_BLOCK_SIZE: usize = 65464; // RFC 2348 maximum block size
pub const MAX_PACKET_SIZE: usize = 65468; // Max block size + 4 byte header
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);
pub const DEFAULT_RETRIES: u32 = 5;

// TFTP Opcodes (RFC 1350)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Opcode {
    Rrq = 1,   // Read Request
    Wrq = 2,   // Write Request
    Data = 3,  // Data
    Ack = 4,   // Acknowledgment
    Error = 5, // Error
    Oack = 6,  // Option Acknowledgment (RFC 2347)
}

impl Opcode {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Opcode::Rrq),
            2 => Some(Opcode::Wrq),
            3 => Some(Opcode::Data),
            4 => Some(Opcode::Ack),
            5 => Some(Opcode::Error),
            6 => Some(Opcode::Oack),
            _ => None,
        }
    }
}

// TFTP Error Codes (RFC 1350)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    NotDefined = 0,
    FileNotFound = 1,
    AccessViolation = 2,
    DiskFull = 3,
    IllegalOperation = 4,
    UnknownTransferId = 5,
    FileAlreadyExists = 6,
    NoSuchUser = 7,
    OptionNegotiationFailed = 8, // RFC 2347
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotDefined => "Not defined",
            ErrorCode::FileNotFound => "File not found",
            ErrorCode::AccessViolation => "Access violation",
            ErrorCode::DiskFull => "Disk full or allocation exceeded",
            ErrorCode::IllegalOperation => "Illegal operation",
            ErrorCode::UnknownTransferId => "Unknown transfer ID",
            ErrorCode::FileAlreadyExists => "File already exists",
            ErrorCode::NoSuchUser => "No such user",
            ErrorCode::OptionNegotiationFailed => "Option negotiation failed",
        }
    }
}

// Transfer Mode (RFC 1350)
//
// The engine is mode-agnostic: the mode travels on the wire and is handed to
// the embedder, but payload bytes are never transformed in transit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// NETASCII mode - 8-bit ASCII with CR+LF line endings
    Netascii,
    /// OCTET mode - Binary transfer without conversion
    Octet,
    /// MAIL mode - Obsolete, refused by the server
    Mail,
}

impl TransferMode {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "netascii" => Ok(TransferMode::Netascii),
            "octet" => Ok(TransferMode::Octet),
            "mail" => Ok(TransferMode::Mail),
            _ => Err(TftpError::Protocol(format!("unknown transfer mode: {s}"))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransferMode::Netascii => "netascii",
            TransferMode::Octet => "octet",
            TransferMode::Mail => "mail",
        }
    }
}

// TFTP Options (RFC 2347/2348/2349)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TftpOptions {
    /// RFC 2348 - Block Size Option, 8..=65464 bytes
    pub block_size: usize,
    /// RFC 2349 - Timeout Interval Option; whole seconds on the wire,
    /// millisecond precision internally
    pub timeout: Duration,
    /// RFC 2349 - Transfer Size Option; 0 means unknown
    pub transfer_size: u64,
    /// Retransmissions allowed for one pending packet
    pub retries: u32,
    /// Request option negotiation and wait for the OACK reply
    pub wait_oack: bool,
}

impl Default for TftpOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            timeout: DEFAULT_TIMEOUT,
            transfer_size: 0,
            retries: DEFAULT_RETRIES,
            wait_oack: false,
        }
    }
}

impl TftpOptions {
    /// Option pairs for an outgoing RRQ/WRQ. Only values that differ from
    /// their RFC defaults are emitted; a zero tsize is never emitted. The
    /// wire timeout is whole seconds in 1..=255, so a sub-second local
    /// timeout stays local and is not offered.
    pub fn request_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        if self.block_size != DEFAULT_BLOCK_SIZE {
            pairs.push(("blksize".to_string(), self.block_size.to_string()));
        }
        if self.timeout != DEFAULT_TIMEOUT
            && self.timeout.subsec_millis() == 0
            && (1..=255).contains(&self.timeout.as_secs())
        {
            pairs.push(("timeout".to_string(), self.timeout.as_secs().to_string()));
        }
        if self.transfer_size != 0 {
            pairs.push(("tsize".to_string(), self.transfer_size.to_string()));
        }
        pairs
    }

    /// Fold a server OACK into the effective options.
    ///
    /// RFC 2347: the server may only acknowledge options the client offered,
    /// with values it is willing to honor. A recognized option carrying an
    /// out-of-range value at this stage is a protocol violation.
    pub fn absorb_oack(&mut self, pairs: &[(String, String)]) -> Result<()> {
        for (name, value) in pairs {
            match name.to_ascii_lowercase().as_str() {
                "blksize" => match value.parse::<usize>() {
                    Ok(size) if (MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&size) => {
                        self.block_size = size;
                    }
                    _ => {
                        return Err(TftpError::Protocol(format!(
                            "blksize '{value}' in OACK out of range"
                        )));
                    }
                },
                "timeout" => match value.parse::<u64>() {
                    Ok(secs) if (1..=255).contains(&secs) => {
                        self.timeout = Duration::from_secs(secs);
                    }
                    _ => {
                        return Err(TftpError::Protocol(format!(
                            "timeout '{value}' in OACK out of range"
                        )));
                    }
                },
                "tsize" => match value.parse::<u64>() {
                    Ok(size) => self.transfer_size = size,
                    Err(_) => {
                        return Err(TftpError::Protocol(format!(
                            "tsize '{value}' in OACK not numeric"
                        )));
                    }
                },
                // RFC 2347: unknown options are ignored
                _ => {}
            }
        }
        Ok(())
    }
}
