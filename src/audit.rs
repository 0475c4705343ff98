//! Structured audit events for SIEM integration.
//!
//! Every security-relevant event is serialized as JSON and emitted through
//! `tracing` with an `audit_event` field, so the usual subscriber machinery
//! (format, filtering, file appenders) applies unchanged.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tracing::{Level, event};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum AuditEvent {
    /// Server startup event
    ServerStarted {
        #[serde(flatten)]
        common: CommonFields,
        bind_addr: String,
        root_dir: String,
    },

    /// Server shutdown event
    ServerShutdown {
        #[serde(flatten)]
        common: CommonFields,
        reason: String,
    },

    /// File read request received
    ReadRequest {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        mode: String,
        options: serde_json::Value,
    },

    /// File read request denied
    ReadDenied {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        reason: String,
    },

    /// Write request received
    WriteRequest {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        mode: String,
        options: serde_json::Value,
    },

    /// Write request denied
    WriteDenied {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        reason: String,
    },

    /// Outbound file transfer started
    TransferStarted {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        file_size: u64,
        mode: String,
        block_size: usize,
    },

    /// Outbound file transfer completed successfully
    TransferCompleted {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        bytes_transferred: u64,
        duration_ms: u64,
    },

    /// Outbound file transfer failed
    TransferFailed {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        error: String,
    },

    /// Inbound write completed
    WriteCompleted {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        bytes_received: u64,
        duration_ms: u64,
    },

    /// Inbound write failed
    WriteFailed {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        error: String,
    },

    /// Path traversal attempt detected
    PathTraversalAttempt {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        requested_path: String,
    },

    /// Invalid protocol operation
    ProtocolViolation {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        violation: String,
    },
}

/// Common fields present in all audit events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommonFields {
    /// ISO 8601 timestamp
    pub timestamp: String,
    /// Hostname or system identifier
    pub hostname: String,
    /// Service name
    pub service: String,
    /// Severity level (info, warn, error)
    pub severity: String,
}

impl CommonFields {
    pub fn new(severity: &str) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            hostname: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string()),
            service: "tftpx".to_string(),
            severity: severity.to_string(),
        }
    }
}

impl AuditEvent {
    /// Emit this event through the active tracing subscriber.
    pub fn log(&self) {
        let severity = self.common().severity.clone();
        let json = serde_json::to_string(self).unwrap_or_else(|_| {
            format!("{{\"error\": \"failed to serialize audit event: {self:?}\"}}")
        });
        match severity.as_str() {
            "error" => event!(Level::ERROR, audit_event = %json),
            "warn" => event!(Level::WARN, audit_event = %json),
            _ => event!(Level::INFO, audit_event = %json),
        }
    }

    fn common(&self) -> &CommonFields {
        match self {
            AuditEvent::ServerStarted { common, .. }
            | AuditEvent::ServerShutdown { common, .. }
            | AuditEvent::ReadRequest { common, .. }
            | AuditEvent::ReadDenied { common, .. }
            | AuditEvent::WriteRequest { common, .. }
            | AuditEvent::WriteDenied { common, .. }
            | AuditEvent::TransferStarted { common, .. }
            | AuditEvent::TransferCompleted { common, .. }
            | AuditEvent::TransferFailed { common, .. }
            | AuditEvent::WriteCompleted { common, .. }
            | AuditEvent::WriteFailed { common, .. }
            | AuditEvent::PathTraversalAttempt { common, .. }
            | AuditEvent::ProtocolViolation { common, .. } => common,
        }
    }
}

/// Audit logger for TFTP operations.
pub struct AuditLogger;

impl AuditLogger {
    pub fn server_started(bind_addr: &str, root_dir: &str) {
        AuditEvent::ServerStarted {
            common: CommonFields::new("info"),
            bind_addr: bind_addr.to_string(),
            root_dir: root_dir.to_string(),
        }
        .log();
    }

    pub fn server_shutdown(reason: &str) {
        AuditEvent::ServerShutdown {
            common: CommonFields::new("info"),
            reason: reason.to_string(),
        }
        .log();
    }

    pub fn read_request(
        client_addr: SocketAddr,
        filename: &str,
        mode: &str,
        options: serde_json::Value,
    ) {
        AuditEvent::ReadRequest {
            common: CommonFields::new("info"),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            mode: mode.to_string(),
            options,
        }
        .log();
    }

    pub fn read_denied(client_addr: SocketAddr, filename: &str, reason: &str) {
        AuditEvent::ReadDenied {
            common: CommonFields::new("warn"),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            reason: reason.to_string(),
        }
        .log();
    }

    pub fn write_request(
        client_addr: SocketAddr,
        filename: &str,
        mode: &str,
        options: serde_json::Value,
    ) {
        AuditEvent::WriteRequest {
            common: CommonFields::new("info"),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            mode: mode.to_string(),
            options,
        }
        .log();
    }

    pub fn write_denied(client_addr: SocketAddr, filename: &str, reason: &str) {
        AuditEvent::WriteDenied {
            common: CommonFields::new("warn"),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            reason: reason.to_string(),
        }
        .log();
    }

    pub fn transfer_started(
        client_addr: SocketAddr,
        filename: &str,
        file_size: u64,
        mode: &str,
        block_size: usize,
    ) {
        AuditEvent::TransferStarted {
            common: CommonFields::new("info"),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            file_size,
            mode: mode.to_string(),
            block_size,
        }
        .log();
    }

    pub fn transfer_completed(
        client_addr: SocketAddr,
        filename: &str,
        bytes_transferred: u64,
        duration_ms: u64,
    ) {
        AuditEvent::TransferCompleted {
            common: CommonFields::new("info"),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            bytes_transferred,
            duration_ms,
        }
        .log();
    }

    pub fn transfer_failed(client_addr: SocketAddr, filename: &str, error: &str) {
        AuditEvent::TransferFailed {
            common: CommonFields::new("error"),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            error: error.to_string(),
        }
        .log();
    }

    pub fn write_completed(
        client_addr: SocketAddr,
        filename: &str,
        bytes_received: u64,
        duration_ms: u64,
    ) {
        AuditEvent::WriteCompleted {
            common: CommonFields::new("info"),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            bytes_received,
            duration_ms,
        }
        .log();
    }

    pub fn write_failed(client_addr: SocketAddr, filename: &str, error: &str) {
        AuditEvent::WriteFailed {
            common: CommonFields::new("error"),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            error: error.to_string(),
        }
        .log();
    }

    pub fn path_traversal_attempt(client_addr: SocketAddr, requested_path: &str) {
        AuditEvent::PathTraversalAttempt {
            common: CommonFields::new("warn"),
            client_addr: client_addr.to_string(),
            requested_path: requested_path.to_string(),
        }
        .log();
    }

    pub fn protocol_violation(client_addr: SocketAddr, violation: &str) {
        AuditEvent::ProtocolViolation {
            common: CommonFields::new("warn"),
            client_addr: client_addr.to_string(),
            violation: violation.to_string(),
        }
        .log();
    }
}
