// Tftpx server binary: config loading, logging setup, and the serve loop.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tftpx::audit::AuditLogger;
use tftpx::config::{LogFormat, TftpConfig, load_config, validate_config, write_config};
use tftpx::error::{Result, TftpError};
use tftpx::server::{FsHandler, TftpServer};
use tftpx::transport::UdpTransport;

#[derive(Parser, Debug)]
#[command(name = "tftpx-server", about = "Standalone TFTP server")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "/etc/tftpx/tftpx.toml")]
    config: PathBuf,

    /// Write a default TOML configuration file and exit
    #[arg(long)]
    init_config: bool,

    /// Validate the configuration and exit (no socket bind)
    #[arg(long)]
    check_config: bool,

    /// Create the root directory if it does not exist
    #[arg(long)]
    create_root_dir: bool,

    /// Root directory to serve files from
    #[arg(long)]
    root_dir: Option<PathBuf>,

    /// Bind address for the TFTP server
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Enable write requests regardless of the configured policy
    #[arg(long)]
    allow_writes: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = if cli.config.exists() {
        load_config(&cli.config)?
    } else {
        TftpConfig::default()
    };

    if let Some(root_dir) = cli.root_dir {
        config.root_dir = root_dir;
    }
    if let Some(bind_addr) = cli.bind {
        config.bind_addr = bind_addr;
    }
    if cli.allow_writes {
        config.write.enabled = true;
    }

    if cli.init_config {
        write_config(&cli.config, &config)?;
        if cli.create_root_dir {
            tokio::fs::create_dir_all(&config.root_dir).await?;
        }
        println!("Wrote config to {}", cli.config.display());
        return Ok(());
    }

    if cli.create_root_dir {
        tokio::fs::create_dir_all(&config.root_dir).await?;
    }

    if cli.check_config {
        validate_config(&config, true)?;
        println!("Config OK: {}", cli.config.display());
        return Ok(());
    }

    validate_config(&config, false)?;

    // Keep the non-blocking appender guard alive for the server's lifetime
    let _log_guard = if let Some(ref log_file) = config.logging.file {
        let dir = match log_file.parent() {
            Some(path) => path,
            None => std::path::Path::new("."),
        };
        let file_name = log_file
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| {
                TftpError::Config("logging.file must include a file name".to_string())
            })?;
        let file_appender = tracing_appender::rolling::never(dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        match config.logging.format {
            LogFormat::Json => {
                tracing_subscriber::fmt()
                    .json()
                    .with_env_filter(EnvFilter::new(config.logging.level.clone()))
                    .with_writer(non_blocking)
                    .init();
            }
            LogFormat::Text => {
                tracing_subscriber::fmt()
                    .with_env_filter(EnvFilter::new(config.logging.level.clone()))
                    .with_writer(non_blocking)
                    .init();
            }
        }
        Some(guard)
    } else {
        match config.logging.format {
            LogFormat::Json => {
                tracing_subscriber::fmt()
                    .json()
                    .with_env_filter(EnvFilter::new(config.logging.level.clone()))
                    .init();
            }
            LogFormat::Text => {
                tracing_subscriber::fmt()
                    .with_env_filter(EnvFilter::new(config.logging.level.clone()))
                    .init();
            }
        }
        None
    };

    let audit_enabled = config.logging.audit_enabled;
    if audit_enabled {
        AuditLogger::server_started(
            &config.bind_addr.to_string(),
            &config.root_dir.display().to_string(),
        );
    }

    let listener = UdpTransport::bind(config.bind_addr)?;
    info!("TFTP server listening on {}", config.bind_addr);

    let handler = FsHandler::new(
        config.root_dir.clone(),
        config.write.clone(),
        config.max_file_size_bytes,
    );

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            shutdown.cancel();
        }
    });

    let mut server = TftpServer::new(listener, handler)
        .with_defaults(config.transfer.session_defaults())
        .with_audit(audit_enabled)
        .with_cancel(cancel);
    server.serve().await?;

    if audit_enabled {
        AuditLogger::server_shutdown("interrupt");
    }
    Ok(())
}
