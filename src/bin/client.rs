// Tftpx client binary

use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

use tftpx::client::TftpClient;
use tftpx::error::{Result, TftpError};
use tftpx::session::{FileSink, FileSource};
use tftpx::{
    DEFAULT_BLOCK_SIZE, DEFAULT_SERVER_PORT, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, TftpOptions,
    TransferMode,
};

/// Tftpx TFTP client
#[derive(Parser, Debug)]
#[command(name = "tftpx-client")]
#[command(about = "TFTP command line client", long_about = None)]
struct Cli {
    /// TFTP server address (e.g. 192.168.1.100:69; port defaults to 69)
    #[arg(short, long)]
    server: String,

    /// Get file from server
    #[arg(short, long, conflicts_with = "put")]
    get: Option<String>,

    /// Put file to server
    #[arg(short, long, conflicts_with = "get")]
    put: Option<String>,

    /// Local file path (for get: destination, for put: remote name override)
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Transfer mode (octet or netascii)
    #[arg(short, long, default_value = "octet")]
    mode: String,

    /// Block size to negotiate (8-65464)
    #[arg(short, long)]
    block_size: Option<usize>,

    /// Retransmission timeout to negotiate, in seconds (1-255)
    #[arg(short, long)]
    timeout: Option<u64>,

    /// Retransmissions allowed per pending packet
    #[arg(short, long)]
    retries: Option<u32>,

    /// Request RFC 2347 option negotiation and wait for the OACK reply
    #[arg(short, long)]
    negotiate: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .with_target(false)
        .init();

    let server_addr = parse_server_addr(&cli.server)?;
    let mode = TransferMode::parse(&cli.mode)?;

    let mut options = TftpOptions::default();
    if let Some(block_size) = cli.block_size {
        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size) {
            warn!(
                "Invalid block size {}, using default {}",
                block_size, DEFAULT_BLOCK_SIZE
            );
        } else {
            options.block_size = block_size;
            options.wait_oack = true;
        }
    }
    if let Some(timeout) = cli.timeout {
        if !(1..=255).contains(&timeout) {
            warn!("Invalid timeout {}, using default", timeout);
        } else {
            options.timeout = Duration::from_secs(timeout);
            options.wait_oack = true;
        }
    }
    if let Some(retries) = cli.retries {
        options.retries = retries;
    }
    if cli.negotiate {
        options.wait_oack = true;
    }

    if let Some(remote_file) = cli.get {
        let local_file = cli.file.unwrap_or_else(|| PathBuf::from(&remote_file));
        let client = TftpClient::new(server_addr).with_options(options);
        info!(
            "Downloading {} from {} to {}",
            remote_file,
            server_addr,
            local_file.display()
        );
        let mut sink = FileSink::create(&local_file).await?;
        let total = client.get(&remote_file, mode, &mut sink).await?;
        info!("Download complete: {} bytes", total);
    } else if let Some(local_file) = cli.put {
        let remote_file = cli
            .file
            .and_then(|p| p.to_str().map(String::from))
            .unwrap_or_else(|| local_file.clone());
        let mut source = FileSource::open(&local_file).await?;
        // RFC 2349: declare the upload size so the server can check space
        options.transfer_size = source.len();
        options.wait_oack = true;
        let client = TftpClient::new(server_addr).with_options(options);
        info!(
            "Uploading {} to {} as {}",
            local_file, server_addr, remote_file
        );
        let total = client.put(&remote_file, mode, &mut source).await?;
        info!("Upload complete: {} bytes", total);
    } else {
        return Err(TftpError::Config(
            "must specify either --get or --put".to_string(),
        ));
    }

    Ok(())
}

fn parse_server_addr(server: &str) -> Result<SocketAddr> {
    if let Ok(addr) = server.parse::<SocketAddr>() {
        return Ok(addr);
    }
    // A bare address gets the well-known port
    server
        .parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, DEFAULT_SERVER_PORT))
        .map_err(|e| TftpError::Config(format!("invalid server address '{server}': {e}")))
}
