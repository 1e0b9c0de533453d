// Osprey TFTP client binary

use anyhow::{Context, bail};
use clap::Parser;
use osprey_tftp::{ClientConfig, TftpClient, TransferMode};
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::info;

/// Osprey TFTP Client
#[derive(Parser, Debug)]
#[command(name = "osprey-tftp-client")]
#[command(about = "Stop-and-wait TFTP client", long_about = None)]
struct Cli {
    /// TFTP server address (e.g., 192.168.1.100:69 or tftp.example.com)
    #[arg(short, long)]
    server: String,

    /// Get file from server
    #[arg(short, long, conflicts_with = "put")]
    get: Option<String>,

    /// Put file to server
    #[arg(short, long, conflicts_with = "get")]
    put: Option<String>,

    /// Local file path (for get: destination, for put: remote name)
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Transfer mode (octet or netascii)
    #[arg(short, long, default_value = "octet")]
    mode: TransferMode,

    /// Per-attempt timeout in milliseconds
    #[arg(short, long, default_value_t = osprey_tftp::DEFAULT_TIMEOUT_MS)]
    timeout_ms: u64,

    /// Consecutive timeouts before giving up
    #[arg(short = 'r', long, default_value_t = osprey_tftp::DEFAULT_MAX_RETRIES)]
    max_retries: u32,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn resolve_server(server: &str) -> anyhow::Result<SocketAddr> {
    if let Ok(addr) = server.parse::<SocketAddr>() {
        return Ok(addr);
    }
    // a bare address; IPv6 literals contain ':' without carrying a port
    let bare = server.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, osprey_tftp::TFTP_PORT));
    }
    let with_port = if server.contains(':') {
        server.to_string()
    } else {
        format!("{}:{}", server, osprey_tftp::TFTP_PORT)
    };
    with_port
        .to_socket_addrs()
        .with_context(|| format!("Invalid server address: {}", server))?
        .next()
        .with_context(|| format!("No address found for {}", server))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .with_target(false)
        .init();

    let server_addr = resolve_server(&cli.server)?;
    if cli.mode == TransferMode::Mail {
        bail!("mail mode is not supported");
    }

    let config = ClientConfig {
        timeout: Duration::from_millis(cli.timeout_ms),
        max_retries: cli.max_retries,
        mode: cli.mode,
        ..ClientConfig::default()
    };
    let client = TftpClient::new(server_addr, config);
    let start = Instant::now();

    let stats = if let Some(remote_file) = cli.get {
        let local_file = cli.file.unwrap_or_else(|| PathBuf::from(&remote_file));
        info!("Downloading {} from {} to {:?}", remote_file, server_addr, local_file);
        client.get(&remote_file, &local_file).await?
    } else if let Some(local_file) = cli.put {
        let remote_file = cli
            .file
            .and_then(|p| p.to_str().map(String::from))
            .unwrap_or_else(|| local_file.clone());
        info!("Uploading {} to {} as {}", local_file, server_addr, remote_file);
        client.put(&PathBuf::from(&local_file), &remote_file).await?
    } else {
        bail!("Must specify either --get or --put");
    };

    let elapsed = start.elapsed();
    let rate = stats.bytes as f64 / elapsed.as_secs_f64().max(0.001) / 1024.0;
    info!(
        "Transfer complete: {} bytes, {} blocks, {} retransmissions in {:.2}s ({:.1} KB/s)",
        stats.bytes,
        stats.blocks,
        stats.retransmissions,
        elapsed.as_secs_f64(),
        rate
    );
    Ok(())
}
