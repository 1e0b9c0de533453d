// Osprey TFTP server binary

use anyhow::Context;
use clap::Parser;
use osprey_tftp::config::{load_config, validate_config, write_config};
use osprey_tftp::{LogFormat, LoggingConfig, ServerConfig, ServerMode, TftpServer};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "osprey-tftp-server", about = "Standalone TFTP server")]
struct Cli {
    #[arg(long, default_value = "/etc/osprey/tftp.toml")]
    config: PathBuf,

    /// Write the effective configuration to --config and exit
    #[arg(long, conflicts_with = "check_config")]
    init_config: bool,

    /// Validate the configuration and exit
    #[arg(long)]
    check_config: bool,

    #[arg(long)]
    create_root_dir: bool,

    /// Directory read requests are served from
    #[arg(long)]
    root_dir: Option<PathBuf>,

    /// Directory write requests land in (defaults to --root-dir)
    #[arg(long)]
    write_root: Option<PathBuf>,

    #[arg(long)]
    bind: Option<SocketAddr>,

    #[arg(long, value_enum)]
    mode: Option<ServerMode>,

    #[arg(long)]
    timeout_ms: Option<u64>,

    #[arg(long)]
    max_retries: Option<u32>,

    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
}

fn init_logging(logging: &LoggingConfig) -> anyhow::Result<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.clone()));

    let (writer, guard) = match logging.file {
        Some(ref log_file) => {
            let dir = log_file
                .parent()
                .unwrap_or_else(|| std::path::Path::new("."));
            let file_name = log_file
                .file_name()
                .and_then(|name| name.to_str())
                .context("logging.file must include a file name")?;
            tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name))
        }
        None => tracing_appender::non_blocking(std::io::stdout()),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer);
    match logging.format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }

    Ok(guard)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = if cli.config.exists() {
        load_config(&cli.config)?
    } else {
        ServerConfig::default()
    };

    if let Some(root_dir) = cli.root_dir {
        config.read_root = root_dir;
    }
    if let Some(write_root) = cli.write_root {
        config.write_root = Some(write_root);
    }
    if let Some(bind_addr) = cli.bind {
        config.bind_addr = bind_addr;
    }
    if let Some(mode) = cli.mode {
        config.mode = mode;
    }
    if let Some(timeout_ms) = cli.timeout_ms {
        config.timeout_ms = timeout_ms;
    }
    if let Some(max_retries) = cli.max_retries {
        config.max_retries = max_retries;
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }

    if cli.create_root_dir {
        tokio::fs::create_dir_all(&config.read_root)
            .await
            .with_context(|| format!("creating {}", config.read_root.display()))?;
        if let Some(ref write_root) = config.write_root {
            tokio::fs::create_dir_all(write_root)
                .await
                .with_context(|| format!("creating {}", write_root.display()))?;
        }
    }

    if cli.init_config {
        write_config(&cli.config, &config)?;
        println!("Wrote config to {}", cli.config.display());
        return Ok(());
    }

    if cli.check_config {
        validate_config(&config, false)?;
        println!("Config OK: {}", cli.config.display());
        return Ok(());
    }

    validate_config(&config, true)?;
    let _log_guard = init_logging(&config.logging)?;

    let server = TftpServer::new(config).bind().await?;
    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, shutting down");
            shutdown.shutdown();
        }
    });

    server.run().await?;
    Ok(())
}
