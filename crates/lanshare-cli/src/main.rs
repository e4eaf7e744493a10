//! LANSHARE CLI
//!
//! Share one file with every peer on the local network that connects.

mod config;
mod logging;
mod progress;

use clap::{Parser, Subcommand};
use lanshare_core::{ConnectionAcceptor, FileDescriptor, format_bytes, receive_file};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Instant;

use config::Config;
use progress::{Dashboard, TransferProgress, format_duration, format_speed, history_table, summary_line};

/// LANSHARE - point-to-multipoint LAN file sharing
#[derive(Parser)]
#[command(name = "lanshare")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Share a file with every peer that connects
    Serve {
        /// File to share
        #[arg(required = true)]
        file: PathBuf,

        /// Listen address (ip:port)
        #[arg(short, long)]
        bind: Option<String>,

        /// Read the file through one shared handle instead of one per peer
        #[arg(long)]
        shared_handle: bool,

        /// Append transfer log lines to this file
        #[arg(long)]
        log_file: Option<PathBuf>,
    },

    /// Receive the shared file from a server
    Receive {
        /// Server address (ip:port)
        #[arg(short, long)]
        server: Option<String>,

        /// Output directory
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show the effective configuration
    Config {
        /// Write the configuration to the config file
        #[arg(long)]
        init: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let config = if cli.config.is_some() {
        Config::load(&config_path)?
    } else {
        Config::load_or_default(&config_path)?
    };

    logging::init_logging(&config.logging.level, cli.verbose)?;

    match cli.command {
        Commands::Serve {
            file,
            bind,
            shared_handle,
            log_file,
        } => {
            let mut config = config;
            if let Some(bind) = bind {
                config.network.listen_addr = bind;
            }
            if log_file.is_some() {
                config.logging.file = log_file;
            }
            config.validate()?;
            serve(file, shared_handle, &config).await?;
        }
        Commands::Receive { server, output } => {
            let mut config = config;
            if let Some(server) = server {
                config.receive.server_addr = server;
            }
            if let Some(output) = output {
                config.receive.output_dir = output;
            }
            config.validate()?;
            receive(&config).await?;
        }
        Commands::Config { init } => {
            config.validate()?;
            show_config(&config, &config_path, init)?;
        }
    }

    Ok(())
}

/// Share `file` until Ctrl+C
async fn serve(file: PathBuf, shared_handle: bool, config: &Config) -> anyhow::Result<()> {
    let bind = config.parse_listen_addr()?;

    let descriptor = if shared_handle {
        FileDescriptor::open_shared(&file).await?
    } else {
        FileDescriptor::open(&file).await?
    };

    let acceptor = ConnectionAcceptor::new(config.share_config())?;

    let log_sink = config
        .logging
        .file
        .clone()
        .map(|path| logging::spawn_log_sink(acceptor.subscribe(), path));

    let mut events = acceptor.subscribe();
    let dashboard = tokio::spawn(async move {
        let mut dashboard = Dashboard::new();
        while let Some(event) = events.next().await {
            dashboard.handle(&event);
        }
        dashboard.live()
    });

    println!("File: {}", file.display());
    println!("Size: {}", format_bytes(descriptor.size()));
    if descriptor.is_shared_handle() {
        println!("Reads: one shared handle");
    } else {
        println!("Reads: one handle per client");
    }
    acceptor.select_file(descriptor);

    let addr = acceptor.start(bind).await?;
    println!("Listening on: {addr}");
    println!("Press Ctrl+C to stop\n");

    tokio::signal::ctrl_c().await?;
    println!("\nShutting down...");
    acceptor.stop().await?;

    let registry = acceptor.registry();
    // Closing the bus ends the dashboard and the log sink
    drop(acceptor);
    match dashboard.await {
        Ok(0) => {}
        Ok(live) => tracing::debug!(live, "progress bars left open"),
        Err(e) => tracing::warn!("progress display ended abnormally: {e}"),
    }
    if let Some(sink) = log_sink {
        match sink.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("writing transfer log failed: {e}"),
            Err(e) => tracing::warn!("transfer log task ended abnormally: {e}"),
        }
    }

    let history = registry.list_history().await;
    if history.is_empty() {
        println!("No transfers.");
    } else {
        println!("\nTransfer history:");
        print!("{}", history_table(&history));
    }
    println!("{}", summary_line(&registry.summary().await));

    Ok(())
}

/// Receive one file from the configured server
async fn receive(config: &Config) -> anyhow::Result<()> {
    let server: SocketAddr = config.parse_server_addr()?;
    let output = &config.receive.output_dir;

    println!("Server: {server}");
    println!("Output directory: {}", output.display());

    let started = Instant::now();
    let mut bar: Option<TransferProgress> = None;
    let result = receive_file(server, output, config.receive_timeout(), |received, total| {
        bar.get_or_insert_with(|| TransferProgress::new(total, &server.to_string()))
            .update(received);
    })
    .await;

    match result {
        Ok(outcome) => {
            let elapsed = started.elapsed();
            let speed = outcome.bytes_received as f64 / elapsed.as_secs_f64().max(0.001);
            if let Some(bar) = &bar {
                bar.finish_with_message(format!("Received: {}", outcome.header.name));
            }
            println!(
                "Saved {} ({}) in {} ({})",
                outcome.path.display(),
                format_bytes(outcome.bytes_received),
                format_duration(elapsed),
                format_speed(speed)
            );
            Ok(())
        }
        Err(e) => {
            if let Some(bar) = &bar {
                bar.abandon();
            }
            Err(e.into())
        }
    }
}

/// Print the effective configuration, optionally writing it out
fn show_config(config: &Config, path: &std::path::Path, init: bool) -> anyhow::Result<()> {
    if init {
        config.save(path)?;
        println!("Configuration written to {}", path.display());
    } else {
        println!("# {}", path.display());
    }
    print!("{}", toml::to_string_pretty(config)?);
    Ok(())
}
