//! Logging setup and the transfer log file.
//!
//! Diagnostics go through `tracing` to stderr. Operator-facing log events from
//! the engine are additionally appended to the configured log file, one
//! `timestamp - LEVEL - message` line each.

use lanshare_core::{Event, EventSubscription};
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber
///
/// `RUST_LOG` overrides `level`; `verbose` forces debug.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init_logging(level: &str, verbose: bool) -> anyhow::Result<()> {
    let level = if verbose { "debug" } else { level };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("lanshare={level},lanshare_core={level}")));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(verbose)
                .with_file(verbose)
                .with_line_number(verbose),
        )
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize logging: {e}"))?;

    Ok(())
}

/// Append every log event from `events` to `path` until the bus closes
pub fn spawn_log_sink(
    events: EventSubscription,
    path: PathBuf,
) -> JoinHandle<std::io::Result<()>> {
    tokio::spawn(write_log_lines(events.logs_only(), path))
}

async fn write_log_lines(mut events: EventSubscription, path: PathBuf) -> std::io::Result<()> {
    let mut file = open_append(&path).await?;

    while let Some(event) = events.next().await {
        if let Event::Log(log) = event {
            file.write_all(format!("{log}\n").as_bytes()).await?;
            file.flush().await?;
        }
    }

    if events.dropped() > 0 {
        tracing::warn!(
            dropped = events.dropped(),
            path = %path.display(),
            "log file is missing events"
        );
    }
    Ok(())
}

async fn open_append(path: &Path) -> std::io::Result<tokio::fs::File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    OpenOptions::new().create(true).append(true).open(path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use lanshare_core::{EventBus, Severity};

    #[tokio::test]
    async fn test_log_sink_writes_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/server_log.txt");

        let bus = EventBus::new(64, 16);
        let sink = spawn_log_sink(bus.subscribe(), path.clone());

        bus.publish(Event::ListenerStopped);
        bus.log(Severity::Info, "Server started on 127.0.0.1:12345", None);
        bus.log(Severity::Error, "Transfer failed", None);
        drop(bus);

        sink.await.unwrap().unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(" - INFO - Server started on 127.0.0.1:12345"));
        assert!(lines[1].ends_with(" - ERROR - Transfer failed"));
    }
}
