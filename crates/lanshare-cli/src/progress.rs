//! Transfer progress display with progress bars.

use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use lanshare_core::{Event, HistoryEntry, RegistrySummary, SessionId, SessionState, format_bytes};
use std::collections::HashMap;
use std::time::Duration;

const BAR_TEMPLATE: &str = "{msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})";

const SESSION_TEMPLATE: &str =
    "{prefix:>8} {msg:<24} [{bar:30.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec})";

fn bar_style(template: &str) -> ProgressStyle {
    ProgressStyle::with_template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-")
}

/// Single transfer progress tracker (receive side)
pub struct TransferProgress {
    bar: ProgressBar,
}

impl TransferProgress {
    /// Create a new progress tracker
    #[must_use]
    pub fn new(total_bytes: u64, filename: &str) -> Self {
        let bar = ProgressBar::new(total_bytes);
        bar.set_style(bar_style(BAR_TEMPLATE));
        bar.set_message(format!("Receiving: {filename}"));
        Self { bar }
    }

    /// Update progress
    pub fn update(&self, transferred_bytes: u64) {
        self.bar.set_position(transferred_bytes);
    }

    /// Finish with custom message
    pub fn finish_with_message(&self, msg: String) {
        self.bar.finish_with_message(msg);
    }

    /// Abandon the progress bar (for errors)
    pub fn abandon(&self) {
        self.bar.abandon();
    }
}

/// One progress bar per live session, driven by engine events
pub struct Dashboard {
    multi: MultiProgress,
    bars: HashMap<SessionId, ProgressBar>,
}

impl Dashboard {
    /// Create an empty dashboard
    #[must_use]
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: HashMap::new(),
        }
    }

    /// Apply one engine event
    pub fn handle(&mut self, event: &Event) {
        match event {
            Event::SessionStarted { id, peer_addr } => {
                let bar = self.multi.add(ProgressBar::new(0));
                bar.set_style(bar_style(SESSION_TEMPLATE));
                bar.set_prefix(id.to_string());
                bar.set_message(peer_addr.clone());
                self.bars.insert(*id, bar);
            }
            Event::Progress {
                id,
                bytes_sent,
                total_bytes,
            } => {
                if let Some(bar) = self.bars.get(id) {
                    bar.set_length(*total_bytes);
                    bar.set_position(*bytes_sent);
                }
            }
            Event::SessionEnded(entry) => {
                if let Some(bar) = self.bars.remove(&entry.id()) {
                    let session = entry.session();
                    bar.set_length(session.total_bytes);
                    bar.set_position(session.bytes_sent);
                    let label = format!("{} {}", session.peer_addr, entry.status_label());
                    match entry.state() {
                        SessionState::Completed => bar.finish_with_message(label),
                        _ => bar.abandon_with_message(label),
                    }
                }
            }
            Event::ListenerStarted { .. }
            | Event::ListenerStopped
            | Event::FileSelected { .. }
            | Event::Log(_) => {}
        }
    }

    /// Number of bars still in progress
    #[must_use]
    pub fn live(&self) -> usize {
        self.bars.len()
    }
}

impl Default for Dashboard {
    fn default() -> Self {
        Self::new()
    }
}

/// Render the transfer history table
#[must_use]
pub fn history_table(entries: &[HistoryEntry]) -> String {
    let mut out = format!(
        "{:<19}  {:<28}  {:>10}  {:<21}  {}\n",
        "Time", "File", "Size", "Client", "Status"
    );

    for entry in entries {
        let session = entry.session();
        let time = session
            .ended_at
            .unwrap_or(session.started_at)
            .with_timezone(&chrono::Local)
            .format("%Y-%m-%d %H:%M:%S");
        let status = match entry.state() {
            SessionState::Completed => style(entry.status_label()).green(),
            SessionState::Cancelled => style(entry.status_label()).yellow(),
            _ => style(entry.status_label()).red(),
        };

        out.push_str(&format!(
            "{time:<19}  {:<28}  {:>10}  {:<21}  {status}\n",
            truncate(&session.file_name, 28),
            format_bytes(session.total_bytes),
            session.peer_addr,
        ));
    }
    out
}

/// One-line outcome summary
#[must_use]
pub fn summary_line(summary: &RegistrySummary) -> String {
    format!(
        "{} completed, {} failed, {} cancelled",
        style(summary.completed).green(),
        style(summary.failed).red(),
        style(summary.cancelled).yellow()
    )
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let kept: String = s.chars().take(max.saturating_sub(3)).collect();
    format!("{kept}...")
}

/// Format speed in human-readable format (bytes/sec)
#[must_use]
pub fn format_speed(bytes_per_sec: f64) -> String {
    format!("{}/s", format_bytes(bytes_per_sec as u64))
}

/// Format duration in human-readable format
///
/// # Example
///
/// ```ignore
/// assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
/// ```
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();

    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}
