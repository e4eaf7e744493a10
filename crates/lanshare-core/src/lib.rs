//! # LANSHARE Core
//!
//! Transfer engine for LANSHARE, a point-to-multipoint file sharing tool: one
//! host shares a selected file with every peer that connects to it.
//!
//! This crate provides:
//! - Metadata frame encoding and decoding
//! - Per-connection transfer sessions with progress accounting
//! - A connection acceptor with cooperative, bounded shutdown
//! - A session registry holding live sessions and the transfer history
//! - An event bus carrying progress, lifecycle and log events to observers
//! - A receiver for the client side of the wire protocol
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     ConnectionAcceptor                          │
//! │   (binds, accepts, spawns one TransferSession per connection)   │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                      TransferSession                            │
//! │   (handshake, chunked streaming, terminal reporting)            │
//! ├──────────────────────────────┬──────────────────────────────────┤
//! │       SessionRegistry        │            EventBus              │
//! │  (snapshots, history ring)   │  (progress, lifecycle, logs)     │
//! ├──────────────────────────────┴──────────────────────────────────┤
//! │                        FrameCodec                               │
//! │   [version][name len][name][size] followed by raw payload       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod acceptor;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod file;
pub mod frame;
pub mod registry;
pub mod session;
pub mod transfer;

pub use acceptor::ConnectionAcceptor;
pub use client::{ReceiveOutcome, receive_file};
pub use config::ShareConfig;
pub use error::{Error, FrameError, Result};
pub use events::{Event, EventBus, EventSubscription, LogEvent, Severity};
pub use file::{ContentReader, FileDescriptor};
pub use frame::{
    FileHeader, decode_metadata, encode_metadata, read_metadata, read_metadata_bounded,
};
pub use registry::{RegistrySummary, SessionRegistry};
pub use session::{FailureReason, HistoryEntry, Session, SessionId, SessionState};
pub use transfer::TransferSession;

/// Wire protocol version carried in the first byte of every metadata frame
pub const PROTOCOL_VERSION: u8 = 1;

/// Size of the fixed fields of a metadata frame (version + name length + size)
pub const HEADER_FIXED_SIZE: usize = 1 + 4 + 8;

/// Longest file name accepted when reading a metadata frame from a stream
pub const MAX_NAME_LEN: usize = 64 * 1024;

/// Default payload chunk size (64 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Default TCP port
pub const DEFAULT_PORT: u16 = 12345;

/// Format bytes in human-readable form
///
/// ```
/// use lanshare_core::format_bytes;
///
/// assert_eq!(format_bytes(512), "512 B");
/// assert_eq!(format_bytes(1536), "1.50 KB");
/// assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MB");
/// ```
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }

    let mut size = bytes as f64;
    let mut unit_idx = 0;
    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{size:.2} {}", UNITS[unit_idx])
}
