//! Receiving side of the wire protocol.
//!
//! A receiver connects, reads one metadata frame and then exactly the
//! announced number of payload bytes. The file is written into an output
//! directory under the announced base name; directory components sent by the
//! server are discarded. Existing files are never overwritten: a taken name
//! gets a ` (n)` suffix. A connection that closes early fails the receive and
//! the partial file, always one this receive created, is removed.

use crate::DEFAULT_CHUNK_SIZE;
use crate::error::{Error, Result};
use crate::frame::{FileHeader, read_metadata_bounded};
use chrono::Utc;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Numbered variants tried before giving up on a taken name
const MAX_NAME_ATTEMPTS: u32 = 1000;

/// Result of a successful receive
#[derive(Debug, Clone)]
pub struct ReceiveOutcome {
    /// Where the file was written
    pub path: PathBuf,
    /// Metadata announced by the server
    pub header: FileHeader,
    /// Payload bytes written to disk
    pub bytes_received: u64,
}

/// Receive one file from `server` into `output_dir`
///
/// `idle_timeout` bounds the connect, the metadata frame once its first byte
/// has arrived, and every payload read. Waiting for that first byte is not
/// bounded: the server holds connections until its operator selects a file.
/// `on_progress` is called with `(received, total)` after each write to disk.
pub async fn receive_file<F>(
    server: SocketAddr,
    output_dir: &Path,
    idle_timeout: Duration,
    mut on_progress: F,
) -> Result<ReceiveOutcome>
where
    F: FnMut(u64, u64),
{
    let mut stream = tokio::time::timeout(idle_timeout, TcpStream::connect(server))
        .await
        .map_err(|_| Error::timeout("connecting to server"))?
        .map_err(|e| Error::Connect(format!("connecting to {server}: {e}").into()))?;
    tracing::debug!(server = %server, "connected");

    let header = read_metadata_bounded(&mut stream, idle_timeout).await?;
    tracing::info!(file = %header.name, size = header.size, "receiving");

    tokio::fs::create_dir_all(output_dir).await?;
    let (mut file, path) = create_unique(output_dir, &sanitize_file_name(&header.name)).await?;

    let copied = copy_payload(&mut stream, &mut file, header.size, idle_timeout, &mut on_progress).await;
    let finished = match copied {
        Ok(()) => file.sync_all().await.map_err(Error::from),
        Err(e) => Err(e),
    };

    if let Err(e) = finished {
        drop(file);
        if let Err(remove) = tokio::fs::remove_file(&path).await {
            tracing::warn!(path = %path.display(), "could not remove partial file: {remove}");
        }
        return Err(e);
    }

    tracing::info!(path = %path.display(), "file received");
    Ok(ReceiveOutcome {
        path,
        bytes_received: header.size,
        header,
    })
}

async fn copy_payload<R, F>(
    reader: &mut R,
    file: &mut File,
    total: u64,
    idle_timeout: Duration,
    on_progress: &mut F,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    F: FnMut(u64, u64),
{
    let mut buf = vec![0u8; DEFAULT_CHUNK_SIZE];
    let mut received = 0u64;

    while received < total {
        let want = buf
            .len()
            .min(usize::try_from(total - received).unwrap_or(usize::MAX));
        let n = tokio::time::timeout(idle_timeout, reader.read(&mut buf[..want]))
            .await
            .map_err(|_| Error::timeout("waiting for payload"))?
            .map_err(|e| Error::Transfer(format!("reading payload: {e}").into()))?;

        if n == 0 {
            return Err(Error::Transfer(
                format!("server closed connection after {received} of {total} bytes").into(),
            ));
        }

        file.write_all(&buf[..n]).await?;
        received += n as u64;
        on_progress(received, total);
    }

    file.flush().await?;
    Ok(())
}

/// Create a new file for `name` in `dir`, never opening an existing one
async fn create_unique(dir: &Path, name: &str) -> Result<(File, PathBuf)> {
    for attempt in 0..MAX_NAME_ATTEMPTS {
        let path = dir.join(numbered_name(name, attempt));
        match OpenOptions::new().write(true).create_new(true).open(&path).await {
            Ok(file) => return Ok((file, path)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(Error::Io(std::io::Error::new(
        ErrorKind::AlreadyExists,
        format!("no free name for {name} in {}", dir.display()),
    )))
}

/// `report.pdf` -> `report (2).pdf`; attempt 0 keeps the name
fn numbered_name(name: &str, attempt: u32) -> String {
    if attempt == 0 {
        return name.to_string();
    }
    match name.rfind('.') {
        Some(dot) if dot > 0 => format!("{} ({attempt}){}", &name[..dot], &name[dot..]),
        _ => format!("{name} ({attempt})"),
    }
}

/// Reduce an announced name to a safe base name
///
/// Keeps only the last path component (either separator). Names that are
/// empty, `.` or `..` after that fall back to `received_file_<timestamp>`.
#[must_use]
pub fn sanitize_file_name(name: &str) -> String {
    let base: String = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .chars()
        .filter(|c| !c.is_control())
        .collect();
    let base = base.trim();

    if base.is_empty() || base == "." || base == ".." {
        return format!("received_file_{}", Utc::now().format("%Y%m%d_%H%M%S"));
    }
    base.to_string()
}
