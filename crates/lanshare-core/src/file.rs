//! The shared file and per-session content readers.
//!
//! Every session reads the file from offset 0 on its own. Three sources are
//! supported:
//!
//! - **Path** (default): each session opens its own handle, so reads for
//!   different peers run fully in parallel.
//! - **Shared handle**: a single open handle behind a mutex. Each reader keeps
//!   its own position and seeks before every read, so reads are serialized but
//!   socket writes stay parallel. Used when the file cannot be reopened.
//! - **Memory**: an in-memory buffer shared by reference.

use crate::error::{Error, Result};
use crate::frame::FileHeader;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
enum ContentSource {
    Path(PathBuf),
    Shared(Arc<Mutex<File>>),
    Memory(Arc<[u8]>),
}

/// The file selected for sharing
///
/// Immutable once created. Cloning is cheap; clones share the same source.
#[derive(Debug, Clone)]
pub struct FileDescriptor {
    name: String,
    size: u64,
    source: ContentSource,
}

impl FileDescriptor {
    /// Share a file from disk, opening a fresh handle per session
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let (name, size) = inspect(path).await?;

        tracing::debug!(path = %path.display(), size, "selected file");

        Ok(Self {
            name,
            size,
            source: ContentSource::Path(path.to_path_buf()),
        })
    }

    /// Share a file from disk through one handle shared by all sessions
    pub async fn open_shared(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let (name, size) = inspect(path).await?;
        let file = File::open(path).await?;

        tracing::debug!(path = %path.display(), size, "selected file (shared handle)");

        Ok(Self {
            name,
            size,
            source: ContentSource::Shared(Arc::new(Mutex::new(file))),
        })
    }

    /// Share an in-memory buffer under `name`
    pub fn from_bytes(name: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Self {
        let bytes = bytes.into();
        Self {
            name: name.into(),
            size: bytes.len() as u64,
            source: ContentSource::Memory(bytes),
        }
    }

    /// File name as announced to peers
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Size in bytes
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Metadata frame contents for this file
    #[must_use]
    pub fn header(&self) -> FileHeader {
        FileHeader::new(self.name.clone(), self.size)
    }

    /// Check if all sessions share one handle
    #[must_use]
    pub fn is_shared_handle(&self) -> bool {
        matches!(self.source, ContentSource::Shared(_))
    }

    /// Open a reader positioned at offset 0
    pub async fn reader(&self) -> Result<ContentReader> {
        let inner = match &self.source {
            ContentSource::Path(path) => ReaderInner::Owned(File::open(path).await?),
            ContentSource::Shared(file) => ReaderInner::Shared(Arc::clone(file)),
            ContentSource::Memory(bytes) => ReaderInner::Memory(Arc::clone(bytes)),
        };

        Ok(ContentReader {
            inner,
            position: 0,
            size: self.size,
        })
    }
}

async fn inspect(path: &Path) -> Result<(String, u64)> {
    let metadata = tokio::fs::metadata(path).await?;
    if !metadata.is_file() {
        return Err(Error::Io(std::io::Error::new(
            ErrorKind::InvalidInput,
            format!("{} is not a regular file", path.display()),
        )));
    }

    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::invalid_config("file name is not valid UTF-8"))?
        .to_string();

    Ok((name, metadata.len()))
}

enum ReaderInner {
    Owned(File),
    Shared(Arc<Mutex<File>>),
    Memory(Arc<[u8]>),
}

/// Sequential reader over the shared file, private to one session
pub struct ContentReader {
    inner: ReaderInner,
    position: u64,
    size: u64,
}

impl ContentReader {
    /// Fill `buf` with the next bytes of the file
    ///
    /// Returns fewer than `buf.len()` bytes only at the announced end of the
    /// file or when the underlying file is shorter than announced. Never reads
    /// past the announced size. Returns 0 at the end.
    pub async fn read_chunk(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let remaining = self.size - self.position;
        let want = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
        let buf = &mut buf[..want];

        let filled = match &mut self.inner {
            ReaderInner::Owned(file) => fill(file, buf).await?,
            ReaderInner::Shared(file) => {
                let mut file = file.lock().await;
                file.seek(SeekFrom::Start(self.position)).await?;
                fill(&mut *file, buf).await?
            }
            ReaderInner::Memory(bytes) => {
                let start = usize::try_from(self.position).unwrap_or(usize::MAX);
                let available = bytes.len().saturating_sub(start).min(want);
                buf[..available].copy_from_slice(&bytes[start..start + available]);
                available
            }
        };

        self.position += filled as u64;
        Ok(filled)
    }
}

async fn fill(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]).await {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
