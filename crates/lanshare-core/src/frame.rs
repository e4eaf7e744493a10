//! Metadata frame encoding and decoding for the LANSHARE wire protocol.
//!
//! A transfer starts with one metadata frame, followed by the raw file content
//! with no further framing. All multi-byte fields are big-endian.
//!
//! ```text
//! ┌─────────┬──────────────┬─────────────────┬──────────────┐
//! │ version │ name length  │ name (UTF-8)    │ total size   │
//! │ 1 byte  │ 4 bytes (BE) │ name length     │ 8 bytes (BE) │
//! └─────────┴──────────────┴─────────────────┴──────────────┘
//! ```
//!
//! The declared size is the only payload delimiter, so both ends must count
//! payload bytes against it.

use crate::error::{Error, FrameError, Result};
use crate::{HEADER_FIXED_SIZE, MAX_NAME_LEN, PROTOCOL_VERSION};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Offset of the name bytes inside a frame
const NAME_OFFSET: usize = 1 + 4;

/// Wire-visible description of the shared file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHeader {
    /// File name (base name only, no directories)
    pub name: String,
    /// Payload size in bytes
    pub size: u64,
}

impl FileHeader {
    /// Create a new header
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
        }
    }

    /// Length of this header once encoded
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        HEADER_FIXED_SIZE + self.name.len()
    }
}

/// Encode a metadata frame
///
/// Fails if the name is longer than [`MAX_NAME_LEN`], since no conforming
/// reader would accept it.
pub fn encode_metadata(header: &FileHeader) -> std::result::Result<Vec<u8>, FrameError> {
    let name = header.name.as_bytes();
    if name.len() > MAX_NAME_LEN {
        return Err(FrameError::NameTooLong {
            len: name.len(),
            max: MAX_NAME_LEN,
        });
    }

    let mut buf = Vec::with_capacity(header.encoded_len());
    buf.push(PROTOCOL_VERSION);
    buf.extend_from_slice(&(name.len() as u32).to_be_bytes());
    buf.extend_from_slice(name);
    buf.extend_from_slice(&header.size.to_be_bytes());
    Ok(buf)
}

/// Decode a metadata frame from the start of `buf`
///
/// Bytes after the frame (payload that arrived in the same read) are ignored;
/// use [`FileHeader::encoded_len`] to find where they start.
pub fn decode_metadata(buf: &[u8]) -> std::result::Result<FileHeader, FrameError> {
    if buf.len() < HEADER_FIXED_SIZE {
        return Err(FrameError::TooShort {
            expected: HEADER_FIXED_SIZE,
            actual: buf.len(),
        });
    }

    let version = buf[0];
    if version != PROTOCOL_VERSION {
        return Err(FrameError::UnsupportedVersion(version));
    }

    let declared = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
    // Name and the trailing size field must both fit
    let available = buf.len() - HEADER_FIXED_SIZE;
    if declared > available {
        return Err(FrameError::NameOverflow {
            declared,
            available,
        });
    }

    let name_end = NAME_OFFSET + declared;
    let name = std::str::from_utf8(&buf[NAME_OFFSET..name_end])
        .map_err(|_| FrameError::InvalidName)?
        .to_string();

    let mut size_bytes = [0u8; 8];
    size_bytes.copy_from_slice(&buf[name_end..name_end + 8]);

    Ok(FileHeader {
        name,
        size: u64::from_be_bytes(size_bytes),
    })
}

/// Read one metadata frame from an async stream
///
/// Name lengths above [`MAX_NAME_LEN`] are rejected before any allocation.
/// A stream that ends inside the frame is a connect error.
pub async fn read_metadata<R>(reader: &mut R) -> Result<FileHeader>
where
    R: AsyncRead + Unpin,
{
    let version = reader.read_u8().await.map_err(eof_as_connect)?;
    read_after_version(reader, version).await
}

/// Read one metadata frame, waiting without bound for its first byte only
///
/// A server holds new connections until a file is selected, so the frame may
/// start arbitrarily late. Once it has started, the remaining fields must
/// arrive within `timeout`.
pub async fn read_metadata_bounded<R>(
    reader: &mut R,
    timeout: Duration,
) -> Result<FileHeader>
where
    R: AsyncRead + Unpin,
{
    let version = reader.read_u8().await.map_err(eof_as_connect)?;
    tokio::time::timeout(timeout, read_after_version(reader, version))
        .await
        .map_err(|_| Error::timeout("metadata frame stalled after its first byte"))?
}

async fn read_after_version<R>(reader: &mut R, version: u8) -> Result<FileHeader>
where
    R: AsyncRead + Unpin,
{
    if version != PROTOCOL_VERSION {
        return Err(FrameError::UnsupportedVersion(version).into());
    }

    let declared = reader.read_u32().await.map_err(eof_as_connect)? as usize;
    if declared > MAX_NAME_LEN {
        return Err(FrameError::NameTooLong {
            len: declared,
            max: MAX_NAME_LEN,
        }
        .into());
    }

    let mut name = vec![0u8; declared];
    reader.read_exact(&mut name).await.map_err(eof_as_connect)?;
    let name = String::from_utf8(name).map_err(|_| FrameError::InvalidName)?;

    let size = reader.read_u64().await.map_err(eof_as_connect)?;

    Ok(FileHeader { name, size })
}

fn eof_as_connect(err: std::io::Error) -> Error {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::connect("connection closed before metadata frame was complete")
    } else {
        Error::Connect(format!("reading metadata frame: {err}").into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_metadata_roundtrip() {
        let header = FileHeader::new("report.pdf", 5_242_880);
        let encoded = encode_metadata(&header).unwrap();

        assert_eq!(encoded.len(), header.encoded_len());
        assert_eq!(encoded[0], PROTOCOL_VERSION);
        assert_eq!(&encoded[1..5], &10u32.to_be_bytes());
        assert_eq!(&encoded[5..15], b"report.pdf");
        assert_eq!(&encoded[15..], &5_242_880u64.to_be_bytes());

        assert_eq!(decode_metadata(&encoded).unwrap(), header);
    }

    #[test]
    fn test_decode_ignores_trailing_payload() {
        let header = FileHeader::new("a.bin", 3);
        let mut buf = encode_metadata(&header).unwrap();
        buf.extend_from_slice(&[1, 2, 3]);

        let decoded = decode_metadata(&buf).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(&buf[decoded.encoded_len()..], &[1, 2, 3]);
    }

    #[test]
    fn test_non_ascii_name() {
        let header = FileHeader::new("résumé-日本.txt", 0);
        let encoded = encode_metadata(&header).unwrap();
        assert_eq!(decode_metadata(&encoded).unwrap(), header);
    }

    #[test]
    fn test_decode_too_short() {
        assert_eq!(
            decode_metadata(&[PROTOCOL_VERSION, 0, 0]),
            Err(FrameError::TooShort {
                expected: HEADER_FIXED_SIZE,
                actual: 3
            })
        );
        assert!(matches!(
            decode_metadata(&[]),
            Err(FrameError::TooShort { actual: 0, .. })
        ));
    }

    #[test]
    fn test_decode_unsupported_version() {
        let mut encoded = encode_metadata(&FileHeader::new("x", 1)).unwrap();
        encoded[0] = 0x7F;
        assert_eq!(
            decode_metadata(&encoded),
            Err(FrameError::UnsupportedVersion(0x7F))
        );
    }

    #[test]
    fn test_decode_name_length_past_end() {
        let mut encoded = encode_metadata(&FileHeader::new("abc", 9)).unwrap();
        encoded[1..5].copy_from_slice(&u32::MAX.to_be_bytes());

        assert_eq!(
            decode_metadata(&encoded),
            Err(FrameError::NameOverflow {
                declared: u32::MAX as usize,
                available: 3
            })
        );
    }

    #[test]
    fn test_decode_name_eats_size_field() {
        // Name length fits the buffer but leaves no room for the size field
        let mut buf = vec![PROTOCOL_VERSION];
        buf.extend_from_slice(&8u32.to_be_bytes());
        buf.extend_from_slice(&[b'n'; 8]);

        assert_eq!(
            decode_metadata(&buf),
            Err(FrameError::NameOverflow {
                declared: 8,
                available: 0
            })
        );

        buf.extend_from_slice(&[0u8; 4]);
        assert_eq!(
            decode_metadata(&buf),
            Err(FrameError::NameOverflow {
                declared: 8,
                available: 4
            })
        );
    }

    #[test]
    fn test_decode_invalid_utf8() {
        let mut buf = vec![PROTOCOL_VERSION];
        buf.extend_from_slice(&2u32.to_be_bytes());
        buf.extend_from_slice(&[0xFF, 0xFE]);
        buf.extend_from_slice(&0u64.to_be_bytes());

        assert_eq!(decode_metadata(&buf), Err(FrameError::InvalidName));
    }

    #[test]
    fn test_encode_name_too_long() {
        let header = FileHeader::new("n".repeat(MAX_NAME_LEN + 1), 0);
        assert!(matches!(
            encode_metadata(&header),
            Err(FrameError::NameTooLong { .. })
        ));
    }

    #[tokio::test]
    async fn test_read_metadata_from_stream() {
        let header = FileHeader::new("movie.mkv", 1 << 40);
        let mut buf = encode_metadata(&header).unwrap();
        buf.extend_from_slice(b"payload");

        let mut reader = &buf[..];
        let decoded = read_metadata(&mut reader).await.unwrap();
        assert_eq!(decoded, header);
        assert_eq!(reader, b"payload");
    }

    #[tokio::test]
    async fn test_read_metadata_truncated() {
        let encoded = encode_metadata(&FileHeader::new("movie.mkv", 10)).unwrap();
        let mut reader = &encoded[..encoded.len() - 3];

        let err = read_metadata(&mut reader).await.unwrap_err();
        assert!(matches!(err, Error::Connect(_)));
    }

    #[tokio::test]
    async fn test_read_metadata_rejects_huge_name() {
        let mut buf = vec![PROTOCOL_VERSION];
        buf.extend_from_slice(&u32::MAX.to_be_bytes());

        let mut reader = &buf[..];
        let err = read_metadata(&mut reader).await.unwrap_err();
        assert!(matches!(
            err,
            Error::MalformedFrame(FrameError::NameTooLong { .. })
        ));
    }

    #[tokio::test]
    async fn test_bounded_read_times_out_mid_frame() {
        let (mut server, mut client) = tokio::io::duplex(64);
        server
            .write_all(&[PROTOCOL_VERSION, 0, 0])
            .await
            .unwrap();

        let err = read_metadata_bounded(&mut client, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        drop(server);
    }

    #[tokio::test]
    async fn test_bounded_read_waits_for_first_byte() {
        let header = FileHeader::new("late.txt", 42);
        let encoded = encode_metadata(&header).unwrap();
        let (mut server, mut client) = tokio::io::duplex(64);

        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            server.write_all(&encoded).await.unwrap();
            server
        });

        let decoded = read_metadata_bounded(&mut client, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(decoded, header);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_read_metadata_bad_version() {
        let buf = [0u8; HEADER_FIXED_SIZE];
        let mut reader = &buf[..];
        let err = read_metadata(&mut reader).await.unwrap_err();
        assert!(matches!(
            err,
            Error::MalformedFrame(FrameError::UnsupportedVersion(0))
        ));
    }
}
