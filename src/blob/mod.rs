//! Digest and blob primitives
//!
//! Streaming SHA-256 with byte counting, the `(digest, size, media type)`
//! blob descriptor, and the dual-digest gzip compressor. Layer compression
//! must surface both digests in one pass: the image config references the
//! `diff_id` (uncompressed tar) while the manifest and the blob endpoints
//! reference the digest of the gzipped bytes.

use std::fmt;
use std::io::{Read, Write};

use flate2::Compression;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use sha2::{Digest as Sha2Digest, Sha256};

use crate::error::{BuilderError, Result};

const STREAM_BUFFER_SIZE: usize = 64 * 1024;

/// A SHA-256 digest. Exactly 32 bytes; the wire form is lowercase
/// `sha256:<hex>`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; 32]);

impl Digest {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Digest(bytes)
    }

    /// Hash a complete in-memory buffer.
    pub fn of_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Digest(hasher.finalize().into())
    }

    /// Parse either `sha256:<hex>` or a bare 64-character hex string.
    pub fn parse(value: &str) -> Result<Self> {
        let hex_part = value.strip_prefix("sha256:").unwrap_or(value);
        if hex_part.len() != 64 {
            return Err(BuilderError::Validation(format!(
                "invalid SHA-256 digest '{}': expected 64 hex characters, got {}",
                value,
                hex_part.len()
            )));
        }
        let raw = hex::decode(hex_part).map_err(|_| {
            BuilderError::Validation(format!(
                "invalid SHA-256 digest '{}': contains non-hex characters",
                value
            ))
        })?;
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&raw);
        Ok(Digest(bytes))
    }

    /// The 64-character lowercase hex form, without prefix.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sha256:{}", self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl Serialize for Digest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Digest::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Content-addressed blob descriptor: digest, byte size, optional media type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    pub digest: Digest,
    pub size: u64,
    pub media_type: Option<String>,
}

impl Descriptor {
    pub fn new(digest: Digest, size: u64) -> Self {
        Self {
            digest,
            size,
            media_type: None,
        }
    }

    pub fn with_media_type(mut self, media_type: impl Into<String>) -> Self {
        self.media_type = Some(media_type.into());
        self
    }
}

/// A writer that tees everything through a SHA-256 hasher while counting
/// bytes. Never closes the wrapped writer.
pub struct DigestWriter<W: Write> {
    inner: W,
    hasher: Sha256,
    count: u64,
}

impl<W: Write> DigestWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            count: 0,
        }
    }

    /// Finish hashing and hand back the wrapped writer.
    pub fn finish(self) -> (W, Digest, u64) {
        let digest = Digest(self.hasher.finalize().into());
        (self.inner, digest, self.count)
    }
}

impl<W: Write> Write for DigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.hasher.update(&buf[..written]);
        self.count += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Stream `reader` through SHA-256, counting bytes. Optionally tees the bytes
/// into `sink`. Neither the reader nor the sink is closed.
pub fn compute_digest<R: Read>(mut reader: R, mut sink: Option<&mut dyn Write>) -> Result<Descriptor> {
    let mut hasher = Sha256::new();
    let mut count: u64 = 0;
    let mut buffer = [0u8; STREAM_BUFFER_SIZE];
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        if let Some(out) = sink.as_deref_mut() {
            out.write_all(&buffer[..read])?;
        }
        count += read as u64;
    }
    Ok(Descriptor::new(Digest(hasher.finalize().into()), count))
}

/// Result of compressing a layer tar: both digests, both sizes, and the
/// compressed bytes delivered to the supplied writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedBlob {
    /// SHA-256 of the gzipped bytes; what manifests and blob endpoints use
    pub digest: Digest,
    /// Size of the gzipped bytes on the wire
    pub size: u64,
    /// SHA-256 of the uncompressed tar; what `rootfs.diff_ids` uses
    pub diff_id: Digest,
    pub uncompressed_size: u64,
}

/// Gzip-compress `reader` into `writer`, producing both the compressed
/// digest and the uncompressed `diff_id` in a single streaming pass: one
/// hasher in front of the encoder, one behind it.
pub fn compress_gzip_into<R: Read, W: Write>(mut reader: R, writer: W) -> Result<(CompressedBlob, W)> {
    let mut diff_hasher = Sha256::new();
    let mut uncompressed_size: u64 = 0;
    let mut encoder = GzEncoder::new(DigestWriter::new(writer), Compression::default());

    let mut buffer = [0u8; STREAM_BUFFER_SIZE];
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        diff_hasher.update(&buffer[..read]);
        uncompressed_size += read as u64;
        encoder.write_all(&buffer[..read])?;
    }

    let (writer, digest, size) = encoder.finish()?.finish();
    Ok((
        CompressedBlob {
            digest,
            size,
            diff_id: Digest(diff_hasher.finalize().into()),
            uncompressed_size,
        },
        writer,
    ))
}

/// Convenience form of [`compress_gzip_into`] returning the bytes.
pub fn compress_gzip<R: Read>(reader: R) -> Result<(CompressedBlob, Vec<u8>)> {
    let (blob, bytes) = compress_gzip_into(reader, Vec::new())?;
    Ok((blob, bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn digest_of_known_vector() {
        let digest = Digest::of_bytes(b"hello world");
        assert_eq!(
            digest.to_string(),
            "sha256:b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn digest_parse_roundtrip() {
        let text = "sha256:b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";
        let digest = Digest::parse(text).expect("parse");
        assert_eq!(digest.to_string(), text);

        let bare = Digest::parse(&text[7..]).expect("parse bare hex");
        assert_eq!(bare, digest);
    }

    #[test]
    fn digest_parse_rejects_bad_input() {
        assert!(Digest::parse("sha256:short").is_err());
        assert!(Digest::parse("sha256:zz").is_err());
        let not_hex = "g".repeat(64);
        assert!(Digest::parse(&not_hex).is_err());
    }

    #[test]
    fn compute_digest_counts_and_tees() {
        let mut sink = Vec::new();
        let descriptor =
            compute_digest(Cursor::new(b"hello world"), Some(&mut sink)).expect("compute");
        assert_eq!(descriptor.size, 11);
        assert_eq!(sink, b"hello world");
        assert_eq!(descriptor.digest, Digest::of_bytes(b"hello world"));
    }

    #[test]
    fn gzip_produces_both_digests() {
        let payload = b"layer tar bytes for dual digest";
        let (blob, compressed) = compress_gzip(Cursor::new(payload)).expect("compress");

        assert_eq!(blob.diff_id, Digest::of_bytes(payload));
        assert_eq!(blob.uncompressed_size, payload.len() as u64);
        assert_eq!(blob.digest, Digest::of_bytes(&compressed));
        assert_eq!(blob.size, compressed.len() as u64);
        assert_ne!(blob.digest, blob.diff_id);
    }

    #[test]
    fn gzip_is_deterministic() {
        let payload = b"same bytes in, same bytes out";
        let (first, first_bytes) = compress_gzip(Cursor::new(payload)).expect("compress");
        let (second, second_bytes) = compress_gzip(Cursor::new(payload)).expect("compress");
        assert_eq!(first, second);
        assert_eq!(first_bytes, second_bytes);
    }
}
