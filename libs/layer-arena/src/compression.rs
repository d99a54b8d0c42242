//! Compression detection for layer blobs.
//!
//! Registries are inconsistent about the `Content-Type` they send for blobs,
//! so the media type is trusted only when it names a known layer format.
//! Generic values fall back to sniffing the magic bytes at the start of the
//! body.

use std::fmt;

const GZIP_MAGIC: &[u8] = &[0x1F, 0x8B, 0x08];
const ZSTD_MAGIC: &[u8] = &[0x28, 0xB5, 0x2F, 0xFD];

/// Number of body bytes inspected when sniffing.
pub const SNIFF_LEN: usize = 4;

/// Compression applied to a layer blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Gzip,
    Zstd,
    /// Uncompressed tar stream.
    None,
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Compression::Gzip => "gzip",
            Compression::Zstd => "zstd",
            Compression::None => "none",
        })
    }
}

/// Classify a byte prefix by its magic number.
///
/// Anything unrecognized, including a prefix too short to match, is treated
/// as an uncompressed tar stream.
pub fn detect_compression(prefix: &[u8]) -> Compression {
    if prefix.starts_with(GZIP_MAGIC) {
        Compression::Gzip
    } else if prefix.starts_with(ZSTD_MAGIC) {
        Compression::Zstd
    } else {
        Compression::None
    }
}

/// What a response's `Content-Type` says about the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    /// Missing or generic; inspect the body instead.
    Sniff,
    /// A recognized layer media type.
    Known(Compression),
    /// Something we don't know how to unpack.
    Unknown,
}

impl MediaType {
    pub fn classify(content_type: &str) -> Self {
        match content_type {
            "" | "text/plain" | "binary/octet-stream" | "application/octet-stream" => {
                MediaType::Sniff
            }
            // Old docker media type.
            "application/gzip" | "application/vnd.docker.image.rootfs.diff.tar.gzip" => {
                MediaType::Known(Compression::Gzip)
            }
            "application/zstd" => MediaType::Known(Compression::Zstd),
            "application/x-tar" => MediaType::Known(Compression::None),
            ct if ct.ends_with(".tar+gzip") => MediaType::Known(Compression::Gzip),
            ct if ct.ends_with(".tar+zstd") => MediaType::Known(Compression::Zstd),
            ct if ct.ends_with(".tar") => MediaType::Known(Compression::None),
            _ => MediaType::Unknown,
        }
    }
}
