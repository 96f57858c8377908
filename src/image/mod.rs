/*
 * Copyright 2026 Oxide Computer Company
 */

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::common::*;

pub mod cache;
pub mod checksum;
pub mod fetch;

/**
 * Anything smaller than this cannot be a usable OS image, compressed or not.
 * A short file almost always means a truncated transfer or an HTML error page
 * saved in place of the archive.
 */
pub const MIN_IMAGE_BYTES: u64 = 100 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    Remote(String),
    Local(PathBuf),
}

impl ImageSource {
    pub fn parse(source: &str) -> ImageSource {
        let lower = source.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            ImageSource::Remote(source.to_string())
        } else {
            ImageSource::Local(PathBuf::from(source))
        }
    }
}

impl std::fmt::Display for ImageSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageSource::Remote(url) => write!(f, "{}", url),
            ImageSource::Local(path) => write!(f, "{}", path.display()),
        }
    }
}

/*
 * Only archives are accepted: a raw image has no signature to check, so it
 * cannot pass validation.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionFormat {
    Xz,
    Gzip,
    Zip,
}

impl CompressionFormat {
    /**
     * Identify an archive by its leading bytes.  Returns None if the bytes do
     * not match any of the signatures we know how to decompress.
     */
    pub fn from_magic(buf: &[u8]) -> Option<CompressionFormat> {
        if buf.starts_with(&[0xFD, b'7', b'z', b'X', b'Z', 0x00]) {
            Some(CompressionFormat::Xz)
        } else if buf.starts_with(&[0x1F, 0x8B]) {
            Some(CompressionFormat::Gzip)
        } else if buf.starts_with(&[b'P', b'K', 0x03, 0x04]) {
            Some(CompressionFormat::Zip)
        } else {
            None
        }
    }

    pub fn detect<P: AsRef<Path>>(path: P) -> Result<Option<CompressionFormat>> {
        let mut buf = [0u8; 6];
        let mut f = File::open(path.as_ref())?;
        let mut n = 0;
        while n < buf.len() {
            let r = f.read(&mut buf[n..])?;
            if r == 0 {
                break;
            }
            n += r;
        }
        Ok(CompressionFormat::from_magic(&buf[..n]))
    }
}

#[derive(Debug, Clone)]
pub struct ImageArtifact {
    pub source: String,
    pub local_cache_path: PathBuf,
    pub size_bytes: u64,
    pub sha256: Option<String>,
    pub compression: CompressionFormat,
}
