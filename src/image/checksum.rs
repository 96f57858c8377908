/*
 * Copyright 2026 Oxide Computer Company
 */

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::common::*;

/**
 * The expected digest for an image, as published alongside it.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumRecord {
    pub expected_sha256: String,
}

impl ChecksumRecord {
    /**
     * Parse the contents of a ".sha256" file.  These come in a few flavours:
     * "hash  filename" (sha256sum text mode), "hash *filename" (binary mode),
     * "hash filename", or just the bare hash.  We only look at the first
     * non-blank line, and the hash must be exactly 64 hex characters.
     */
    pub fn parse(text: &str) -> Option<ChecksumRecord> {
        let line = text.lines().map(str::trim).find(|l| !l.is_empty())?;
        let hash = line.split_whitespace().next()?;

        if hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }

        Some(ChecksumRecord { expected_sha256: hash.to_ascii_lowercase() })
    }

    pub fn matches(&self, actual: &str) -> bool {
        self.expected_sha256.eq_ignore_ascii_case(actual)
    }

    pub fn render(&self, filename: &str) -> String {
        format!("{}  {}\n", self.expected_sha256, filename)
    }
}

/**
 * Location of the sidecar checksum file we keep next to a cached artifact.
 */
pub fn sidecar_path<P: AsRef<Path>>(artifact: P) -> PathBuf {
    let mut s = artifact.as_ref().as_os_str().to_os_string();
    s.push(".sha256");
    PathBuf::from(s)
}

pub fn checksum_url(source: &str) -> String {
    format!("{}.sha256", source)
}

pub fn sha256_file<P: AsRef<Path>>(path: P) -> Result<String> {
    let path = path.as_ref();
    let mut f = File::open(path)
        .with_context(|| format!("open {} for hashing", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = f.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub fn sha256_str(s: &str) -> String {
    hex::encode(Sha256::digest(s.as_bytes()))
}
