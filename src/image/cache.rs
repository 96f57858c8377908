/*
 * Copyright 2026 Oxide Computer Company
 */

use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use super::checksum::{
    checksum_url, sha256_file, sha256_str, sidecar_path, ChecksumRecord,
};
use super::fetch::Fetcher;
use super::{CompressionFormat, ImageArtifact, ImageSource, MIN_IMAGE_BYTES};
use crate::common::*;
use crate::file::{ensure_dir, exists_file, read_file, remove_file_maybe, write_file};

/*
 * File name suffixes we trust to describe an image archive.  Longer suffixes
 * come first only for readability; any match is sufficient.
 */
const ARCHIVE_SUFFIXES: &[&str] =
    &[".img.xz", ".img.gz", ".img.zip", ".zip", ".xz", ".gz", ".img"];

/**
 * Derive the name of the cache slot for a remote image.  If the URL ends in
 * something that looks like an image archive we use that name, which keeps the
 * cache directory legible.  Otherwise (e.g., a "latest" redirect URL) the name
 * is derived from a hash of the entire URL, so that the same URL always maps
 * to the same slot.
 */
pub fn cache_key(uri: &str) -> String {
    let path = uri.split(['?', '#']).next().unwrap_or(uri);
    let base = path.rsplit('/').next().unwrap_or("");

    let lower = base.to_ascii_lowercase();
    if ARCHIVE_SUFFIXES
        .iter()
        .any(|sfx| lower.len() > sfx.len() && lower.ends_with(sfx))
    {
        return base.to_string();
    }

    format!("image-{}.img", &sha256_str(uri)[..16])
}

pub struct ImageCache<F: Fetcher> {
    dir: PathBuf,
    min_size: u64,
    fetcher: F,
}

impl<F: Fetcher> ImageCache<F> {
    pub fn new<P: AsRef<Path>>(dir: P, fetcher: F) -> ImageCache<F> {
        ImageCache {
            dir: dir.as_ref().to_path_buf(),
            min_size: MIN_IMAGE_BYTES,
            fetcher,
        }
    }

    pub fn with_min_size(mut self, min_size: u64) -> ImageCache<F> {
        self.min_size = min_size;
        self
    }

    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    /**
     * Produce a validated local image file for this source, downloading it if
     * we do not already have a good copy.
     */
    pub fn resolve(
        &self,
        log: &Logger,
        source: &ImageSource,
        force_refresh: bool,
    ) -> Result<ImageArtifact> {
        match source {
            ImageSource::Local(path) => {
                info!(log, "using local image {}", path.display());
                self.inspect(log, path, source).with_context(|| {
                    format!("local image {} failed validation", path.display())
                })
            }
            ImageSource::Remote(url) => {
                self.resolve_remote(log, url, source, force_refresh)
            }
        }
    }

    fn resolve_remote(
        &self,
        log: &Logger,
        url: &str,
        source: &ImageSource,
        force_refresh: bool,
    ) -> Result<ImageArtifact> {
        ensure_dir(log, &self.dir, 0o755)?;

        let slot = self.dir.join(cache_key(url));
        info!(log, "cache slot for {} is {}", url, slot.display());

        /*
         * A validation failure is worth exactly one fresh download.  If the
         * cached copy was the thing that failed, that download is the retry.
         */
        let mut retries = 1;

        if exists_file(&slot)? {
            if force_refresh {
                info!(log, "refresh requested, discarding cached image");
                self.evict(log, &slot)?;
            } else {
                match self.inspect(log, &slot, source) {
                    Ok(artifact) => {
                        info!(log, "reusing cached image {}", slot.display());
                        return Ok(artifact);
                    }
                    Err(e) => {
                        warn!(log, "cached image rejected: {:#}", e);
                        self.evict(log, &slot)?;
                        retries = 0;
                    }
                }
            }
        }

        loop {
            self.download(log, url, &slot)?;

            match self.inspect(log, &slot, source) {
                Ok(artifact) => return Ok(artifact),
                Err(e) => {
                    self.evict(log, &slot)?;
                    if retries == 0 {
                        return Err(e.context(format!(
                            "image from {} failed validation",
                            url
                        )));
                    }
                    warn!(log, "downloaded image rejected, retrying: {:#}", e);
                    retries -= 1;
                }
            }
        }
    }

    /**
     * Check whether a file is an acceptable image for this source.  Every
     * predicate must pass; the reason for a rejection is logged.
     */
    pub fn validate<P: AsRef<Path>>(
        &self,
        log: &Logger,
        path: P,
        source: &ImageSource,
    ) -> bool {
        match self.inspect(log, path.as_ref(), source) {
            Ok(_) => true,
            Err(e) => {
                warn!(log, "image validation failed: {:#}", e);
                false
            }
        }
    }

    fn inspect(
        &self,
        log: &Logger,
        path: &Path,
        source: &ImageSource,
    ) -> Result<ImageArtifact> {
        if !exists_file(path)? {
            bail!("{} does not exist", path.display());
        }

        let size = std::fs::metadata(path)?.len();
        if size == 0 {
            bail!("{} is empty", path.display());
        }
        if size < self.min_size {
            bail!(
                "{} is {} bytes, smaller than the {} byte minimum",
                path.display(),
                size,
                self.min_size
            );
        }

        let compression = match CompressionFormat::detect(path)? {
            Some(c) => c,
            None => bail!("{} is not a recognised archive", path.display()),
        };

        /*
         * If a checksum is available, the check becomes cryptographic rather
         * than heuristic.  Not every publisher provides one, so its absence
         * is not a failure.
         */
        let sha256 = match self.checksum_for(log, path, source) {
            Some(record) => {
                info!(log, "verifying SHA-256 of {}", path.display());
                let actual = sha256_file(path)?;
                if !record.matches(&actual) {
                    bail!(
                        "checksum mismatch for {}: expected {}, got {}",
                        path.display(),
                        record.expected_sha256,
                        actual
                    );
                }
                info!(log, "checksum ok"; "sha256" => &actual);
                Some(actual)
            }
            None => {
                warn!(
                    log,
                    "no checksum available for {}; basic checks only", source
                );
                None
            }
        };

        Ok(ImageArtifact {
            source: source.to_string(),
            local_cache_path: path.to_path_buf(),
            size_bytes: size,
            sha256,
            compression,
        })
    }

    /**
     * Locate the expected checksum for an image.  For a remote source we ask
     * the server again (it is independent of the cached bytes) and fall back
     * on the sidecar we stored at download time.  A local image may have a
     * sidecar sitting next to it.
     */
    fn checksum_for(
        &self,
        log: &Logger,
        path: &Path,
        source: &ImageSource,
    ) -> Option<ChecksumRecord> {
        if let ImageSource::Remote(url) = source {
            if let Some(record) = self.fetch_checksum(log, url) {
                return Some(record);
            }
        }

        match read_file(sidecar_path(path)) {
            Ok(Some(text)) => {
                let record = ChecksumRecord::parse(&text);
                if record.is_none() {
                    warn!(log, "ignoring malformed sidecar for {}", path.display());
                }
                record
            }
            Ok(None) => None,
            Err(e) => {
                warn!(log, "reading sidecar for {}: {:#}", path.display(), e);
                None
            }
        }
    }

    fn fetch_checksum(&self, log: &Logger, url: &str) -> Option<ChecksumRecord> {
        let curl = checksum_url(url);
        match self.fetcher.fetch_text(log, &curl) {
            Ok(Some(text)) => {
                let record = ChecksumRecord::parse(&text);
                if record.is_none() {
                    warn!(log, "ignoring malformed checksum file {}", curl);
                }
                record
            }
            Ok(None) => {
                info!(log, "no checksum published at {}", curl);
                None
            }
            Err(e) => {
                warn!(log, "checksum fetch failed: {:#}", e);
                None
            }
        }
    }

    /**
     * Download into a temporary file in the cache directory, and only move it
     * into the slot once it has passed the size check.  If anything goes wrong
     * the temporary file is removed when it is dropped.
     */
    fn download(&self, log: &Logger, url: &str, slot: &Path) -> Result<()> {
        let sidecar = sidecar_path(slot);
        remove_file_maybe(&sidecar)?;

        let mut tmp = tempfile::Builder::new()
            .prefix(".download-")
            .tempfile_in(&self.dir)?;

        let n = {
            let mut w = BufWriter::new(tmp.as_file_mut());
            let n = self.fetcher.download(log, url, &mut w)?;
            w.flush()?;
            n
        };

        if n < self.min_size {
            bail!(
                "download of {} was only {} bytes, expected at least {}",
                url,
                n,
                self.min_size
            );
        }

        tmp.as_file().sync_all()?;
        tmp.persist(slot)
            .with_context(|| format!("move download into {}", slot.display()))?;
        info!(log, "stored {} bytes at {}", n, slot.display());

        match self.fetch_checksum(log, url) {
            Some(record) => {
                let name = slot
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                write_file(&sidecar, &record.render(&name))?;
                info!(log, "stored checksum sidecar {}", sidecar.display());
            }
            None => {
                info!(log, "no checksum sidecar stored for {}", url);
            }
        }

        Ok(())
    }

    /**
     * Remove a cached artifact and its sidecar.
     */
    pub fn evict(&self, log: &Logger, slot: &Path) -> Result<()> {
        info!(log, "evicting {}", slot.display());
        remove_file_maybe(slot)?;
        remove_file_maybe(sidecar_path(slot))?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::cell::{Cell, RefCell};

    const FLOOR: u64 = 4096;

    struct FakeFetcher {
        image: RefCell<Vec<u8>>,
        checksum: RefCell<Option<String>>,
        fail_download: bool,
        downloads: Cell<u32>,
        text_fetches: Cell<u32>,
    }

    impl FakeFetcher {
        fn new(image: Vec<u8>, checksum: Option<String>) -> FakeFetcher {
            FakeFetcher {
                image: RefCell::new(image),
                checksum: RefCell::new(checksum),
                fail_download: false,
                downloads: Cell::new(0),
                text_fetches: Cell::new(0),
            }
        }
    }

    impl Fetcher for FakeFetcher {
        fn download(
            &self,
            _log: &Logger,
            _url: &str,
            out: &mut dyn Write,
        ) -> Result<u64> {
            self.downloads.set(self.downloads.get() + 1);
            let image = self.image.borrow();
            /*
             * Emit part of the body before failing, to show that a partial
             * transfer never reaches the cache slot.
             */
            if self.fail_download {
                out.write_all(&image[..image.len() / 2])?;
                bail!("connection reset by peer");
            }
            out.write_all(&image)?;
            Ok(image.len() as u64)
        }

        fn fetch_text(&self, _log: &Logger, url: &str) -> Result<Option<String>> {
            assert!(url.ends_with(".sha256"));
            self.text_fetches.set(self.text_fetches.get() + 1);
            Ok(self.checksum.borrow().clone())
        }
    }

    fn xz_image(len: usize, fill: u8) -> Vec<u8> {
        let mut v = vec![0xFD, b'7', b'z', b'X', b'Z', 0x00];
        v.resize(len, fill);
        v
    }

    fn digest(data: &[u8]) -> String {
        use sha2::{Digest, Sha256};
        hex::encode(Sha256::digest(data))
    }

    fn listing(dir: &Path) -> Vec<String> {
        let mut v: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        v.sort();
        v
    }

    const URL: &str = "https://downloads.example.com/images/hubos-2026-01.img.xz";

    #[test]
    fn cache_key_uses_archive_basename() {
        for (url, key) in [
            (URL, "hubos-2026-01.img.xz"),
            ("https://example.com/a/b/os.zip?token=abc", "os.zip"),
            ("https://example.com/os.img.gz#frag", "os.img.gz"),
            ("https://example.com/RaspiOS.IMG.XZ", "RaspiOS.IMG.XZ"),
        ] {
            assert_eq!(cache_key(url), key);
            assert_eq!(cache_key(url), cache_key(url));
        }
    }

    #[test]
    fn cache_key_hashes_other_uris() {
        let latest = "https://downloads.example.com/hubos_lite_arm64_latest";
        let k = cache_key(latest);
        assert!(k.starts_with("image-"));
        assert!(k.ends_with(".img"));
        let hash = &k["image-".len()..k.len() - ".img".len()];
        assert_eq!(hash.len(), 16);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));

        assert_eq!(k, cache_key(latest));
        assert_ne!(k, cache_key("https://downloads.example.com/other_latest"));
        assert_ne!(
            cache_key("https://example.com/latest?v=1"),
            cache_key("https://example.com/latest?v=2")
        );

        /*
         * A bare suffix is not a file name:
         */
        assert!(cache_key("https://example.com/.xz").starts_with("image-"));
        assert!(cache_key("https://example.com/").starts_with("image-"));
    }

    #[test]
    fn first_run_downloads_then_reuses() -> Result<()> {
        let log = init_log();
        let dir = tempfile::tempdir()?;
        let image = xz_image(8192, 7);
        let sum = format!("{}  hubos-2026-01.img.xz\n", digest(&image));
        let cache = ImageCache::new(dir.path(), FakeFetcher::new(image, Some(sum)))
            .with_min_size(FLOOR);
        let source = ImageSource::parse(URL);

        let a = cache.resolve(&log, &source, false)?;
        assert_eq!(cache.fetcher().downloads.get(), 1);
        assert_eq!(a.local_cache_path, dir.path().join("hubos-2026-01.img.xz"));
        assert_eq!(a.size_bytes, 8192);
        assert_eq!(a.compression, CompressionFormat::Xz);
        assert!(a.sha256.is_some());
        assert_eq!(
            listing(dir.path()),
            vec!["hubos-2026-01.img.xz", "hubos-2026-01.img.xz.sha256"]
        );

        let b = cache.resolve(&log, &source, false)?;
        assert_eq!(cache.fetcher().downloads.get(), 1);
        assert_eq!(a.local_cache_path, b.local_cache_path);
        assert_eq!(a.sha256, b.sha256);
        Ok(())
    }

    #[test]
    fn validate_is_idempotent() -> Result<()> {
        let log = init_log();
        let dir = tempfile::tempdir()?;
        let image = xz_image(8192, 1);
        let sum = digest(&image);
        let cache = ImageCache::new(dir.path(), FakeFetcher::new(image, Some(sum)))
            .with_min_size(FLOOR);
        let source = ImageSource::parse(URL);
        let a = cache.resolve(&log, &source, false)?;

        let first = cache.validate(&log, &a.local_cache_path, &source);
        let second = cache.validate(&log, &a.local_cache_path, &source);
        assert!(first);
        assert_eq!(first, second);
        assert_eq!(cache.fetcher().downloads.get(), 1);
        Ok(())
    }

    #[test]
    fn size_floor_beats_magic() -> Result<()> {
        let log = init_log();
        let dir = tempfile::tempdir()?;
        let p = dir.path().join("small.img.xz");
        std::fs::write(&p, xz_image(FLOOR as usize - 1, 0))?;

        let cache = ImageCache::new(dir.path(), FakeFetcher::new(vec![], None))
            .with_min_size(FLOOR);
        assert!(!cache.validate(&log, &p, &ImageSource::parse(URL)));

        std::fs::write(&p, xz_image(FLOOR as usize, 0))?;
        assert!(cache.validate(&log, &p, &ImageSource::parse(URL)));
        Ok(())
    }

    #[test]
    fn unrecognised_format_rejected() -> Result<()> {
        let log = init_log();
        let dir = tempfile::tempdir()?;
        let p = dir.path().join("page.img.xz");
        let mut html = b"<!DOCTYPE html>".to_vec();
        html.resize(FLOOR as usize * 2, b' ');
        std::fs::write(&p, html)?;

        let cache = ImageCache::new(dir.path(), FakeFetcher::new(vec![], None))
            .with_min_size(FLOOR);
        assert!(!cache.validate(&log, &p, &ImageSource::parse(URL)));
        assert!(!cache.validate(&log, dir.path().join("absent"), &ImageSource::parse(URL)));
        Ok(())
    }

    #[test]
    fn checksum_mismatch_rejected_despite_heuristics() -> Result<()> {
        let log = init_log();
        let dir = tempfile::tempdir()?;
        let p = dir.path().join("hubos-2026-01.img.xz");
        std::fs::write(&p, xz_image(8192, 3))?;

        let wrong = digest(&xz_image(8192, 4));
        let cache = ImageCache::new(dir.path(), FakeFetcher::new(vec![], Some(wrong)))
            .with_min_size(FLOOR);
        assert!(!cache.validate(&log, &p, &ImageSource::parse(URL)));
        Ok(())
    }

    #[test]
    fn mismatched_cache_is_evicted_and_fetched_again() -> Result<()> {
        let log = init_log();
        let dir = tempfile::tempdir()?;
        let good = xz_image(8192, 5);
        let slot = dir.path().join("hubos-2026-01.img.xz");
        std::fs::write(&slot, xz_image(8192, 6))?;
        std::fs::write(sidecar_path(&slot), "stale")?;

        let cache = ImageCache::new(
            dir.path(),
            FakeFetcher::new(good.clone(), Some(digest(&good))),
        )
        .with_min_size(FLOOR);

        let a = cache.resolve(&log, &ImageSource::parse(URL), false)?;
        assert_eq!(cache.fetcher().downloads.get(), 1);
        assert_eq!(std::fs::read(&a.local_cache_path)?, good);
        let sidecar = std::fs::read_to_string(sidecar_path(&slot))?;
        assert!(sidecar.starts_with(&digest(&good)));
        Ok(())
    }

    #[test]
    fn persistent_mismatch_gives_up_after_one_download() -> Result<()> {
        let log = init_log();
        let dir = tempfile::tempdir()?;
        let slot = dir.path().join("hubos-2026-01.img.xz");
        std::fs::write(&slot, xz_image(8192, 6))?;
        std::fs::write(sidecar_path(&slot), digest(b"something else"))?;

        let cache = ImageCache::new(
            dir.path(),
            FakeFetcher::new(xz_image(8192, 8), Some(digest(b"never matches"))),
        )
        .with_min_size(FLOOR);

        assert!(cache.resolve(&log, &ImageSource::parse(URL), false).is_err());
        assert_eq!(cache.fetcher().downloads.get(), 1);
        assert!(listing(dir.path()).is_empty());
        Ok(())
    }

    #[test]
    fn bad_fresh_download_is_retried_once() -> Result<()> {
        let log = init_log();
        let dir = tempfile::tempdir()?;
        let cache = ImageCache::new(
            dir.path(),
            FakeFetcher::new(xz_image(8192, 8), Some(digest(b"never matches"))),
        )
        .with_min_size(FLOOR);

        assert!(cache.resolve(&log, &ImageSource::parse(URL), false).is_err());
        assert_eq!(cache.fetcher().downloads.get(), 2);
        assert!(listing(dir.path()).is_empty());
        Ok(())
    }

    #[test]
    fn failed_download_leaves_nothing_behind() -> Result<()> {
        let log = init_log();
        let dir = tempfile::tempdir()?;
        let mut f = FakeFetcher::new(xz_image(8192, 2), None);
        f.fail_download = true;
        let cache = ImageCache::new(dir.path(), f).with_min_size(FLOOR);

        assert!(cache.resolve(&log, &ImageSource::parse(URL), false).is_err());
        assert_eq!(cache.fetcher().downloads.get(), 1);
        assert!(listing(dir.path()).is_empty());
        Ok(())
    }

    #[test]
    fn short_download_is_not_cached() -> Result<()> {
        let log = init_log();
        let dir = tempfile::tempdir()?;
        let cache = ImageCache::new(
            dir.path(),
            FakeFetcher::new(xz_image(FLOOR as usize / 2, 0), None),
        )
        .with_min_size(FLOOR);

        assert!(cache.resolve(&log, &ImageSource::parse(URL), false).is_err());
        assert!(listing(dir.path()).is_empty());
        Ok(())
    }

    #[test]
    fn missing_checksum_degrades_to_basic_checks() -> Result<()> {
        let log = init_log();
        let dir = tempfile::tempdir()?;
        let cache = ImageCache::new(dir.path(), FakeFetcher::new(xz_image(8192, 9), None))
            .with_min_size(FLOOR);

        let a = cache.resolve(&log, &ImageSource::parse(URL), false)?;
        assert!(a.sha256.is_none());
        assert_eq!(listing(dir.path()), vec!["hubos-2026-01.img.xz"]);
        Ok(())
    }

    #[test]
    fn stored_sidecar_used_when_server_is_silent() -> Result<()> {
        let log = init_log();
        let dir = tempfile::tempdir()?;
        let image = xz_image(8192, 9);
        let cache = ImageCache::new(
            dir.path(),
            FakeFetcher::new(image.clone(), Some(digest(&image))),
        )
        .with_min_size(FLOOR);
        let source = ImageSource::parse(URL);
        let a = cache.resolve(&log, &source, false)?;

        /*
         * The server stops publishing checksums, and the cached bytes are
         * then damaged: the sidecar from download time still catches it.
         */
        *cache.fetcher().checksum.borrow_mut() = None;
        assert!(cache.validate(&log, &a.local_cache_path, &source));
        std::fs::write(&a.local_cache_path, xz_image(8192, 10))?;
        assert!(!cache.validate(&log, &a.local_cache_path, &source));
        Ok(())
    }

    #[test]
    fn force_refresh_downloads_again() -> Result<()> {
        let log = init_log();
        let dir = tempfile::tempdir()?;
        let cache = ImageCache::new(dir.path(), FakeFetcher::new(xz_image(8192, 9), None))
            .with_min_size(FLOOR);
        let source = ImageSource::parse(URL);

        cache.resolve(&log, &source, false)?;
        cache.resolve(&log, &source, true)?;
        assert_eq!(cache.fetcher().downloads.get(), 2);
        Ok(())
    }

    #[test]
    fn local_images_are_checked_in_place() -> Result<()> {
        let log = init_log();
        let dir = tempfile::tempdir()?;
        let cache_dir = dir.path().join("cache");
        let p = dir.path().join("mine.img.gz");
        let mut gz = vec![0x1F, 0x8B];
        gz.resize(8192, 0);
        std::fs::write(&p, &gz)?;

        let cache = ImageCache::new(&cache_dir, FakeFetcher::new(vec![], None))
            .with_min_size(FLOOR);
        let source = ImageSource::Local(p.clone());

        let a = cache.resolve(&log, &source, false)?;
        assert_eq!(a.local_cache_path, p);
        assert_eq!(a.compression, CompressionFormat::Gzip);
        assert_eq!(cache.fetcher().downloads.get(), 0);
        assert_eq!(cache.fetcher().text_fetches.get(), 0);
        assert!(!cache_dir.exists());

        std::fs::write(sidecar_path(&p), digest(b"not this image"))?;
        assert!(cache.resolve(&log, &source, false).is_err());
        assert!(p.exists(), "local images are never evicted");
        Ok(())
    }
}
