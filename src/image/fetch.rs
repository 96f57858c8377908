/*
 * Copyright 2026 Oxide Computer Company
 */

use std::io::Write;
use std::time::Duration;

use crate::common::*;

/**
 * Remote access used by the image cache.  The HTTP implementation is the only
 * one used in production; tests substitute their own.
 */
pub trait Fetcher {
    /**
     * Stream the body at "url" into "out", returning the number of bytes
     * written.  Any transport failure or non-success status is an error.
     */
    fn download(&self, log: &Logger, url: &str, out: &mut dyn Write) -> Result<u64>;

    /**
     * Fetch a small text document.  Returns None if the server says it does
     * not exist.
     */
    fn fetch_text(&self, log: &Logger, url: &str) -> Result<Option<String>>;
}

pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<HttpFetcher> {
        /*
         * There is deliberately no overall request timeout: an OS image is
         * large and a slow link may legitimately take a long time.  Stalled
         * connections are left to the transport.
         */
        let client = reqwest::blocking::ClientBuilder::new()
            .connect_timeout(Duration::from_secs(30))
            .timeout(None)
            .user_agent(concat!("hubprovision/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(HttpFetcher { client })
    }
}

impl Fetcher for HttpFetcher {
    fn download(&self, log: &Logger, url: &str, out: &mut dyn Write) -> Result<u64> {
        info!(log, "GET {}", url);
        let mut res = self
            .client
            .get(url)
            .send()
            .with_context(|| format!("download {}", url))?;

        if !res.status().is_success() {
            bail!("download {}: bad status {}", url, res.status());
        }

        if let Some(len) = res.content_length() {
            info!(log, "expecting {} bytes", len);
        }

        let n = res.copy_to(out).with_context(|| format!("download {}", url))?;
        info!(log, "downloaded {} bytes from {}", n, url);
        Ok(n)
    }

    fn fetch_text(&self, log: &Logger, url: &str) -> Result<Option<String>> {
        debug!(log, "GET {}", url);
        let res = self
            .client
            .get(url)
            .timeout(Duration::from_secs(60))
            .send()
            .with_context(|| format!("fetch {}", url))?;

        if res.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !res.status().is_success() {
            bail!("fetch {}: bad status {}", url, res.status());
        }

        Ok(Some(res.text()?))
    }
}
