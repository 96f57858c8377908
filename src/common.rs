/*
 * Copyright 2026 Oxide Computer Company
 */

use atty::Stream;
use slog::Drain;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

pub use anyhow::{anyhow, bail, Context, Result};
pub use slog::{debug, error, info, o, trace, warn, Logger};

/**
 * Initialise a logger which writes to stdout, and which does the right thing on
 * both an interactive terminal and when stdout is not a tty.
 */
pub fn init_log() -> Logger {
    let dec = slog_term::TermDecorator::new().stdout().build();
    if atty::is(Stream::Stdout) {
        let dr = Mutex::new(slog_term::CompactFormat::new(dec).build()).fuse();
        slog::Logger::root(dr, o!())
    } else {
        let dr = Mutex::new(
            slog_term::FullFormat::new(dec).use_original_order().build(),
        )
        .fuse();
        slog::Logger::root(dr, o!())
    }
}

/**
 * Initialise a logger which writes every record both to the console (as per
 * init_log()) and to an append-only file.  On the target device nobody is
 * watching the console, so the file is the only record of what happened.
 */
pub fn init_log_with_file<P: AsRef<Path>>(path: P) -> Result<Logger> {
    let path = path.as_ref();
    let f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open log file {}", path.display()))?;

    let file = Mutex::new(
        slog_term::FullFormat::new(slog_term::PlainDecorator::new(f))
            .use_original_order()
            .build(),
    )
    .ignore_res();

    /*
     * A Logger is itself a Drain, so the console half can reuse whatever
     * init_log() decided about the terminal.
     */
    let term = init_log();

    Ok(slog::Logger::root(slog::Duplicate::new(term, file).ignore_res(), o!()))
}

pub trait OutputExt {
    fn info(&self) -> String;
}

impl OutputExt for std::process::Output {
    fn info(&self) -> String {
        render_output(self.status.code(), &self.stdout, &self.stderr)
    }
}

/**
 * Produce a short description of a finished command: the exit code, and then
 * whatever it had to say about the failure.
 */
pub fn render_output(code: Option<i32>, stdout: &[u8], stderr: &[u8]) -> String {
    let mut out = String::new();

    if let Some(code) = code {
        out.push_str(&format!("exit code {}", code));
    }

    /*
     * Attempt to render stderr from the command:
     */
    let stderr = String::from_utf8_lossy(stderr).trim().to_string();
    let extra = if stderr.is_empty() {
        /*
         * If there is no stderr output, this command might emit its
         * failure message on stdout:
         */
        String::from_utf8_lossy(stdout).trim().to_string()
    } else {
        stderr
    };

    if !extra.is_empty() {
        if !out.is_empty() {
            out.push_str(": ");
        }
        out.push_str(&extra);
    }

    out
}

pub fn sleep(ms: u64) {
    std::thread::sleep(std::time::Duration::from_millis(ms));
}
