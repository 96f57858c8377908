/*
 * Copyright 2026 Oxide Computer Company
 */

use std::path::PathBuf;

use hubprovision::bootfs::{self, BootLayout};
use hubprovision::common::*;
use hubprovision::image::cache::ImageCache;
use hubprovision::image::fetch::HttpFetcher;
use hubprovision::image::ImageSource;
use hubprovision::media;
use hubprovision::profile::{hash_password, ProfileInputs, ProvisioningProfile};
use hubprovision::trigger;

/*
 * The current Raspberry Pi OS Lite (64-bit) release.  This URL redirects to
 * a dated .img.xz file and carries no suffix of its own, so it is cached
 * under a name derived from the URL itself.
 */
const DEFAULT_IMAGE: &str =
    "https://downloads.raspberrypi.com/raspios_lite_arm64_latest";

fn options() -> getopts::Options {
    let mut opts = getopts::Options::new();
    opts.optopt("i", "image", "OS image URL or local file", "SOURCE");
    opts.optopt("d", "device", "target block device (required)", "DEVICE");
    opts.optopt("u", "user", "OS user name", "USER");
    opts.optopt("p", "password", "OS user password", "PASSWORD");
    opts.optopt("P", "password-hash", "pre-hashed OS user password", "HASH");
    opts.optopt("", "wifi-ssid", "Wi-Fi network name", "SSID");
    opts.optopt("", "wifi-password", "Wi-Fi passphrase", "PSK");
    opts.optopt("", "wifi-country", "Wi-Fi regulatory country", "CC");
    opts.optopt("r", "repo", "workload repository URI", "URI");
    opts.optopt("b", "branch", "workload repository branch", "BRANCH");
    opts.optopt("k", "deploy-key", "repository deploy key (required)", "FILE");
    opts.optopt("", "runtime-version", "container runtime version", "VERSION");
    opts.optmulti("w", "workload", "workload to start, in order", "NAME");
    opts.optopt("", "command-timeout", "per-command timeout on the device", "SECS");
    opts.optopt("c", "cache-dir", "image cache directory", "DIR");
    opts.optflag("f", "force-refresh", "download the image even if cached");
    opts.optopt("", "agent", "agent binary to stage for the device", "FILE");
    opts.optflag("h", "help", "print this message");
    opts
}

fn usage(opts: &getopts::Options) {
    let s = opts.usage("Usage: hub-prepare -d DEVICE -k DEPLOY_KEY [OPTIONS]");
    println!("{}", s);
}

fn main() {
    let log = init_log();
    let opts = options();

    let mat = match opts.parse(std::env::args().skip(1)) {
        Ok(mat) => mat,
        Err(e) => {
            usage(&opts);
            error!(log, "invalid options: {}", e);
            std::process::exit(1);
        }
    };
    if mat.opt_present("h") {
        usage(&opts);
        std::process::exit(0);
    }

    match run(&log, &mat) {
        Ok(()) => {
            info!(log, "ok, boot media prepared");
            std::process::exit(0);
        }
        Err(e) => {
            error!(log, "fatal error: {:?}", e);
            std::process::exit(1);
        }
    }
}

fn cache_dir(mat: &getopts::Matches) -> Result<PathBuf> {
    if let Some(dir) = mat.opt_str("c") {
        return Ok(PathBuf::from(dir));
    }
    if let Some(xdg) = std::env::var_os("XDG_CACHE_HOME") {
        return Ok(PathBuf::from(xdg).join("hubprovision"));
    }
    match std::env::var_os("HOME") {
        Some(home) => Ok(PathBuf::from(home).join(".cache").join("hubprovision")),
        None => bail!("cannot find a cache directory; use --cache-dir"),
    }
}

fn inputs(mat: &getopts::Matches) -> Result<ProfileInputs> {
    let command_timeout_secs = match mat.opt_str("command-timeout") {
        Some(s) => Some(
            s.parse::<u64>()
                .with_context(|| format!("invalid --command-timeout {:?}", s))?,
        ),
        None => None,
    };

    Ok(ProfileInputs {
        username: mat.opt_str("u"),
        password: mat.opt_str("p"),
        password_hash: mat.opt_str("P"),
        wifi_ssid: mat.opt_str("wifi-ssid"),
        wifi_password: mat.opt_str("wifi-password"),
        wifi_country: mat.opt_str("wifi-country"),
        repository: mat.opt_str("r"),
        branch: mat.opt_str("b"),
        deploy_key: mat.opt_str("k").map(PathBuf::from),
        runtime_version: mat.opt_str("runtime-version"),
        workloads: mat.opt_strs("w"),
        command_timeout_secs,
    })
}

fn run(log: &Logger, mat: &getopts::Matches) -> Result<()> {
    if !mat.free.is_empty() {
        bail!("unexpected arguments: {}", mat.free.join(" "));
    }

    /*
     * Check everything the operator told us before touching anything.
     */
    let device = match mat.opt_str("d") {
        Some(d) => d,
        None => bail!("a target device (--device) is required"),
    };
    let agent = mat.opt_str("agent").map(PathBuf::from);
    if let Some(a) = &agent {
        if !hubprovision::file::exists_file(a)? {
            bail!("agent binary {} not found", a.display());
        }
    }
    let profile = ProvisioningProfile::build(&inputs(mat)?, |pw| {
        hash_password(log, pw)
    })?;
    info!(log, "provisioning profile";
        "user" => &profile.os_username,
        "repository" => &profile.repository_uri,
        "branch" => &profile.repository_branch,
        "workloads" => profile.workloads.join(","),
        "wifi" => profile.wifi.is_some());

    let target = media::check_target(log, &device)?;
    info!(log, "target device: {}", target);

    /*
     * Obtain a verified image.  This can take a long time, so do it before
     * asking for confirmation rather than after.
     */
    let source =
        ImageSource::parse(mat.opt_str("i").as_deref().unwrap_or(DEFAULT_IMAGE));
    let cache = ImageCache::new(cache_dir(mat)?, HttpFetcher::new()?);
    let image = cache.resolve(log, &source, mat.opt_present("f"))?;
    info!(log, "image ready: {}", image.local_cache_path.display();
        "size" => image.size_bytes,
        "compression" => ?image.compression,
        "sha256" => image.sha256.as_deref().unwrap_or("unverified"));

    if !media::confirm(std::io::stdin().lock(), std::io::stdout(), &target)? {
        bail!("aborted; {} was not modified", target.path);
    }

    media::unmount_all(log, &target.path)?;
    media::write_image(log, &image.local_cache_path, image.compression, &target.path)?;

    let part = media::partition_path(&target.path, 1);
    media::wait_for_device(log, &part)?;
    let mnt = media::Mounted::vfat(log, &part)?;
    let layout = BootLayout::new(mnt.path());

    bootfs::stage(log, &layout, &profile, agent.as_deref())?;
    if !trigger::is_staged(&layout)? {
        bail!("first-boot trigger is missing after staging");
    }

    mnt.unmount()?;
    info!(log, "{} is ready; move it to the hub and power on", target.path);

    Ok(())
}
