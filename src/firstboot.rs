/*
 * Copyright 2026 Oxide Computer Company
 */

use std::time::Duration;

use hubprovision::agent::system::HostSystem;
use hubprovision::agent::{Agent, AgentPaths};
use hubprovision::bootfs::DEVICE_BOOT_DIR;
use hubprovision::common::*;
use hubprovision::file::read_toml;
use hubprovision::profile::AgentConfig;

const DEFAULT_LOG: &str = "/var/log/hubprovision-firstboot.log";

fn options() -> getopts::Options {
    let mut opts = getopts::Options::new();
    opts.optopt("b", "boot-dir", "where the boot partition is mounted", "DIR");
    opts.optopt("l", "log", "append-only log file", "FILE");
    opts.optflag("", "no-reboot", "do not reboot once provisioning is done");
    opts.optflag("F", "force", "run even when not started by systemd");
    opts.optflag("h", "help", "print this message");
    opts
}

fn usage(opts: &getopts::Options) {
    println!("{}", opts.usage("Usage: hub-firstboot [OPTIONS]"));
}

fn main() {
    let opts = options();
    let mat = match opts.parse(std::env::args().skip(1)) {
        Ok(mat) => mat,
        Err(e) => {
            usage(&opts);
            error!(init_log(), "invalid options: {}", e);
            std::process::exit(1);
        }
    };
    if mat.opt_present("h") {
        usage(&opts);
        std::process::exit(0);
    }

    let logfile = mat.opt_str("l").unwrap_or_else(|| DEFAULT_LOG.to_string());
    let log = match init_log_with_file(&logfile) {
        Ok(log) => log,
        Err(e) => {
            let log = init_log();
            warn!(log, "console only, no log file: {:?}", e);
            log
        }
    };

    match run(&log, &mat) {
        Ok(true) => {
            info!(log, "ok, provisioning complete");
            std::process::exit(0);
        }
        Ok(false) => {
            error!(log, "provisioning failed; see {}", logfile);
            std::process::exit(1);
        }
        Err(e) => {
            error!(log, "fatal error: {:?}", e);
            std::process::exit(1);
        }
    }
}

fn run(log: &Logger, mat: &getopts::Matches) -> Result<bool> {
    /*
     * This program reconfigures the whole machine.  Try to ensure it has at
     * least been started by systemd, as the first-boot unit would:
     */
    if let Some(id) = std::env::var_os("INVOCATION_ID") {
        info!(log, "systemd invocation: {}", id.to_string_lossy());
    } else if mat.opt_present("F") {
        warn!(log, "not running under systemd, but --force was given");
    } else {
        bail!("INVOCATION_ID is not set; running under systemd?");
    }

    let boot = mat.opt_str("b").unwrap_or_else(|| DEVICE_BOOT_DIR.to_string());
    let paths = AgentPaths::device(&boot);

    let cfgpath = paths.boot.agent_config();
    let config: AgentConfig = match read_toml(&cfgpath)? {
        Some(c) => c,
        None => bail!("agent configuration {} not found", cfgpath.display()),
    };
    info!(log, "agent configuration from {}", cfgpath.display();
        "user" => &config.username,
        "repository" => &config.repository.uri,
        "branch" => &config.repository.branch,
        "timeout" => config.command_timeout_secs);

    let sys = HostSystem::new(Duration::from_secs(config.command_timeout_secs));
    let report = Agent::new(&sys, &config, &paths)
        .reboot(!mat.opt_present("no-reboot"))
        .run(log)?;

    info!(log, "run report written to {}", paths.report().display());
    Ok(report.succeeded())
}
