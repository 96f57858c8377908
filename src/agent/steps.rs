/*
 * Copyright 2026 Oxide Computer Company
 */

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::pipeline::{Fatality, Idempotency, Phase, Step, StepOutcome};
use super::state::RunState;
use super::system::{Exec, System};
use super::Agent;
use crate::bootfs::NM_CONNECTION_ID;
use crate::common::*;
use crate::file::{
    ensure_dir, exists_dir, exists_file, read_file, remove_file_maybe,
    write_file, write_file_mode, zero_and_remove,
};
use crate::trigger;

const CONNECTIVITY_PROBE: &str = "deb.debian.org";
const DOCKER_INSTALLER: &str = "https://get.docker.com";

/*
 * Names docker compose itself looks for, in its own order of preference.
 */
pub const DESCRIPTORS: &[&str] = &[
    "compose.yaml",
    "compose.yml",
    "docker-compose.yaml",
    "docker-compose.yml",
];

pub fn all<'a, S: System>() -> Vec<Step<Agent<'a, S>>> {
    vec![
        Step {
            name: "network",
            phase: Phase::Prefix,
            idempotency: Idempotency::AlwaysSafeToRepeat,
            fatality: Fatality::WarnAndContinue,
            enters: None,
            reaches: Some(RunState::NetworkReady),
            action: network::<S>,
        },
        Step {
            name: "runtime",
            phase: Phase::Prefix,
            idempotency: Idempotency::InstallIfAbsent,
            fatality: Fatality::Fatal,
            enters: None,
            reaches: Some(RunState::RuntimeInstalled),
            action: runtime::<S>,
        },
        Step {
            name: "credentials",
            phase: Phase::Prefix,
            idempotency: Idempotency::AlwaysSafeToRepeat,
            fatality: Fatality::Fatal,
            enters: None,
            reaches: None,
            action: credentials::<S>,
        },
        Step {
            name: "source",
            phase: Phase::Prefix,
            idempotency: Idempotency::AlwaysSafeToRepeat,
            fatality: Fatality::Fatal,
            enters: None,
            reaches: Some(RunState::SourceRetrieved),
            action: source::<S>,
        },
        Step {
            name: "prefetch",
            phase: Phase::FanOut,
            idempotency: Idempotency::AlwaysSafeToRepeat,
            fatality: Fatality::WarnAndContinue,
            enters: None,
            reaches: None,
            action: prefetch::<S>,
        },
        Step {
            name: "workloads",
            phase: Phase::FanOut,
            idempotency: Idempotency::AlwaysSafeToRepeat,
            fatality: Fatality::WarnAndContinue,
            enters: Some(RunState::WorkloadsStarting),
            reaches: None,
            action: workloads::<S>,
        },
        Step {
            name: "cleanup",
            phase: Phase::Suffix,
            idempotency: Idempotency::StrictOnce,
            fatality: Fatality::WarnAndContinue,
            enters: None,
            reaches: None,
            action: cleanup::<S>,
        },
        Step {
            name: "disable-and-reboot",
            phase: Phase::Suffix,
            idempotency: Idempotency::StrictOnce,
            fatality: Fatality::WarnAndContinue,
            /*
             * Entering the state writes the run report, which must be on disk
             * before we ask for the reboot.
             */
            enters: Some(RunState::Completed),
            reaches: None,
            action: reboot::<S>,
        },
    ]
}

fn online<S: System>(a: &Agent<'_, S>, log: &Logger) -> bool {
    let probe = Exec::new("ping").args(["-c", "1", "-W", "5", CONNECTIVITY_PROBE]);
    a.sys.exec(log, &probe).map(|o| o.success()).unwrap_or(false)
}

fn wait_online<S: System>(a: &Agent<'_, S>, log: &Logger) -> bool {
    for attempt in 1..=a.probe_attempts {
        if online(a, log) {
            return true;
        }
        info!(log, "waiting for network ({}/{})", attempt, a.probe_attempts);
        sleep(a.probe_interval_ms);
    }
    online(a, log)
}

fn network<S: System>(a: &mut Agent<'_, S>, log: &Logger) -> Result<StepOutcome> {
    if online(a, log) {
        return Ok(StepOutcome::Skipped("network already reachable".into()));
    }

    let mut warnings = Vec::new();
    if a.config.network.wifi {
        if let Err(e) = wifi_up(a, log) {
            warnings.push(format!("Wi-Fi bring-up failed: {:#}", e));
        }
    } else {
        info!(log, "no Wi-Fi configured; assuming wired network");
    }

    if !wait_online(a, log) {
        warnings.push("no network connectivity; continuing regardless".into());
    }
    Ok(StepOutcome::Warned(warnings))
}

fn wifi_up<S: System>(a: &Agent<'_, S>, log: &Logger) -> Result<()> {
    let staged = a.paths.boot.nm_profile();
    let profile = match read_file(&staged)? {
        Some(p) => p,
        None => bail!("Wi-Fi configured but {} is missing", staged.display()),
    };

    if !a.sys.has_command("nmcli") {
        info!(log, "installing NetworkManager");
        a.sys.check(log, &Exec::new("apt-get").arg("update"))?;
        a.sys.check(
            log,
            &Exec::new("apt-get").args(["install", "-y", "network-manager"]),
        )?;
    }

    ensure_dir(log, &a.paths.nm_connections, 0o755)?;
    let target = a.paths.installed_nm_profile();
    write_file_mode(&target, profile.as_bytes(), 0o600)?;
    info!(log, "installed Wi-Fi profile {}", target.display());

    a.sys.check(log, &Exec::new("nmcli").args(["connection", "reload"]))?;
    a.sys.check(
        log,
        &Exec::new("nmcli").args(["connection", "up", "id", NM_CONNECTION_ID]),
    )?;
    Ok(())
}

fn docker_ready<S: System>(a: &Agent<'_, S>, log: &Logger) -> bool {
    a.sys.has_command("docker")
        && a.sys
            .exec(log, &Exec::new("docker").args(["compose", "version"]))
            .map(|o| o.success())
            .unwrap_or(false)
}

fn runtime<S: System>(a: &mut Agent<'_, S>, log: &Logger) -> Result<StepOutcome> {
    let installed = if docker_ready(a, log) {
        info!(log, "container runtime already present");
        false
    } else {
        ensure_dir(log, &a.paths.state_dir, 0o755)?;
        let script = a.paths.state_dir.join("get-docker.sh");
        a.sys.check(
            log,
            &Exec::new("curl")
                .args(["-fsSL", "--retry", "3", "-o"])
                .path_arg(&script)
                .arg(DOCKER_INSTALLER),
        )?;

        let mut install = Exec::new("sh").path_arg(&script);
        if let Some(v) = &a.config.runtime.version {
            info!(log, "installing container runtime version {}", v);
            install = install.args(["--version", v.as_str()]);
        }
        a.sys.check(log, &install)?;
        remove_file_maybe(&script)?;

        if !docker_ready(a, log) {
            bail!("docker compose is still unavailable after installation");
        }
        true
    };

    /*
     * Checked on every run, so that an install which was interrupted before
     * this point is finished off next time.
     */
    let user = &a.config.username;
    let groups = a.sys.check(log, &Exec::new("id").args(["-nG", user.as_str()]))?;
    if groups.stdout_str().split_whitespace().any(|g| g == "docker") {
        info!(log, "{} is already in the docker group", user);
    } else {
        a.sys.check(
            log,
            &Exec::new("usermod").args(["-aG", "docker", user.as_str()]),
        )?;
        info!(log, "added {} to the docker group", user);
    }

    if installed {
        Ok(StepOutcome::Done)
    } else {
        Ok(StepOutcome::Skipped("container runtime already installed".into()))
    }
}

fn credentials<S: System>(
    a: &mut Agent<'_, S>,
    log: &Logger,
) -> Result<StepOutcome> {
    let boot_key = a.paths.boot.deploy_key();
    if !exists_file(&boot_key)? {
        bail!("deploy key {} is missing", boot_key.display());
    }
    let private = std::fs::read(&boot_key)
        .with_context(|| format!("read {}", boot_key.display()))?;

    ensure_dir(log, &a.paths.ssh_dir, 0o700)?;
    write_file_mode(a.paths.staged_key(), &private, 0o600)?;
    info!(log, "staged deploy key at {}", a.paths.staged_key().display());

    let mut warnings = Vec::new();
    match std::fs::read(a.paths.boot.deploy_key_pub()) {
        Ok(public) => write_file_mode(a.paths.staged_key_pub(), &public, 0o644)?,
        Err(e) => warnings.push(format!("public deploy key not staged: {}", e)),
    }
    Ok(StepOutcome::Warned(warnings))
}

fn git<S: System>(a: &Agent<'_, S>) -> Exec {
    let ssh = format!(
        "ssh -i {} -o IdentitiesOnly=yes -o StrictHostKeyChecking=accept-new",
        a.paths.staged_key().display()
    );
    Exec::new("git")
        .env("GIT_SSH_COMMAND", &ssh)
        .env("GIT_TERMINAL_PROMPT", "0")
}

fn source<S: System>(a: &mut Agent<'_, S>, log: &Logger) -> Result<StepOutcome> {
    let repo = &a.config.repository;
    let path = &repo.path;

    if exists_dir(path.join(".git"))? {
        info!(log, "updating {} from {}", path.display(), repo.uri);
        a.sys.check(
            log,
            &git(a)
                .arg("-C")
                .path_arg(path)
                .args(["remote", "set-url", "origin", repo.uri.as_str()]),
        )?;
        a.sys.check(
            log,
            &git(a).arg("-C").path_arg(path).args(["fetch", "--prune", "origin"]),
        )?;
        /*
         * The remote is the truth; anything changed on the device is lost.
         */
        a.sys.check(
            log,
            &git(a)
                .arg("-C")
                .path_arg(path)
                .args(["reset", "--hard"])
                .arg(format!("origin/{}", repo.branch)),
        )?;
    } else {
        if exists_dir(path)? {
            warn!(log, "removing {} which is not a git checkout", path.display());
            std::fs::remove_dir_all(path)?;
        }
        if let Some(parent) = path.parent() {
            ensure_dir(log, parent, 0o755)?;
        }
        info!(log, "cloning {} ({}) into {}", repo.uri, repo.branch, path.display());
        a.sys.check(
            log,
            &git(a)
                .args(["clone", "--branch", repo.branch.as_str(), repo.uri.as_str()])
                .path_arg(path),
        )?;
    }

    let mut warnings = Vec::new();
    let owner = format!("{}:", a.config.username);
    let chown = Exec::new("chown").args(["-R", owner.as_str()]).path_arg(path);
    match a.sys.exec(log, &chown) {
        Ok(o) if o.success() => (),
        Ok(o) => warnings.push(format!("could not chown {}: {}", path.display(), o.info())),
        Err(e) => warnings.push(format!("could not chown {}: {:#}", path.display(), e)),
    }
    Ok(StepOutcome::Warned(warnings))
}

/**
 * Locate the compose file for a workload, if it has one.
 */
pub fn find_descriptor<P: AsRef<Path>>(dir: P) -> Result<Option<PathBuf>> {
    for name in DESCRIPTORS {
        let p = dir.as_ref().join(name);
        if exists_file(&p)? {
            return Ok(Some(p));
        }
    }
    Ok(None)
}

#[derive(Deserialize)]
struct ComposeFile {
    #[serde(default)]
    services: Option<BTreeMap<String, serde_yaml::Value>>,
}

/**
 * Names of the services a compose file declares.
 */
pub fn list_services<P: AsRef<Path>>(descriptor: P) -> Result<Vec<String>> {
    let p = descriptor.as_ref();
    let f: ComposeFile = match crate::file::read_yaml(p)? {
        Some(f) => f,
        None => bail!("{} vanished", p.display()),
    };
    Ok(f.services.map(|s| s.into_keys().collect()).unwrap_or_default())
}

fn compose<P: AsRef<Path>>(descriptor: P) -> Exec {
    Exec::new("docker").args(["compose", "-f"]).path_arg(descriptor)
}

fn prefetch<S: System>(a: &mut Agent<'_, S>, log: &Logger) -> Result<StepOutcome> {
    let mut warnings = Vec::new();

    for w in &a.config.workloads {
        let dir = a.config.repository.path.join(w);
        let desc = match find_descriptor(&dir) {
            Ok(Some(d)) => d,
            Ok(None) => {
                debug!(log, "nothing to pull for {}", w);
                continue;
            }
            Err(e) => {
                warnings.push(format!("workload {}: {:#}", w, e));
                continue;
            }
        };

        info!(log, "pulling images for {}", w);
        match a.sys.exec(log, &compose(&desc).arg("pull")) {
            Ok(o) if o.success() => (),
            Ok(o) => warnings.push(format!("workload {}: pull failed: {}", w, o.info())),
            Err(e) => warnings.push(format!("workload {}: pull failed: {:#}", w, e)),
        }
    }

    Ok(StepOutcome::Warned(warnings))
}

fn workloads<S: System>(a: &mut Agent<'_, S>, log: &Logger) -> Result<StepOutcome> {
    let mut warnings = Vec::new();

    for w in &a.config.workloads {
        let dir = a.config.repository.path.join(w);
        let desc = match find_descriptor(&dir) {
            Ok(Some(d)) => d,
            Ok(None) => {
                warnings.push(format!(
                    "workload {}: no compose file in {}, skipped",
                    w,
                    dir.display()
                ));
                continue;
            }
            Err(e) => {
                warnings.push(format!("workload {}: {:#}", w, e));
                continue;
            }
        };

        let services = match list_services(&desc) {
            Ok(s) if s.is_empty() => {
                warnings.push(format!(
                    "workload {}: {} declares no services, skipped",
                    w,
                    desc.display()
                ));
                continue;
            }
            Ok(s) => s,
            Err(e) => {
                warnings.push(format!("workload {}: {:#}", w, e));
                continue;
            }
        };

        info!(log, "starting workload {}", w;
            "services" => services.join(","),
            "descriptor" => desc.display().to_string());
        match a.sys.exec(log, &compose(&desc).args(["up", "-d"])) {
            Ok(o) if o.success() => info!(log, "workload {} is up", w),
            Ok(o) => warnings.push(format!("workload {}: start failed: {}", w, o.info())),
            Err(e) => warnings.push(format!("workload {}: start failed: {:#}", w, e)),
        }
    }

    Ok(StepOutcome::Warned(warnings))
}

/*
 * Destroy a secret file.  shred(1) if we have it, otherwise overwrite it with
 * zeroes ourselves.
 */
fn scrub<S: System>(a: &Agent<'_, S>, log: &Logger, p: &Path) -> Result<()> {
    if !exists_file(p)? {
        return Ok(());
    }

    if a.sys.has_command("shred") {
        let out = a.sys.exec(log, &Exec::new("shred").arg("-u").path_arg(p))?;
        if out.success() && !exists_file(p)? {
            info!(log, "shredded {}", p.display());
            return Ok(());
        }
        warn!(log, "shred of {} failed, overwriting instead", p.display());
    }

    zero_and_remove(p)?;
    info!(log, "zeroed and removed {}", p.display());
    Ok(())
}

fn cleanup<S: System>(a: &mut Agent<'_, S>, log: &Logger) -> Result<StepOutcome> {
    let mut warnings = Vec::new();

    for key in [a.paths.boot.deploy_key(), a.paths.staged_key()] {
        if let Err(e) = scrub(a, log, &key) {
            warnings.push(format!("could not destroy {}: {:#}", key.display(), e));
        }
    }
    for key in [a.paths.boot.deploy_key_pub(), a.paths.staged_key_pub()] {
        if let Err(e) = remove_file_maybe(&key) {
            warnings.push(format!("{:#}", e));
        }
    }

    /*
     * The boot partition is FAT and readable by anyone, so the Wi-Fi
     * passphrase must not stay there.  It is only safe to remove once
     * NetworkManager has its own copy.
     */
    let wifi_copies = [a.paths.boot.nm_profile(), a.paths.boot.wpa_supplicant()];
    let installed = a.paths.installed_nm_profile();
    match exists_file(&installed) {
        Ok(true) => {
            for f in wifi_copies {
                if let Err(e) = scrub(a, log, &f) {
                    warnings.push(format!("could not destroy {}: {:#}", f.display(), e));
                }
            }
        }
        Ok(false) => {
            for f in wifi_copies.iter().filter(|f| f.exists()) {
                warnings.push(format!(
                    "{} left in place; no Wi-Fi profile was installed",
                    f.display()
                ));
            }
        }
        Err(e) => warnings.push(format!("{:#}", e)),
    }

    /*
     * Disarm the trigger.  Once the unit and the entry point are both gone,
     * nothing will run us again.
     */
    match a
        .sys
        .exec(log, &Exec::new("systemctl").args(["disable", trigger::UNIT_NAME]))
    {
        Ok(o) if o.success() => (),
        Ok(o) => warnings.push(format!("could not disable unit: {}", o.info())),
        Err(e) => warnings.push(format!("could not disable unit: {:#}", e)),
    }
    for f in [a.paths.installed_unit.clone(), a.paths.boot.entry_script()] {
        match remove_file_maybe(&f) {
            Ok(true) => info!(log, "removed {}", f.display()),
            Ok(false) => (),
            Err(e) => warnings.push(format!("{:#}", e)),
        }
    }
    match a.sys.exec(log, &Exec::new("systemctl").arg("daemon-reload")) {
        Ok(o) if o.success() => (),
        Ok(o) => warnings.push(format!("could not reload units: {}", o.info())),
        Err(e) => warnings.push(format!("could not reload units: {:#}", e)),
    }

    let cmdline = a.paths.boot.cmdline();
    match read_file(&cmdline) {
        Ok(Some(line)) if trigger::is_armed(&line) => {
            if let Err(e) = write_file(&cmdline, &trigger::disarm_cmdline(&line)) {
                warnings.push(format!("could not disarm {}: {:#}", cmdline.display(), e));
            } else {
                info!(log, "removed one-shot directive from {}", cmdline.display());
            }
        }
        Ok(_) => (),
        Err(e) => warnings.push(format!("{:#}", e)),
    }

    Ok(StepOutcome::Warned(warnings))
}

fn reboot<S: System>(a: &mut Agent<'_, S>, log: &Logger) -> Result<StepOutcome> {
    if !a.reboot {
        return Ok(StepOutcome::Skipped("reboot suppressed".into()));
    }

    info!(log, "provisioning complete; rebooting");
    a.sys.check(log, &Exec::new("systemctl").arg("reboot"))?;
    Ok(StepOutcome::Done)
}
