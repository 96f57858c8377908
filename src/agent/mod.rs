/*
 * Copyright 2026 Oxide Computer Company
 */

/*!
 * The first-boot provisioning agent.  This runs unattended on the device,
 * with nobody watching; the log file and the run report it leaves behind in
 * the state directory are the only way to find out what happened.
 */

use std::path::{Path, PathBuf};

use crate::bootfs::{BootLayout, NM_CONNECTION_ID};
use crate::common::*;
use crate::file::{ensure_dir, write_file};
use crate::profile::AgentConfig;
use crate::trigger;

pub mod pipeline;
pub mod state;
pub mod steps;
pub mod system;

use pipeline::{Pipeline, RunReport, StepContext};
use system::System;

pub const STATE_DIR: &str = "/var/lib/hubprovision";
pub const SSH_DIR: &str = "/root/.ssh";
pub const NM_CONNECTIONS: &str = "/etc/NetworkManager/system-connections";
pub const REPORT: &str = "last-run.json";
const STAGED_KEY: &str = "hubprovision_deploy_key";

/**
 * Where the agent reads and writes things on the device.
 */
#[derive(Debug, Clone)]
pub struct AgentPaths {
    pub boot: BootLayout,
    pub ssh_dir: PathBuf,
    pub nm_connections: PathBuf,
    pub installed_unit: PathBuf,
    pub state_dir: PathBuf,
}

impl AgentPaths {
    pub fn device<P: AsRef<Path>>(boot_dir: P) -> AgentPaths {
        AgentPaths {
            boot: BootLayout::new(boot_dir),
            ssh_dir: PathBuf::from(SSH_DIR),
            nm_connections: PathBuf::from(NM_CONNECTIONS),
            installed_unit: PathBuf::from(trigger::INSTALLED_UNIT),
            state_dir: PathBuf::from(STATE_DIR),
        }
    }

    pub fn staged_key(&self) -> PathBuf {
        self.ssh_dir.join(STAGED_KEY)
    }

    pub fn staged_key_pub(&self) -> PathBuf {
        self.ssh_dir.join(format!("{}.pub", STAGED_KEY))
    }

    pub fn report(&self) -> PathBuf {
        self.state_dir.join(REPORT)
    }

    pub fn installed_nm_profile(&self) -> PathBuf {
        self.nm_connections
            .join(format!("{}.nmconnection", NM_CONNECTION_ID))
    }
}

pub struct Agent<'a, S: System> {
    sys: &'a S,
    config: &'a AgentConfig,
    paths: &'a AgentPaths,
    reboot: bool,
    probe_attempts: u32,
    probe_interval_ms: u64,
}

impl<'a, S: System> Agent<'a, S> {
    pub fn new(
        sys: &'a S,
        config: &'a AgentConfig,
        paths: &'a AgentPaths,
    ) -> Agent<'a, S> {
        Agent {
            sys,
            config,
            paths,
            reboot: true,
            probe_attempts: 12,
            probe_interval_ms: 5_000,
        }
    }

    pub fn reboot(mut self, reboot: bool) -> Agent<'a, S> {
        self.reboot = reboot;
        self
    }

    /**
     * How long to wait for the network to appear after bringing it up.
     */
    pub fn probe(mut self, attempts: u32, interval_ms: u64) -> Agent<'a, S> {
        self.probe_attempts = attempts;
        self.probe_interval_ms = interval_ms;
        self
    }

    pub fn run(&mut self, log: &Logger) -> Result<RunReport> {
        let pipeline = Pipeline::new(steps::all::<S>())?;
        info!(log, "provisioning run starting";
            "steps" => pipeline.names().join(","),
            "workloads" => self.config.workloads.join(","));

        let report = pipeline.run(log, self);

        if report.succeeded() {
            info!(log, "provisioning run completed";
                "warnings" => report.warnings.len());
        } else {
            error!(log, "provisioning run ended in {}", report.state;
                "warnings" => report.warnings.len());
        }
        for w in &report.warnings {
            warn!(log, "warning: {}", w);
        }
        Ok(report)
    }
}

impl<S: System> StepContext for Agent<'_, S> {
    fn checkpoint(&mut self, log: &Logger, report: &RunReport) {
        let out = self.paths.report();
        let res = ensure_dir(log, &self.paths.state_dir, 0o755)
            .and_then(|_| Ok(serde_json::to_string_pretty(report)?))
            .and_then(|json| write_file(&out, &format!("{}\n", json)));
        if let Err(e) = res {
            /*
             * The log still has everything.
             */
            warn!(log, "could not write run report {}: {:#}", out.display(), e);
        }
    }
}
