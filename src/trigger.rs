/*
 * Copyright 2026 Oxide Computer Company
 */

/*!
 * The first-boot trigger has two halves.  A kernel command line directive
 * asks systemd to run the entry-point script exactly once, on the next boot.
 * The entry-point script then installs a persistent unit, conditioned on the
 * script still existing, so that a run interrupted by a power cut is picked
 * up again on the following boot.  The agent deletes the script and the unit
 * once provisioning succeeds, after which nothing fires again.
 */

use crate::bootfs::{BootLayout, DEVICE_BOOT_DIR};
use crate::common::*;
use crate::file::{exists_file, read_file, write_file, write_file_mode};

pub const UNIT_NAME: &str = "hubprovision-firstboot.service";
pub const INSTALLED_UNIT: &str = "/etc/systemd/system/hubprovision-firstboot.service";
pub const INSTALLED_AGENT: &str = "/usr/local/sbin/hub-firstboot";

const RUN_DIRECTIVE: &str = "systemd.run=";

/*
 * Everything we add to the kernel command line, apart from the systemd.run=
 * directive itself.  disarm_cmdline() removes exactly these.
 */
const TRIGGER_ARGS: &[&str] = &[
    "systemd.run_success_action=reboot",
    "systemd.run_failure_action=emergency",
    "systemd.unit=kernel-command-line.target",
];

/**
 * The entry point is a fixed script.  Everything that varies from one device
 * to the next lives in the agent configuration file instead.
 */
pub fn entry_script() -> String {
    format!(
        "#!/bin/sh\n\
         #\n\
         # First-boot entry point staged by hub-prepare.  Installs the\n\
         # persistent provisioning unit and runs the agent.  The agent deletes\n\
         # this file once provisioning has completed.\n\
         #\n\
         set -e\n\
         BOOT={boot}\n\
         install -m 0644 \"$BOOT/hubprovision/{unit}\" {installed_unit}\n\
         if [ -f \"$BOOT/hubprovision/hub-firstboot\" ]; then\n\
         \tinstall -m 0755 \"$BOOT/hubprovision/hub-firstboot\" {agent}\n\
         fi\n\
         systemctl daemon-reload || true\n\
         systemctl enable {unit}\n\
         exec {agent} --boot-dir \"$BOOT\"\n",
        boot = DEVICE_BOOT_DIR,
        unit = UNIT_NAME,
        installed_unit = INSTALLED_UNIT,
        agent = INSTALLED_AGENT,
    )
}

pub fn unit_file() -> String {
    format!(
        "[Unit]\n\
         Description=Home hub first-boot provisioning\n\
         Wants=network-online.target\n\
         After=network-online.target\n\
         ConditionPathExists={boot}/{entry}\n\
         \n\
         [Service]\n\
         Type=oneshot\n\
         ExecStart={agent} --boot-dir {boot}\n\
         StandardOutput=journal+console\n\
         StandardError=journal+console\n\
         TimeoutStartSec=infinity\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n",
        boot = DEVICE_BOOT_DIR,
        entry = crate::bootfs::ENTRY_SCRIPT,
        agent = INSTALLED_AGENT,
    )
}

/**
 * Add the one-shot directive to a kernel command line.  If there is already a
 * systemd.run= directive present we leave the line alone, so that staging the
 * same media twice does not stack up two triggers.
 */
pub fn arm_cmdline(cmdline: &str) -> String {
    let line = cmdline.trim();

    if line.split_whitespace().any(|t| t.starts_with(RUN_DIRECTIVE)) {
        return format!("{}\n", line);
    }

    let mut out = line.to_string();
    let mut push = |t: &str| {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(t);
    };
    push(&format!(
        "{}{}/{}",
        RUN_DIRECTIVE,
        DEVICE_BOOT_DIR,
        crate::bootfs::ENTRY_SCRIPT
    ));
    for arg in TRIGGER_ARGS {
        push(arg);
    }
    out.push('\n');
    out
}

/**
 * Remove the one-shot directive (and its companions) from a kernel command
 * line, leaving everything else in its original order.
 */
pub fn disarm_cmdline(cmdline: &str) -> String {
    let kept: Vec<&str> = cmdline
        .split_whitespace()
        .filter(|t| !t.starts_with(RUN_DIRECTIVE) && !TRIGGER_ARGS.contains(t))
        .collect();
    format!("{}\n", kept.join(" "))
}

pub fn is_armed(cmdline: &str) -> bool {
    cmdline.split_whitespace().any(|t| t.starts_with(RUN_DIRECTIVE))
}

/**
 * Put the trigger in place on a mounted boot partition.
 */
pub fn stage(log: &Logger, layout: &BootLayout) -> Result<()> {
    let cmdline = layout.cmdline();
    let orig = match read_file(&cmdline)? {
        Some(s) => s,
        None => bail!(
            "{} not found; is this really a boot partition?",
            cmdline.display()
        ),
    };

    info!(log, "staging first-boot unit {}", layout.unit().display());
    write_file(layout.unit(), &unit_file())?;

    info!(log, "staging entry point {}", layout.entry_script().display());
    write_file_mode(layout.entry_script(), entry_script().as_bytes(), 0o755)?;

    if is_armed(&orig) {
        info!(log, "kernel command line already carries a one-shot directive");
    } else {
        let armed = arm_cmdline(&orig);
        info!(log, "arming kernel command line"; "cmdline" => armed.trim());
        write_file(&cmdline, &armed)?;
    }

    Ok(())
}

/**
 * Is the trigger staged on this boot partition?  Used by the operator tool as
 * a final check before unmounting.
 */
pub fn is_staged(layout: &BootLayout) -> Result<bool> {
    Ok(exists_file(layout.entry_script())?
        && exists_file(layout.unit())?
        && read_file(layout.cmdline())?.map(|s| is_armed(&s)).unwrap_or(false))
}
