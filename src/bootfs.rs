/*
 * Copyright 2026 Oxide Computer Company
 */

use std::path::{Path, PathBuf};

use crate::common::*;
use crate::file::{ensure_dir, exists_dir, write_file, write_file_mode};
use crate::image::checksum::sha256_str;
use crate::profile::{ProvisioningProfile, WifiCredentials};
use crate::trigger;

/*
 * Where the boot partition is mounted on the running device.
 */
pub const DEVICE_BOOT_DIR: &str = "/boot/firmware";

/*
 * Files on the boot partition, relative to its root.  The names at the top
 * level are the ones the stock OS image looks for on its own.
 */
pub const SSH_MARKER: &str = "ssh";
pub const USERCONF: &str = "userconf.txt";
pub const WPA_SUPPLICANT: &str = "wpa_supplicant.conf";
pub const CMDLINE: &str = "cmdline.txt";
pub const ENTRY_SCRIPT: &str = "firstrun.sh";
pub const STATE_DIR: &str = "hubprovision";

const NM_PROFILE: &str = "wifi.nmconnection";
const AGENT_CONFIG: &str = "agent.toml";
const AGENT_BINARY: &str = "hub-firstboot";
const KEYS_DIR: &str = "keys";
const DEPLOY_KEY: &str = "deploy_key";
const DEPLOY_KEY_PUB: &str = "deploy_key.pub";

pub const NM_CONNECTION_ID: &str = "hubprovision-wifi";

/**
 * The set of well-known paths on a boot partition, wherever it happens to be
 * mounted.  Both the operator tool and the agent use this, so that the two
 * agree on where things live.
 */
#[derive(Debug, Clone)]
pub struct BootLayout {
    root: PathBuf,
}

impl BootLayout {
    pub fn new<P: AsRef<Path>>(root: P) -> BootLayout {
        BootLayout { root: root.as_ref().to_path_buf() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ssh_marker(&self) -> PathBuf {
        self.root.join(SSH_MARKER)
    }

    pub fn userconf(&self) -> PathBuf {
        self.root.join(USERCONF)
    }

    pub fn wpa_supplicant(&self) -> PathBuf {
        self.root.join(WPA_SUPPLICANT)
    }

    pub fn cmdline(&self) -> PathBuf {
        self.root.join(CMDLINE)
    }

    pub fn entry_script(&self) -> PathBuf {
        self.root.join(ENTRY_SCRIPT)
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join(STATE_DIR)
    }

    pub fn nm_profile(&self) -> PathBuf {
        self.state_dir().join(NM_PROFILE)
    }

    pub fn unit(&self) -> PathBuf {
        self.state_dir().join(trigger::UNIT_NAME)
    }

    pub fn agent_config(&self) -> PathBuf {
        self.state_dir().join(AGENT_CONFIG)
    }

    pub fn agent_binary(&self) -> PathBuf {
        self.state_dir().join(AGENT_BINARY)
    }

    pub fn keys_dir(&self) -> PathBuf {
        self.state_dir().join(KEYS_DIR)
    }

    pub fn deploy_key(&self) -> PathBuf {
        self.keys_dir().join(DEPLOY_KEY)
    }

    pub fn deploy_key_pub(&self) -> PathBuf {
        self.keys_dir().join(DEPLOY_KEY_PUB)
    }
}

pub fn render_userconf(profile: &ProvisioningProfile) -> String {
    format!("{}:{}\n", profile.os_username, profile.password_hash)
}

/**
 * NetworkManager wants a UUID for each connection.  We derive it from the SSID
 * so that restaging the same network produces an identical file.
 */
fn connection_uuid(ssid: &str) -> String {
    let h = sha256_str(&format!("{}:{}", NM_CONNECTION_ID, ssid));
    format!(
        "{}-{}-4{}-8{}-{}",
        &h[0..8],
        &h[8..12],
        &h[13..16],
        &h[17..20],
        &h[20..32]
    )
}

pub fn render_nmconnection(wifi: &WifiCredentials) -> String {
    format!(
        "[connection]\n\
         id={id}\n\
         uuid={uuid}\n\
         type=wifi\n\
         interface-name=wlan0\n\
         autoconnect=true\n\
         \n\
         [wifi]\n\
         mode=infrastructure\n\
         ssid={ssid}\n\
         \n\
         [wifi-security]\n\
         auth-alg=open\n\
         key-mgmt=wpa-psk\n\
         psk={psk}\n\
         \n\
         [ipv4]\n\
         method=auto\n\
         \n\
         [ipv6]\n\
         addr-gen-mode=default\n\
         method=auto\n",
        id = NM_CONNECTION_ID,
        uuid = connection_uuid(&wifi.ssid),
        ssid = wifi.ssid,
        psk = wifi.psk,
    )
}

/**
 * Older images configure Wi-Fi from a wpa_supplicant.conf dropped in the boot
 * partition; newer ones ignore it.  We stage both.
 */
pub fn render_wpa_supplicant(wifi: &WifiCredentials) -> String {
    /*
     * A raw key is written bare; a quoted value is taken as a passphrase.
     */
    let psk = if wifi.is_raw_key() {
        wifi.psk.clone()
    } else {
        format!("\"{}\"", wifi.psk)
    };
    format!(
        "ctrl_interface=DIR=/var/run/wpa_supplicant GROUP=netdev\n\
         update_config=1\n\
         country={country}\n\
         \n\
         network={{\n\
         \tssid=\"{ssid}\"\n\
         \tpsk={psk}\n\
         }}\n",
        country = wifi.country,
        ssid = wifi.ssid,
        psk = psk,
    )
}

/**
 * Write everything the agent will need onto a mounted boot partition.
 */
pub fn stage(
    log: &Logger,
    layout: &BootLayout,
    profile: &ProvisioningProfile,
    agent_binary: Option<&Path>,
) -> Result<()> {
    if !exists_dir(layout.root())? {
        bail!("boot partition {} is not mounted", layout.root().display());
    }
    info!(log, "staging first-boot artifacts in {}", layout.root().display());

    /*
     * Enable SSH, and create the initial user account:
     */
    write_file(layout.ssh_marker(), "")?;
    write_file_mode(layout.userconf(), render_userconf(profile).as_bytes(), 0o600)?;
    info!(log, "staged user {}", profile.os_username);

    ensure_dir(log, layout.state_dir(), 0o755)?;
    ensure_dir(log, layout.keys_dir(), 0o700)?;

    if let Some(wifi) = &profile.wifi {
        write_file_mode(
            layout.nm_profile(),
            render_nmconnection(wifi).as_bytes(),
            0o600,
        )?;
        write_file_mode(
            layout.wpa_supplicant(),
            render_wpa_supplicant(wifi).as_bytes(),
            0o600,
        )?;
        info!(log, "staged Wi-Fi network \"{}\" ({})", wifi.ssid, wifi.country);
    } else {
        info!(log, "no Wi-Fi network configured; expecting wired Ethernet");
    }

    let config = profile.agent_config().render()?;
    write_file_mode(layout.agent_config(), config.as_bytes(), 0o600)?;

    /*
     * Private key material is readable by the owner only; the public half can
     * be read by anybody.
     */
    let private = std::fs::read(&profile.deploy_key.private).with_context(|| {
        format!("read deploy key {}", profile.deploy_key.private.display())
    })?;
    let public = std::fs::read(&profile.deploy_key.public).with_context(|| {
        format!("read deploy key {}", profile.deploy_key.public.display())
    })?;
    write_file_mode(layout.deploy_key(), &private, 0o400)?;
    write_file_mode(layout.deploy_key_pub(), &public, 0o444)?;
    info!(log, "staged deploy key pair");

    match agent_binary {
        Some(bin) => {
            let data = std::fs::read(bin)
                .with_context(|| format!("read agent binary {}", bin.display()))?;
            write_file_mode(layout.agent_binary(), &data, 0o755)?;
            info!(log, "staged agent binary from {}", bin.display());
        }
        None => {
            warn!(
                log,
                "no agent binary staged; the image must already provide {}",
                trigger::INSTALLED_AGENT
            );
        }
    }

    trigger::stage(log, layout)?;

    Ok(())
}
