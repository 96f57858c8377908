/*
 * Copyright 2026 Oxide Computer Company
 */

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use serde::{Deserialize, Serialize};

use crate::common::*;
use crate::file::exists_file;

pub const DEFAULT_USERNAME: &str = "hub";
pub const DEFAULT_BRANCH: &str = "main";
pub const DEFAULT_WIFI_COUNTRY: &str = "US";
pub const DEFAULT_REPOSITORY_PATH: &str = "/opt/hubprovision/stacks";
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 30 * 60;

/*
 * Stacks are brought up in this order unless the operator says otherwise: the
 * message broker first, as the others connect to it on start.
 */
pub const DEFAULT_WORKLOADS: &[&str] =
    &["mosquitto", "zigbee2mqtt", "homeassistant", "nodered"];

const OPENSSL: &str = "openssl";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WifiCredentials {
    pub ssid: String,
    pub psk: String,
    pub country: String,
}

impl WifiCredentials {
    /**
     * A pre-computed WPA key is exactly 64 hex digits, rather than a
     * passphrase of 8 to 63 characters.
     */
    pub fn is_raw_key(&self) -> bool {
        is_raw_psk(&self.psk)
    }
}

fn is_raw_psk(psk: &str) -> bool {
    psk.len() == 64 && psk.chars().all(|c| c.is_ascii_hexdigit())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployKeyPair {
    pub private: PathBuf,
    pub public: PathBuf,
}

impl DeployKeyPair {
    pub fn from_private<P: AsRef<Path>>(private: P) -> DeployKeyPair {
        let private = private.as_ref().to_path_buf();
        let mut public = private.as_os_str().to_os_string();
        public.push(".pub");
        DeployKeyPair { private, public: PathBuf::from(public) }
    }
}

/**
 * Everything the operator told us about the device they want, validated.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisioningProfile {
    pub os_username: String,
    pub password_hash: String,
    pub wifi: Option<WifiCredentials>,
    pub repository_uri: String,
    pub repository_branch: String,
    pub deploy_key: DeployKeyPair,
    pub container_runtime_version: Option<String>,
    pub workloads: Vec<String>,
    pub command_timeout_secs: u64,
}

/**
 * Raw operator input, as it arrives from the command line.
 */
#[derive(Debug, Clone, Default)]
pub struct ProfileInputs {
    pub username: Option<String>,
    pub password: Option<String>,
    pub password_hash: Option<String>,
    pub wifi_ssid: Option<String>,
    pub wifi_password: Option<String>,
    pub wifi_country: Option<String>,
    pub repository: Option<String>,
    pub branch: Option<String>,
    pub deploy_key: Option<PathBuf>,
    pub runtime_version: Option<String>,
    pub workloads: Vec<String>,
    pub command_timeout_secs: Option<u64>,
}

pub const DEFAULT_REPOSITORY: &str = "git@github.com:home-hub/hub-stacks.git";

impl ProvisioningProfile {
    /**
     * Check the operator input for missing or contradictory values.  Nothing
     * has been written anywhere at this point.  The password hasher is only
     * invoked once everything else has been checked.
     */
    pub fn build<H>(inputs: &ProfileInputs, hasher: H) -> Result<ProvisioningProfile>
    where
        H: FnOnce(&str) -> Result<String>,
    {
        let os_username =
            inputs.username.as_deref().unwrap_or(DEFAULT_USERNAME).to_string();
        if !valid_username(&os_username) {
            bail!("\"{}\" is not a valid user name", os_username);
        }

        let deploy_key = match &inputs.deploy_key {
            Some(p) => DeployKeyPair::from_private(p),
            None => bail!("a deploy key (--deploy-key) is required"),
        };
        if !exists_file(&deploy_key.private)? {
            bail!("deploy key {} not found", deploy_key.private.display());
        }
        if !exists_file(&deploy_key.public)? {
            bail!("deploy public key {} not found", deploy_key.public.display());
        }

        let wifi = match (&inputs.wifi_ssid, &inputs.wifi_password) {
            (None, None) => {
                if inputs.wifi_country.is_some() {
                    bail!("a Wi-Fi country was given without a Wi-Fi network");
                }
                None
            }
            (Some(_), None) => {
                bail!("a Wi-Fi SSID was given without a Wi-Fi password")
            }
            (None, Some(_)) => {
                bail!("a Wi-Fi password was given without a Wi-Fi SSID")
            }
            (Some(ssid), Some(psk)) => {
                if ssid.is_empty() || psk.is_empty() {
                    bail!("the Wi-Fi SSID and password must not be empty");
                }
                if ssid.len() > 32 {
                    bail!("Wi-Fi SSID \"{}\" is longer than 32 bytes", ssid);
                }
                if !is_raw_psk(psk) && (psk.len() < 8 || psk.len() > 63) {
                    bail!(
                        "a WPA passphrase must be between 8 and 63 characters, \
                        or a key of 64 hex digits"
                    );
                }
                if ssid.contains(['\n', '"']) || psk.contains(['\n', '"']) {
                    bail!("Wi-Fi SSID and password may not contain quotes or newlines");
                }
                let country = inputs
                    .wifi_country
                    .as_deref()
                    .unwrap_or(DEFAULT_WIFI_COUNTRY)
                    .to_ascii_uppercase();
                if country.len() != 2
                    || !country.chars().all(|c| c.is_ascii_alphabetic())
                {
                    bail!("Wi-Fi country \"{}\" is not a two letter code", country);
                }
                Some(WifiCredentials {
                    ssid: ssid.to_string(),
                    psk: psk.to_string(),
                    country,
                })
            }
        };

        let repository_uri = inputs
            .repository
            .as_deref()
            .unwrap_or(DEFAULT_REPOSITORY)
            .trim()
            .to_string();
        if repository_uri.is_empty() {
            bail!("the repository URI must not be empty");
        }
        let repository_branch =
            inputs.branch.as_deref().unwrap_or(DEFAULT_BRANCH).to_string();
        if repository_branch.is_empty()
            || repository_branch.starts_with('-')
            || repository_branch.contains(char::is_whitespace)
        {
            bail!("\"{}\" is not a usable branch name", repository_branch);
        }

        let workloads: Vec<String> = if inputs.workloads.is_empty() {
            DEFAULT_WORKLOADS.iter().map(|w| w.to_string()).collect()
        } else {
            inputs.workloads.clone()
        };
        for (i, w) in workloads.iter().enumerate() {
            if !valid_workload(w) {
                bail!("\"{}\" is not a valid workload directory name", w);
            }
            if workloads[..i].contains(w) {
                bail!("workload \"{}\" is listed more than once", w);
            }
        }

        let command_timeout_secs = inputs
            .command_timeout_secs
            .unwrap_or(DEFAULT_COMMAND_TIMEOUT_SECS);
        if command_timeout_secs == 0 {
            bail!("the command timeout must be at least one second");
        }

        /*
         * Exactly one of the two password forms must be provided.  The hash
         * ends up in a "user:hash" record, so it cannot contain a colon.
         */
        let password_hash = match (&inputs.password, &inputs.password_hash) {
            (Some(_), Some(_)) => {
                bail!("--password and --password-hash are mutually exclusive")
            }
            (None, None) => {
                bail!("one of --password or --password-hash is required")
            }
            (Some(pw), None) => {
                if pw.is_empty() {
                    bail!("the password must not be empty");
                }
                hasher(pw)?
            }
            (None, Some(hash)) => hash.trim().to_string(),
        };
        if !password_hash.starts_with('$')
            || password_hash.contains([':', '\n'])
        {
            bail!("the password hash is not a crypt(3) string");
        }

        Ok(ProvisioningProfile {
            os_username,
            password_hash,
            wifi,
            repository_uri,
            repository_branch,
            deploy_key,
            container_runtime_version: inputs.runtime_version.clone(),
            workloads,
            command_timeout_secs,
        })
    }

    /**
     * The part of the profile the agent on the device needs.  Secrets that the
     * agent does not consume (the password hash, the Wi-Fi passphrase) stay
     * out of it; they are staged in their own files.
     */
    pub fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            username: self.os_username.clone(),
            workloads: self.workloads.clone(),
            command_timeout_secs: self.command_timeout_secs,
            repository: RepositoryConfig {
                uri: self.repository_uri.clone(),
                branch: self.repository_branch.clone(),
                path: PathBuf::from(DEFAULT_REPOSITORY_PATH),
            },
            runtime: RuntimeConfig {
                version: self.container_runtime_version.clone(),
            },
            network: NetworkConfig { wifi: self.wifi.is_some() },
        }
    }
}

fn valid_username(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        _ => return false,
    }
    name.len() <= 32
        && chars.all(|c| {
            c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-'
        })
}

fn valid_workload(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.starts_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

/**
 * Produce a SHA-512 crypt(3) hash of a password, as expected by the OS image
 * in its user configuration record.
 */
pub fn hash_password(log: &Logger, password: &str) -> Result<String> {
    info!(log, "exec: openssl passwd -6 -stdin");
    let mut child = Command::new(OPENSSL)
        .arg("passwd")
        .arg("-6")
        .arg("-stdin")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("could not run openssl to hash the password")?;

    {
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("openssl stdin unavailable"))?;
        stdin.write_all(password.as_bytes())?;
        stdin.write_all(b"\n")?;
    }

    let output = child.wait_with_output()?;
    if !output.status.success() {
        bail!("openssl passwd failed: {}", output.info());
    }

    let hash = String::from_utf8(output.stdout)?.trim().to_string();
    if hash.is_empty() {
        bail!("openssl passwd produced no output");
    }
    Ok(hash)
}

/**
 * Configuration for the first-boot agent.  This is rendered into the boot
 * partition by the operator tool and read back by the agent; the entry-point
 * script itself contains no configuration.
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub username: String,
    pub workloads: Vec<String>,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    pub repository: RepositoryConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub network: NetworkConfig,
}

fn default_command_timeout() -> u64 {
    DEFAULT_COMMAND_TIMEOUT_SECS
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    pub uri: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default = "default_repository_path")]
    pub path: PathBuf,
}

fn default_branch() -> String {
    DEFAULT_BRANCH.to_string()
}

fn default_repository_path() -> PathBuf {
    PathBuf::from(DEFAULT_REPOSITORY_PATH)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default)]
    pub wifi: bool,
}

impl AgentConfig {
    pub fn render(&self) -> Result<String> {
        Ok(toml::to_string(self)?)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const HASH: &str = "$6$salt$abcdefghijklmnopqrstuvwxyz";

    struct Keys {
        _dir: tempfile::TempDir,
        private: PathBuf,
    }

    fn keys() -> Keys {
        let dir = tempfile::tempdir().unwrap();
        let private = dir.path().join("deploy");
        std::fs::write(&private, "PRIVATE").unwrap();
        std::fs::write(dir.path().join("deploy.pub"), "ssh-ed25519 AAAA").unwrap();
        Keys { _dir: dir, private }
    }

    fn inputs(k: &Keys) -> ProfileInputs {
        ProfileInputs {
            password_hash: Some(HASH.to_string()),
            deploy_key: Some(k.private.clone()),
            ..Default::default()
        }
    }

    fn no_hasher(_: &str) -> Result<String> {
        panic!("hasher should not be called");
    }

    #[test]
    fn defaults() -> Result<()> {
        let k = keys();
        let p = ProvisioningProfile::build(&inputs(&k), no_hasher)?;
        assert_eq!(p.os_username, DEFAULT_USERNAME);
        assert_eq!(p.password_hash, HASH);
        assert!(p.wifi.is_none());
        assert_eq!(p.repository_branch, "main");
        assert_eq!(p.workloads, DEFAULT_WORKLOADS);
        assert_eq!(p.deploy_key.public, k.private.with_extension("pub"));
        Ok(())
    }

    #[test]
    fn both_password_forms_rejected() {
        let k = keys();
        let mut i = inputs(&k);
        i.password = Some("hunter22".into());
        let e = ProvisioningProfile::build(&i, no_hasher).unwrap_err();
        assert!(e.to_string().contains("mutually exclusive"));
    }

    #[test]
    fn neither_password_form_rejected() {
        let k = keys();
        let mut i = inputs(&k);
        i.password_hash = None;
        assert!(ProvisioningProfile::build(&i, no_hasher).is_err());
    }

    #[test]
    fn plaintext_password_is_hashed() -> Result<()> {
        let k = keys();
        let mut i = inputs(&k);
        i.password_hash = None;
        i.password = Some("hunter22".into());
        let p = ProvisioningProfile::build(&i, |pw| {
            assert_eq!(pw, "hunter22");
            Ok(HASH.to_string())
        })?;
        assert_eq!(p.password_hash, HASH);
        Ok(())
    }

    #[test]
    fn hasher_not_called_when_other_input_is_bad() {
        let k = keys();
        let mut i = inputs(&k);
        i.password_hash = None;
        i.password = Some("hunter22".into());
        i.wifi_ssid = Some("home".into());
        assert!(ProvisioningProfile::build(&i, no_hasher).is_err());
    }

    #[test]
    fn wifi_is_all_or_nothing() {
        let k = keys();

        let mut i = inputs(&k);
        i.wifi_ssid = Some("home".into());
        assert!(ProvisioningProfile::build(&i, no_hasher).is_err());

        let mut i = inputs(&k);
        i.wifi_password = Some("correct horse".into());
        assert!(ProvisioningProfile::build(&i, no_hasher).is_err());

        let mut i = inputs(&k);
        i.wifi_ssid = Some("".into());
        i.wifi_password = Some("correct horse".into());
        assert!(ProvisioningProfile::build(&i, no_hasher).is_err());

        let mut i = inputs(&k);
        i.wifi_country = Some("DE".into());
        assert!(ProvisioningProfile::build(&i, no_hasher).is_err());
    }

    #[test]
    fn wifi_accepted() -> Result<()> {
        let k = keys();
        let mut i = inputs(&k);
        i.wifi_ssid = Some("home".into());
        i.wifi_password = Some("correct horse".into());
        i.wifi_country = Some("gb".into());
        let p = ProvisioningProfile::build(&i, no_hasher)?;
        assert_eq!(
            p.wifi,
            Some(WifiCredentials {
                ssid: "home".into(),
                psk: "correct horse".into(),
                country: "GB".into(),
            })
        );
        assert!(p.agent_config().network.wifi);
        Ok(())
    }

    #[test]
    fn wifi_raw_key() -> Result<()> {
        let k = keys();
        let key = "0123456789abcdefABCDEF0123456789abcdef0123456789abcdef0123456789";
        assert_eq!(key.len(), 64);

        let mut i = inputs(&k);
        i.wifi_ssid = Some("home".into());
        i.wifi_password = Some(key.into());
        let p = ProvisioningProfile::build(&i, no_hasher)?;
        assert!(p.wifi.as_ref().map(|w| w.is_raw_key()).unwrap_or(false));

        /*
         * 64 characters that are not all hex is neither form.
         */
        i.wifi_password = Some(format!("{}g", &key[..63]));
        assert!(ProvisioningProfile::build(&i, no_hasher).is_err());

        i.wifi_password = Some("a".repeat(63));
        let p = ProvisioningProfile::build(&i, no_hasher)?;
        assert!(!p.wifi.as_ref().map(|w| w.is_raw_key()).unwrap_or(true));
        Ok(())
    }

    #[test]
    fn deploy_key_required_and_checked() {
        let k = keys();
        let mut i = inputs(&k);
        i.deploy_key = None;
        assert!(ProvisioningProfile::build(&i, no_hasher).is_err());

        let mut i = inputs(&k);
        i.deploy_key = Some(k.private.with_file_name("missing"));
        assert!(ProvisioningProfile::build(&i, no_hasher).is_err());

        std::fs::remove_file(k.private.with_extension("pub")).unwrap();
        assert!(ProvisioningProfile::build(&inputs(&k), no_hasher).is_err());
    }

    #[test]
    fn bad_names_rejected() {
        let k = keys();
        for user in ["Root", "1abc", "", "a b", "user:x"] {
            let mut i = inputs(&k);
            i.username = Some(user.into());
            assert!(ProvisioningProfile::build(&i, no_hasher).is_err(), "{}", user);
        }
        for w in ["..", "a/b", "", "-rf"] {
            let mut i = inputs(&k);
            i.workloads = vec![w.into()];
            assert!(ProvisioningProfile::build(&i, no_hasher).is_err(), "{}", w);
        }
        let mut i = inputs(&k);
        i.workloads = vec!["mqtt".into(), "mqtt".into()];
        assert!(ProvisioningProfile::build(&i, no_hasher).is_err());

        let mut i = inputs(&k);
        i.password_hash = Some("plaintext".into());
        assert!(ProvisioningProfile::build(&i, no_hasher).is_err());
    }

    #[test]
    fn agent_config_round_trips_through_toml() -> Result<()> {
        let k = keys();
        let mut i = inputs(&k);
        i.workloads = vec!["mosquitto".into(), "homeassistant".into()];
        i.runtime_version = Some("27.3".into());
        let c = ProvisioningProfile::build(&i, no_hasher)?.agent_config();

        let text = c.render()?;
        assert!(!text.contains(HASH));
        let back: AgentConfig = toml::from_str(&text)?;
        assert_eq!(back, c);
        Ok(())
    }

    #[test]
    fn agent_config_defaults() -> Result<()> {
        let c: AgentConfig = toml::from_str(
            "username = \"hub\"\n\
             workloads = [\"mosquitto\"]\n\
             [repository]\n\
             uri = \"git@example.com:stacks.git\"\n",
        )?;
        assert_eq!(c.repository.branch, "main");
        assert_eq!(c.repository.path, PathBuf::from(DEFAULT_REPOSITORY_PATH));
        assert_eq!(c.command_timeout_secs, DEFAULT_COMMAND_TIMEOUT_SECS);
        assert!(c.runtime.version.is_none());
        assert!(!c.network.wifi);
        Ok(())
    }
}
