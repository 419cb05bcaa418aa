use std::{path::PathBuf, time::Duration};

use serde::{
    Deserialize,
    de::{self, Visitor},
};
use thiserror::Error;

use crate::forwarding::{SupervisorSettings, TunnelSpec};

pub const DEFAULT_PATH: &str = "~/.config/portkeeper.toml";
pub const DEFAULT_KNOWN_HOSTS_PATH: &str = "~/.config/portkeeper/known_hosts.db";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config {0}: {1}")]
    Read(String, String),
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("environment {0} not found")]
    EnvNotFound(String),
    #[error("cannot expand {0}: HOME is not set")]
    NoHome(String),
    #[error("env variable error: {0}")]
    EnvVar(String),
    #[error("invalid settings: {0} must be greater than zero")]
    InvalidSettings(&'static str),
}

#[derive(Deserialize, Debug, PartialEq)]
pub(crate) struct PortkeeperConfig {
    #[serde(default)]
    pub settings: SettingsConfig,
    pub proxies: Vec<ProxyConfig>,
}
#[derive(Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(default)]
pub(crate) struct SettingsConfig {
    pub idle_timeout_secs: u64,
    pub probe_interval_secs: u64,
    pub probe_timeout_secs: u64,
}
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub(crate) struct ProxyConfig {
    /// name used on the command line to pick this proxy
    pub env: String,
    pub default_user: Option<String>,
    pub default_host: Option<String>,
    pub backend: BackendConfig,
    #[serde(default)]
    pub forwarding: Vec<ForwardingConfig>,
}
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub(crate) enum BackendConfig {
    #[serde(alias = "tsh", alias = "TSH")]
    Tsh(TshConfig),
    #[serde(alias = "ssh", alias = "SSH")]
    Ssh(SshConfig),
}
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub(crate) struct TshConfig {
    /// teleport proxy address (host:port)
    pub proxy: String,
    pub auth_connector: Option<String>,
    #[serde(default = "default_tsh_binary")]
    pub binary: String,
}
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub(crate) struct SshConfig {
    /// public address of the bastion
    pub bastion_address: String,
    #[serde(default = "default_ssh_port")]
    pub bastion_port: u16,
    pub bastion_user: String,
    /// ssh port of the hosts behind the bastion
    #[serde(default = "default_ssh_port")]
    pub target_ssh_port: u16,
    pub private_key_path: String,
    pub private_key_passphrase: Option<EnvOrValue>,
    pub known_hosts_path: Option<String>,
}
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub(crate) struct ForwardingConfig {
    pub listen_port: u16,
    pub remote_host: Option<String>,
    pub user_login: Option<String>,
    pub destination: Option<String>,
    pub remote_port: Option<u16>,
}
/// a secret stored either in plaintext in the file or in an environment variable
#[derive(Clone, PartialEq, Debug)]
pub(crate) struct EnvOrValue {
    from_env: Option<String>,
    value: Option<String>,
}

fn default_tsh_binary() -> String {
    String::from("tsh")
}
fn default_ssh_port() -> u16 {
    22
}

impl Default for SettingsConfig {
    fn default() -> Self {
        let defaults = SupervisorSettings::default();
        SettingsConfig {
            idle_timeout_secs: defaults.idle_timeout.as_secs(),
            probe_interval_secs: defaults.probe_interval.as_secs(),
            probe_timeout_secs: defaults.probe_timeout.as_secs(),
        }
    }
}

impl TryFrom<SettingsConfig> for SupervisorSettings {
    type Error = ConfigError;

    fn try_from(value: SettingsConfig) -> Result<Self, Self::Error> {
        Ok(SupervisorSettings {
            idle_timeout: non_zero_secs("idle_timeout_secs", value.idle_timeout_secs)?,
            probe_interval: non_zero_secs("probe_interval_secs", value.probe_interval_secs)?,
            probe_timeout: non_zero_secs("probe_timeout_secs", value.probe_timeout_secs)?,
        })
    }
}

fn non_zero_secs(name: &'static str, secs: u64) -> Result<Duration, ConfigError> {
    if secs == 0 {
        return Err(ConfigError::InvalidSettings(name));
    }
    Ok(Duration::from_secs(secs))
}

impl From<ForwardingConfig> for TunnelSpec {
    fn from(value: ForwardingConfig) -> Self {
        TunnelSpec {
            listen_port: value.listen_port,
            remote_host: value.remote_host.filter(|h| !h.is_empty()),
            user_login: value.user_login.filter(|u| !u.is_empty()),
            destination: value.destination.filter(|d| !d.is_empty()),
            remote_port: value.remote_port,
        }
    }
}

impl PortkeeperConfig {
    pub fn load(path: Option<String>) -> Result<Self, ConfigError> {
        let path = expand_home(&path.unwrap_or(DEFAULT_PATH.to_string()))?;
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| ConfigError::Read(path.display().to_string(), e.to_string()))?;
        Ok(toml::from_str(&raw)?)
    }
    pub fn find_proxy(&self, env: &str) -> Result<&ProxyConfig, ConfigError> {
        self.proxies
            .iter()
            .find(|p| p.env == env)
            .ok_or_else(|| ConfigError::EnvNotFound(env.to_string()))
    }
}

impl ProxyConfig {
    pub fn tunnel_specs(&self) -> Vec<TunnelSpec> {
        self.forwarding.iter().cloned().map(TunnelSpec::from).collect()
    }
}

impl EnvOrValue {
    /// the plaintext value wins when both are present
    pub fn get(&self) -> Result<String, ConfigError> {
        match (&self.value, &self.from_env) {
            (Some(value), _) => Ok(value.clone()),
            (None, Some(env_var)) => std::env::var(env_var).map_err(|e| match e {
                std::env::VarError::NotPresent => {
                    ConfigError::EnvVar(format!("{env_var} not found in the environment!"))
                }
                std::env::VarError::NotUnicode(_) => {
                    ConfigError::EnvVar(format!("{env_var} is not unicode!"))
                }
            }),
            (None, None) => Err(ConfigError::EnvVar(String::from("no value configured"))),
        }
    }
}

/// expands a leading `~/` using HOME
pub(crate) fn expand_home(path: &str) -> Result<PathBuf, ConfigError> {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = std::env::var("HOME").map_err(|_| ConfigError::NoHome(path.to_string()))?;
            Ok(PathBuf::from(home).join(rest))
        }
        None => Ok(PathBuf::from(path)),
    }
}

impl<'de> Deserialize<'de> for EnvOrValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct EnvOrValueVisitor;
        impl<'de> Visitor<'de> for EnvOrValueVisitor {
            type Value = EnvOrValue;
            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter
                    .write_str("a map with at least one between `from_env` or `value` set to Some")
            }
            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: serde::de::MapAccess<'de>,
            {
                let mut from_env = None;
                let mut value = None;

                while let Some(key) = map.next_key::<String>()? {
                    match key.as_str() {
                        "from_env" => from_env = Some(map.next_value()?),
                        "value" => value = Some(map.next_value()?),
                        _ => return Err(de::Error::unknown_field(&key, &["from_env", "value"])),
                    }
                }

                if from_env.is_none() && value.is_none() {
                    return Err(de::Error::custom(
                        "at least one between `from_env` or `value` must be provided!",
                    ));
                }
                if value.is_some() {
                    from_env = None; // value takes precedence
                }
                Ok(EnvOrValue { value, from_env })
            }
        }
        deserializer.deserialize_map(EnvOrValueVisitor)
    }
}
