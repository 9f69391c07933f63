// Configuration file parser and known-config store

//! Configuration loading and the known-config store
//!
//! Handles the TOML configuration file and the directory of WireGuard
//! configs the control channel may select from. Config names are
//! validated before they can ever reach a command line.

use crate::context::NetworkIdentity;
use crate::launcher::validate_config_name;
use crate::types::{Config, GeneralConfig};
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Load configuration from TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let contents = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;

    let config: Config = toml::from_str(&contents).context("Failed to parse config file")?;

    validate_config(&config)?;
    Ok(config)
}

/// Validate configuration values
fn validate_config(config: &Config) -> Result<()> {
    let general = &config.general;

    if general.wg_interface.is_empty() {
        anyhow::bail!("wg_interface cannot be empty");
    }

    if general.config_dir.is_empty() {
        anyhow::bail!("config_dir cannot be empty");
    }

    if let Some(active) = &general.active_config {
        validate_config_name(active).context("active_config is not a valid config name")?;
    }

    if general.provider_prefix.is_empty() {
        anyhow::bail!("provider_prefix cannot be empty");
    }

    if general.policy_file.is_empty() {
        anyhow::bail!("policy_file cannot be empty");
    }

    if general.poll_interval == 0 {
        anyhow::bail!("poll_interval must be > 0");
    }

    Ok(())
}

/// Known-config lookups and identity classification, built from the
/// general configuration at startup.
pub struct ConfigStore {
    config_dir: PathBuf,
    active: Option<Arc<str>>,
    provider_prefix: String,
}

impl ConfigStore {
    /// Build the store from the loaded configuration.
    pub fn new(general: &GeneralConfig) -> Self {
        Self {
            config_dir: PathBuf::from(&general.config_dir),
            active: general.active_config.as_deref().map(Arc::from),
            provider_prefix: general.provider_prefix.clone(),
        }
    }

    /// True when `name` is a valid config name and `<config_dir>/<name>.conf`
    /// exists.
    pub fn is_known(&self, name: &str) -> bool {
        if validate_config_name(name).is_err() {
            return false;
        }
        self.config_dir.join(format!("{name}.conf")).is_file()
    }

    /// Config selected for host-driven bring-ups. Each caller gets a clone
    /// of the same shared value, so an unchanged selection keeps its
    /// identity across state commits.
    pub fn active_config(&self) -> Option<Arc<str>> {
        self.active.clone()
    }

    /// Whether the identity belongs to an external service provider.
    pub fn is_provider(&self, identity: &NetworkIdentity) -> bool {
        identity.network_id.starts_with(&self.provider_prefix)
    }

    /// Directory holding the known configs.
    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn general(config_dir: &str) -> GeneralConfig {
        GeneralConfig {
            wg_interface: "wg0".to_string(),
            config_dir: config_dir.to_string(),
            active_config: Some("home".to_string()),
            provider_prefix: "provider:".to_string(),
            policy_file: "/tmp/policy".to_string(),
            poll_interval: 2,
            log_level: "info".to_string(),
        }
    }

    fn temp_config_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("wg-lifecycle-cfg-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("home.conf"), "[Interface]\n").unwrap();
        dir
    }

    #[test]
    fn test_validate_config() {
        let config = Config {
            general: general("/etc/wireguard"),
        };
        assert!(validate_config(&config).is_ok());

        let mut bad = config.clone();
        bad.general.wg_interface = String::new();
        assert!(validate_config(&bad).is_err());

        let mut bad = config.clone();
        bad.general.config_dir = String::new();
        assert!(validate_config(&bad).is_err());

        let mut bad = config.clone();
        bad.general.active_config = Some("../../etc/shadow".to_string());
        assert!(validate_config(&bad).is_err());

        let mut bad = config.clone();
        bad.general.poll_interval = 0;
        assert!(validate_config(&bad).is_err());
    }

    #[test]
    fn test_is_known_checks_directory() {
        let dir = temp_config_dir();
        let store = ConfigStore::new(&general(dir.to_str().unwrap()));

        assert!(store.is_known("home"));
        assert!(!store.is_known("office"));
    }

    #[test]
    fn test_is_known_rejects_unsafe_names() {
        let dir = temp_config_dir();
        let store = ConfigStore::new(&general(dir.to_str().unwrap()));

        assert!(!store.is_known(""));
        assert!(!store.is_known("../home"));
        assert!(!store.is_known("home; rm -rf /"));
    }

    #[test]
    fn test_active_config_keeps_identity() {
        let store = ConfigStore::new(&general("/etc/wireguard"));
        let first = store.active_config().unwrap();
        let second = store.active_config().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_provider_identity_prefix() {
        let store = ConfigStore::new(&general("/etc/wireguard"));
        let provider = NetworkIdentity {
            network_type: "WIREGUARD".to_string(),
            network_attrs: 0,
            network_id: "provider:acme-vpn".to_string(),
        };
        let host = NetworkIdentity {
            network_id: "home-wifi".to_string(),
            ..provider.clone()
        };
        assert!(store.is_provider(&provider));
        assert!(!store.is_provider(&host));
    }
}
