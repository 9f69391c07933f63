// wg-quick process launcher

//! External launcher process management
//!
//! Spawns `wg-quick up` for a named config, hands the pid to the caller
//! and watches the process from a detached task that reports the exit back
//! into the engine as an event. `stop` runs `wg-quick down` without
//! waiting and treats an already-down interface as success.

use crate::engine::Input;
use anyhow::Result;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tokio::sync::mpsc;

/// Validates that a name (interface or config) is safe to use in shell
/// commands. Only allows alphanumeric characters, hyphens, and underscores
/// to prevent command injection.
fn validate_name(name: &str, field_name: &str) -> Result<()> {
    if name.is_empty() {
        anyhow::bail!("{} cannot be empty", field_name);
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        anyhow::bail!(
            "{} contains invalid characters: '{}'. Only alphanumeric, hyphens, and underscores are allowed",
            field_name,
            name
        );
    }

    Ok(())
}

/// Public wrapper for validating interface names.
///
/// # Errors
///
/// Returns an error if the interface name is empty or contains invalid
/// characters.
pub fn validate_interface_name(name: &str) -> Result<()> {
    validate_name(name, "Interface name")
}

/// Public wrapper for validating config names.
///
/// # Errors
///
/// Returns an error if the config name is empty or contains invalid
/// characters.
pub fn validate_config_name(name: &str) -> Result<()> {
    validate_name(name, "Config name")
}

/// Why a launcher spawn did not happen.
#[derive(Debug)]
pub enum LaunchError {
    /// No config is selected for this connection.
    MissingConfig,
    /// The config name failed the safe-name check.
    InvalidName(String),
    /// The spawn itself failed.
    Spawn(std::io::Error),
    /// The child had no pid to track (already reaped).
    NoPid,
}

impl fmt::Display for LaunchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LaunchError::MissingConfig => write!(f, "no active config to start"),
            LaunchError::InvalidName(name) => write!(f, "invalid config name '{name}'"),
            LaunchError::Spawn(err) => write!(f, "failed to spawn wg-quick: {err}"),
            LaunchError::NoPid => write!(f, "spawned wg-quick has no pid"),
        }
    }
}

impl std::error::Error for LaunchError {}

/// Launcher collaborator as seen by the effect executor.
pub trait ProcessLauncher: Send + Sync {
    /// Spawn the bring-up process for the named config. Returns the pid;
    /// completion arrives later as a launcher-exited event.
    fn start(&self, config: &str) -> Result<u32, LaunchError>;

    /// Bring the config down. Fire-and-forget; already-down is fine.
    fn stop(&self, config: &str);
}

/// `wg-quick`-backed launcher.
pub struct WgQuickLauncher {
    config_dir: PathBuf,
    events: mpsc::Sender<Input>,
}

impl WgQuickLauncher {
    /// New launcher resolving config names under `config_dir` and
    /// reporting exits into `events`.
    pub fn new(config_dir: PathBuf, events: mpsc::Sender<Input>) -> Self {
        Self { config_dir, events }
    }

    fn config_path(&self, config: &str) -> PathBuf {
        self.config_dir.join(format!("{config}.conf"))
    }
}

impl ProcessLauncher for WgQuickLauncher {
    fn start(&self, config: &str) -> Result<u32, LaunchError> {
        validate_config_name(config).map_err(|_| LaunchError::InvalidName(config.to_string()))?;

        let path = self.config_path(config);
        log::info!("Starting wg-quick up {}", path.display());

        let mut child = Command::new("wg-quick")
            .arg("up")
            .arg(&path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(LaunchError::Spawn)?;

        let pid = child.id().ok_or(LaunchError::NoPid)?;

        let events = self.events.clone();
        tokio::spawn(async move {
            let success = match child.wait().await {
                Ok(status) => status.success(),
                Err(e) => {
                    log::error!("Failed to wait for wg-quick pid {}: {}", pid, e);
                    false
                }
            };
            if events
                .send(Input::LauncherExited { pid, success })
                .await
                .is_err()
            {
                log::debug!("Engine gone, dropping exit of wg-quick pid {}", pid);
            }
        });

        Ok(pid)
    }

    fn stop(&self, config: &str) {
        if validate_config_name(config).is_err() {
            log::error!("Refusing to stop invalid config name '{}'", config);
            return;
        }

        let path = self.config_path(config);
        log::info!("Stopping wg-quick for {}", path.display());

        tokio::spawn(async move {
            match Command::new("wg-quick").arg("down").arg(&path).output().await {
                Ok(output) => {
                    if !output.status.success() {
                        let stderr = String::from_utf8_lossy(&output.stderr);
                        // Don't complain if the interface is already down
                        if !stderr.contains("is not a WireGuard interface") {
                            log::warn!("wg-quick down failed: {}", stderr.trim());
                        }
                    }
                }
                Err(e) => {
                    log::error!("Failed to execute wg-quick down: {}", e);
                }
            }
        });
    }
}
