// Shared types: connection state record, wire enums, configuration

//! Shared data structures
//!
//! This module defines the connection state record owned by the engine,
//! the status/mode values reported over the control channel, the integer
//! result codes of the control methods, and the TOML configuration
//! structures.

use std::sync::Arc;

use serde::Deserialize;

/// Aggregate lifecycle state of the single managed connection.
///
/// One instance lives inside the engine and is only ever replaced through
/// the reducer's commit step; everything else reads snapshots.
#[derive(Debug, Clone)]
pub struct ConnectionState {
    /// System-wide tunnel policy, updated by policy-change events.
    pub system_wide_enabled: bool,
    /// Name of the WireGuard config currently in use. Shared with the
    /// launcher effect; the commit step compares old/new by `Arc` identity
    /// so an unchanged config is carried over without being released.
    pub active_config: Option<Arc<str>>,
    /// The IP layer is considered connected.
    pub ip_connected: bool,
    /// Connection is driven by an external service provider over the
    /// control channel instead of the host's up/down flow.
    pub provider_mode: bool,
    /// wg-quick has been spawned and has not exited yet.
    pub wg_quick_running: bool,
    /// The WireGuard subsystem is considered active (spans the launcher
    /// run and the interface being up).
    pub wireguard_running: bool,
    /// The launcher reported a successful bring-up.
    pub wireguard_up: bool,
    /// Kernel-level interface status, set by interface notifications.
    pub wireguard_interface_up: bool,
    /// Kernel interface index, -1 when none.
    pub wireguard_interface_index: i32,
    /// A policy-triggered start/stop is in flight; host callbacks are
    /// suppressed until it settles.
    pub policy_transition_ongoing: bool,
    /// Transient flag set when a control-channel start could not spawn the
    /// launcher; the control adapter reads and clears it for its reply.
    pub control_start_failed: bool,
}

impl ConnectionState {
    /// Initial state at module start. Everything is down; only the policy
    /// value is seeded from the policy store.
    pub fn new(system_wide_enabled: bool) -> Self {
        Self {
            system_wide_enabled,
            active_config: None,
            ip_connected: false,
            provider_mode: false,
            wg_quick_running: false,
            wireguard_running: false,
            wireguard_up: false,
            wireguard_interface_up: false,
            wireguard_interface_index: -1,
            policy_transition_ongoing: false,
            control_start_failed: false,
        }
    }

    /// Tunnel status as reported over the control channel.
    pub fn status(&self) -> TunnelStatus {
        if !self.wireguard_running {
            TunnelStatus::Stopped
        } else if self.wg_quick_running {
            TunnelStatus::Started
        } else {
            TunnelStatus::Connected
        }
    }

    /// Operating mode as reported over the control channel.
    pub fn mode(&self) -> OpMode {
        if self.provider_mode {
            OpMode::Provider
        } else {
            OpMode::Normal
        }
    }
}

/// Coarse tunnel status derived from the state flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelStatus {
    /// WireGuard is not running.
    Stopped,
    /// wg-quick was spawned and has not reported back yet.
    Started,
    /// Bring-up completed.
    Connected,
}

impl TunnelStatus {
    /// Wire representation used in GetStatus replies and StatusChanged.
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelStatus::Stopped => "stopped",
            TunnelStatus::Started => "started",
            TunnelStatus::Connected => "connected",
        }
    }
}

/// Who drives the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpMode {
    /// Host-driven up/down flow.
    Normal,
    /// External service provider drives start/stop.
    Provider,
}

impl OpMode {
    /// Wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            OpMode::Normal => "normal",
            OpMode::Provider => "provider",
        }
    }
}

/// Result codes of the control-channel Start method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartResult {
    /// Launcher spawned.
    Ok,
    /// Caller is not the service provider for this connection.
    Refused,
    /// WireGuard is already running.
    AlreadyRunning,
    /// Config name empty or malformed.
    InvalidArgs,
    /// Config name not present in the config directory.
    InvalidConfig,
    /// Spawn failed.
    Failed,
}

impl StartResult {
    /// Integer code sent over the bus.
    pub fn code(self) -> i32 {
        match self {
            StartResult::Ok => 0,
            StartResult::Refused => 1,
            StartResult::AlreadyRunning => 2,
            StartResult::InvalidArgs => 3,
            StartResult::InvalidConfig => 4,
            StartResult::Failed => 5,
        }
    }
}

/// Result codes of the control-channel Stop method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopResult {
    /// Stop issued.
    Ok,
    /// Caller is not the service provider for this connection.
    Refused,
    /// Nothing to stop.
    NotRunning,
}

impl StopResult {
    /// Integer code sent over the bus.
    pub fn code(self) -> i32 {
        match self {
            StopResult::Ok => 0,
            StopResult::Refused => 1,
            StopResult::NotRunning => 2,
        }
    }
}

/// Sink for committed status transitions (the StatusChanged broadcast).
pub trait StatusSink: Send + Sync {
    /// Called once per committed state transition that emits status.
    fn emit(&self, status: TunnelStatus, mode: OpMode);
}

/// Main configuration structure.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// The single `[general]` table.
    pub general: GeneralConfig,
}

/// General configuration options.
#[derive(Debug, Deserialize, Clone)]
pub struct GeneralConfig {
    /// Name of the managed WireGuard interface.
    pub wg_interface: String,
    /// Directory holding the known `<name>.conf` WireGuard configs.
    #[serde(default = "default_config_dir")]
    pub config_dir: String,
    /// Config selected for host-driven bring-ups. Optional; provider-mode
    /// connections pick their config over the control channel instead.
    #[serde(default)]
    pub active_config: Option<String>,
    /// Identities whose network id starts with this prefix run in
    /// provider mode.
    #[serde(default = "default_provider_prefix")]
    pub provider_prefix: String,
    /// Path of the system-wide policy value.
    #[serde(default = "default_policy_file")]
    pub policy_file: String,
    /// Poll interval for the policy and interface monitors (seconds).
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    /// env_logger filter used when RUST_LOG is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

// Default values for configuration
fn default_config_dir() -> String {
    "/etc/wireguard".to_string()
}

fn default_provider_prefix() -> String {
    "provider:".to_string()
}

fn default_policy_file() -> String {
    "/etc/wg-lifecycle/system-wide".to_string()
}

fn default_poll_interval() -> u64 {
    2
}

fn default_log_level() -> String {
    "info".to_string()
}
