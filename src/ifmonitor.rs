// WireGuard interface presence monitor

//! Kernel interface monitor
//!
//! Watches the managed WireGuard interface and reports presence edges to
//! the engine as interface-up(index)/interface-down events. Presence is
//! polled through `if-addrs`; a wg-quick-managed interface always carries
//! an address while it exists, so showing up there is the up condition.

use crate::engine::Input;
use anyhow::{Context, Result};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;

/// Kernel index of the named interface, or None when it does not exist.
pub fn interface_index(name: &str) -> Result<Option<i32>> {
    let interfaces = if_addrs::get_if_addrs().context("Failed to get interface addresses")?;

    for iface in interfaces {
        if iface.name == name {
            let index = iface.index.map(|i| i as i32).unwrap_or(-1);
            return Ok(Some(index));
        }
    }

    Ok(None)
}

/// Polls the managed interface and reports presence edges.
pub struct InterfaceMonitor {
    interface: String,
    poll_interval: Duration,
    inputs: mpsc::Sender<Input>,
}

impl InterfaceMonitor {
    /// New monitor for the named interface.
    pub fn new(interface: String, poll_interval: Duration, inputs: mpsc::Sender<Input>) -> Self {
        Self {
            interface,
            poll_interval,
            inputs,
        }
    }

    /// Poll until the engine goes away.
    pub async fn run(self) {
        log::info!("interface monitor watching {}", self.interface);

        let mut was_up = false;
        let mut timer = interval(self.poll_interval);

        loop {
            timer.tick().await;

            let index = match interface_index(&self.interface) {
                Ok(index) => index,
                Err(e) => {
                    log::warn!("Failed to check interface {}: {}", self.interface, e);
                    continue;
                }
            };

            let event = match (was_up, index) {
                (false, Some(index)) => {
                    was_up = true;
                    Some(Input::InterfaceUp { index })
                }
                (true, None) => {
                    was_up = false;
                    Some(Input::InterfaceDown)
                }
                _ => None,
            };

            if let Some(event) = event {
                if self.inputs.send(event).await.is_err() {
                    log::debug!("engine gone, interface monitor exiting");
                    return;
                }
            }
        }
    }
}
