// System-wide policy monitor

//! System policy store
//!
//! The system-wide tunnel policy is a single boolean kept in a small file.
//! [`read_policy`] returns the current value; [`PolicyMonitor`] polls the
//! file on an interval and feeds value edges into the engine as
//! policy-change events. A missing file reads as disabled.

use crate::engine::Input;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;

/// Read the current policy value. Missing or unreadable files count as
/// disabled rather than failing the caller.
pub fn read_policy(path: &Path) -> bool {
    match fs::read_to_string(path) {
        Ok(contents) => parse_policy(&contents),
        Err(_) => false,
    }
}

fn parse_policy(contents: &str) -> bool {
    matches!(
        contents.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Polls the policy file and reports value changes.
pub struct PolicyMonitor {
    path: PathBuf,
    poll_interval: Duration,
    inputs: mpsc::Sender<Input>,
}

impl PolicyMonitor {
    /// New monitor for the given policy file.
    pub fn new(path: PathBuf, poll_interval: Duration, inputs: mpsc::Sender<Input>) -> Self {
        Self {
            path,
            poll_interval,
            inputs,
        }
    }

    /// Poll until the engine goes away. `initial` is the value the engine
    /// was seeded with, so only real edges are reported.
    pub async fn run(self, initial: bool) {
        log::info!(
            "policy monitor watching {} (currently {})",
            self.path.display(),
            initial
        );

        let mut last = initial;
        let mut timer = interval(self.poll_interval);

        loop {
            timer.tick().await;

            let current = read_policy(&self.path);
            if current == last {
                continue;
            }
            last = current;

            if self
                .inputs
                .send(Input::PolicyChanged { enabled: current })
                .await
                .is_err()
            {
                log::debug!("engine gone, policy monitor exiting");
                return;
            }
        }
    }
}
