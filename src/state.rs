// Connection lifecycle reducer

//! State machine for the connection lifecycle
//!
//! This module implements the single reducer that reconciles every event
//! source (host up/down requests, control-channel start/stop, policy
//! changes, interface notifications, launcher exits) into one consistent
//! connection state plus an ordered list of side effects.
//!
//! The reducer is pure with respect to state: it never performs I/O.
//! Spawning the launcher is therefore split in two steps. The reducer
//! emits a [`Effect::StartLauncher`] decision, the engine performs the
//! spawn and feeds the outcome straight back in as
//! [`Event::LauncherSpawned`] within the same serialized step, so the
//! observable ordering matches a synchronous start.

use crate::context::{CallStatus, ConnectionContext};
use crate::types::ConnectionState;
use std::sync::Arc;

/// Events consumed by [`reduce`].
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Host asked for the IP layer to come up. The ingress adapter has
    /// already registered the connection context.
    IpUp {
        /// Identity matched the provider pattern.
        provider: bool,
        /// Config selected for this bring-up (none in provider mode).
        active_config: Option<Arc<str>>,
    },
    /// Host asked for the IP layer to go down.
    IpDown,
    /// The system-wide policy value changed.
    PolicyChanged {
        /// New policy value.
        enabled: bool,
    },
    /// Control channel asked to start with a validated config.
    ControlStart {
        /// Config name, already known-checked by the adapter.
        config: Arc<str>,
    },
    /// Control channel asked to stop.
    ControlStop,
    /// The kernel interface appeared.
    InterfaceUp {
        /// Kernel interface index.
        index: i32,
    },
    /// The kernel interface disappeared.
    InterfaceDown,
    /// The launcher process exited.
    LauncherExited {
        /// Exit status was zero.
        success: bool,
    },
    /// Outcome of a previously decided launcher spawn, fed back by the
    /// engine within the same serialized step.
    LauncherSpawned {
        /// Which flow requested the spawn.
        flow: SpawnFlow,
        /// The spawn succeeded.
        ok: bool,
    },
}

/// The flow a launcher spawn was decided in; selects the failure handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnFlow {
    /// Host-driven bring-up.
    HostUp,
    /// Policy toggled on while connected.
    PolicyEnable,
    /// Control-channel start.
    Control,
}

/// Side effects decided by the reducer, applied in order by the executor.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Deliver the one-shot up callback with the given outcome.
    ReplyUp(CallStatus),
    /// Deliver the one-shot down callback.
    ReplyDown,
    /// Spawn the launcher for the given config.
    StartLauncher {
        /// Config to bring up; a missing config fails the spawn.
        config: Option<Arc<str>>,
        /// Flow the decision belongs to.
        flow: SpawnFlow,
    },
    /// Bring the active config down.
    StopLauncher,
    /// Remove the connection context and release everything it owns.
    ReleaseContext,
    /// Tell the host the connection is gone for good. The host answers
    /// with an IP-down request, so no release happens here.
    NotifyFatalClose {
        /// Human-readable reason passed to the host.
        reason: &'static str,
    },
    /// Broadcast the committed status.
    EmitStatus,
}

/// A reducer decision: the state to commit and the effects to apply
/// against the pre-commit snapshot.
#[derive(Debug)]
pub struct Transition {
    /// State to commit after the effects ran.
    pub next: ConnectionState,
    /// Ordered side effects.
    pub effects: Vec<Effect>,
}

/// Map (current state, event, optional context) to (next state, effects).
///
/// Callback suppression is always checked provider-mode first, then
/// transition-in-progress, then the default host-callback path; provider
/// connections never have host callbacks registered at all.
pub fn reduce(
    current: &ConnectionState,
    event: &Event,
    context: Option<&ConnectionContext>,
) -> Transition {
    let mut next = current.clone();
    let mut effects = Vec::new();

    match event {
        Event::IpUp {
            provider,
            active_config,
        } => {
            if current.ip_connected {
                log::warn!("ip-up while already connected");
            }

            next.ip_connected = true;
            next.provider_mode = *provider;
            next.active_config = active_config.clone();

            if *provider {
                // Provider connections report success right away and wait
                // for control-channel calls.
                effects.push(Effect::ReplyUp(CallStatus::Success));
                effects.push(Effect::EmitStatus);
            } else if current.system_wide_enabled {
                effects.push(Effect::StartLauncher {
                    config: active_config.clone(),
                    flow: SpawnFlow::HostUp,
                });
                // Status goes out once the spawn outcome lands.
            } else {
                // Policy is off, nothing to start.
                effects.push(Effect::ReplyUp(CallStatus::Success));
                effects.push(Effect::EmitStatus);
            }
        }

        Event::IpDown => {
            // The host owns teardown unconditionally, launcher still
            // starting or not.
            next.ip_connected = false;
            next.provider_mode = false;
            next.wireguard_up = false;
            next.wg_quick_running = false;
            next.wireguard_running = false;

            effects.push(Effect::StopLauncher);
            effects.push(Effect::ReleaseContext);
            effects.push(Effect::ReplyDown);
            effects.push(Effect::EmitStatus);
        }

        Event::PolicyChanged { enabled } => {
            log::info!("system-wide policy changed to {}", enabled);
            next.system_wide_enabled = *enabled;

            // Providers own their connection; policy only matters while
            // an IP-layer connection exists.
            if !current.provider_mode && current.ip_connected {
                if context.is_none() {
                    log::error!("connected but no context is registered");
                } else if *enabled && current.system_wide_enabled != *enabled {
                    next.policy_transition_ongoing = true;
                    effects.push(Effect::StartLauncher {
                        config: current.active_config.clone(),
                        flow: SpawnFlow::PolicyEnable,
                    });
                } else {
                    next.policy_transition_ongoing = true;
                    // Interface-down detection is unreliable when the
                    // interface never came up, so the flags are forced
                    // instead of awaited.
                    next.wireguard_running = false;
                    next.wireguard_up = false;
                    next.wireguard_interface_up = false;
                    effects.push(Effect::StopLauncher);
                    effects.push(Effect::EmitStatus);
                }
            }
        }

        Event::ControlStart { config } => {
            next.active_config = Some(config.clone());
            effects.push(Effect::StartLauncher {
                config: Some(config.clone()),
                flow: SpawnFlow::Control,
            });
        }

        Event::ControlStop => {
            next.wireguard_running = false;
            next.wireguard_up = false;
            next.wireguard_interface_up = false;
            effects.push(Effect::StopLauncher);
            effects.push(Effect::EmitStatus);
        }

        Event::InterfaceUp { index } => {
            log::info!("wireguard interface up, index {}", index);
            next.wireguard_interface_up = true;
            next.wireguard_interface_index = *index;

            if context.is_none() {
                log::error!("interface up but no context is registered");
            } else {
                effects.push(Effect::EmitStatus);
            }
        }

        Event::InterfaceDown => {
            log::info!("wireguard interface down");
            next.wireguard_interface_up = false;
            next.wireguard_interface_index = -1;

            if context.is_none() {
                log::error!("interface down but no context is registered");
            } else {
                if !current.wireguard_running {
                    // Inconsistent, e.g. the flags were forced down when a
                    // transition stopped the launcher; keep going.
                    log::warn!("interface down but it was not known to be running");
                }
                if current.provider_mode {
                    // Provider picks the loss up from the status signal.
                } else if current.policy_transition_ongoing {
                    next.policy_transition_ongoing = false;
                } else {
                    // The host reacts with an ip-down request, which does
                    // the actual release; releasing here too would free
                    // twice.
                    effects.push(Effect::NotifyFatalClose {
                        reason: "wireguard interface went down unexpectedly",
                    });
                }
                effects.push(Effect::EmitStatus);
            }
        }

        Event::LauncherExited { success } => {
            next.wg_quick_running = false;
            next.wireguard_up = *success;

            if *success {
                next.ip_connected = true;
                if current.provider_mode {
                    // Provider watches the status signal.
                } else if current.policy_transition_ongoing {
                    next.policy_transition_ongoing = false;
                } else {
                    effects.push(Effect::ReplyUp(CallStatus::Success));
                }
            } else if current.provider_mode {
                // The status signal is the provider's failure report.
            } else if current.policy_transition_ongoing {
                next.policy_transition_ongoing = false;
            } else {
                next.ip_connected = false;
                next.wireguard_running = false;
                next.wireguard_up = false;
                next.wireguard_interface_up = false;
                effects.push(Effect::StopLauncher);
                effects.push(Effect::ReleaseContext);
                effects.push(Effect::ReplyUp(CallStatus::Error));
            }
            effects.push(Effect::EmitStatus);
        }

        Event::LauncherSpawned { flow, ok } => match flow {
            SpawnFlow::HostUp => {
                if *ok {
                    next.wg_quick_running = true;
                    next.wireguard_running = true;
                    next.wireguard_up = false;
                    // Up callback is deferred until the launcher exits.
                } else {
                    next.ip_connected = false;
                    effects.push(Effect::ReleaseContext);
                    effects.push(Effect::ReplyUp(CallStatus::Error));
                }
                effects.push(Effect::EmitStatus);
            }
            SpawnFlow::PolicyEnable => {
                if *ok {
                    next.wg_quick_running = true;
                    next.wireguard_running = true;
                    next.wireguard_up = false;
                } else {
                    log::error!("could not start launcher on policy change");
                    effects.push(Effect::NotifyFatalClose {
                        reason: "could not start wireguard on policy change",
                    });
                }
                effects.push(Effect::EmitStatus);
            }
            SpawnFlow::Control => {
                if *ok {
                    next.wg_quick_running = true;
                    next.wireguard_running = true;
                    next.wireguard_up = false;
                    effects.push(Effect::EmitStatus);
                } else {
                    // The control adapter reads this back for its reply
                    // and clears it.
                    next.control_start_failed = true;
                }
            }
        },
    }

    Transition { next, effects }
}
