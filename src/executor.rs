// Effect executor

//! Side-effect execution
//!
//! Applies the effects decided by the reducer, in order: host callbacks
//! (one-shot, taken out of the context immediately before invocation),
//! launcher start/stop, fatal-close notification, status broadcast and
//! context release. Effects read the pre-commit state snapshot; the
//! status broadcast reads the state about to be committed.

use crate::context::{ContextStore, HostLink, IpDownCallback, IpUpCallback, NetworkIdentity};
use crate::launcher::{LaunchError, ProcessLauncher};
use crate::state::{Effect, SpawnFlow};
use crate::types::{ConnectionState, StatusSink};

/// Collaborators the executor delegates to.
pub struct Collaborators<'a> {
    /// External launcher process.
    pub launcher: &'a dyn ProcessLauncher,
    /// Host notification channel.
    pub host: &'a dyn HostLink,
    /// Status broadcast sink.
    pub status: &'a dyn StatusSink,
}

/// A launcher spawn performed during the effect pass; the engine feeds the
/// outcome back through the reducer before committing the follow-up.
pub struct PendingSpawn {
    /// Flow that requested the spawn.
    pub flow: SpawnFlow,
    /// Spawn outcome, with the pid on success.
    pub outcome: Result<u32, LaunchError>,
}

/// Apply `effects` in order.
///
/// `pre` is the state snapshot the triggering event was reduced against,
/// `next` the state about to be committed. A released context's callbacks
/// are stashed so a later reply effect in the same pass still reaches
/// them, mirroring the save-before-free ordering of the teardown paths.
pub fn apply_effects(
    collaborators: &Collaborators<'_>,
    pre: &ConnectionState,
    next: &ConnectionState,
    effects: Vec<Effect>,
    store: &mut ContextStore,
    identity: Option<&NetworkIdentity>,
) -> Option<PendingSpawn> {
    let mut stashed_up: Option<IpUpCallback> = None;
    let mut stashed_down: Option<IpDownCallback> = None;
    let mut pending = None;

    for effect in effects {
        match effect {
            Effect::ReplyUp(status) => {
                let callback = identity
                    .and_then(|id| store.get_mut(id))
                    .and_then(|ctx| ctx.take_up())
                    .or_else(|| stashed_up.take());
                match callback {
                    Some(callback) => callback(status),
                    None => log::warn!("no up callback to deliver {:?}", status),
                }
            }

            Effect::ReplyDown => {
                let callback = identity
                    .and_then(|id| store.get_mut(id))
                    .and_then(|ctx| ctx.take_down())
                    .or_else(|| stashed_down.take());
                match callback {
                    Some(callback) => callback(),
                    None => log::warn!("no down callback to deliver"),
                }
            }

            Effect::StartLauncher { config, flow } => {
                let outcome = match config.as_deref() {
                    Some(config) => collaborators.launcher.start(config),
                    None => Err(LaunchError::MissingConfig),
                };
                if let Err(e) = &outcome {
                    log::error!("launcher start failed: {}", e);
                }
                pending = Some(PendingSpawn { flow, outcome });
            }

            Effect::StopLauncher => match pre.active_config.as_deref() {
                Some(config) => collaborators.launcher.stop(config),
                None => log::debug!("stop requested with no active config"),
            },

            Effect::ReleaseContext => match identity.and_then(|id| store.remove(id)) {
                Some(mut context) => {
                    stashed_up = context.take_up();
                    stashed_down = context.take_down();
                }
                None => log::warn!("release requested but context is already gone"),
            },

            Effect::NotifyFatalClose { reason } => match identity {
                Some(identity) => collaborators.host.fatal_close(identity, reason),
                None => log::warn!("fatal close with no identity: {}", reason),
            },

            Effect::EmitStatus => {
                collaborators.status.emit(next.status(), next.mode());
            }
        }
    }

    pending
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{CallStatus, ConnectionContext};
    use crate::state::Effect;
    use crate::types::{OpMode, TunnelStatus};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct RecordingLauncher {
        starts: Mutex<Vec<String>>,
        stops: Mutex<Vec<String>>,
        fail_start: bool,
    }

    impl ProcessLauncher for RecordingLauncher {
        fn start(&self, config: &str) -> Result<u32, LaunchError> {
            self.starts.lock().unwrap().push(config.to_string());
            if self.fail_start {
                Err(LaunchError::MissingConfig)
            } else {
                Ok(4242)
            }
        }

        fn stop(&self, config: &str) {
            self.stops.lock().unwrap().push(config.to_string());
        }
    }

    #[derive(Default)]
    struct RecordingHost {
        closes: Mutex<Vec<String>>,
    }

    impl HostLink for RecordingHost {
        fn fatal_close(&self, _identity: &NetworkIdentity, reason: &str) {
            self.closes.lock().unwrap().push(reason.to_string());
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        emitted: Mutex<Vec<(TunnelStatus, OpMode)>>,
    }

    impl StatusSink for RecordingSink {
        fn emit(&self, status: TunnelStatus, mode: OpMode) {
            self.emitted.lock().unwrap().push((status, mode));
        }
    }

    fn identity() -> NetworkIdentity {
        NetworkIdentity {
            network_type: "WIREGUARD".to_string(),
            network_attrs: 0,
            network_id: "home-wifi".to_string(),
        }
    }

    fn store_with_context() -> ContextStore {
        let mut store = ContextStore::new();
        store.insert(ConnectionContext::new(identity()));
        store
    }

    #[test]
    fn test_release_then_reply_still_reaches_callback() {
        let launcher = RecordingLauncher::default();
        let host = RecordingHost::default();
        let sink = RecordingSink::default();
        let collaborators = Collaborators {
            launcher: &launcher,
            host: &host,
            status: &sink,
        };

        let delivered = Arc::new(Mutex::new(None));
        let mut store = store_with_context();
        let slot = Arc::clone(&delivered);
        store
            .get_mut(&identity())
            .unwrap()
            .set_up_callback(Box::new(move |status| {
                *slot.lock().unwrap() = Some(status);
            }));

        let state = ConnectionState::new(true);
        let id = identity();
        apply_effects(
            &collaborators,
            &state,
            &state,
            vec![
                Effect::ReleaseContext,
                Effect::ReplyUp(CallStatus::Error),
                Effect::EmitStatus,
            ],
            &mut store,
            Some(&id),
        );

        assert_eq!(*delivered.lock().unwrap(), Some(CallStatus::Error));
        assert!(store.is_empty());
        assert_eq!(sink.emitted.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_stop_uses_pre_commit_config() {
        let launcher = RecordingLauncher::default();
        let host = RecordingHost::default();
        let sink = RecordingSink::default();
        let collaborators = Collaborators {
            launcher: &launcher,
            host: &host,
            status: &sink,
        };

        let mut pre = ConnectionState::new(true);
        pre.active_config = Some(Arc::from("home"));
        let mut next = pre.clone();
        next.active_config = None;

        let mut store = store_with_context();
        let id = identity();
        apply_effects(
            &collaborators,
            &pre,
            &next,
            vec![Effect::StopLauncher],
            &mut store,
            Some(&id),
        );

        assert_eq!(*launcher.stops.lock().unwrap(), vec!["home".to_string()]);
    }

    #[test]
    fn test_start_with_no_config_fails_without_spawn() {
        let launcher = RecordingLauncher::default();
        let host = RecordingHost::default();
        let sink = RecordingSink::default();
        let collaborators = Collaborators {
            launcher: &launcher,
            host: &host,
            status: &sink,
        };

        let state = ConnectionState::new(true);
        let mut store = store_with_context();
        let id = identity();
        let pending = apply_effects(
            &collaborators,
            &state,
            &state,
            vec![Effect::StartLauncher {
                config: None,
                flow: SpawnFlow::HostUp,
            }],
            &mut store,
            Some(&id),
        );

        let pending = pending.unwrap();
        assert!(pending.outcome.is_err());
        assert!(launcher.starts.lock().unwrap().is_empty());
    }

    #[test]
    fn test_fatal_close_reaches_host() {
        let launcher = RecordingLauncher::default();
        let host = RecordingHost::default();
        let sink = RecordingSink::default();
        let collaborators = Collaborators {
            launcher: &launcher,
            host: &host,
            status: &sink,
        };

        let state = ConnectionState::new(true);
        let mut store = store_with_context();
        let id = identity();
        apply_effects(
            &collaborators,
            &state,
            &state,
            vec![Effect::NotifyFatalClose { reason: "gone" }],
            &mut store,
            Some(&id),
        );

        assert_eq!(*host.closes.lock().unwrap(), vec!["gone".to_string()]);
        // The context stays registered for the host's ip-down
        assert!(!store.is_empty());
    }

    #[test]
    fn test_reply_up_without_callback_is_tolerated() {
        let launcher = RecordingLauncher::default();
        let host = RecordingHost::default();
        let sink = RecordingSink::default();
        let collaborators = Collaborators {
            launcher: &launcher,
            host: &host,
            status: &sink,
        };

        let state = ConnectionState::new(true);
        let mut store = store_with_context();
        let id = identity();
        // No callback registered: must not panic, just warn
        apply_effects(
            &collaborators,
            &state,
            &state,
            vec![Effect::ReplyUp(CallStatus::Success)],
            &mut store,
            Some(&id),
        );
    }
}
