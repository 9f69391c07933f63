// Serialized event loop around the reducer

//! Event ingress and state ownership
//!
//! Every event source (host requests, control-channel calls, policy
//! changes, interface notifications, launcher exits) funnels into one
//! mpsc channel of [`Input`] values. The engine task owns the
//! [`ConnectionState`] and the context store, translates each input into a
//! reducer event (creating contexts, matching pids, checking control
//! preconditions), applies the returned effects and commits the new state.
//! Nothing else ever mutates either; cross-event dependencies live in the
//! stored state only.

use crate::config::ConfigStore;
use crate::context::{
    ConnectionContext, ContextStore, HostLink, IpDownCallback, IpUpCallback, NetworkIdentity,
};
use crate::executor::{apply_effects, Collaborators, PendingSpawn};
use crate::launcher::{validate_config_name, ProcessLauncher};
use crate::state::{reduce, Event};
use crate::types::{ConnectionState, OpMode, StartResult, StatusSink, StopResult, TunnelStatus};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Inputs accepted by the engine, one variant per event source.
pub enum Input {
    /// Host requests the IP layer up for an identity.
    IpUp {
        /// Connection identity.
        identity: NetworkIdentity,
        /// One-shot completion callback.
        callback: IpUpCallback,
    },
    /// Host requests the IP layer down.
    IpDown {
        /// Connection identity.
        identity: NetworkIdentity,
        /// One-shot completion callback.
        callback: IpDownCallback,
    },
    /// The system-wide policy value changed.
    PolicyChanged {
        /// New value.
        enabled: bool,
    },
    /// Control-channel start request.
    ControlStart {
        /// Requested config name, unvalidated.
        config: String,
        /// Reply slot.
        reply: oneshot::Sender<StartResult>,
    },
    /// Control-channel stop request.
    ControlStop {
        /// Reply slot.
        reply: oneshot::Sender<StopResult>,
    },
    /// Control-channel status query.
    GetStatus {
        /// Reply slot.
        reply: oneshot::Sender<(TunnelStatus, OpMode)>,
    },
    /// The managed interface appeared.
    InterfaceUp {
        /// Kernel interface index.
        index: i32,
    },
    /// The managed interface disappeared.
    InterfaceDown,
    /// A launcher process exited.
    LauncherExited {
        /// Pid of the exited process.
        pid: u32,
        /// Exit status was zero.
        success: bool,
    },
    /// Stop the engine loop and tear down.
    Shutdown,
}

fn describe_state(state: &ConnectionState) -> String {
    format!(
        "policy={} connected={} provider={} quick={} running={} up={}",
        state.system_wide_enabled,
        state.ip_connected,
        state.provider_mode,
        state.wg_quick_running,
        state.wireguard_running,
        state.wireguard_up
    )
}

/// Owner of the connection state. Runs until a shutdown input arrives.
pub struct Engine {
    state: ConnectionState,
    store: ContextStore,
    configs: ConfigStore,
    launcher: Arc<dyn ProcessLauncher>,
    host: Arc<dyn HostLink>,
    status: Arc<dyn StatusSink>,
    inputs: mpsc::Receiver<Input>,
}

impl Engine {
    /// Build the engine. `initial_policy` seeds the policy flag from the
    /// policy store's current value.
    pub fn new(
        initial_policy: bool,
        configs: ConfigStore,
        launcher: Arc<dyn ProcessLauncher>,
        host: Arc<dyn HostLink>,
        status: Arc<dyn StatusSink>,
        inputs: mpsc::Receiver<Input>,
    ) -> Self {
        Self {
            state: ConnectionState::new(initial_policy),
            store: ContextStore::new(),
            configs,
            launcher,
            host,
            status,
            inputs,
        }
    }

    /// Process inputs until shutdown, then tear down.
    pub async fn run(mut self) {
        log::info!("engine started, {}", describe_state(&self.state));
        while let Some(input) = self.inputs.recv().await {
            if matches!(input, Input::Shutdown) {
                break;
            }
            self.handle(input);
        }
        self.teardown();
        log::info!("engine stopped");
    }

    /// Handle one input. Synchronous: an input is reduced, its effects
    /// applied and the state committed before the next one is looked at.
    fn handle(&mut self, input: Input) {
        match input {
            Input::IpUp { identity, callback } => {
                let provider = self.configs.is_provider(&identity);
                let active_config = if provider {
                    None
                } else {
                    self.configs.active_config()
                };

                let mut context = ConnectionContext::new(identity.clone());
                context.set_up_callback(callback);
                self.store.insert(context);

                self.dispatch(
                    Event::IpUp {
                        provider,
                        active_config,
                    },
                    Some(identity),
                );
            }

            Input::IpDown { identity, callback } => match self.store.get_mut(&identity) {
                Some(context) => {
                    context.set_down_callback(callback);
                    self.dispatch(Event::IpDown, Some(identity));
                }
                None => {
                    // Down requests only ever deliver success; answer
                    // directly so the host does not hang on a connection
                    // we never knew about.
                    log::warn!("ip-down for unknown identity {:?}", identity);
                    callback();
                }
            },

            Input::PolicyChanged { enabled } => {
                let identity = self.store.first_identity();
                self.dispatch(Event::PolicyChanged { enabled }, identity);
            }

            Input::ControlStart { config, reply } => {
                let result = self.control_start(config);
                let _ = reply.send(result);
            }

            Input::ControlStop { reply } => {
                let result = self.control_stop();
                let _ = reply.send(result);
            }

            Input::GetStatus { reply } => {
                let _ = reply.send((self.state.status(), self.state.mode()));
            }

            Input::InterfaceUp { index } => {
                let identity = self.store.first_identity();
                self.dispatch(Event::InterfaceUp { index }, identity);
            }

            Input::InterfaceDown => {
                let identity = self.store.first_identity();
                self.dispatch(Event::InterfaceDown, identity);
            }

            Input::LauncherExited { pid, success } => {
                // A manual disconnect may already have released the
                // context; the exit of its launcher is then nobody's
                // business.
                let Some(identity) = self.store.identity_for_pid(pid) else {
                    log::debug!("exit of untracked pid {}, ignoring", pid);
                    return;
                };
                log::info!("wg-quick pid {} exited, success={}", pid, success);
                if let Some(context) = self.store.get_mut(&identity) {
                    context.launcher_pid = 0;
                }
                self.dispatch(Event::LauncherExited { success }, Some(identity));
            }

            Input::Shutdown => {}
        }
    }

    /// Control-channel start: precondition ladder, then the reducer.
    fn control_start(&mut self, config: String) -> StartResult {
        if !self.state.provider_mode {
            log::error!("control start while not in provider mode");
            return StartResult::Refused;
        }
        if self.state.wireguard_running {
            return StartResult::AlreadyRunning;
        }
        if validate_config_name(&config).is_err() {
            return StartResult::InvalidArgs;
        }
        if !self.configs.is_known(&config) {
            return StartResult::InvalidConfig;
        }
        let Some(identity) = self.store.first_identity() else {
            log::error!("provider mode but no context is registered");
            return StartResult::Failed;
        };

        self.dispatch(
            Event::ControlStart {
                config: Arc::from(config.as_str()),
            },
            Some(identity),
        );

        // The spawn outcome lands in this transient flag; read and clear
        // it for the reply.
        if self.state.control_start_failed {
            self.state.control_start_failed = false;
            StartResult::Failed
        } else {
            StartResult::Ok
        }
    }

    /// Control-channel stop: precondition ladder, then the reducer.
    fn control_stop(&mut self) -> StopResult {
        if !self.state.provider_mode {
            log::error!("control stop while not in provider mode");
            return StopResult::Refused;
        }
        if !self.state.wireguard_running {
            return StopResult::NotRunning;
        }
        match self.store.first_identity() {
            Some(identity) => {
                self.dispatch(Event::ControlStop, Some(identity));
            }
            None => {
                log::error!("provider mode but no context is registered");
            }
        }
        StopResult::Ok
    }

    /// Reduce, apply effects against the pre-commit snapshot, commit; if
    /// the effects spawned the launcher, feed the outcome straight back
    /// through the reducer before returning.
    fn dispatch(&mut self, event: Event, identity: Option<NetworkIdentity>) {
        let launcher = Arc::clone(&self.launcher);
        let host = Arc::clone(&self.host);
        let status = Arc::clone(&self.status);
        let collaborators = Collaborators {
            launcher: &*launcher,
            host: &*host,
            status: &*status,
        };

        let context = identity.as_ref().and_then(|id| self.store.get(id));
        let transition = reduce(&self.state, &event, context);
        let pending = apply_effects(
            &collaborators,
            &self.state,
            &transition.next,
            transition.effects,
            &mut self.store,
            identity.as_ref(),
        );
        self.commit(transition.next);

        if let Some(PendingSpawn { flow, outcome }) = pending {
            let ok = outcome.is_ok();
            if let (Ok(pid), Some(id)) = (&outcome, identity.as_ref()) {
                if let Some(context) = self.store.get_mut(id) {
                    context.launcher_pid = *pid;
                }
            }

            let follow = Event::LauncherSpawned { flow, ok };
            let context = identity.as_ref().and_then(|id| self.store.get(id));
            let transition = reduce(&self.state, &follow, context);
            let leftover = apply_effects(
                &collaborators,
                &self.state,
                &transition.next,
                transition.effects,
                &mut self.store,
                identity.as_ref(),
            );
            if leftover.is_some() {
                log::error!("spawn decided while handling a spawn outcome");
            }
            self.commit(transition.next);
        }
    }

    /// Replace the state record. The previous active config is released by
    /// the drop unless the new state carries the identical value.
    fn commit(&mut self, next: ConnectionState) {
        match (&self.state.active_config, &next.active_config) {
            (Some(old), Some(new)) if Arc::ptr_eq(old, new) => {}
            (Some(old), _) => log::trace!("releasing previous active config '{}'", old),
            _ => {}
        }
        log::debug!("committed: {}", describe_state(&next));
        self.state = next;
    }

    /// Shutdown housekeeping, mirroring module teardown: stop a still
    /// running launcher and complain about leftover contexts.
    fn teardown(&mut self) {
        if self.state.wireguard_running {
            if let Some(config) = self.state.active_config.as_deref() {
                log::info!("wireguard still running at shutdown, stopping");
                self.launcher.stop(config);
            }
        }
        if !self.store.is_empty() {
            log::warn!(
                "{} connection context(s) still registered at shutdown",
                self.store.len()
            );
        }
    }

    #[cfg(test)]
    fn state(&self) -> &ConnectionState {
        &self.state
    }

    #[cfg(test)]
    fn store(&self) -> &ContextStore {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CallStatus;
    use crate::launcher::LaunchError;
    use crate::types::GeneralConfig;
    use std::fs;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Mutex;

    struct TestLauncher {
        starts: Mutex<Vec<String>>,
        stops: Mutex<Vec<String>>,
        fail_start: AtomicBool,
        next_pid: AtomicU32,
    }

    impl TestLauncher {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                starts: Mutex::new(Vec::new()),
                stops: Mutex::new(Vec::new()),
                fail_start: AtomicBool::new(false),
                next_pid: AtomicU32::new(4242),
            })
        }

        fn started(&self) -> Vec<String> {
            self.starts.lock().unwrap().clone()
        }

        fn stopped(&self) -> Vec<String> {
            self.stops.lock().unwrap().clone()
        }
    }

    impl ProcessLauncher for TestLauncher {
        fn start(&self, config: &str) -> Result<u32, LaunchError> {
            self.starts.lock().unwrap().push(config.to_string());
            if self.fail_start.load(Ordering::SeqCst) {
                Err(LaunchError::MissingConfig)
            } else {
                Ok(self.next_pid.fetch_add(1, Ordering::SeqCst))
            }
        }

        fn stop(&self, config: &str) {
            self.stops.lock().unwrap().push(config.to_string());
        }
    }

    struct TestHost {
        closes: Mutex<Vec<String>>,
    }

    impl TestHost {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                closes: Mutex::new(Vec::new()),
            })
        }
    }

    impl HostLink for TestHost {
        fn fatal_close(&self, _identity: &NetworkIdentity, reason: &str) {
            self.closes.lock().unwrap().push(reason.to_string());
        }
    }

    struct NullSink;

    impl StatusSink for NullSink {
        fn emit(&self, _status: TunnelStatus, _mode: OpMode) {}
    }

    fn temp_config_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("wg-lifecycle-engine-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("home.conf"), "[Interface]\n").unwrap();
        fs::write(dir.join("acme.conf"), "[Interface]\n").unwrap();
        dir
    }

    fn config_store() -> ConfigStore {
        ConfigStore::new(&GeneralConfig {
            wg_interface: "wg0".to_string(),
            config_dir: temp_config_dir().to_str().unwrap().to_string(),
            active_config: Some("home".to_string()),
            provider_prefix: "provider:".to_string(),
            policy_file: "/tmp/policy".to_string(),
            poll_interval: 2,
            log_level: "info".to_string(),
        })
    }

    fn host_identity() -> NetworkIdentity {
        NetworkIdentity {
            network_type: "WIREGUARD".to_string(),
            network_attrs: 0,
            network_id: "home-wifi".to_string(),
        }
    }

    fn provider_identity() -> NetworkIdentity {
        NetworkIdentity {
            network_type: "WIREGUARD".to_string(),
            network_attrs: 0,
            network_id: "provider:acme".to_string(),
        }
    }

    struct Harness {
        engine: Engine,
        launcher: Arc<TestLauncher>,
        host: Arc<TestHost>,
        _inputs: mpsc::Sender<Input>,
    }

    fn harness(initial_policy: bool) -> Harness {
        let (tx, rx) = mpsc::channel(8);
        let launcher = TestLauncher::new();
        let host = TestHost::new();
        let engine = Engine::new(
            initial_policy,
            config_store(),
            Arc::clone(&launcher) as Arc<dyn ProcessLauncher>,
            Arc::clone(&host) as Arc<dyn HostLink>,
            Arc::new(NullSink),
            rx,
        );
        Harness {
            engine,
            launcher,
            host,
            _inputs: tx,
        }
    }

    fn up_callback() -> (IpUpCallback, Arc<Mutex<Option<CallStatus>>>) {
        let slot = Arc::new(Mutex::new(None));
        let cloned = Arc::clone(&slot);
        let callback: IpUpCallback = Box::new(move |status| {
            *cloned.lock().unwrap() = Some(status);
        });
        (callback, slot)
    }

    fn down_callback() -> (IpDownCallback, Arc<AtomicU32>) {
        let count = Arc::new(AtomicU32::new(0));
        let cloned = Arc::clone(&count);
        let callback: IpDownCallback = Box::new(move || {
            cloned.fetch_add(1, Ordering::SeqCst);
        });
        (callback, count)
    }

    #[test]
    fn test_ip_up_policy_off_succeeds_without_launcher() {
        let mut h = harness(false);
        let (callback, result) = up_callback();

        h.engine.handle(Input::IpUp {
            identity: host_identity(),
            callback,
        });

        assert_eq!(*result.lock().unwrap(), Some(CallStatus::Success));
        assert!(h.launcher.started().is_empty());
        assert!(h.engine.state().ip_connected);
        assert!(!h.engine.state().wireguard_running);
    }

    #[test]
    fn test_full_bringup_defers_callback_until_exit() {
        let mut h = harness(true);
        let (callback, result) = up_callback();

        h.engine.handle(Input::IpUp {
            identity: host_identity(),
            callback,
        });

        assert_eq!(h.launcher.started(), vec!["home".to_string()]);
        // Callback waits for the launcher outcome
        assert_eq!(*result.lock().unwrap(), None);
        assert!(h.engine.state().wg_quick_running);

        h.engine.handle(Input::LauncherExited {
            pid: 4242,
            success: true,
        });

        assert_eq!(*result.lock().unwrap(), Some(CallStatus::Success));
        assert!(h.engine.state().ip_connected);
        assert!(h.engine.state().wireguard_up);
        assert!(!h.engine.state().wg_quick_running);
        assert_eq!(h.engine.state().status(), TunnelStatus::Connected);
        // Context survives a successful bring-up
        assert_eq!(h.engine.store().len(), 1);
    }

    #[test]
    fn test_failed_bringup_reports_error_and_releases() {
        let mut h = harness(true);
        let (callback, result) = up_callback();

        h.engine.handle(Input::IpUp {
            identity: host_identity(),
            callback,
        });
        h.engine.handle(Input::LauncherExited {
            pid: 4242,
            success: false,
        });

        assert_eq!(*result.lock().unwrap(), Some(CallStatus::Error));
        assert!(h.engine.store().is_empty());
        assert!(!h.engine.state().ip_connected);
        assert!(!h.engine.state().wireguard_running);
        assert_eq!(h.launcher.stopped(), vec!["home".to_string()]);
    }

    #[test]
    fn test_spawn_failure_reports_error_immediately() {
        let mut h = harness(true);
        h.launcher.fail_start.store(true, Ordering::SeqCst);
        let (callback, result) = up_callback();

        h.engine.handle(Input::IpUp {
            identity: host_identity(),
            callback,
        });

        assert_eq!(*result.lock().unwrap(), Some(CallStatus::Error));
        assert!(h.engine.store().is_empty());
        assert!(!h.engine.state().ip_connected);
    }

    #[test]
    fn test_ip_down_wins_race_against_pending_launcher() {
        let mut h = harness(true);
        let (up, up_result) = up_callback();
        let (down, down_count) = down_callback();

        h.engine.handle(Input::IpUp {
            identity: host_identity(),
            callback: up,
        });
        h.engine.handle(Input::IpDown {
            identity: host_identity(),
            callback: down,
        });

        assert_eq!(down_count.load(Ordering::SeqCst), 1);
        assert!(h.engine.store().is_empty());
        assert_eq!(h.launcher.stopped(), vec!["home".to_string()]);

        // The launcher exit arrives after the release and must be a no-op
        h.engine.handle(Input::LauncherExited {
            pid: 4242,
            success: false,
        });

        assert_eq!(*up_result.lock().unwrap(), None);
        assert_eq!(down_count.load(Ordering::SeqCst), 1);
        assert!(!h.engine.state().ip_connected);
    }

    #[test]
    fn test_ip_down_unknown_identity_still_answers() {
        let mut h = harness(false);
        let (down, down_count) = down_callback();

        h.engine.handle(Input::IpDown {
            identity: host_identity(),
            callback: down,
        });

        assert_eq!(down_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_control_refused_outside_provider_mode() {
        let mut h = harness(false);

        let (reply, mut rx) = oneshot::channel();
        h.engine.handle(Input::ControlStart {
            config: "home".to_string(),
            reply,
        });
        assert_eq!(rx.try_recv().unwrap(), StartResult::Refused);

        let (reply, mut rx) = oneshot::channel();
        h.engine.handle(Input::ControlStop { reply });
        assert_eq!(rx.try_recv().unwrap(), StopResult::Refused);
    }

    #[test]
    fn test_provider_control_session() {
        let mut h = harness(false);
        let (callback, result) = up_callback();

        h.engine.handle(Input::IpUp {
            identity: provider_identity(),
            callback,
        });
        // Provider connections succeed right away, nothing started
        assert_eq!(*result.lock().unwrap(), Some(CallStatus::Success));
        assert!(h.launcher.started().is_empty());

        // Unknown config
        let (reply, mut rx) = oneshot::channel();
        h.engine.handle(Input::ControlStart {
            config: "nope".to_string(),
            reply,
        });
        assert_eq!(rx.try_recv().unwrap(), StartResult::InvalidConfig);

        // Malformed config name
        let (reply, mut rx) = oneshot::channel();
        h.engine.handle(Input::ControlStart {
            config: "../etc/shadow".to_string(),
            reply,
        });
        assert_eq!(rx.try_recv().unwrap(), StartResult::InvalidArgs);

        // Known config starts
        let (reply, mut rx) = oneshot::channel();
        h.engine.handle(Input::ControlStart {
            config: "acme".to_string(),
            reply,
        });
        assert_eq!(rx.try_recv().unwrap(), StartResult::Ok);
        assert_eq!(h.launcher.started(), vec!["acme".to_string()]);
        assert_eq!(h.engine.state().status(), TunnelStatus::Started);

        // Second start is rejected while running
        let (reply, mut rx) = oneshot::channel();
        h.engine.handle(Input::ControlStart {
            config: "acme".to_string(),
            reply,
        });
        assert_eq!(rx.try_recv().unwrap(), StartResult::AlreadyRunning);

        // Stop brings every flag down
        let (reply, mut rx) = oneshot::channel();
        h.engine.handle(Input::ControlStop { reply });
        assert_eq!(rx.try_recv().unwrap(), StopResult::Ok);
        assert_eq!(h.launcher.stopped(), vec!["acme".to_string()]);
        assert!(!h.engine.state().wireguard_running);
        assert!(!h.engine.state().wireguard_up);
        assert!(!h.engine.state().wireguard_interface_up);

        // Nothing left to stop
        let (reply, mut rx) = oneshot::channel();
        h.engine.handle(Input::ControlStop { reply });
        assert_eq!(rx.try_recv().unwrap(), StopResult::NotRunning);
    }

    #[test]
    fn test_control_start_spawn_failure_replies_failed() {
        let mut h = harness(false);
        let (callback, _result) = up_callback();
        h.engine.handle(Input::IpUp {
            identity: provider_identity(),
            callback,
        });

        h.launcher.fail_start.store(true, Ordering::SeqCst);
        let (reply, mut rx) = oneshot::channel();
        h.engine.handle(Input::ControlStart {
            config: "acme".to_string(),
            reply,
        });

        assert_eq!(rx.try_recv().unwrap(), StartResult::Failed);
        // The transient flag is consumed by the reply
        assert!(!h.engine.state().control_start_failed);
        assert!(!h.engine.state().wireguard_running);
    }

    #[test]
    fn test_interface_loss_notifies_host_once() {
        let mut h = harness(true);
        let (callback, _result) = up_callback();

        h.engine.handle(Input::IpUp {
            identity: host_identity(),
            callback,
        });
        h.engine.handle(Input::LauncherExited {
            pid: 4242,
            success: true,
        });
        h.engine.handle(Input::InterfaceUp { index: 7 });
        assert_eq!(h.engine.state().wireguard_interface_index, 7);

        h.engine.handle(Input::InterfaceDown);

        assert_eq!(h.host.closes.lock().unwrap().len(), 1);
        // The context is left for the host's follow-up ip-down
        assert_eq!(h.engine.store().len(), 1);
        assert_eq!(h.engine.state().wireguard_interface_index, -1);
    }

    #[test]
    fn test_policy_disable_scenario_settles_without_close() {
        let mut h = harness(true);
        let (callback, _result) = up_callback();

        h.engine.handle(Input::IpUp {
            identity: host_identity(),
            callback,
        });
        h.engine.handle(Input::LauncherExited {
            pid: 4242,
            success: true,
        });
        h.engine.handle(Input::InterfaceUp { index: 7 });

        h.engine.handle(Input::PolicyChanged { enabled: false });
        assert!(h.engine.state().policy_transition_ongoing);
        assert!(!h.engine.state().wireguard_running);
        assert_eq!(h.launcher.stopped(), vec!["home".to_string()]);

        h.engine.handle(Input::InterfaceDown);
        assert!(!h.engine.state().policy_transition_ongoing);
        assert!(h.host.closes.lock().unwrap().is_empty());
    }

    #[test]
    fn test_get_status_snapshot() {
        let mut h = harness(false);

        let (reply, mut rx) = oneshot::channel();
        h.engine.handle(Input::GetStatus { reply });
        assert_eq!(
            rx.try_recv().unwrap(),
            (TunnelStatus::Stopped, OpMode::Normal)
        );

        let (callback, _result) = up_callback();
        h.engine.handle(Input::IpUp {
            identity: provider_identity(),
            callback,
        });

        let (reply, mut rx) = oneshot::channel();
        h.engine.handle(Input::GetStatus { reply });
        assert_eq!(
            rx.try_recv().unwrap(),
            (TunnelStatus::Stopped, OpMode::Provider)
        );
    }
}
