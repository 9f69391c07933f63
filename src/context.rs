// Per-connection context and its store

//! Per-connection bookkeeping
//!
//! One [`ConnectionContext`] exists per logical connection (in practice a
//! single one), tracking the network identity, the pending host callbacks
//! and the launcher pid. The [`ContextStore`] indexes contexts by identity
//! and by pid; lookups always come back as options so callers handle the
//! context-already-released race explicitly.

/// Outcome delivered to a host callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    /// The request completed.
    Success,
    /// The request failed; the connection is torn down.
    Error,
}

/// One-shot host callback for an IP-up request.
pub type IpUpCallback = Box<dyn FnOnce(CallStatus) + Send>;

/// One-shot host callback for an IP-down request. Down requests only ever
/// deliver success.
pub type IpDownCallback = Box<dyn FnOnce() + Send>;

/// Host-side notifications that are not tied to an outstanding request.
pub trait HostLink: Send + Sync {
    /// Tell the host the connection died and must be closed. The host is
    /// expected to follow up with an IP-down request; the caller must not
    /// release any resources itself.
    fn fatal_close(&self, identity: &NetworkIdentity, reason: &str);
}

/// Opaque comparison key of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkIdentity {
    /// Network type string from the host.
    pub network_type: String,
    /// Attribute bits from the host.
    pub network_attrs: u32,
    /// Network id, e.g. a connection name.
    pub network_id: String,
}

/// Per-connection record. Created on IP-up, released on IP-down or on the
/// failure paths of the bring-up and launcher-exit flows.
pub struct ConnectionContext {
    /// Identity the context is keyed by.
    pub identity: NetworkIdentity,
    ip_up: Option<IpUpCallback>,
    ip_down: Option<IpDownCallback>,
    /// Pid of the spawned launcher, 0 when none is tracked.
    pub launcher_pid: u32,
}

impl ConnectionContext {
    /// New context with no pending callbacks and no launcher.
    pub fn new(identity: NetworkIdentity) -> Self {
        Self {
            identity,
            ip_up: None,
            ip_down: None,
            launcher_pid: 0,
        }
    }

    /// Store the up callback of the outstanding request.
    pub fn set_up_callback(&mut self, callback: IpUpCallback) {
        if self.ip_up.is_some() {
            log::warn!("replacing a pending ip-up callback for {:?}", self.identity);
        }
        self.ip_up = Some(callback);
    }

    /// Store the down callback of the outstanding request.
    pub fn set_down_callback(&mut self, callback: IpDownCallback) {
        if self.ip_down.is_some() {
            log::warn!("replacing a pending ip-down callback for {:?}", self.identity);
        }
        self.ip_down = Some(callback);
    }

    /// Take the up callback out of the context. Invocation consumes it, so
    /// a callback can never fire twice for one request.
    pub fn take_up(&mut self) -> Option<IpUpCallback> {
        self.ip_up.take()
    }

    /// Take the down callback out of the context.
    pub fn take_down(&mut self) -> Option<IpDownCallback> {
        self.ip_down.take()
    }
}

/// Store of registered connection contexts, keyed by identity.
///
/// Sized for a single active connection but kept general; every lookup is
/// an explicit existence check.
#[derive(Default)]
pub struct ContextStore {
    entries: Vec<ConnectionContext>,
}

impl ContextStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a context. An existing context with the same identity is
    /// replaced with a warning; the host contract allows one outstanding
    /// request per identity.
    pub fn insert(&mut self, context: ConnectionContext) {
        if let Some(existing) = self
            .entries
            .iter()
            .position(|c| c.identity == context.identity)
        {
            log::warn!(
                "context for {:?} already registered, replacing",
                context.identity
            );
            self.entries.remove(existing);
        }
        self.entries.push(context);
    }

    /// Look up a context by identity.
    pub fn get(&self, identity: &NetworkIdentity) -> Option<&ConnectionContext> {
        self.entries.iter().find(|c| &c.identity == identity)
    }

    /// Mutable lookup by identity.
    pub fn get_mut(&mut self, identity: &NetworkIdentity) -> Option<&mut ConnectionContext> {
        self.entries.iter_mut().find(|c| &c.identity == identity)
    }

    /// Remove and return a context.
    pub fn remove(&mut self, identity: &NetworkIdentity) -> Option<ConnectionContext> {
        let position = self.entries.iter().position(|c| &c.identity == identity)?;
        Some(self.entries.remove(position))
    }

    /// Identity of the first registered context, for the event sources
    /// that address "the" connection rather than a specific identity.
    pub fn first_identity(&self) -> Option<NetworkIdentity> {
        self.entries.first().map(|c| c.identity.clone())
    }

    /// Identity of the context tracking the given launcher pid.
    pub fn identity_for_pid(&self, pid: u32) -> Option<NetworkIdentity> {
        if pid == 0 {
            return None;
        }
        self.entries
            .iter()
            .find(|c| c.launcher_pid == pid)
            .map(|c| c.identity.clone())
    }

    /// True when no context is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of registered contexts.
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
