use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Stable key for a registered server, derived from its base URL.
///
/// URLs are compared case-insensitively: two registrations with the same URL
/// are the same identity even when their display names differ.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerIdentity(String);

impl ServerIdentity {
    pub fn from_url(url: &str) -> Self {
        Self(url.trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Last observed health of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerHealthState {
    Online,
    Offline,
    /// Reserved for authentication failures. The poller never produces it.
    Noauth,
    #[default]
    Unknown,
}

impl ServerHealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Noauth => "noauth",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ServerHealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// In-memory cache of the last health observed per server identity.
///
/// Entries are created on first poll and overwritten on every later poll.
/// They are never removed; an entry for an unregistered server is simply
/// never read again.
#[derive(Clone, Default)]
pub struct ServerStateStore {
    inner: Arc<RwLock<HashMap<ServerIdentity, ServerHealthState>>>,
}

impl ServerStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state for `identity`, `Unknown` if it was never recorded.
    pub fn get_state(&self, identity: &ServerIdentity) -> ServerHealthState {
        self.inner
            .read()
            .get(identity)
            .copied()
            .unwrap_or_default()
    }

    /// Upsert the state for `identity` and return the value it replaced.
    pub fn set_state(
        &self,
        identity: &ServerIdentity,
        state: ServerHealthState,
    ) -> ServerHealthState {
        self.inner
            .write()
            .insert(identity.clone(), state)
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}
