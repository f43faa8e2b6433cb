//! Explorer providers: one per SCDF domain, each rendering a root node per
//! registered server and re-rendering whenever the state manager asks.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::config::StateCheckMode;
use crate::manager::ServerStatesManager;
use crate::registration::{RegistrationError, ServerDirectory, ServerRegistration};
use crate::state::ServerHealthState;
use crate::visibility::RefreshSink;

/// Buffered refresh signals per provider. A lagging subscriber only needs
/// to re-read once.
pub const REFRESH_CAPACITY: usize = 16;

/// Domain shown beneath a server node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerMode {
    Apps,
    Streams,
    Tasks,
    Jobs,
}

impl ServerMode {
    pub const ALL: [ServerMode; 4] = [Self::Apps, Self::Streams, Self::Tasks, Self::Jobs];

    /// Tree view id registered with the state manager.
    pub fn view_id(&self) -> &'static str {
        match self {
            Self::Apps => "scdfApps",
            Self::Streams => "scdfStreams",
            Self::Tasks => "scdfTasks",
            Self::Jobs => "scdfJobs",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::Apps => "Apps",
            Self::Streams => "Streams",
            Self::Tasks => "Tasks",
            Self::Jobs => "Jobs",
        }
    }
}

/// Root node for one registered server in an explorer tree.
#[derive(Debug, Clone, Serialize)]
pub struct ServerNode {
    pub label: String,
    pub description: String,
    pub mode: ServerMode,
    pub state: ServerHealthState,
    #[serde(skip)]
    pub registration: ServerRegistration,
}

impl ServerNode {
    pub const CONTEXT_VALUE: &'static str = "serverRegistration";

    pub fn new(registration: ServerRegistration, mode: ServerMode, state: ServerHealthState) -> Self {
        Self {
            label: registration.name.clone(),
            description: registration.url.clone(),
            mode,
            state,
            registration,
        }
    }

    /// Icon name for this node under the given check mode. Only `Online` and
    /// `Offline` change the icon; other states keep the plain server icon.
    pub fn icon(&self, check: StateCheckMode) -> &'static str {
        match (check, self.state) {
            (StateCheckMode::Icon, ServerHealthState::Offline) => "server_offline",
            (StateCheckMode::Color, ServerHealthState::Online) => "server_green",
            (StateCheckMode::Color, ServerHealthState::Offline) => "server_red",
            _ => "server",
        }
    }
}

/// Tree data provider for one domain.
///
/// `refresh()` is the sink registered with the state manager; UIs listen for
/// it through [`ExplorerProvider::subscribe`].
#[derive(Clone)]
pub struct ExplorerProvider {
    mode: ServerMode,
    directory: Arc<dyn ServerDirectory>,
    states: ServerStatesManager,
    tx: broadcast::Sender<()>,
}

impl ExplorerProvider {
    pub fn new(mode: ServerMode, directory: Arc<dyn ServerDirectory>, states: ServerStatesManager) -> Self {
        let (tx, _) = broadcast::channel(REFRESH_CAPACITY);
        Self {
            mode,
            directory,
            states,
            tx,
        }
    }

    pub fn mode(&self) -> ServerMode {
        self.mode
    }

    pub fn view_id(&self) -> &'static str {
        self.mode.view_id()
    }

    /// Signal listeners that the tree must be re-read.
    pub fn refresh(&self) {
        // No receivers just means no UI is listening.
        let _ = self.tx.send(());
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    pub fn refresh_sink(&self) -> RefreshSink {
        let tx = self.tx.clone();
        Arc::new(move || {
            let _ = tx.send(());
        })
    }

    /// Forward a tree view visibility change to the state manager.
    pub fn set_visible(&self, visible: bool) {
        if visible {
            self.states.on_view_visible(self.view_id(), self.refresh_sink());
        } else {
            self.states.on_view_hidden(self.view_id());
        }
    }

    /// One node per registered server, tagged with its cached health.
    pub async fn root_nodes(&self) -> Result<Vec<ServerNode>, RegistrationError> {
        let servers = self.directory.list_servers().await?;
        Ok(servers
            .into_iter()
            .map(|registration| {
                let state = self.states.get_state(&registration.identity());
                ServerNode::new(registration, self.mode, state)
            })
            .collect())
    }

    /// Icon for a node under the current settings.
    pub fn icon_for(&self, node: &ServerNode) -> &'static str {
        node.icon(self.states.settings().mode)
    }
}

/// The four explorer providers, sharing one state manager.
#[derive(Clone)]
pub struct Explorers {
    providers: Vec<ExplorerProvider>,
}

impl Explorers {
    pub fn new(directory: Arc<dyn ServerDirectory>, states: ServerStatesManager) -> Self {
        let providers = ServerMode::ALL
            .iter()
            .map(|mode| ExplorerProvider::new(*mode, directory.clone(), states.clone()))
            .collect();
        Self { providers }
    }

    pub fn providers(&self) -> &[ExplorerProvider] {
        &self.providers
    }

    pub fn get(&self, mode: ServerMode) -> Option<&ExplorerProvider> {
        self.providers.iter().find(|p| p.mode() == mode)
    }

    /// Refresh every provider, whether visible or not.
    pub fn refresh_all(&self) {
        for provider in &self.providers {
            provider.refresh();
        }
    }

    /// Sink that refreshes every provider, for registration changes.
    pub fn refresh_all_sink(&self) -> RefreshSink {
        let explorers = self.clone();
        Arc::new(move || explorers.refresh_all())
    }

    pub fn set_visible(&self, visible: bool) {
        for provider in &self.providers {
            provider.set_visible(visible);
        }
    }
}
