use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::config::check_secret_permissions;
use crate::state::ServerIdentity;
use crate::visibility::RefreshSink;

const SERVERS_FILE: &str = "servers.toml";
const CREDENTIALS_FILE: &str = "credentials.toml";

/// Registration fields that are safe to keep in plain settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRegistrationNonsensitive {
    pub url: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerCredentials {
    pub username: String,
    pub password: String,
}

/// A registered SCDF server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRegistration {
    pub url: String,
    pub name: String,
    pub credentials: ServerCredentials,
}

impl ServerRegistration {
    pub fn identity(&self) -> ServerIdentity {
        ServerIdentity::from_url(&self.url)
    }

    /// Join `path` onto the registration's base URL.
    pub fn url_for(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

/// Payload announcing the known servers to the language server.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataflowEnvironmentParams {
    pub environments: Vec<ServerRegistration>,
    pub default_environment: String,
    pub trustssl: bool,
}

/// Source of the servers the poller should check.
///
/// Implementations are consulted on every tick, so edits to the server list
/// are picked up without restarting the poller.
pub trait ServerDirectory: Send + Sync {
    fn list_servers(&self) -> BoxFuture<'_, Result<Vec<ServerRegistration>, RegistrationError>>;
}

#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("server already registered with name: {0}")]
    DuplicateName(String),
    #[error("server already registered with url: {0}")]
    DuplicateUrl(String),
    #[error("server not found: {0}")]
    NotFound(String),
    #[error("invalid server url: {0}")]
    InvalidUrl(String),
    #[error("failed to read {}: {}", .0.display(), .1)]
    ReadFailed(PathBuf, #[source] std::io::Error),
    #[error("failed to parse {}: {}", .0.display(), .1)]
    ParseFailed(PathBuf, #[source] toml::de::Error),
    #[error("failed to write {}: {}", .0.display(), .1)]
    WriteFailed(PathBuf, #[source] std::io::Error),
    #[error("failed to serialize registrations: {0}")]
    SerializeFailed(#[source] toml::ser::Error),
    #[error("registration task failed: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

/// Validate a server base URL. Only `http` and `https` with a host are
/// accepted.
pub fn validate_server_url(url: &str) -> Result<(), String> {
    let parsed = reqwest::Url::parse(url).map_err(|e| format!("'{}': {}", url, e))?;
    match parsed.scheme() {
        "http" | "https" => {}
        other => return Err(format!("unsupported scheme '{}'", other)),
    }
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(format!("'{}' has no host", url));
    }
    Ok(())
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ServersFile {
    default: Option<ServerRegistrationNonsensitive>,
    #[serde(default)]
    servers: Vec<ServerRegistrationNonsensitive>,
}

fn credentials_key(name: &str) -> String {
    format!("usernamepwd_{}", name)
}

/// Persistent directory of registered servers.
///
/// Names and URLs live in `servers.toml`; credentials live in
/// `credentials.toml` keyed by `usernamepwd_<name>`. A registration whose
/// credentials are missing is not reported by [`get_servers`].
///
/// [`get_servers`]: ServerRegistrationManager::get_servers
pub struct ServerRegistrationManager {
    dir: PathBuf,
    trustssl: bool,
    write_lock: Mutex<()>,
    on_change: Mutex<Option<RefreshSink>>,
}

impl ServerRegistrationManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            trustssl: false,
            write_lock: Mutex::new(()),
            on_change: Mutex::new(None),
        }
    }

    pub fn with_trustssl(mut self, trustssl: bool) -> Self {
        self.trustssl = trustssl;
        self
    }

    /// Install the callback run after every successful mutation, normally
    /// the explorer-wide refresh.
    pub fn set_on_change(&self, sink: RefreshSink) {
        *self.on_change.lock() = Some(sink);
    }

    fn servers_path(&self) -> PathBuf {
        self.dir.join(SERVERS_FILE)
    }

    fn credentials_path(&self) -> PathBuf {
        self.dir.join(CREDENTIALS_FILE)
    }

    /// All registrations that have stored credentials, in registration order.
    pub fn get_servers(&self) -> Result<Vec<ServerRegistration>, RegistrationError> {
        load_servers(&self.servers_path(), &self.credentials_path())
    }

    /// Register a new server. The first server registered becomes the
    /// default.
    pub fn connect_server(&self, registration: ServerRegistration) -> Result<(), RegistrationError> {
        validate_server_url(&registration.url).map_err(RegistrationError::InvalidUrl)?;
        {
            let _guard = self.write_lock.lock();
            let mut servers = self.read_servers()?;
            let identity = registration.identity();

            if servers
                .servers
                .iter()
                .any(|s| s.name.eq_ignore_ascii_case(&registration.name))
            {
                return Err(RegistrationError::DuplicateName(registration.name));
            }
            if servers
                .servers
                .iter()
                .any(|s| ServerIdentity::from_url(&s.url) == identity)
            {
                return Err(RegistrationError::DuplicateUrl(registration.url));
            }

            let mut credentials = self.read_credentials()?;
            credentials.insert(
                credentials_key(&registration.name),
                registration.credentials.clone(),
            );
            self.write_credentials(&credentials)?;

            let entry = ServerRegistrationNonsensitive {
                url: registration.url.clone(),
                name: registration.name.clone(),
            };
            servers.servers.push(entry.clone());
            if servers.servers.len() == 1 {
                servers.default = Some(entry);
            }
            self.write_servers(&servers)?;
            tracing::info!(server = %registration.url, name = %registration.name, "server registered");
        }
        self.notify_changed();
        Ok(())
    }

    /// Remove a server by name (case-insensitive). If it was the default,
    /// the first remaining server takes its place.
    pub fn disconnect_server(&self, name: &str) -> Result<(), RegistrationError> {
        {
            let _guard = self.write_lock.lock();
            let mut servers = self.read_servers()?;
            let index = servers
                .servers
                .iter()
                .position(|s| s.name.eq_ignore_ascii_case(name))
                .ok_or_else(|| RegistrationError::NotFound(name.to_string()))?;
            let removed = servers.servers.remove(index);

            let mut credentials = self.read_credentials()?;
            if credentials.remove(&credentials_key(&removed.name)).is_some() {
                self.write_credentials(&credentials)?;
            }

            let was_default = servers
                .default
                .as_ref()
                .is_some_and(|d| d.name == removed.name);
            if was_default {
                servers.default = servers.servers.first().cloned();
            }
            self.write_servers(&servers)?;
            tracing::info!(server = %removed.url, name = %removed.name, "server unregistered");
        }
        self.notify_changed();
        Ok(())
    }

    /// Mark the server with the given name (case-insensitive) as default.
    pub fn set_default_server(&self, name: &str) -> Result<ServerRegistrationNonsensitive, RegistrationError> {
        let entry = {
            let _guard = self.write_lock.lock();
            let mut servers = self.read_servers()?;
            let entry = servers
                .servers
                .iter()
                .find(|s| s.name.eq_ignore_ascii_case(name))
                .cloned()
                .ok_or_else(|| RegistrationError::NotFound(name.to_string()))?;
            servers.default = Some(entry.clone());
            self.write_servers(&servers)?;
            entry
        };
        self.notify_changed();
        Ok(entry)
    }

    /// The stored default matched by URL, or the only server when exactly
    /// one is registered. Read failures resolve to `None`.
    pub fn get_default_server(&self) -> Option<ServerRegistration> {
        let default = self.read_servers().ok()?.default;
        let servers = self.get_servers().ok()?;
        let matched = default.and_then(|d| {
            let identity = ServerIdentity::from_url(&d.url);
            servers.iter().find(|s| s.identity() == identity).cloned()
        });
        match matched {
            Some(server) => Some(server),
            None if servers.len() == 1 => servers.into_iter().next(),
            None => None,
        }
    }

    /// Build the environment payload for the language server, if a default
    /// server can be resolved.
    pub fn environment(&self) -> Result<Option<DataflowEnvironmentParams>, RegistrationError> {
        let environments = self.get_servers()?;
        let Some(default) = self.get_default_server() else {
            return Ok(None);
        };
        Ok(Some(DataflowEnvironmentParams {
            environments,
            default_environment: default.name,
            trustssl: self.trustssl,
        }))
    }

    fn notify_changed(&self) {
        let sink = self.on_change.lock().clone();
        if let Some(sink) = sink {
            sink();
        }
    }

    fn read_servers(&self) -> Result<ServersFile, RegistrationError> {
        read_toml(&self.servers_path())
    }

    fn read_credentials(&self) -> Result<BTreeMap<String, ServerCredentials>, RegistrationError> {
        read_credentials(&self.credentials_path())
    }

    fn write_servers(&self, servers: &ServersFile) -> Result<(), RegistrationError> {
        write_toml(&self.servers_path(), servers)
    }

    fn write_credentials(
        &self,
        credentials: &BTreeMap<String, ServerCredentials>,
    ) -> Result<(), RegistrationError> {
        let path = self.credentials_path();
        write_toml(&path, credentials)?;
        restrict_permissions(&path)
    }
}

impl ServerDirectory for ServerRegistrationManager {
    /// Reads the stores on the blocking pool so a poll tick never stalls a
    /// runtime worker on file I/O.
    fn list_servers(&self) -> BoxFuture<'_, Result<Vec<ServerRegistration>, RegistrationError>> {
        let servers_path = self.servers_path();
        let credentials_path = self.credentials_path();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || load_servers(&servers_path, &credentials_path)).await?
        })
    }
}

fn load_servers(
    servers_path: &Path,
    credentials_path: &Path,
) -> Result<Vec<ServerRegistration>, RegistrationError> {
    let servers: ServersFile = read_toml(servers_path)?;
    let credentials = read_credentials(credentials_path)?;
    Ok(servers
        .servers
        .into_iter()
        .filter_map(|reg| {
            let creds = credentials.get(&credentials_key(&reg.name))?.clone();
            Some(ServerRegistration {
                url: reg.url,
                name: reg.name,
                credentials: creds,
            })
        })
        .collect())
}

fn read_credentials(path: &Path) -> Result<BTreeMap<String, ServerCredentials>, RegistrationError> {
    check_secret_permissions(path);
    read_toml(path)
}

fn read_toml<T: Default + serde::de::DeserializeOwned>(path: &Path) -> Result<T, RegistrationError> {
    if !path.exists() {
        return Ok(T::default());
    }
    let contents = std::fs::read_to_string(path)
        .map_err(|e| RegistrationError::ReadFailed(path.to_path_buf(), e))?;
    toml::from_str(&contents).map_err(|e| RegistrationError::ParseFailed(path.to_path_buf(), e))
}

fn write_toml<T: Serialize>(path: &Path, value: &T) -> Result<(), RegistrationError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| RegistrationError::WriteFailed(path.to_path_buf(), e))?;
    }
    let contents = toml::to_string_pretty(value).map_err(RegistrationError::SerializeFailed)?;
    std::fs::write(path, contents).map_err(|e| RegistrationError::WriteFailed(path.to_path_buf(), e))
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<(), RegistrationError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| RegistrationError::WriteFailed(path.to_path_buf(), e))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<(), RegistrationError> {
    Ok(())
}
