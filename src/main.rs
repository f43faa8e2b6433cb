//! scdf-explorer - server health for Spring Cloud Data Flow explorers
//!
//! `watch` runs the explorer views headless: every registered server is
//! polled while the views are visible and the tree is printed whenever a
//! view refreshes. The `servers` subcommands manage registrations and
//! `probe` checks a single server once.

use clap::{Parser as ClapParser, Subcommand};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use scdf_explorer::{
    config::{self, ExplorerConfig, StateCheckSettings},
    explorer::{ExplorerProvider, Explorers},
    manager::ServerStatesManager,
    probe::{HealthProbe, HttpHealthProbe, ProbeError},
    registration::{
        RegistrationError, ServerCredentials, ServerDirectory, ServerRegistration,
        ServerRegistrationManager,
    },
};

const CONFIG_FILE: &str = "config.toml";
const CONFIG_RELOAD_INTERVAL: Duration = Duration::from_secs(2);

/// scdf-explorer - server health for Spring Cloud Data Flow explorers
#[derive(ClapParser, Debug)]
#[command(name = "scdf-explorer", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory holding config.toml and the server registrations
    #[arg(long, global = true, env = "SCDF_EXPLORER_CONFIG_DIR")]
    config_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show the explorer views and keep server states up to date
    Watch,

    /// Manage registered servers
    Servers {
        #[command(subcommand)]
        command: ServersCommand,
    },

    /// Check once whether a registered server is reachable
    Probe {
        /// Server name (case-insensitive)
        name: String,
    },
}

#[derive(Subcommand, Debug)]
enum ServersCommand {
    /// List registered servers
    List,

    /// Register a server. The first server registered becomes the default.
    Add {
        #[arg(long)]
        name: String,

        /// Base URL, e.g. http://localhost:9393
        #[arg(long)]
        url: String,

        #[arg(long, env = "SCDF_USERNAME", default_value = "")]
        username: String,

        #[arg(long, env = "SCDF_PASSWORD", default_value = "", hide_env_values = true)]
        password: String,
    },

    /// Unregister a server
    Remove { name: String },

    /// Make a server the default
    Default { name: String },

    /// Print the language server environment as JSON
    Env,
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("registration error: {0}")]
    Registration(#[from] RegistrationError),

    #[error("probe error: {0}")]
    Probe(#[from] ProbeError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no default server registered")]
    NoDefaultServer,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let cli = Cli::parse();
    init_tracing();

    let dir = cli.config_dir.unwrap_or_else(config::default_config_dir);
    match cli.command {
        Commands::Watch => run_watch(&dir).await,
        Commands::Servers { command } => run_servers(&dir, command),
        Commands::Probe { name } => run_probe(&dir, &name).await,
    }
}

fn init_tracing() {
    // stdout carries the explorer output, so logs go to stderr.
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "scdf_explorer=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Read the config file. A file that cannot be read or parsed disables
/// polling rather than aborting.
fn load_config(path: &Path) -> (StateCheckSettings, bool) {
    match ExplorerConfig::load(path) {
        Ok(Some(config)) => (config.state_check(), config.connection.trustssl),
        Ok(None) => (StateCheckSettings::default(), false),
        Err(e) => {
            tracing::warn!(error = %e, "invalid config, server state polling disabled");
            (StateCheckSettings::disabled(), false)
        }
    }
}

// ── Watch mode ─────────────────────────────────────────────────────

async fn run_watch(dir: &Path) -> Result<(), AppError> {
    let config_path = dir.join(CONFIG_FILE);
    let (settings, trustssl) = load_config(&config_path);
    tracing::info!(
        dir = %dir.display(),
        interval_secs = settings.interval_secs,
        "scdf-explorer watching"
    );

    let registrations = Arc::new(ServerRegistrationManager::new(dir));
    let probe = Arc::new(HttpHealthProbe::new(trustssl)?);
    let directory: Arc<dyn ServerDirectory> = registrations.clone();
    let states = ServerStatesManager::new(directory.clone(), probe.clone(), settings);
    let explorers = Explorers::new(directory, states.clone());
    registrations.set_on_change(explorers.refresh_all_sink());

    // Subscribe before the views become visible so the first refresh prints.
    let printers: Vec<_> = explorers
        .providers()
        .iter()
        .cloned()
        .map(|provider| tokio::spawn(print_on_refresh(provider)))
        .collect();

    explorers.set_visible(true);
    let reload = tokio::spawn(reload_config(config_path, states.clone(), probe));

    tokio::signal::ctrl_c().await?;
    tracing::info!("received Ctrl+C");

    explorers.set_visible(false);
    states.shutdown().await;
    reload.abort();
    for printer in printers {
        printer.abort();
    }
    Ok(())
}

async fn print_on_refresh(provider: ExplorerProvider) {
    let mut rx = provider.subscribe();
    loop {
        match rx.recv().await {
            Ok(()) | Err(RecvError::Lagged(_)) => print_tree(&provider).await,
            Err(RecvError::Closed) => break,
        }
    }
}

async fn print_tree(provider: &ExplorerProvider) {
    let nodes = match provider.root_nodes().await {
        Ok(nodes) => nodes,
        Err(e) => {
            tracing::warn!(view = provider.view_id(), error = %e, "failed to list servers");
            return;
        }
    };
    let mut out = std::io::stdout().lock();
    let _ = writeln!(out, "[{}]", provider.mode().title());
    for node in &nodes {
        let _ = writeln!(
            out,
            "  {:<16} {:<40} {:<8} {}",
            node.label,
            node.description,
            node.state,
            provider.icon_for(node)
        );
    }
}

/// Re-apply the `[server]` settings and certificate trust whenever the
/// config file changes.
async fn reload_config(path: PathBuf, states: ServerStatesManager, probe: Arc<HttpHealthProbe>) {
    let mut last = modified(&path);
    let mut interval = tokio::time::interval(CONFIG_RELOAD_INTERVAL);
    interval.tick().await;
    loop {
        interval.tick().await;
        let current = modified(&path);
        if current == last {
            continue;
        }
        last = current;
        let (settings, trustssl) = load_config(&path);
        tracing::info!(interval_secs = settings.interval_secs, "config changed, applying");
        match probe.set_trustssl(trustssl) {
            Ok(true) => tracing::info!(trustssl, "probe client rebuilt"),
            Ok(false) => {}
            Err(e) => tracing::warn!(error = %e, "failed to rebuild probe client, keeping the old one"),
        }
        states.apply_settings(settings);
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

// ── Registrations ──────────────────────────────────────────────────

fn run_servers(dir: &Path, command: ServersCommand) -> Result<(), AppError> {
    let registrations = ServerRegistrationManager::new(dir);
    match command {
        ServersCommand::List => {
            let default = registrations.get_default_server().map(|s| s.identity());
            for server in registrations.get_servers()? {
                let marker = if Some(server.identity()) == default { "*" } else { " " };
                println!("{} {:<16} {}", marker, server.name, server.url);
            }
        }
        ServersCommand::Add {
            name,
            url,
            username,
            password,
        } => {
            registrations.connect_server(ServerRegistration {
                url,
                name: name.clone(),
                credentials: ServerCredentials { username, password },
            })?;
            println!("registered {}", name);
        }
        ServersCommand::Remove { name } => {
            registrations.disconnect_server(&name)?;
            println!("removed {}", name);
        }
        ServersCommand::Default { name } => {
            let server = registrations.set_default_server(&name)?;
            println!("default is now {} ({})", server.name, server.url);
        }
        ServersCommand::Env => {
            let (_, trustssl) = load_config(&dir.join(CONFIG_FILE));
            let env = registrations
                .with_trustssl(trustssl)
                .environment()?
                .ok_or(AppError::NoDefaultServer)?;
            println!("{}", serde_json::to_string_pretty(&env)?);
        }
    }
    Ok(())
}

async fn run_probe(dir: &Path, name: &str) -> Result<(), AppError> {
    let (_, trustssl) = load_config(&dir.join(CONFIG_FILE));
    let server = ServerRegistrationManager::new(dir)
        .get_servers()?
        .into_iter()
        .find(|s| s.name.eq_ignore_ascii_case(name))
        .ok_or_else(|| RegistrationError::NotFound(name.to_string()))?;
    let probe = HttpHealthProbe::new(trustssl)?;
    let state = probe.state(&server).await;
    println!("{} {} {}", server.name, server.url, state);
    Ok(())
}
