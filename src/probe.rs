//! Liveness probing of SCDF servers.
//!
//! A server is considered online when `GET {url}/about` answers with a
//! success status and a non-empty body. Anything else, including transport
//! errors and timeouts, is reported as offline by [`HealthProbe::state`].

use futures::future::BoxFuture;
use parking_lot::RwLock;
use std::time::Duration;

use crate::registration::ServerRegistration;
use crate::state::ServerHealthState;

const ABOUT_PATH: &str = "/about";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const PROBE_DEADLINE: Duration = Duration::from_secs(10);

/// Checks whether a server is reachable.
pub trait HealthProbe: Send + Sync {
    fn probe<'a>(&'a self, server: &'a ServerRegistration) -> BoxFuture<'a, Result<bool, ProbeError>>;

    /// Probe and collapse the outcome into a health state. Never fails.
    fn state<'a>(&'a self, server: &'a ServerRegistration) -> BoxFuture<'a, ServerHealthState> {
        Box::pin(async move {
            match self.probe(server).await {
                Ok(true) => ServerHealthState::Online,
                Ok(false) => ServerHealthState::Offline,
                Err(e) => {
                    tracing::debug!(server = %server.url, error = %e, "health probe failed");
                    ServerHealthState::Offline
                }
            }
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("failed to build http client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("no answer within {0:?}")]
    Timeout(Duration),
}

/// [`HealthProbe`] that queries the server's `/about` endpoint over HTTP
/// with basic auth.
pub struct HttpHealthProbe {
    client: RwLock<ProbeClient>,
    deadline: Duration,
}

struct ProbeClient {
    http: reqwest::Client,
    trustssl: bool,
}

fn build_client(trustssl: bool) -> Result<reqwest::Client, ProbeError> {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .danger_accept_invalid_certs(trustssl)
        .build()
        .map_err(ProbeError::Client)
}

impl HttpHealthProbe {
    pub fn new(trustssl: bool) -> Result<Self, ProbeError> {
        let http = build_client(trustssl)?;
        Ok(Self {
            client: RwLock::new(ProbeClient { http, trustssl }),
            deadline: PROBE_DEADLINE,
        })
    }

    pub fn trustssl(&self) -> bool {
        self.client.read().trustssl
    }

    /// Rebuild the client if certificate trust changed. Returns whether it
    /// did. Probes already in flight finish on the old client.
    pub fn set_trustssl(&self, trustssl: bool) -> Result<bool, ProbeError> {
        if self.trustssl() == trustssl {
            return Ok(false);
        }
        let http = build_client(trustssl)?;
        *self.client.write() = ProbeClient { http, trustssl };
        Ok(true)
    }

    /// Upper bound for a whole probe, body included.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    async fn fetch_about(&self, server: &ServerRegistration) -> Result<bool, ProbeError> {
        let client = self.client.read().http.clone();
        let resp = client
            .get(server.url_for(ABOUT_PATH))
            .basic_auth(
                &server.credentials.username,
                Some(&server.credentials.password),
            )
            .send()
            .await?;
        if !resp.status().is_success() {
            tracing::debug!(server = %server.url, status = %resp.status(), "about endpoint not ok");
            return Ok(false);
        }
        let body = resp.bytes().await?;
        Ok(!body.iter().all(u8::is_ascii_whitespace))
    }
}

impl HealthProbe for HttpHealthProbe {
    fn probe<'a>(&'a self, server: &'a ServerRegistration) -> BoxFuture<'a, Result<bool, ProbeError>> {
        Box::pin(async move {
            tokio::time::timeout(self.deadline, self.fetch_about(server))
                .await
                .map_err(|_| ProbeError::Timeout(self.deadline))?
        })
    }
}
