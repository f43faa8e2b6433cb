use futures::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::probe::HealthProbe;
use crate::registration::ServerDirectory;
use crate::state::ServerStateStore;
use crate::visibility::VisibilityRegistry;

/// What a single poll tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// The host was not focused; nothing was probed.
    Skipped,
    /// The server list could not be read; nothing was probed.
    ListFailed,
    Polled {
        servers: usize,
        changed: usize,
        /// Number of views refreshed. Zero when nothing changed.
        refreshed: usize,
    },
}

/// Everything a tick needs, shared between the timer task and on-demand
/// polls.
#[derive(Clone)]
pub struct PollContext {
    pub directory: Arc<dyn ServerDirectory>,
    pub probe: Arc<dyn HealthProbe>,
    pub store: ServerStateStore,
    pub views: VisibilityRegistry,
    pub focused: Arc<AtomicBool>,
}

impl PollContext {
    /// Run one poll cycle.
    ///
    /// Every server is probed concurrently and diffed against the store.
    /// Only after all probes have finished are views refreshed, once, if any
    /// server changed state.
    pub async fn poll_once(&self) -> TickOutcome {
        if !self.focused.load(Ordering::Acquire) {
            tracing::debug!("host not focused, skipping state poll");
            return TickOutcome::Skipped;
        }

        let servers = match self.directory.list_servers().await {
            Ok(servers) => servers,
            Err(e) => {
                tracing::warn!(error = %e, "failed to list servers for state poll");
                return TickOutcome::ListFailed;
            }
        };
        tracing::debug!(servers = servers.len(), "polling server states");

        let diffs = servers.iter().map(|server| async move {
            let identity = server.identity();
            let state = self.probe.state(server).await;
            let previous = self.store.set_state(&identity, state);
            if previous != state {
                tracing::info!(server = %server.url, from = %previous, to = %state, "server state changed");
            }
            previous != state
        });
        let changed = join_all(diffs).await.into_iter().filter(|c| *c).count();

        let refreshed = if changed > 0 { self.views.fan_out() } else { 0 };
        TickOutcome::Polled {
            servers: servers.len(),
            changed,
            refreshed,
        }
    }
}

/// Handle to the periodic poll task. Cancelling (or dropping) it stops
/// future ticks; a tick already running is left to finish.
pub struct PollTimer {
    period: Duration,
    cancel: CancellationToken,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl PollTimer {
    /// Spawn the timer task. The first tick fires one `period` from now.
    ///
    /// Returns `None` without spawning when `period` is zero or the first
    /// tick would lie beyond what the clock can represent.
    pub fn spawn(ctx: PollContext, period: Duration) -> Option<Self> {
        if period.is_zero() {
            return None;
        }
        let start = Instant::now().checked_add(period)?;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(poll_loop(ctx, start, period, cancel.clone()));
        Some(Self {
            period,
            cancel,
            task: Some(task),
        })
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancel and wait for the task to exit.
    pub async fn join(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for PollTimer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn poll_loop(ctx: PollContext, start: Instant, period: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval_at(start, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                ctx.poll_once().await;
            }
        }
    }
    tracing::debug!("state poll timer stopped");
}
