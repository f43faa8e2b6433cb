use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::StateCheckSettings;
use crate::poller::{PollContext, PollTimer, TickOutcome};
use crate::probe::HealthProbe;
use crate::registration::ServerDirectory;
use crate::state::{ServerHealthState, ServerIdentity, ServerStateStore};
use crate::visibility::{RefreshSink, VisibilityRegistry};

/// Keeps server health in sync for the explorer views.
///
/// Owns the state store, the set of visible views and the single poll
/// timer. The timer runs only while at least one view is visible and the
/// settings enable polling; every transition of either re-evaluates that
/// condition under one lock, so at most one timer ever exists.
///
/// Cheap to clone; clones share all state. Must be used from within a
/// tokio runtime since arming the timer spawns a task.
#[derive(Clone)]
pub struct ServerStatesManager {
    inner: Arc<Inner>,
}

struct Inner {
    ctx: PollContext,
    settings: RwLock<StateCheckSettings>,
    timer: Mutex<Option<PollTimer>>,
}

impl ServerStatesManager {
    pub fn new(
        directory: Arc<dyn ServerDirectory>,
        probe: Arc<dyn HealthProbe>,
        settings: StateCheckSettings,
    ) -> Self {
        let ctx = PollContext {
            directory,
            probe,
            store: ServerStateStore::new(),
            views: VisibilityRegistry::new(),
            focused: Arc::new(AtomicBool::new(true)),
        };
        Self {
            inner: Arc::new(Inner {
                ctx,
                settings: RwLock::new(settings),
                timer: Mutex::new(None),
            }),
        }
    }

    /// Last known state of a server, `Unknown` if never polled.
    pub fn get_state(&self, identity: &ServerIdentity) -> ServerHealthState {
        self.inner.ctx.store.get_state(identity)
    }

    pub fn store(&self) -> &ServerStateStore {
        &self.inner.ctx.store
    }

    /// A view became visible: remember its sink, refresh it right away so
    /// it shows cached state, and arm the timer if needed.
    pub fn on_view_visible(&self, view_id: &str, sink: RefreshSink) {
        {
            let mut timer = self.inner.timer.lock();
            self.inner.ctx.views.register(view_id, sink.clone());
            self.evaluate(&mut timer);
        }
        tracing::debug!(view = view_id, "view visible");
        sink();
    }

    /// A view was hidden: forget it and disarm the timer if it was the last.
    pub fn on_view_hidden(&self, view_id: &str) {
        let mut timer = self.inner.timer.lock();
        if self.inner.ctx.views.unregister(view_id) {
            tracing::debug!(view = view_id, "view hidden");
        }
        self.evaluate(&mut timer);
    }

    /// Replace the polling settings. A running timer is re-created when the
    /// interval changes and cancelled when polling is turned off.
    pub fn apply_settings(&self, settings: StateCheckSettings) {
        let mut timer = self.inner.timer.lock();
        *self.inner.settings.write() = settings;
        self.evaluate(&mut timer);
    }

    pub fn settings(&self) -> StateCheckSettings {
        *self.inner.settings.read()
    }

    /// Report whether the host window has focus. Ticks are skipped while
    /// unfocused.
    pub fn set_focused(&self, focused: bool) {
        self.inner.ctx.focused.store(focused, Ordering::Release);
    }

    pub fn is_armed(&self) -> bool {
        self.inner.timer.lock().is_some()
    }

    /// Run a poll cycle immediately, outside the timer schedule.
    pub async fn poll_now(&self) -> TickOutcome {
        self.inner.ctx.poll_once().await
    }

    /// Stop the timer regardless of visible views.
    pub async fn shutdown(&self) {
        let timer = self.inner.timer.lock().take();
        if let Some(timer) = timer {
            timer.join().await;
        }
    }

    fn evaluate(&self, timer: &mut Option<PollTimer>) {
        let settings = *self.inner.settings.read();
        let wanted = if self.inner.ctx.views.is_empty() {
            None
        } else {
            settings.interval()
        };

        match (timer.as_ref(), wanted) {
            (None, Some(period)) => {
                tracing::info!(interval_secs = period.as_secs(), "arming server state poll");
                *timer = self.spawn_timer(period);
            }
            (Some(current), Some(period)) if current.period() != period => {
                tracing::info!(interval_secs = period.as_secs(), "re-arming server state poll");
                current.cancel();
                *timer = self.spawn_timer(period);
            }
            (Some(current), None) => {
                tracing::info!("disarming server state poll");
                current.cancel();
                *timer = None;
            }
            _ => {}
        }
    }

    fn spawn_timer(&self, period: Duration) -> Option<PollTimer> {
        let timer = PollTimer::spawn(self.inner.ctx.clone(), period);
        if timer.is_none() {
            tracing::warn!(
                interval_secs = period.as_secs(),
                "poll interval out of range, state polling disabled"
            );
        }
        timer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StateCheckMode;
    use crate::probe::ProbeError;
    use crate::registration::{RegistrationError, ServerCredentials, ServerRegistration};
    use futures::future::BoxFuture;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Default)]
    struct FakeDirectory {
        servers: RwLock<Vec<ServerRegistration>>,
        fail: AtomicBool,
    }

    impl ServerDirectory for FakeDirectory {
        fn list_servers(&self) -> BoxFuture<'_, Result<Vec<ServerRegistration>, RegistrationError>> {
            Box::pin(async move {
                if self.fail.load(Ordering::SeqCst) {
                    return Err(RegistrationError::NotFound("directory".into()));
                }
                Ok(self.servers.read().clone())
            })
        }
    }

    #[derive(Default)]
    struct FakeProbe {
        /// url -> reachable; missing urls time out.
        results: RwLock<HashMap<String, bool>>,
        calls: AtomicUsize,
    }

    impl HealthProbe for FakeProbe {
        fn probe<'a>(
            &'a self,
            server: &'a ServerRegistration,
        ) -> BoxFuture<'a, Result<bool, ProbeError>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                match self.results.read().get(&server.url) {
                    Some(up) => Ok(*up),
                    None => Err(ProbeError::Timeout(Duration::from_secs(10))),
                }
            })
        }
    }

    fn server(name: &str, url: &str) -> ServerRegistration {
        ServerRegistration {
            url: url.into(),
            name: name.into(),
            credentials: ServerCredentials {
                username: "u".into(),
                password: "p".into(),
            },
        }
    }

    fn counting_sink() -> (RefreshSink, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let sink: RefreshSink = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (sink, hits)
    }

    fn setup(
        settings: StateCheckSettings,
    ) -> (ServerStatesManager, Arc<FakeDirectory>, Arc<FakeProbe>) {
        let directory = Arc::new(FakeDirectory::default());
        let probe = Arc::new(FakeProbe::default());
        let manager = ServerStatesManager::new(directory.clone(), probe.clone(), settings);
        (manager, directory, probe)
    }

    fn every(secs: u64) -> StateCheckSettings {
        StateCheckSettings::new(secs, StateCheckMode::Icon)
    }

    #[tokio::test]
    async fn visible_view_is_refreshed_immediately() {
        let (manager, _, _) = setup(every(5));
        let (sink, hits) = counting_sink();
        manager.on_view_visible("scdfApps", sink);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn timer_armed_iff_views_and_polling_enabled() {
        let (manager, _, _) = setup(every(5));
        assert!(!manager.is_armed());

        let (a, _) = counting_sink();
        let (b, _) = counting_sink();
        manager.on_view_visible("scdfApps", a);
        assert!(manager.is_armed());
        manager.on_view_visible("scdfStreams", b);
        assert!(manager.is_armed());

        manager.on_view_hidden("scdfApps");
        assert!(manager.is_armed());
        manager.on_view_hidden("scdfStreams");
        assert!(!manager.is_armed());

        // Hiding an unknown view keeps the timer off.
        manager.on_view_hidden("scdfJobs");
        assert!(!manager.is_armed());
    }

    #[tokio::test]
    async fn zero_interval_never_arms_but_still_refreshes() {
        let (manager, _, _) = setup(every(0));
        let (sink, hits) = counting_sink();
        manager.on_view_visible("scdfTasks", sink);
        assert!(!manager.is_armed());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn mode_none_never_arms() {
        let (manager, _, _) = setup(StateCheckSettings::new(5, StateCheckMode::None));
        let (sink, _) = counting_sink();
        manager.on_view_visible("scdfTasks", sink);
        assert!(!manager.is_armed());
    }

    #[tokio::test]
    async fn settings_change_arms_and_disarms() {
        let (manager, _, _) = setup(every(0));
        let (sink, _) = counting_sink();
        manager.on_view_visible("scdfApps", sink);
        assert!(!manager.is_armed());

        manager.apply_settings(every(10));
        assert!(manager.is_armed());

        manager.apply_settings(StateCheckSettings::new(10, StateCheckMode::None));
        assert!(!manager.is_armed());
    }

    #[tokio::test]
    async fn oversized_interval_never_arms() {
        let (manager, _, _) = setup(every(i64::MAX as u64));
        let (sink, hits) = counting_sink();
        manager.on_view_visible("scdfApps", sink);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!manager.is_armed());

        manager.apply_settings(every(5));
        assert!(manager.is_armed());
        manager.apply_settings(every(u64::MAX));
        assert!(!manager.is_armed());
    }

    #[tokio::test]
    async fn settings_change_without_views_stays_disarmed() {
        let (manager, _, _) = setup(every(0));
        manager.apply_settings(every(3));
        assert!(!manager.is_armed());
        assert_eq!(manager.settings(), every(3));
    }

    #[tokio::test]
    async fn tick_with_changes_fans_out_once() {
        let (manager, directory, probe) = setup(every(0));
        directory.servers.write().extend([
            server("a", "http://10.0.0.1:9393"),
            server("b", "http://10.0.0.2:9393"),
        ]);
        probe.results.write().insert("http://10.0.0.1:9393".into(), true);
        probe.results.write().insert("http://10.0.0.2:9393".into(), false);

        let (apps, apps_hits) = counting_sink();
        let (streams, streams_hits) = counting_sink();
        manager.on_view_visible("scdfApps", apps);
        manager.on_view_visible("scdfStreams", streams);

        let outcome = manager.poll_now().await;
        assert_eq!(
            outcome,
            TickOutcome::Polled {
                servers: 2,
                changed: 2,
                refreshed: 2
            }
        );
        // One immediate refresh on visibility plus one fan-out.
        assert_eq!(apps_hits.load(Ordering::SeqCst), 2);
        assert_eq!(streams_hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn tick_without_changes_does_not_fan_out() {
        let (manager, directory, probe) = setup(every(0));
        directory.servers.write().push(server("a", "http://10.0.0.1:9393"));
        probe.results.write().insert("http://10.0.0.1:9393".into(), true);

        let (sink, hits) = counting_sink();
        manager.on_view_visible("scdfApps", sink);
        manager.poll_now().await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        let outcome = manager.poll_now().await;
        assert_eq!(
            outcome,
            TickOutcome::Polled {
                servers: 1,
                changed: 0,
                refreshed: 0
            }
        );
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn online_stays_unknown_becomes_offline() {
        let (manager, directory, probe) = setup(every(0));
        let a = server("a", "http://10.0.0.1:9393");
        let b = server("b", "http://10.0.0.2:9393");
        directory.servers.write().extend([a.clone(), b.clone()]);
        manager.store().set_state(&a.identity(), ServerHealthState::Online);
        probe.results.write().insert(a.url.clone(), true);
        probe.results.write().insert(b.url.clone(), false);

        let (apps, apps_hits) = counting_sink();
        let (jobs, jobs_hits) = counting_sink();
        manager.on_view_visible("scdfApps", apps);
        manager.on_view_visible("scdfJobs", jobs);

        let outcome = manager.poll_now().await;
        assert_eq!(
            outcome,
            TickOutcome::Polled {
                servers: 2,
                changed: 1,
                refreshed: 2
            }
        );
        assert_eq!(manager.get_state(&a.identity()), ServerHealthState::Online);
        assert_eq!(manager.get_state(&b.identity()), ServerHealthState::Offline);
        assert_eq!(apps_hits.load(Ordering::SeqCst), 2);
        assert_eq!(jobs_hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn probe_error_maps_to_offline_without_aborting_others() {
        let (manager, directory, probe) = setup(every(0));
        let up = server("up", "http://10.0.0.1:9393");
        let broken = server("broken", "http://10.0.0.2:9393");
        directory.servers.write().extend([broken.clone(), up.clone()]);
        probe.results.write().insert(up.url.clone(), true);

        manager.poll_now().await;
        assert_eq!(manager.get_state(&up.identity()), ServerHealthState::Online);
        assert_eq!(manager.get_state(&broken.identity()), ServerHealthState::Offline);
    }

    #[tokio::test]
    async fn listing_failure_aborts_tick_only() {
        let (manager, directory, probe) = setup(every(0));
        let a = server("a", "http://10.0.0.1:9393");
        directory.servers.write().push(a.clone());
        probe.results.write().insert(a.url.clone(), true);

        directory.fail.store(true, Ordering::SeqCst);
        assert_eq!(manager.poll_now().await, TickOutcome::ListFailed);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
        assert_eq!(manager.get_state(&a.identity()), ServerHealthState::Unknown);

        directory.fail.store(false, Ordering::SeqCst);
        manager.poll_now().await;
        assert_eq!(manager.get_state(&a.identity()), ServerHealthState::Online);
    }

    #[tokio::test]
    async fn unfocused_host_skips_tick() {
        let (manager, directory, probe) = setup(every(0));
        directory.servers.write().push(server("a", "http://10.0.0.1:9393"));
        manager.set_focused(false);
        assert_eq!(manager.poll_now().await, TickOutcome::Skipped);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn new_server_picked_up_on_next_tick() {
        let (manager, directory, probe) = setup(every(0));
        let a = server("a", "http://10.0.0.1:9393");
        probe.results.write().insert(a.url.clone(), true);
        manager.poll_now().await;
        assert_eq!(manager.get_state(&a.identity()), ServerHealthState::Unknown);

        directory.servers.write().push(a.clone());
        manager.poll_now().await;
        assert_eq!(manager.get_state(&a.identity()), ServerHealthState::Online);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_ticks_at_configured_interval() {
        let (manager, directory, probe) = setup(every(5));
        let a = server("a", "http://10.0.0.1:9393");
        directory.servers.write().push(a.clone());
        probe.results.write().insert(a.url.clone(), true);

        let (sink, hits) = counting_sink();
        manager.on_view_visible("scdfApps", sink);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(4_900)).await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
        // Still online, so no extra refresh.
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        manager.on_view_hidden("scdfApps");
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn interval_change_rearms_with_new_period() {
        let (manager, directory, probe) = setup(every(60));
        let a = server("a", "http://10.0.0.1:9393");
        directory.servers.write().push(a.clone());
        probe.results.write().insert(a.url.clone(), true);

        let (sink, _) = counting_sink();
        manager.on_view_visible("scdfApps", sink);
        manager.apply_settings(every(2));
        assert!(manager.is_armed());

        tokio::time::sleep(Duration::from_millis(2_100)).await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
        manager.shutdown().await;
        assert!(!manager.is_armed());
    }

    #[tokio::test]
    async fn sink_can_query_state_during_fan_out() {
        let (manager, directory, probe) = setup(every(0));
        let a = server("a", "http://10.0.0.1:9393");
        directory.servers.write().push(a.clone());
        probe.results.write().insert(a.url.clone(), false);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let observer = manager.clone();
        let log = seen.clone();
        let identity = a.identity();
        manager.on_view_visible(
            "scdfStreams",
            Arc::new(move || log.lock().push(observer.get_state(&identity))),
        );
        manager.poll_now().await;
        assert_eq!(
            *seen.lock(),
            vec![ServerHealthState::Unknown, ServerHealthState::Offline]
        );
    }
}
