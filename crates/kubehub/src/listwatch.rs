//! Virtual List/Watch source over the polling-only discovery API.
//!
//! Every List and every invalidation starts a new generation. A Watch is only
//! accepted at the current generation and never delivers events: its channel
//! closes when the session is stopped, times out, or a relist is forced, and
//! the informer driver answers that by listing again.

use std::sync::Arc;
use std::time::{Duration, Instant as StdInstant};

use apiwatch_core::{
    parse_group_version, ApiResourceItem, ApiResourceList, ApiResourceSpec, CachedDiscovery, DiscoveryClient, Invalidatable,
    ListOptions, ListWatch, WatchError, WatchEvent, WatchOptions, WatchSession,
};
use metrics::{counter, gauge, histogram};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::relist::{RelistPoll, RelistState};

#[derive(Debug)]
struct State {
    generation: u64,
    relist: RelistState,
    cancels: Vec<CancellationToken>,
    forced_relists: u64,
}

impl State {
    fn cancel_sessions(&mut self) -> usize {
        let n = self.cancels.len();
        for token in self.cancels.drain(..) {
            token.cancel();
        }
        gauge!("apiwatch_watch_sessions", 0.0);
        n
    }

    fn prune_sessions(&mut self) {
        self.cancels.retain(|t| !t.is_cancelled());
        gauge!("apiwatch_watch_sessions", self.cancels.len() as f64);
    }
}

pub struct VirtualListWatcher {
    cluster: String,
    cache: Arc<dyn CachedDiscovery>,
    settle_window: Duration,
    state: Arc<Mutex<State>>,
    relist_signal: Notify,
    shutdown: CancellationToken,
    runtime: Handle,
}

impl VirtualListWatcher {
    /// Must be called from within a Tokio runtime; watch sessions are spawned onto it.
    /// Cancelling `shutdown` closes every session and stops the relist scheduler.
    pub fn new(
        cluster: impl Into<String>,
        cache: Arc<dyn CachedDiscovery>,
        settle_window: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            cluster: cluster.into(),
            cache,
            settle_window,
            state: Arc::new(Mutex::new(State {
                generation: 0,
                relist: RelistState::Idle,
                cancels: Vec::new(),
                forced_relists: 0,
            })),
            relist_signal: Notify::new(),
            shutdown,
            runtime: Handle::current(),
        }
    }

    pub fn cluster(&self) -> &str { &self.cluster }

    pub fn generation(&self) -> u64 { self.state.lock().generation }

    /// Sessions registered since the last List/forced relist that are still open.
    pub fn active_sessions(&self) -> usize {
        self.state.lock().cancels.iter().filter(|t| !t.is_cancelled()).count()
    }

    /// Tokens still held in the registry, open or not yet pruned.
    pub fn registered_sessions(&self) -> usize { self.state.lock().cancels.len() }

    /// Relists forced by the debounce scheduler so far.
    pub fn forced_relists(&self) -> u64 { self.state.lock().forced_relists }

    pub fn relist_pending(&self) -> bool { self.state.lock().relist.is_pending() }

    pub(crate) fn shutdown_token(&self) -> CancellationToken { self.shutdown.clone() }

    pub(crate) fn relist_signal(&self) -> &Notify { &self.relist_signal }

    /// One scheduler step under the lock; on `Fire` the outstanding sessions are already cancelled.
    pub(crate) fn poll_relist(&self, now: Instant) -> RelistPoll {
        let mut st = self.state.lock();
        let poll = st.relist.poll(now);
        if poll == RelistPoll::Fire {
            let closed = st.cancel_sessions();
            st.forced_relists += 1;
            counter!("apiwatch_forced_relists_total", 1);
            debug!(cluster = %self.cluster, closed, "forced relist");
        }
        poll
    }

    /// Start a new generation, flush the discovery cache and (re)arm the
    /// debounced relist. Outstanding watches stay open until the quiet period ends.
    pub fn invalidate(&self) {
        let generation = {
            let mut st = self.state.lock();
            st.generation += 1;
            st.relist.arm(Instant::now(), self.settle_window);
            self.cache.invalidate();
            st.generation
        };
        self.relist_signal.notify_one();
        counter!("apiwatch_invalidations_total", 1);
        debug!(cluster = %self.cluster, generation, "invalidated");
    }

    fn to_items(&self, generation: &str, groups: Vec<apiwatch_core::DiscoveryGroup>) -> Vec<ApiResourceItem> {
        let mut items = Vec::new();
        for group in groups {
            let (g, v) = match parse_group_version(&group.group_version) {
                Ok(gv) => gv,
                Err(e) => {
                    error!(cluster = %self.cluster, group_version = %group.group_version, error = %e, "failed to parse a GroupVersion");
                    continue;
                }
            };
            for rsc in group.resources {
                items.push(ApiResourceItem {
                    name: format!("{}:{}", group.group_version, rsc.name),
                    resource_version: generation.to_string(),
                    spec: ApiResourceSpec {
                        name: rsc.name,
                        singular_name: rsc.singular_name,
                        namespaced: rsc.namespaced,
                        group: g.clone(),
                        version: v.clone(),
                        kind: rsc.kind,
                        verbs: rsc.verbs,
                    },
                });
            }
        }
        items
    }
}

#[async_trait::async_trait]
impl ListWatch for VirtualListWatcher {
    /// Always a fresh generation, even if discovery returns the same snapshot.
    async fn list(&self, _opts: &ListOptions) -> Result<ApiResourceList, WatchError> {
        let started = StdInstant::now();
        let generation = {
            let mut st = self.state.lock();
            st.generation += 1;
            st.cancel_sessions();
            st.generation
        };
        let rv = generation.to_string();
        let groups = self.cache.server_preferred_resources().await.map_err(WatchError::Discovery)?;
        let items = self.to_items(&rv, groups);
        counter!("apiwatch_lists_total", 1);
        histogram!("apiwatch_list_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(cluster = %self.cluster, generation, count = items.len(), "listed API resources");
        Ok(ApiResourceList { resource_version: rv, items })
    }

    fn watch(&self, opts: &WatchOptions) -> Result<WatchSession, WatchError> {
        let token = {
            let mut st = self.state.lock();
            let current = st.generation.to_string();
            if current != opts.resource_version {
                counter!("apiwatch_watch_expired_total", 1);
                debug!(cluster = %self.cluster, requested = %opts.resource_version, current = %current, "stale watch request");
                return Err(WatchError::Expired {
                    requested: opts.resource_version.clone(),
                    current,
                    cluster: self.cluster.clone(),
                });
            }
            let token = self.shutdown.child_token();
            st.cancels.push(token.clone());
            st.prune_sessions();
            token
        };

        let (tx, rx) = mpsc::channel::<WatchEvent>(1);
        let closer = token.clone();
        let timeout = opts.timeout;
        let cluster = self.cluster.clone();
        let state = Arc::clone(&self.state);
        self.runtime.spawn(async move {
            match timeout {
                Some(t) => {
                    tokio::select! {
                        _ = closer.cancelled() => {}
                        _ = tokio::time::sleep(t) => closer.cancel(),
                    }
                }
                None => closer.cancelled().await,
            }
            state.lock().prune_sessions();
            debug!(cluster = %cluster, "ending an APIResource watch");
            drop(tx);
        });
        Ok(WatchSession::new(rx, token))
    }
}

impl Invalidatable for VirtualListWatcher {
    fn invalidate(&self) {
        VirtualListWatcher::invalidate(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{MemCacheDiscovery, MockDiscovery};

    fn apps_and_core() -> Arc<MockDiscovery> {
        let mock = Arc::new(MockDiscovery::new());
        mock.push_group("v1", &[("pods", "Pod"), ("services", "Service")]);
        mock.push_group("apps/v1", &[("deployments", "Deployment")]);
        mock
    }

    fn watcher(mock: Arc<MockDiscovery>, shutdown: CancellationToken) -> VirtualListWatcher {
        VirtualListWatcher::new("test", Arc::new(MemCacheDiscovery::new(mock)), Duration::from_secs(20), shutdown)
    }

    #[tokio::test]
    async fn list_stamps_every_item_with_its_generation() {
        let lw = watcher(apps_and_core(), CancellationToken::new());
        let first = lw.list(&ListOptions::default()).await.expect("list");
        let second = lw.list(&ListOptions::default()).await.expect("list");
        assert_eq!(first.resource_version, "1");
        assert_eq!(second.resource_version, "2");
        assert!(first.items.iter().all(|i| i.resource_version == "1"));
        assert!(second.items.iter().all(|i| i.resource_version == "2"));
        assert_eq!(first.items.len(), 3);
    }

    #[tokio::test]
    async fn bad_group_version_is_skipped() {
        let mock = apps_and_core();
        mock.push_group("a/b/c", &[("things", "Thing")]);
        let lw = watcher(mock, CancellationToken::new());
        let list = lw.list(&ListOptions::default()).await.expect("list");
        assert!(list.items.iter().all(|i| !i.name.starts_with("a/b/c")));
        assert_eq!(list.items.len(), 3);
    }

    #[tokio::test]
    async fn discovery_error_propagates() {
        let mock = apps_and_core();
        mock.fail_next("connection refused");
        let lw = watcher(mock, CancellationToken::new());
        let err = lw.list(&ListOptions::default()).await.expect_err("must fail");
        assert!(matches!(err, WatchError::Discovery(_)));
        assert!(err.to_string().contains("connection refused"));
    }

    #[tokio::test]
    async fn watch_timeout_closes_channel() {
        let lw = watcher(apps_and_core(), CancellationToken::new());
        let list = lw.list(&ListOptions::default()).await.expect("list");
        let mut session = lw
            .watch(&WatchOptions::at(list.resource_version).with_timeout(Duration::from_millis(20)))
            .expect("watch");
        tokio::time::timeout(Duration::from_secs(2), session.closed()).await.expect("closed after timeout");
        assert!(session.is_stopped());
        assert_eq!(lw.active_sessions(), 0);
    }

    #[tokio::test]
    async fn closed_sessions_leave_the_registry() {
        let lw = watcher(apps_and_core(), CancellationToken::new());
        let list = lw.list(&ListOptions::default()).await.expect("list");
        let mut first = lw.watch(&WatchOptions::at(&list.resource_version)).expect("watch");
        let second = lw.watch(&WatchOptions::at(&list.resource_version)).expect("watch");
        assert_eq!(lw.registered_sessions(), 2);

        first.stop();
        first.closed().await;
        assert_eq!(lw.registered_sessions(), 1);
        assert_eq!(lw.active_sessions(), 1);

        lw.list(&ListOptions::default()).await.expect("list");
        assert_eq!(lw.registered_sessions(), 0);
        assert!(second.is_stopped());
    }

    #[tokio::test]
    async fn shutdown_closes_sessions() {
        let shutdown = CancellationToken::new();
        let lw = watcher(apps_and_core(), shutdown.clone());
        let mut session = lw.watch(&WatchOptions::at("0")).expect("watch at initial generation");
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), session.closed()).await.expect("closed on shutdown");
    }
}
