//! Wires the virtual list-watcher, the relist scheduler and the definer index
//! into one ready-to-use discovery watch source.

use std::sync::Arc;

use apiwatch_core::{CachedDiscovery, DefinerId, Invalidatable, ObjectNotifier, ResourceDescriptor, ResourceEventHandler};
use apiwatch_schema::{definer_id, Definer};
use apiwatch_store::DefinerIndex;
use kube::core::DynamicObject;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, InvalidationPolicy};
use crate::listwatch::VirtualListWatcher;
use crate::relist;

pub struct DiscoveryEngine {
    config: EngineConfig,
    source: Arc<VirtualListWatcher>,
    index: Arc<Mutex<DefinerIndex>>,
    shutdown: CancellationToken,
    scheduler: Option<JoinHandle<()>>,
}

impl DiscoveryEngine {
    /// Start the relist scheduler and subscribe to every notifier.
    /// Must be called from within a Tokio runtime.
    pub fn start(
        config: EngineConfig,
        discovery: Arc<dyn CachedDiscovery>,
        notifiers: &[Arc<dyn ObjectNotifier>],
    ) -> Self {
        let shutdown = CancellationToken::new();
        let source = Arc::new(VirtualListWatcher::new(
            config.cluster.clone(),
            discovery,
            config.settle_window,
            shutdown.clone(),
        ));
        let index = Arc::new(Mutex::new(DefinerIndex::new()));
        let scheduler = tokio::spawn(relist::run(Arc::clone(&source)));
        let handler: Arc<dyn ResourceEventHandler> = Arc::new(DefinerEventHandler {
            cluster: config.cluster.clone(),
            policy: config.policy,
            index: Arc::clone(&index),
            source: Arc::clone(&source),
        });
        for notifier in notifiers {
            notifier.add_event_handler(Arc::clone(&handler));
        }
        info!(
            cluster = %config.cluster,
            settle_secs = config.settle_window.as_secs_f64(),
            notifiers = notifiers.len(),
            "discovery engine started"
        );
        Self { config, source, index, shutdown, scheduler: Some(scheduler) }
    }

    pub fn config(&self) -> &EngineConfig { &self.config }

    /// The List/Watch source for an informer driver.
    pub fn source(&self) -> Arc<VirtualListWatcher> { Arc::clone(&self.source) }

    /// Manual invalidation handle.
    pub fn invalidator(&self) -> Arc<dyn Invalidatable> { self.source.clone() }

    pub fn definers(&self) -> Arc<Mutex<DefinerIndex>> { Arc::clone(&self.index) }

    /// Who currently defines `gvr`.
    pub fn definers_of(&self, gvr: &ResourceDescriptor) -> Vec<DefinerId> { self.index.lock().definers_of(gvr) }

    /// Stop the scheduler and close every watch session.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.scheduler.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "relist scheduler ended abnormally");
            }
        }
    }
}

impl Drop for DiscoveryEngine {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Keeps the definer index current and turns notifications into invalidations.
struct DefinerEventHandler {
    cluster: String,
    policy: InvalidationPolicy,
    index: Arc<Mutex<DefinerIndex>>,
    source: Arc<VirtualListWatcher>,
}

impl DefinerEventHandler {
    /// Returns false when the object is not a usable definer.
    fn record(&self, obj: &DynamicObject) -> bool {
        let (id, definer) = match definer_id(obj, &self.cluster).and_then(|id| Definer::from_dynamic(obj).map(|d| (id, d))) {
            Ok(v) => v,
            Err(e) => {
                warn!(cluster = %self.cluster, error = %e, "ignoring notification");
                return false;
            }
        };
        let delta = self.index.lock().set_definer(&id, &definer);
        if !delta.is_empty() {
            debug!(definer = %id, added = delta.added.len(), removed = delta.removed.len(), "definer changed");
        }
        true
    }

    fn forget(&self, obj: &DynamicObject) -> bool {
        let id = match definer_id(obj, &self.cluster) {
            Ok(id) => id,
            Err(e) => {
                warn!(cluster = %self.cluster, error = %e, "ignoring deletion");
                return false;
            }
        };
        let delta = self.index.lock().remove_definer(&id);
        debug!(definer = %id, removed = delta.removed.len(), "definer removed");
        true
    }

    fn invalidate(&self, obj: &DynamicObject, why: &str) {
        debug!(cluster = %self.cluster, name = ?obj.metadata.name, why, "notified of invalidator");
        self.source.invalidate();
    }
}

impl ResourceEventHandler for DefinerEventHandler {
    fn on_add(&self, obj: &DynamicObject) {
        if self.record(obj) && self.policy.on_add {
            self.invalidate(obj, "add");
        }
    }

    fn on_update(&self, _old: &DynamicObject, new: &DynamicObject) {
        if self.record(new) && self.policy.on_update {
            self.invalidate(new, "update");
        }
    }

    fn on_delete(&self, obj: &DynamicObject) {
        if self.forget(obj) && self.policy.on_delete {
            self.invalidate(obj, "delete");
        }
    }
}
