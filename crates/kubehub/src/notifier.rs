//! Definer notifiers on top of kube-runtime's watcher.

use std::collections::HashMap;
use std::sync::Arc;

use apiwatch_core::{ObjectNotifier, ResourceEventHandler};
use futures::TryStreamExt;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{
    api::Api,
    core::{ApiResource, DynamicObject, GroupVersionKind, TypeMeta},
    runtime::{watcher, watcher::Event, WatchStreamExt},
    Client,
};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type ObjKey = (Option<String>, String);

fn key_of(obj: &DynamicObject) -> ObjKey {
    (obj.metadata.namespace.clone(), obj.metadata.name.clone().unwrap_or_default())
}

/// Known objects plus registered handlers. Turns watcher events into
/// add/update/delete callbacks; new handlers get an add for every known object.
#[derive(Default)]
pub struct NotifierState {
    type_meta: Option<TypeMeta>,
    known: HashMap<ObjKey, DynamicObject>,
    handlers: Vec<Arc<dyn ResourceEventHandler>>,
}

impl NotifierState {
    /// `type_meta` is stamped on objects that arrive without apiVersion/kind.
    pub fn new(type_meta: Option<TypeMeta>) -> Self {
        Self { type_meta, ..Self::default() }
    }

    pub fn len(&self) -> usize { self.known.len() }
    pub fn is_empty(&self) -> bool { self.known.is_empty() }

    fn stamp(&self, mut obj: DynamicObject) -> DynamicObject {
        if obj.types.is_none() {
            obj.types = self.type_meta.clone();
        }
        obj
    }

    pub fn add_handler(&mut self, handler: Arc<dyn ResourceEventHandler>) {
        for obj in self.known.values() {
            handler.on_add(obj);
        }
        self.handlers.push(handler);
    }

    pub fn applied(&mut self, obj: DynamicObject) {
        let obj = self.stamp(obj);
        let key = key_of(&obj);
        match self.known.insert(key, obj.clone()) {
            None => self.handlers.iter().for_each(|h| h.on_add(&obj)),
            Some(old) if old.metadata.resource_version != obj.metadata.resource_version => {
                self.handlers.iter().for_each(|h| h.on_update(&old, &obj))
            }
            Some(_) => {}
        }
    }

    pub fn deleted(&mut self, obj: DynamicObject) {
        let obj = self.stamp(obj);
        let last = self.known.remove(&key_of(&obj)).unwrap_or(obj);
        self.handlers.iter().for_each(|h| h.on_delete(&last));
    }

    /// A full relist: whatever is missing was deleted, the rest is applied.
    pub fn restarted(&mut self, list: Vec<DynamicObject>) {
        let fresh: HashMap<ObjKey, DynamicObject> =
            list.into_iter().map(|o| self.stamp(o)).map(|o| (key_of(&o), o)).collect();
        let gone: Vec<ObjKey> = self.known.keys().filter(|k| !fresh.contains_key(*k)).cloned().collect();
        for k in gone {
            if let Some(old) = self.known.remove(&k) {
                self.handlers.iter().for_each(|h| h.on_delete(&old));
            }
        }
        for (_, obj) in fresh {
            self.applied(obj);
        }
    }
}

async fn wait_until_synced(mut rx: watch::Receiver<bool>) -> bool {
    let synced = rx.wait_for(|s| *s).await.is_ok();
    synced
}

/// Watches one kind of definer object and notifies handlers informer-style.
pub struct KubeNotifier {
    name: String,
    state: Arc<Mutex<NotifierState>>,
    synced: watch::Receiver<bool>,
}

impl KubeNotifier {
    /// Spawn the watch loop; it stops when `shutdown` is cancelled.
    pub fn spawn(api: Api<DynamicObject>, ar: &ApiResource, shutdown: CancellationToken) -> Arc<Self> {
        let name = format!("{}/{}", ar.api_version, ar.kind);
        let state = Arc::new(Mutex::new(NotifierState::new(Some(TypeMeta {
            api_version: ar.api_version.clone(),
            kind: ar.kind.clone(),
        }))));
        let (synced_tx, synced) = watch::channel(false);
        let loop_state = Arc::clone(&state);
        let loop_name = name.clone();
        tokio::spawn(async move {
            let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
            futures::pin_mut!(stream);
            info!(notifier = %loop_name, "definer watcher started");
            loop {
                let next = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    next = stream.try_next() => next,
                };
                match next {
                    Ok(Some(Event::Applied(o))) => loop_state.lock().applied(o),
                    Ok(Some(Event::Deleted(o))) => loop_state.lock().deleted(o),
                    Ok(Some(Event::Restarted(list))) => {
                        debug!(notifier = %loop_name, count = list.len(), "watch restart");
                        loop_state.lock().restarted(list);
                        let _ = synced_tx.send(true);
                    }
                    Ok(None) => break,
                    Err(e) => warn!(notifier = %loop_name, error = %e, "definer watch error"),
                }
            }
            warn!(notifier = %loop_name, "definer watcher ended");
        });
        Arc::new(Self { name, state, synced })
    }

    /// Notifier for CustomResourceDefinitions.
    pub fn crds(client: Client, shutdown: CancellationToken) -> Arc<Self> {
        let ar = ApiResource::erase::<CustomResourceDefinition>(&());
        Self::spawn(Api::all_with(client, &ar), &ar, shutdown)
    }

    /// Notifier for kcp APIBindings.
    pub fn api_bindings(client: Client, shutdown: CancellationToken) -> Arc<Self> {
        let gvk = GroupVersionKind::gvk("apis.kcp.io", "v1alpha1", "APIBinding");
        let ar = ApiResource::from_gvk_with_plural(&gvk, "apibindings");
        Self::spawn(Api::all_with(client, &ar), &ar, shutdown)
    }

    pub fn name(&self) -> &str { &self.name }

    /// Wait for the first complete listing. Returns false if the watcher ended first.
    pub async fn wait_synced(&self) -> bool {
        wait_until_synced(self.synced.clone()).await
    }

    pub fn known(&self) -> usize { self.state.lock().len() }
}

impl ObjectNotifier for KubeNotifier {
    fn add_event_handler(&self, handler: Arc<dyn ResourceEventHandler>) {
        self.state.lock().add_handler(handler);
    }
}
