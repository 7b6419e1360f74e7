//! apiwatch kubehub: a watchable view of "which resource types exist" over the
//! polling-only discovery API, plus the kube-backed collaborators it needs.

#![forbid(unsafe_code)]

pub mod config;
pub mod discovery;
pub mod engine;
pub mod listwatch;
pub mod notifier;
pub mod relist;

pub use config::{EngineConfig, InvalidationPolicy};
pub use discovery::{KubeDiscovery, MemCacheDiscovery, MockDiscovery};
pub use engine::DiscoveryEngine;
pub use listwatch::VirtualListWatcher;
pub use notifier::{KubeNotifier, NotifierState};
