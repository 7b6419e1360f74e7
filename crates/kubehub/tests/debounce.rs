#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use apiwatch_core::{Invalidatable, ListOptions, ListWatch, WatchOptions};
use apiwatch_kubehub::{DiscoveryEngine, EngineConfig, MemCacheDiscovery, MockDiscovery};
use tokio::time::sleep;

async fn settle() {
    for _ in 0..8 { tokio::task::yield_now().await; }
}

fn engine(mock: &Arc<MockDiscovery>) -> DiscoveryEngine {
    let cfg = EngineConfig::new("root").with_settle_window(Duration::from_secs(20));
    DiscoveryEngine::start(cfg, Arc::new(MemCacheDiscovery::new(Arc::clone(mock))), &[])
}

#[tokio::test(start_paused = true)]
async fn burst_of_invalidations_forces_one_relist_after_the_last() {
    let mock = Arc::new(MockDiscovery::new());
    mock.push_group("v1", &[("pods", "Pod")]);
    let engine = engine(&mock);
    let lw = engine.source();

    let list = lw.list(&ListOptions::default()).await.expect("list");
    let mut session = lw.watch(&WatchOptions::at(list.resource_version)).expect("watch");

    // t=0 and t=5
    engine.invalidator().invalidate();
    settle().await;
    sleep(Duration::from_secs(5)).await;
    engine.invalidator().invalidate();
    settle().await;

    // t=24: first deadline (t=20) was pushed out; nothing forced yet.
    sleep(Duration::from_secs(19)).await;
    settle().await;
    assert_eq!(lw.forced_relists(), 0);
    assert!(!session.is_stopped());
    assert!(lw.relist_pending());

    // t=26: exactly one relist, at ~t=25.
    sleep(Duration::from_secs(2)).await;
    settle().await;
    assert_eq!(lw.forced_relists(), 1);
    assert!(session.is_stopped());
    assert_eq!(session.next().await, None);

    // Quiet afterwards.
    sleep(Duration::from_secs(60)).await;
    settle().await;
    assert_eq!(lw.forced_relists(), 1);
    assert!(!lw.relist_pending());
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn signals_further_apart_than_the_window_relist_separately() {
    let mock = Arc::new(MockDiscovery::new());
    mock.push_group("v1", &[("pods", "Pod")]);
    let engine = engine(&mock);
    let lw = engine.source();

    engine.invalidator().invalidate();
    settle().await;
    sleep(Duration::from_secs(21)).await;
    settle().await;
    assert_eq!(lw.forced_relists(), 1);

    engine.invalidator().invalidate();
    settle().await;
    sleep(Duration::from_secs(21)).await;
    settle().await;
    assert_eq!(lw.forced_relists(), 2);
    engine.shutdown().await;
}

/// Drives the engine the way an informer does: List, Watch, and re-List once
/// the watch closes.
#[tokio::test(start_paused = true)]
async fn informer_loop_sees_new_types_after_invalidation() {
    let mock = Arc::new(MockDiscovery::new());
    mock.push_group("v1", &[("pods", "Pod")]);
    let engine = engine(&mock);
    let lw = engine.source();

    let first = lw.list(&ListOptions::default()).await.expect("list");
    assert_eq!(first.items.len(), 1);
    let mut session = lw.watch(&WatchOptions::at(&first.resource_version)).expect("watch");

    // A new CRD appears; the cached discovery result hides it until invalidated.
    mock.push_group("example.io/v1", &[("widgets", "Widget")]);
    engine.invalidator().invalidate();
    settle().await;

    // The old watch stays open through the quiet period, then closes.
    session.closed().await;
    assert_eq!(lw.forced_relists(), 1);

    // A stale re-watch is refused; the driver must re-List.
    assert!(lw.watch(&WatchOptions::at(&first.resource_version)).expect_err("stale").is_expired());
    let second = lw.list(&ListOptions::default()).await.expect("list");
    assert!(second.items.iter().any(|i| i.name == "example.io/v1:widgets"));
    lw.watch(&WatchOptions::at(&second.resource_version)).expect("watch at fresh version");
    engine.shutdown().await;
}

#[tokio::test]
async fn shutdown_closes_open_watches() {
    let mock = Arc::new(MockDiscovery::new());
    mock.push_group("v1", &[("pods", "Pod")]);
    let engine = engine(&mock);
    let lw = engine.source();
    let list = lw.list(&ListOptions::default()).await.expect("list");
    let mut session = lw.watch(&WatchOptions::at(list.resource_version)).expect("watch");
    engine.shutdown().await;
    tokio::time::timeout(Duration::from_secs(2), session.closed()).await.expect("closed on shutdown");
}
