//! Watch sessions over the virtual discovery source.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Item type of a watch channel. Discovery has no per-object change feed, so
/// the type has no values: the only thing a session can report is that its
/// channel closed, which means "re-List".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEvent {}

/// One accepted Watch call. The delivery channel closes exactly once: when the
/// session is stopped, times out, or a relist is forced.
#[derive(Debug)]
pub struct WatchSession {
    rx: mpsc::Receiver<WatchEvent>,
    token: CancellationToken,
}

impl WatchSession {
    /// `rx` must close once `token` is cancelled.
    pub fn new(rx: mpsc::Receiver<WatchEvent>, token: CancellationToken) -> Self {
        Self { rx, token }
    }

    /// Idempotent.
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Next event, or `None` once the channel is closed.
    pub async fn next(&mut self) -> Option<WatchEvent> {
        self.rx.recv().await
    }

    /// Wait until the channel closes, discarding anything delivered meanwhile.
    pub async fn closed(&mut self) {
        while self.rx.recv().await.is_some() {}
    }
}

impl Drop for WatchSession {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
