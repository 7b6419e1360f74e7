//! Debounced relist scheduling.
//!
//! Invalidation signals arm a deadline `settle_window` in the future; every
//! further signal while pending pushes the deadline out again. Only when a
//! deadline passes without being pushed are the outstanding watches closed,
//! which makes the informer driver re-List.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::listwatch::VirtualListWatcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RelistState {
    #[default]
    Idle,
    Pending { deadline: Instant },
}

/// What the scheduler loop should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelistPoll {
    /// Nothing pending; wait for a signal.
    Idle,
    /// Sleep until the deadline (or an earlier signal).
    Wait(Instant),
    /// Deadline passed; force the relist now.
    Fire,
}

impl RelistState {
    /// Start or extend the quiet period.
    pub fn arm(&mut self, now: Instant, settle_window: Duration) {
        *self = RelistState::Pending { deadline: now + settle_window };
    }

    /// Returns `Fire` at most once per armed period and goes back to `Idle`.
    pub fn poll(&mut self, now: Instant) -> RelistPoll {
        match *self {
            RelistState::Idle => RelistPoll::Idle,
            RelistState::Pending { deadline } if now < deadline => RelistPoll::Wait(deadline),
            RelistState::Pending { .. } => {
                *self = RelistState::Idle;
                RelistPoll::Fire
            }
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, RelistState::Pending { .. })
    }
}

/// Background loop: sleep until the deadline when pending, otherwise wait for a
/// signal. Exits once the watcher's shutdown token is cancelled.
pub(crate) async fn run(lw: Arc<VirtualListWatcher>) {
    let shutdown = lw.shutdown_token();
    debug!(cluster = %lw.cluster(), "relist scheduler started");
    loop {
        let next = match lw.poll_relist(Instant::now()) {
            RelistPoll::Fire => {
                info!(cluster = %lw.cluster(), generation = lw.generation(), "cycled APIResource watches");
                continue;
            }
            RelistPoll::Wait(deadline) => Some(deadline),
            RelistPoll::Idle => None,
        };
        let sleep = async {
            match next {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = lw.relist_signal().notified() => {}
            _ = sleep => {}
        }
    }
    debug!(cluster = %lw.cluster(), "relist scheduler stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn sliding_deadline_fires_once_after_last_signal() {
        let window = Duration::from_secs(20);
        let t0 = Instant::now();
        let mut st = RelistState::default();
        assert_eq!(st.poll(t0), RelistPoll::Idle);

        st.arm(t0, window);
        st.arm(t0 + Duration::from_secs(5), window);
        let deadline = t0 + Duration::from_secs(25);
        assert_eq!(st.poll(t0 + Duration::from_secs(20)), RelistPoll::Wait(deadline));
        assert_eq!(st.poll(t0 + Duration::from_secs(24)), RelistPoll::Wait(deadline));
        assert_eq!(st.poll(deadline), RelistPoll::Fire);
        assert_eq!(st.poll(deadline + Duration::from_secs(1)), RelistPoll::Idle);
        assert!(!st.is_pending());
    }
}
