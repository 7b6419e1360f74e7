//! Engine configuration, with `APIWATCH_*` environment overrides.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Result};

pub const DEFAULT_SETTLE_WINDOW: Duration = Duration::from_secs(20);

/// Which definer notifications force a relist. Every notification still
/// updates the definer index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidationPolicy {
    pub on_add: bool,
    pub on_update: bool,
    pub on_delete: bool,
}

impl InvalidationPolicy {
    pub const NONE: Self = Self { on_add: false, on_update: false, on_delete: false };
    pub const ALL: Self = Self { on_add: true, on_update: true, on_delete: true };
}

impl Default for InvalidationPolicy {
    fn default() -> Self {
        Self { on_add: true, on_update: false, on_delete: false }
    }
}

/// Parses a comma list of `add`, `update`, `delete`; `none` and `all` are shorthands.
impl FromStr for InvalidationPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut p = Self::NONE;
        for tok in s.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            match tok.to_ascii_lowercase().as_str() {
                "add" => p.on_add = true,
                "update" => p.on_update = true,
                "delete" => p.on_delete = true,
                "all" => p = Self::ALL,
                "none" => {}
                other => return Err(anyhow!("invalid invalidation trigger: {} (expect add,update,delete)", other)),
            }
        }
        Ok(p)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Logical cluster name used in logs, errors and default definer ids.
    pub cluster: String,
    /// Quiet period after the last invalidation before the relist is forced.
    pub settle_window: Duration,
    pub policy: InvalidationPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { cluster: "local".to_string(), settle_window: DEFAULT_SETTLE_WINDOW, policy: InvalidationPolicy::default() }
    }
}

impl EngineConfig {
    pub fn new(cluster: impl Into<String>) -> Self {
        Self { cluster: cluster.into(), ..Self::default() }
    }

    pub fn with_settle_window(mut self, settle_window: Duration) -> Self {
        self.settle_window = settle_window;
        self
    }

    pub fn with_policy(mut self, policy: InvalidationPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Read `APIWATCH_CLUSTER`, `APIWATCH_SETTLE_SECS` and `APIWATCH_INVALIDATE_ON`;
    /// absent or unparsable values keep their defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let cluster = lookup("APIWATCH_CLUSTER").filter(|s| !s.is_empty()).unwrap_or(d.cluster);
        let settle_window = lookup("APIWATCH_SETTLE_SECS")
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(d.settle_window);
        let policy = lookup("APIWATCH_INVALIDATE_ON").and_then(|s| s.parse().ok()).unwrap_or(d.policy);
        Self { cluster, settle_window, policy }
    }
}
