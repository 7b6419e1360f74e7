//! apiwatch store: incremental index between definers and the resource types they declare.

#![forbid(unsafe_code)]

use apiwatch_core::{DefinerId, ResourceDescriptor};
use apiwatch_schema::EnumerateResources;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

/// What one `set_definer` call changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DefinerDelta {
    pub added: Vec<ResourceDescriptor>,
    pub removed: Vec<ResourceDescriptor>,
}

impl DefinerDelta {
    pub fn is_empty(&self) -> bool { self.added.is_empty() && self.removed.is_empty() }
}

/// Two maps kept as exact inverses of each other. A descriptor whose last
/// definer goes away is removed rather than left with an empty set.
#[derive(Debug, Default)]
pub struct DefinerIndex {
    definer_to_types: FxHashMap<DefinerId, FxHashSet<ResourceDescriptor>>,
    types_to_definers: FxHashMap<ResourceDescriptor, FxHashSet<DefinerId>>,
}

impl DefinerIndex {
    pub fn new() -> Self { Self::default() }

    /// Record the current declarations of `id`, applying only the set difference
    /// against what was recorded before.
    pub fn set_definer<E: EnumerateResources + ?Sized>(&mut self, id: &DefinerId, enumr: &E) -> DefinerDelta {
        let new_set: FxHashSet<ResourceDescriptor> = enumr.resources().collect();
        self.replace(id, new_set)
    }

    /// Forget `id` entirely.
    pub fn remove_definer(&mut self, id: &DefinerId) -> DefinerDelta {
        self.replace(id, FxHashSet::default())
    }

    fn replace(&mut self, id: &DefinerId, new_set: FxHashSet<ResourceDescriptor>) -> DefinerDelta {
        let old_set = self.definer_to_types.remove(id).unwrap_or_default();
        let mut delta = DefinerDelta::default();
        for gvr in new_set.iter() {
            if !old_set.contains(gvr) {
                self.types_to_definers.entry(gvr.clone()).or_default().insert(id.clone());
                debug!(gvr = %gvr, definer = %id, "adding definition");
                delta.added.push(gvr.clone());
            }
        }
        for gvr in old_set.iter() {
            if new_set.contains(gvr) { continue; }
            debug!(gvr = %gvr, definer = %id, "removing definition");
            if let Some(definers) = self.types_to_definers.get_mut(gvr) {
                definers.remove(id);
                if definers.is_empty() {
                    self.types_to_definers.remove(gvr);
                    debug!(gvr = %gvr, "no more definers");
                }
            }
            delta.removed.push(gvr.clone());
        }
        if !new_set.is_empty() {
            self.definer_to_types.insert(id.clone(), new_set);
        }
        delta.added.sort();
        delta.removed.sort();
        delta
    }

    /// Definers currently declaring `gvr`, sorted.
    pub fn definers_of(&self, gvr: &ResourceDescriptor) -> Vec<DefinerId> {
        let mut out: Vec<_> = self.types_to_definers.get(gvr).map(|s| s.iter().cloned().collect()).unwrap_or_default();
        out.sort();
        out
    }

    /// Resource types currently declared by `id`, sorted.
    pub fn resources_of(&self, id: &DefinerId) -> Vec<ResourceDescriptor> {
        let mut out: Vec<_> = self.definer_to_types.get(id).map(|s| s.iter().cloned().collect()).unwrap_or_default();
        out.sort();
        out
    }

    pub fn is_defined(&self, gvr: &ResourceDescriptor) -> bool { self.types_to_definers.contains_key(gvr) }

    /// All defined resource types, sorted.
    pub fn descriptors(&self) -> Vec<ResourceDescriptor> {
        let mut out: Vec<_> = self.types_to_definers.keys().cloned().collect();
        out.sort();
        out
    }

    /// All definers with a non-empty declaration, sorted.
    pub fn definers(&self) -> Vec<DefinerId> {
        let mut out: Vec<_> = self.definer_to_types.keys().cloned().collect();
        out.sort();
        out
    }

    /// Number of defined resource types.
    pub fn len(&self) -> usize { self.types_to_definers.len() }
    pub fn is_empty(&self) -> bool { self.types_to_definers.is_empty() }

    /// Check that both maps are exact inverses and that no set is empty.
    pub fn check_consistency(&self) -> Result<(), String> {
        for (id, gvrs) in self.definer_to_types.iter() {
            if gvrs.is_empty() { return Err(format!("definer {} has an empty set", id)); }
            for gvr in gvrs {
                let back = self.types_to_definers.get(gvr).map(|s| s.contains(id)).unwrap_or(false);
                if !back { return Err(format!("{} -> {} has no inverse", id, gvr)); }
            }
        }
        for (gvr, ids) in self.types_to_definers.iter() {
            if ids.is_empty() { return Err(format!("descriptor {} has an empty set", gvr)); }
            for id in ids {
                let fwd = self.definer_to_types.get(id).map(|s| s.contains(gvr)).unwrap_or(false);
                if !fwd { return Err(format!("{} -> {} has no inverse", gvr, id)); }
            }
        }
        Ok(())
    }
}
