use reflector_core::{MirroringProperties, NamespacedName};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;

/// Engine-local view of the cluster. Advisory only: anything missing is refetched.
#[derive(Debug, Default)]
pub(crate) struct Caches {
    pub properties: FxHashMap<NamespacedName, MirroringProperties>,
    pub direct_reflections: FxHashMap<NamespacedName, FxHashSet<NamespacedName>>,
    pub auto_reflections: FxHashMap<NamespacedName, FxHashSet<NamespacedName>>,
    pub auto_sources: FxHashSet<NamespacedName>,
    pub not_found: FxHashSet<NamespacedName>,
}

impl Caches {
    pub fn clear(&mut self) {
        self.properties.clear();
        self.direct_reflections.clear();
        self.auto_reflections.clear();
        self.auto_sources.clear();
        self.not_found.clear();
    }

    pub fn unlink(&mut self, source: &NamespacedName, reflection: &NamespacedName) {
        if let Some(set) = self.direct_reflections.get_mut(source) {
            set.remove(reflection);
        }
        if let Some(set) = self.auto_reflections.get_mut(source) {
            set.remove(reflection);
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            properties: self.properties.len(),
            direct_reflections: self.direct_reflections.values().map(|s| s.len()).sum(),
            auto_reflections: self.auto_reflections.values().map(|s| s.len()).sum(),
            auto_sources: self.auto_sources.len(),
            not_found: self.not_found.len(),
        }
    }
}

/// Entry counts per cache; reflection counts are summed over all sources.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub properties: usize,
    pub direct_reflections: usize,
    pub auto_reflections: usize,
    pub auto_sources: usize,
    pub not_found: usize,
}
