use std::borrow::Cow;
use std::sync::Arc;
use std::time::Instant;

use kube::Resource;
use metrics::{counter, histogram};
use reflector_core::{MirroringProperties, NamespacedName, ReflectionStamp};
use reflector_kubehub::{EventType, Notification, Subscriber, WatchedKind, WatchedObject, WatchedResource};
use rustc_hash::FxHashSet;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheStats, Caches};
use crate::{KindAdapter, NamespaceLister, PatchBuilder, StoreError};

/// What the caller already knows about a reflection target.
enum Target<'a, T> {
    Existing(&'a T),
    Missing,
    Unresolved,
}

enum SourceLookup {
    Found(MirroringProperties),
    Missing,
    Failed,
}

enum Created<T> {
    Done,
    /// Someone else created the target first.
    Raced(T),
    Failed,
}

/// Reflections currently linked to one source, sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Linked {
    pub direct: Vec<NamespacedName>,
    pub auto: Vec<NamespacedName>,
}

/// Reconciles one mirrored kind. Handlers are serialized on the cache lock, so notifications
/// from the kind pipeline and the namespace pipeline never interleave.
pub struct ReflectionEngine<A: KindAdapter> {
    adapter: A,
    namespaces: Arc<dyn NamespaceLister>,
    caches: Mutex<Caches>,
}

impl<A: KindAdapter> ReflectionEngine<A> {
    pub fn new(adapter: A, namespaces: Arc<dyn NamespaceLister>) -> Self {
        Self { adapter, namespaces, caches: Mutex::new(Caches::default()) }
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.caches.lock().await.stats()
    }

    pub async fn linked(&self, source: &NamespacedName) -> Linked {
        let caches = self.caches.lock().await;
        let sorted = |set: Option<&FxHashSet<NamespacedName>>| {
            let mut v: Vec<_> = set.into_iter().flatten().cloned().collect();
            v.sort();
            v
        };
        Linked {
            direct: sorted(caches.direct_reflections.get(source)),
            auto: sorted(caches.auto_reflections.get(source)),
        }
    }

    /// Drop all cached state; the next events rebuild it from the API.
    pub async fn reset(&self, cause: WatchedKind) {
        let mut caches = self.caches.lock().await;
        let before = caches.stats();
        caches.clear();
        info!(kind = %kind::<A>(), cause = %cause, properties = before.properties, "caches cleared after watch session ended");
    }

    pub async fn handle_event(&self, event_type: EventType, object: &A::Object) {
        let Some(id) = NamespacedName::from_meta(object.meta()) else {
            debug!(kind = %kind::<A>(), "skipping object without namespace or name");
            return;
        };
        let t0 = Instant::now();
        let mut caches = self.caches.lock().await;
        match event_type {
            EventType::Added | EventType::Modified => self.upsert(&mut caches, &id, object).await,
            EventType::Deleted => self.deleted(&mut caches, &id, object).await,
        }
        histogram!("reflector_reconcile_ms", "kind" => kind::<A>().as_str()).record(t0.elapsed().as_secs_f64() * 1000.0);
    }

    /// Fan every auto source out into a namespace that just appeared.
    pub async fn handle_namespace_added(&self, namespace: &str) {
        let mut caches = self.caches.lock().await;
        let mut sources: Vec<NamespacedName> = caches.auto_sources.iter().cloned().collect();
        sources.sort();
        for source in sources {
            if source.namespace == namespace {
                continue;
            }
            let Some(props) = caches.properties.get(&source) else { continue };
            if !props.can_be_auto_reflected_to_namespace(namespace) {
                continue;
            }
            let target = NamespacedName::new(namespace, source.name.clone());
            debug!(source = %source, reflection = %target, "namespace added; auto-reflecting");
            if self.reflect(&mut caches, &source, &target, None, Target::Unresolved, true).await {
                caches.auto_reflections.entry(source).or_default().insert(target);
            }
        }
    }

    async fn upsert(&self, caches: &mut Caches, id: &NamespacedName, object: &A::Object) {
        let props = MirroringProperties::from_meta(object.meta());
        caches.not_found.remove(id);
        caches.properties.insert(id.clone(), props.clone());
        match &props.reflects {
            None => self.reconcile_source(caches, id, object, &props).await,
            Some(source) => {
                // Whatever it used to source, it sources nothing now.
                self.retire_source(caches, id, "object became a reflection").await;
                if props.is_auto_reflection {
                    self.reconcile_auto_reflection(caches, id, source).await;
                } else {
                    self.reconcile_direct_reflection(caches, id, object, &props, source).await;
                }
            }
        }
    }

    async fn reconcile_source(
        &self,
        caches: &mut Caches,
        id: &NamespacedName,
        object: &A::Object,
        props: &MirroringProperties,
    ) {
        if let Some(direct) = caches.direct_reflections.get_mut(id) {
            direct.retain(|r| {
                let keep = props.can_be_reflected_to_namespace(&r.namespace);
                if !keep {
                    info!(source = %id, reflection = %r, "reflection no longer permitted; unlinked");
                }
                keep
            });
        }

        let revoked: Vec<NamespacedName> = caches
            .auto_reflections
            .get(id)
            .map(|set| set.iter().filter(|r| !props.can_be_auto_reflected_to_namespace(&r.namespace)).cloned().collect())
            .unwrap_or_default();
        for r in revoked {
            info!(source = %id, reflection = %r, "auto reflection no longer permitted");
            self.delete_reflection(&r).await;
            caches.unlink(id, &r);
        }

        let is_auto_source = props.allowed && props.auto_enabled;
        if is_auto_source {
            caches.auto_sources.insert(id.clone());
        } else {
            caches.auto_sources.remove(id);
            caches.auto_reflections.remove(id);
        }

        if !props.allowed {
            caches.direct_reflections.remove(id);
            return;
        }

        let mut stale: Vec<NamespacedName> = caches
            .direct_reflections
            .get(id)
            .map(|set| {
                set.iter()
                    .filter(|r| caches.properties.get(*r).map_or(true, |p| p.reflected_version != props.resource_version))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        stale.sort();
        for r in stale {
            self.reflect(caches, id, &r, Some(object), Target::Unresolved, false).await;
        }

        if is_auto_source {
            self.auto_reflect(caches, id, object, props).await;
        }
    }

    async fn reconcile_direct_reflection(
        &self,
        caches: &mut Caches,
        id: &NamespacedName,
        object: &A::Object,
        props: &MirroringProperties,
        source: &NamespacedName,
    ) {
        let source_props = match self.lookup_source(caches, source).await {
            SourceLookup::Found(p) => p,
            SourceLookup::Missing => {
                warn!(source = %source, reflection = %id, "source of reflection not found");
                return;
            }
            SourceLookup::Failed => return,
        };
        if !source_props.can_be_reflected_to_namespace(&id.namespace) {
            warn!(source = %source, reflection = %id, "source does not permit reflection into this namespace");
            caches.unlink(source, id);
            return;
        }
        caches.direct_reflections.entry(source.clone()).or_default().insert(id.clone());
        if source_props.resource_version == props.reflected_version {
            debug!(source = %source, reflection = %id, version = %props.reflected_version, "reflection up to date");
            return;
        }
        self.reflect(caches, source, id, None, Target::Existing(object), false).await;
    }

    async fn reconcile_auto_reflection(&self, caches: &mut Caches, id: &NamespacedName, source: &NamespacedName) {
        let source_props = if caches.not_found.contains(source) {
            None
        } else {
            match self.lookup_source(caches, source).await {
                SourceLookup::Found(p) => Some(p),
                SourceLookup::Missing => None,
                SourceLookup::Failed => return,
            }
        };
        let Some(source_props) = source_props else {
            info!(source = %source, reflection = %id, "source gone; deleting auto reflection");
            self.delete_reflection(id).await;
            return;
        };
        if !source_props.can_be_auto_reflected_to_namespace(&id.namespace) {
            info!(source = %source, reflection = %id, "auto reflection no longer permitted");
            self.delete_reflection(id).await;
            caches.unlink(source, id);
            return;
        }
        caches.auto_reflections.entry(source.clone()).or_default().insert(id.clone());
    }

    async fn deleted(&self, caches: &mut Caches, id: &NamespacedName, object: &A::Object) {
        caches.properties.remove(id);
        let props = MirroringProperties::from_meta(object.meta());
        if let Some(source) = &props.reflects {
            caches.unlink(source, id);
            debug!(source = %source, reflection = %id, "reflection deleted; unlinked");
            return;
        }

        caches.not_found.insert(id.clone());
        self.retire_source(caches, id, "source deleted").await;
    }

    /// Forget `id` as a source and delete the auto reflections it owned.
    async fn retire_source(&self, caches: &mut Caches, id: &NamespacedName, reason: &'static str) {
        caches.auto_sources.remove(id);
        caches.direct_reflections.remove(id);
        let mut autos: Vec<NamespacedName> =
            caches.auto_reflections.remove(id).map(|set| set.into_iter().collect()).unwrap_or_default();
        autos.sort();
        if !autos.is_empty() {
            info!(source = %id, count = autos.len(), reason, "removing auto reflections");
        }
        for r in autos {
            self.delete_reflection(&r).await;
        }
    }

    async fn lookup_source(&self, caches: &mut Caches, source: &NamespacedName) -> SourceLookup {
        if let Some(p) = caches.properties.get(source) {
            return SourceLookup::Found(p.clone());
        }
        match self.adapter.get(source).await {
            Ok(obj) => {
                let p = MirroringProperties::from_meta(obj.meta());
                caches.properties.insert(source.clone(), p.clone());
                SourceLookup::Found(p)
            }
            Err(StoreError::NotFound) => {
                caches.not_found.insert(source.clone());
                SourceLookup::Missing
            }
            Err(e) => {
                error!(source = %source, error = %e, "fetching source failed");
                SourceLookup::Failed
            }
        }
    }

    /// Reconcile every auto reflection of `id` against the current namespaces.
    async fn auto_reflect(&self, caches: &mut Caches, id: &NamespacedName, object: &A::Object, props: &MirroringProperties) {
        let candidates = match self.adapter.list_by_name(&id.name).await {
            Ok(v) => v,
            Err(e) => {
                error!(source = %id, error = %e, "listing same-named objects failed");
                return;
            }
        };
        let namespaces = match self.namespaces.list_namespaces().await {
            Ok(v) => v,
            Err(e) => {
                error!(source = %id, error = %e, "listing namespaces failed");
                return;
            }
        };

        let mut occupied: FxHashSet<&str> = FxHashSet::default();
        let mut to_delete = Vec::new();
        let mut to_update = Vec::new();
        let mut to_skip = Vec::new();
        for candidate in &candidates {
            let Some(cid) = NamespacedName::from_meta(candidate.meta()) else { continue };
            if cid.namespace == id.namespace {
                continue;
            }
            occupied.insert(candidate.meta().namespace.as_deref().unwrap_or_default());
            let cp = MirroringProperties::from_meta(candidate.meta());
            if cp.reflects.as_ref() != Some(id) || !cp.is_auto_reflection {
                continue;
            }
            if !props.can_be_auto_reflected_to_namespace(&cid.namespace) {
                to_delete.push(cid);
            } else if cp.reflected_version == props.resource_version {
                to_skip.push(cid);
            } else {
                to_update.push((cid, candidate));
            }
        }
        let to_create: Vec<NamespacedName> = namespaces
            .iter()
            .filter(|ns| **ns != id.namespace && !occupied.contains(ns.as_str()))
            .filter(|ns| props.can_be_auto_reflected_to_namespace(ns))
            .map(|ns| NamespacedName::new(ns.clone(), id.name.clone()))
            .collect();

        info!(
            source = %id,
            create = to_create.len(),
            update = to_update.len(),
            skip = to_skip.len(),
            delete = to_delete.len(),
            "auto reflection fan-out"
        );

        for r in &to_delete {
            self.delete_reflection(r).await;
        }
        let mut linked: FxHashSet<NamespacedName> = to_skip.into_iter().collect();
        for r in to_create {
            if self.reflect(caches, id, &r, Some(object), Target::Missing, true).await {
                linked.insert(r);
            }
        }
        for (r, existing) in to_update {
            self.reflect(caches, id, &r, Some(object), Target::Existing(existing), true).await;
            linked.insert(r);
        }
        caches.auto_reflections.insert(id.clone(), linked);
    }

    /// Copy `source_id` into `target_id`. Returns whether the target now reflects the source.
    async fn reflect(
        &self,
        caches: &mut Caches,
        source_id: &NamespacedName,
        target_id: &NamespacedName,
        source: Option<&A::Object>,
        target: Target<'_, A::Object>,
        auto: bool,
    ) -> bool {
        if source_id == target_id {
            return false;
        }
        let source: Cow<'_, A::Object> = match source {
            Some(s) => Cow::Borrowed(s),
            None => match self.adapter.get(source_id).await {
                Ok(s) => Cow::Owned(s),
                Err(StoreError::NotFound) => {
                    warn!(source = %source_id, reflection = %target_id, "source not found; nothing to reflect");
                    caches.not_found.insert(source_id.clone());
                    return false;
                }
                Err(e) => {
                    self.failed("get", source_id, &e);
                    return false;
                }
            },
        };
        let version = source.meta().resource_version.clone().unwrap_or_default();
        let stamp = ReflectionStamp::new(source_id.clone(), version, auto);

        let existing: Option<Cow<'_, A::Object>> = match target {
            Target::Existing(t) => Some(Cow::Borrowed(t)),
            Target::Missing => None,
            Target::Unresolved => match self.adapter.get(target_id).await {
                Ok(t) => Some(Cow::Owned(t)),
                Err(StoreError::NotFound) => None,
                Err(e) => {
                    self.failed("get", target_id, &e);
                    return false;
                }
            },
        };
        let existing = match existing {
            Some(t) => t,
            None => match self.create_reflection(&source, target_id, &stamp).await {
                Created::Done => return true,
                Created::Raced(t) => Cow::Owned(t),
                Created::Failed => return false,
            },
        };
        self.patch_reflection(&source, target_id, &existing, &stamp).await
    }

    async fn create_reflection(&self, source: &A::Object, target: &NamespacedName, stamp: &ReflectionStamp) -> Created<A::Object> {
        let mut object = self.adapter.clone_for_creation(source);
        let meta = object.meta_mut();
        meta.name = Some(target.name.clone());
        meta.namespace = Some(target.namespace.clone());
        meta.annotations.get_or_insert_with(Default::default).extend(stamp.annotations());

        match self.adapter.create(&object, &target.namespace).await {
            Ok(_) => {
                info!(source = %stamp.source, reflection = %target, version = %stamp.version, auto = stamp.auto, "created reflection");
                counter!("reflector_reflect_created_total", "kind" => kind::<A>().as_str()).increment(1);
                Created::Done
            }
            Err(StoreError::Conflict) => {
                debug!(reflection = %target, "reflection created concurrently; revalidating");
                match self.adapter.get(target).await {
                    Ok(existing) => Created::Raced(existing),
                    Err(e) => {
                        self.failed("get", target, &e);
                        Created::Failed
                    }
                }
            }
            Err(e) => {
                self.failed("create", target, &e);
                Created::Failed
            }
        }
    }

    async fn patch_reflection(
        &self,
        source: &A::Object,
        target_id: &NamespacedName,
        target: &A::Object,
        stamp: &ReflectionStamp,
    ) -> bool {
        let target_props = MirroringProperties::from_meta(target.meta());
        if target_props.reflects.as_ref() != Some(&stamp.source) {
            warn!(source = %stamp.source, target = %target_id, "target exists and is not a reflection of this source; leaving it alone");
            counter!("reflector_reflect_skipped_total", "kind" => kind::<A>().as_str()).increment(1);
            return false;
        }
        if target_props.reflected_version == stamp.version {
            debug!(source = %stamp.source, reflection = %target_id, version = %stamp.version, "reflection already at source version");
            counter!("reflector_reflect_skipped_total", "kind" => kind::<A>().as_str()).increment(1);
            return true;
        }

        let mut patch = PatchBuilder::default();
        patch.merge_annotations(stamp.annotations());
        self.adapter.configure_patch(source, target, &mut patch);
        match self.adapter.apply_patch(&patch.build(), target_id).await {
            Ok(_) => {
                info!(source = %stamp.source, reflection = %target_id, version = %stamp.version, "patched reflection");
                counter!("reflector_reflect_patched_total", "kind" => kind::<A>().as_str()).increment(1);
                true
            }
            Err(e) => {
                self.failed("patch", target_id, &e);
                false
            }
        }
    }

    async fn delete_reflection(&self, id: &NamespacedName) {
        match self.adapter.delete(id).await {
            Ok(()) => {
                info!(reflection = %id, "deleted reflection");
                counter!("reflector_reflections_deleted_total", "kind" => kind::<A>().as_str()).increment(1);
            }
            Err(StoreError::NotFound) => debug!(reflection = %id, "reflection already gone"),
            Err(e) => self.failed("delete", id, &e),
        }
    }

    fn failed(&self, op: &'static str, id: &NamespacedName, e: &StoreError) {
        error!(kind = %kind::<A>(), op, object = %id, error = %e, "api call failed");
        counter!("reflector_reflect_errors_total", "kind" => kind::<A>().as_str(), "op" => op).increment(1);
    }
}

fn kind<A: KindAdapter>() -> WatchedKind {
    <A::Object as WatchedResource>::KIND
}

#[async_trait::async_trait]
impl<A: KindAdapter> Subscriber for ReflectionEngine<A> {
    async fn notify(&self, notification: &Notification) {
        match notification {
            Notification::Object(event) => {
                if let Some(object) = <A::Object as WatchedResource>::from_watched(&event.object) {
                    self.handle_event(event.event_type, object).await;
                } else if let (WatchedObject::Namespace(ns), EventType::Added) = (&event.object, event.event_type) {
                    if let Some(name) = ns.metadata.name.as_deref() {
                        self.handle_namespace_added(name).await;
                    }
                }
            }
            Notification::SessionClosed(closed) if closed.kind == kind::<A>() || closed.kind == WatchedKind::Namespace => {
                self.reset(closed.kind).await;
            }
            Notification::SessionClosed(_) => {}
        }
    }
}
