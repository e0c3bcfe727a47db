use std::fmt;

use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Secret};
use kube::Resource;
use reflector_core::NamespacedName;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// The closed set of kinds the reflector watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum WatchedKind {
    ConfigMap,
    Secret,
    Namespace,
}

impl WatchedKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatchedKind::ConfigMap => "ConfigMap",
            WatchedKind::Secret => "Secret",
            WatchedKind::Namespace => "Namespace",
        }
    }
}

impl fmt::Display for WatchedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A watched object, tagged by kind once at the pipeline boundary.
#[derive(Debug, Clone)]
#[allow(clippy::large_enum_variant)]
pub enum WatchedObject {
    ConfigMap(ConfigMap),
    Secret(Secret),
    Namespace(Namespace),
}

impl WatchedObject {
    pub fn kind(&self) -> WatchedKind {
        match self {
            WatchedObject::ConfigMap(_) => WatchedKind::ConfigMap,
            WatchedObject::Secret(_) => WatchedKind::Secret,
            WatchedObject::Namespace(_) => WatchedKind::Namespace,
        }
    }

    /// `None` for namespaces, which are cluster-scoped.
    pub fn id(&self) -> Option<NamespacedName> {
        match self {
            WatchedObject::ConfigMap(o) => NamespacedName::from_meta(&o.metadata),
            WatchedObject::Secret(o) => NamespacedName::from_meta(&o.metadata),
            WatchedObject::Namespace(_) => None,
        }
    }
}

/// Object-carrying watch event types. Bookmarks and error events never reach subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone)]
pub struct ObjectEvent {
    pub event_type: EventType,
    pub object: WatchedObject,
}

/// Announced after a watch session ends and before the next one is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionClosed {
    pub kind: WatchedKind,
    pub faulted: bool,
}

#[derive(Debug, Clone)]
pub enum Notification {
    Object(ObjectEvent),
    SessionClosed(SessionClosed),
}

/// A concrete resource type that can be fed through a pipeline.
pub trait WatchedResource: Resource<DynamicType = ()> + Clone + DeserializeOwned + fmt::Debug + Send + Sync + 'static {
    const KIND: WatchedKind;

    fn into_watched(self) -> WatchedObject;

    fn from_watched(object: &WatchedObject) -> Option<&Self>;

    /// Objects the API server keeps for its own bookkeeping; dropped before queueing.
    fn is_ignored(&self) -> bool {
        false
    }
}

impl WatchedResource for ConfigMap {
    const KIND: WatchedKind = WatchedKind::ConfigMap;

    fn into_watched(self) -> WatchedObject {
        WatchedObject::ConfigMap(self)
    }

    fn from_watched(object: &WatchedObject) -> Option<&Self> {
        match object {
            WatchedObject::ConfigMap(o) => Some(o),
            _ => None,
        }
    }
}

pub(crate) const SERVICE_ACCOUNT_TOKEN: &str = "kubernetes.io/service-account-token";

impl WatchedResource for Secret {
    const KIND: WatchedKind = WatchedKind::Secret;

    fn into_watched(self) -> WatchedObject {
        WatchedObject::Secret(self)
    }

    fn from_watched(object: &WatchedObject) -> Option<&Self> {
        match object {
            WatchedObject::Secret(o) => Some(o),
            _ => None,
        }
    }

    fn is_ignored(&self) -> bool {
        self.type_.as_deref() == Some(SERVICE_ACCOUNT_TOKEN)
    }
}

impl WatchedResource for Namespace {
    const KIND: WatchedKind = WatchedKind::Namespace;

    fn into_watched(self) -> WatchedObject {
        WatchedObject::Namespace(self)
    }

    fn from_watched(object: &WatchedObject) -> Option<&Self> {
        match object {
            WatchedObject::Namespace(o) => Some(o),
            _ => None,
        }
    }
}
