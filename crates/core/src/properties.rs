use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::Serialize;

use crate::annotations;
use crate::{NamespacedName, PatternList};

/// Reflection policy of an object, derived from its annotations when observed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MirroringProperties {
    pub allowed: bool,
    pub allowed_namespaces: PatternList,
    pub auto_enabled: bool,
    pub auto_namespaces: PatternList,
    /// Set iff the object is a reflection; names its source.
    pub reflects: Option<NamespacedName>,
    pub is_auto_reflection: bool,
    pub reflected_version: String,
    pub reflected_at: Option<DateTime<Utc>>,
    pub resource_version: String,
}

impl MirroringProperties {
    pub fn from_meta(meta: &ObjectMeta) -> Self {
        let empty = BTreeMap::new();
        let annotations = meta.annotations.as_ref().unwrap_or(&empty);
        let namespace = meta.namespace.as_deref().unwrap_or("");
        let get = |key: &str| annotations.get(key).map(String::as_str);

        let reflects = get(annotations::REFLECTS).and_then(|v| NamespacedName::parse_reference(v, namespace));
        Self {
            allowed: parse_bool(get(annotations::REFLECTION_ALLOWED)),
            allowed_namespaces: PatternList::parse(get(annotations::REFLECTION_ALLOWED_NAMESPACES).unwrap_or("")),
            auto_enabled: parse_bool(get(annotations::REFLECTION_AUTO_ENABLED)),
            auto_namespaces: PatternList::parse(get(annotations::REFLECTION_AUTO_NAMESPACES).unwrap_or("")),
            is_auto_reflection: reflects.is_some() && parse_bool(get(annotations::AUTO_REFLECTS)),
            reflects,
            reflected_version: get(annotations::REFLECTED_VERSION).map(|v| v.trim().to_string()).unwrap_or_default(),
            reflected_at: get(annotations::REFLECTED_AT).and_then(parse_timestamp),
            resource_version: meta.resource_version.clone().unwrap_or_default(),
        }
    }

    pub fn is_reflection(&self) -> bool {
        self.reflects.is_some()
    }

    pub fn can_be_reflected_to_namespace(&self, namespace: &str) -> bool {
        self.allowed && self.allowed_namespaces.matches(namespace)
    }

    pub fn can_be_auto_reflected_to_namespace(&self, namespace: &str) -> bool {
        self.can_be_reflected_to_namespace(namespace) && self.auto_enabled && self.auto_namespaces.matches(namespace)
    }
}

/// Bookkeeping written onto a reflection each time its source is copied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReflectionStamp {
    pub source: NamespacedName,
    pub version: String,
    pub at: DateTime<Utc>,
    pub auto: bool,
}

impl ReflectionStamp {
    pub fn new(source: NamespacedName, version: impl Into<String>, auto: bool) -> Self {
        Self { source, version: version.into(), at: Utc::now(), auto }
    }

    pub fn annotations(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (annotations::AUTO_REFLECTS.to_string(), self.auto.to_string()),
            (annotations::REFLECTS.to_string(), self.source.to_string()),
            (annotations::REFLECTED_VERSION.to_string(), self.version.clone()),
            (annotations::REFLECTED_AT.to_string(), self.at.to_rfc3339_opts(SecondsFormat::Secs, true)),
        ])
    }
}

fn parse_bool(value: Option<&str>) -> bool {
    value.map(|v| v.trim().eq_ignore_ascii_case("true")).unwrap_or(false)
}

// Older writers stored the timestamp JSON-encoded, quotes included.
fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let v = value.trim().trim_matches('"');
    DateTime::parse_from_rfc3339(v).ok().map(|dt| dt.with_timezone(&Utc))
}
