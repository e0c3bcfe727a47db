use std::fmt;
use std::str::FromStr;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};

/// Identity of a namespaced object. Sole cache key of the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ReferenceError {
    #[error("empty object reference")]
    Empty,
    #[error("invalid object reference: {0} (expect namespace/name)")]
    Invalid(String),
}

impl NamespacedName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    /// Identity of an observed object. `None` for cluster-scoped or unnamed metadata.
    pub fn from_meta(meta: &ObjectMeta) -> Option<Self> {
        let namespace = meta.namespace.as_deref().filter(|s| !s.is_empty())?;
        let name = meta.name.as_deref().filter(|s| !s.is_empty())?;
        Some(Self::new(namespace, name))
    }

    /// Parse the value of a `reflects` annotation.
    ///
    /// `namespace/name` is taken as-is; a bare `name` resolves against `default_namespace`
    /// (the namespace of the reflection carrying the annotation). Anything else, including
    /// empty parts or more than one separator, yields `None`.
    pub fn parse_reference(value: &str, default_namespace: &str) -> Option<Self> {
        let value = value.trim();
        if value.is_empty() {
            return None;
        }
        let parts: Vec<&str> = value.split('/').map(str::trim).collect();
        match parts.as_slice() {
            [name] if !default_namespace.is_empty() => Some(Self::new(default_namespace, *name)),
            [namespace, name] if !namespace.is_empty() && !name.is_empty() => Some(Self::new(*namespace, *name)),
            _ => None,
        }
    }
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Strict form used on the command line: both parts are required.
impl FromStr for NamespacedName {
    type Err = ReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ReferenceError::Empty);
        }
        match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => Ok(Self::new(ns, name)),
            _ => Err(ReferenceError::Invalid(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_reference_full_and_bare() {
        assert_eq!(NamespacedName::parse_reference("dev/cfg", "qa"), Some(NamespacedName::new("dev", "cfg")));
        assert_eq!(NamespacedName::parse_reference("cfg", "qa"), Some(NamespacedName::new("qa", "cfg")));
        assert_eq!(NamespacedName::parse_reference("  dev/cfg ", "qa"), Some(NamespacedName::new("dev", "cfg")));
    }

    #[test]
    fn parse_reference_is_total() {
        for bad in ["", "   ", "/", "dev/", "/cfg", "a/b/c"] {
            assert_eq!(NamespacedName::parse_reference(bad, "qa"), None, "input {bad:?}");
        }
        assert_eq!(NamespacedName::parse_reference("cfg", ""), None);
    }

    #[test]
    fn display_round_trips_through_from_str() {
        let n = NamespacedName::new("dev", "cfg");
        assert_eq!(n.to_string(), "dev/cfg");
        assert_eq!("dev/cfg".parse::<NamespacedName>().unwrap(), n);
        assert_eq!("".parse::<NamespacedName>(), Err(ReferenceError::Empty));
        assert!("cfg".parse::<NamespacedName>().is_err());
    }

    #[test]
    fn from_meta_requires_namespace_and_name() {
        let mut meta = ObjectMeta { name: Some("cfg".into()), ..Default::default() };
        assert_eq!(NamespacedName::from_meta(&meta), None);
        meta.namespace = Some("dev".into());
        assert_eq!(NamespacedName::from_meta(&meta), Some(NamespacedName::new("dev", "cfg")));
    }
}
