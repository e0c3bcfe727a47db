//! Annotation keys understood by the reflector. All live on the object's own metadata.

pub const PREFIX: &str = "reflector.v1.k8s.emberstack.com";

pub const REFLECTION_ALLOWED: &str = "reflector.v1.k8s.emberstack.com/reflection-allowed";
pub const REFLECTION_ALLOWED_NAMESPACES: &str = "reflector.v1.k8s.emberstack.com/reflection-allowed-namespaces";
pub const REFLECTION_AUTO_ENABLED: &str = "reflector.v1.k8s.emberstack.com/reflection-auto-enabled";
pub const REFLECTION_AUTO_NAMESPACES: &str = "reflector.v1.k8s.emberstack.com/reflection-auto-namespaces";

/// `namespace/name` or bare `name`; marks the object as a reflection of that source.
pub const REFLECTS: &str = "reflector.v1.k8s.emberstack.com/reflects";
/// Written by the engine only.
pub const AUTO_REFLECTS: &str = "reflector.v1.k8s.emberstack.com/auto-reflects";
pub const REFLECTED_VERSION: &str = "reflector.v1.k8s.emberstack.com/reflected-version";
pub const REFLECTED_AT: &str = "reflector.v1.k8s.emberstack.com/reflected-at";
