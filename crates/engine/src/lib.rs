//! Reflector engine: keeps reflections of annotated sources converged, one engine per mirrored kind.
//!
//! The engine is a [`Subscriber`](reflector_kubehub::Subscriber) of its kind's watch pipeline and of
//! the namespace pipeline. Its caches are process-local, rebuilt lazily from the API server, and
//! cleared whenever either pipeline restarts a session.

#![forbid(unsafe_code)]

mod adapter;
mod cache;
mod cluster;
mod engine;
mod error;
mod payload;

pub use adapter::{KindAdapter, NamespaceLister};
pub use cache::CacheStats;
pub use cluster::{ConfigMapAdapter, KubeAdapter, KubeNamespaces, SecretAdapter};
pub use engine::{Linked, ReflectionEngine};
pub use error::{StoreError, StoreResult};
pub use payload::{PatchBuilder, ReflectedPayload};
