use reflector_core::NamespacedName;

use crate::{PatchBuilder, ReflectedPayload, StoreResult};

/// Per-kind strategy: the operations the engine cannot perform generically.
///
/// Payload handling defaults to the object's [`ReflectedPayload`] impl; implementors only
/// supply the raw API calls.
#[async_trait::async_trait]
pub trait KindAdapter: Send + Sync + 'static {
    type Object: ReflectedPayload;

    /// New object carrying only the source's kind-specific payload.
    fn clone_for_creation(&self, source: &Self::Object) -> Self::Object {
        source.clone_payload()
    }

    fn configure_patch(&self, source: &Self::Object, target: &Self::Object, patch: &mut PatchBuilder) {
        source.configure_patch(target, patch)
    }

    /// Every object of this kind named `name`, across all namespaces.
    async fn list_by_name(&self, name: &str) -> StoreResult<Vec<Self::Object>>;

    async fn create(&self, object: &Self::Object, namespace: &str) -> StoreResult<Self::Object>;

    async fn get(&self, id: &NamespacedName) -> StoreResult<Self::Object>;

    async fn delete(&self, id: &NamespacedName) -> StoreResult<()>;

    async fn apply_patch(&self, patch: &serde_json::Value, id: &NamespacedName) -> StoreResult<Self::Object>;
}

#[async_trait::async_trait]
pub trait NamespaceLister: Send + Sync {
    /// Names of namespaces that can currently receive reflections.
    async fn list_namespaces(&self) -> StoreResult<Vec<String>>;
}
