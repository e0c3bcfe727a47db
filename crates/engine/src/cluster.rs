use std::marker::PhantomData;

use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Secret};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource};
use reflector_core::NamespacedName;
use tracing::debug;

use crate::{KindAdapter, NamespaceLister, ReflectedPayload, StoreResult};

/// Adapter backed by the kube API for any namespaced mirrored kind.
pub struct KubeAdapter<K> {
    client: Client,
    _kind: PhantomData<fn() -> K>,
}

pub type ConfigMapAdapter = KubeAdapter<ConfigMap>;
pub type SecretAdapter = KubeAdapter<Secret>;

impl<K> KubeAdapter<K> {
    pub fn new(client: Client) -> Self {
        Self { client, _kind: PhantomData }
    }
}

impl<K> KubeAdapter<K>
where
    K: ReflectedPayload + Resource<Scope = NamespaceResourceScope>,
{
    fn namespaced(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait::async_trait]
impl<K> KindAdapter for KubeAdapter<K>
where
    K: ReflectedPayload + Resource<Scope = NamespaceResourceScope>,
{
    type Object = K;

    async fn list_by_name(&self, name: &str) -> StoreResult<Vec<K>> {
        let api: Api<K> = Api::all(self.client.clone());
        let lp = ListParams::default().fields(&format!("metadata.name={name}"));
        let list = api.list(&lp).await?;
        debug!(kind = %K::KIND, name, found = list.items.len(), "listed by name");
        Ok(list.items)
    }

    async fn create(&self, object: &K, namespace: &str) -> StoreResult<K> {
        Ok(self.namespaced(namespace).create(&PostParams::default(), object).await?)
    }

    async fn get(&self, id: &NamespacedName) -> StoreResult<K> {
        Ok(self.namespaced(&id.namespace).get(&id.name).await?)
    }

    async fn delete(&self, id: &NamespacedName) -> StoreResult<()> {
        self.namespaced(&id.namespace).delete(&id.name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn apply_patch(&self, patch: &serde_json::Value, id: &NamespacedName) -> StoreResult<K> {
        let pp = PatchParams::default();
        Ok(self.namespaced(&id.namespace).patch(&id.name, &pp, &Patch::Merge(patch)).await?)
    }
}

pub struct KubeNamespaces {
    api: Api<Namespace>,
}

impl KubeNamespaces {
    pub fn new(client: Client) -> Self {
        Self { api: Api::all(client) }
    }
}

#[async_trait::async_trait]
impl NamespaceLister for KubeNamespaces {
    async fn list_namespaces(&self) -> StoreResult<Vec<String>> {
        let list = self.api.list(&ListParams::default()).await?;
        Ok(list
            .items
            .into_iter()
            .filter(|ns| ns.status.as_ref().and_then(|s| s.phase.as_deref()) != Some("Terminating"))
            .filter_map(|ns| ns.metadata.name)
            .collect())
    }
}
