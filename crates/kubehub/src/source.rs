use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use kube::api::{Api, WatchEvent, WatchParams};
use kube::Client;
use tracing::debug;

use crate::WatchedResource;

/// The API server rejects watch timeouts at or above the client read timeout (295s).
pub const MAX_WATCH_TIMEOUT_SECS: u64 = 290;

pub type WatchStream<K> = BoxStream<'static, kube::Result<WatchEvent<K>>>;

/// Opens one watch session. Each call is a fresh registration: the server replays current
/// state as `Added` events and then streams changes until the timeout.
#[async_trait::async_trait]
pub trait WatchSource<K>: Send + Sync {
    async fn watch(&self, timeout: Duration) -> kube::Result<WatchStream<K>>;
}

/// Cluster-wide watch backed by the kube API.
pub struct KubeWatchSource<K> {
    api: Api<K>,
}

impl<K: WatchedResource> KubeWatchSource<K> {
    pub fn all(client: Client) -> Self {
        Self { api: Api::all(client) }
    }
}

#[async_trait::async_trait]
impl<K: WatchedResource> WatchSource<K> for KubeWatchSource<K> {
    async fn watch(&self, timeout: Duration) -> kube::Result<WatchStream<K>> {
        let secs = timeout.as_secs().clamp(1, MAX_WATCH_TIMEOUT_SECS) as u32;
        let wp = WatchParams::default().timeout(secs);
        debug!(kind = %K::KIND, timeout_secs = secs, "opening watch");
        let stream = self.api.watch(&wp, "0").await?;
        Ok(stream.boxed())
    }
}
