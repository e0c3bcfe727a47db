//! Reflector kubehub: watch ingestion for the small fixed set of watched kinds.
//!
//! One [`WatchPipeline`] per kind turns the API server's watch primitive into a
//! restartable, backpressured event feed delivered sequentially to [`Subscriber`]s.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use kube::Client;
use tracing::info;

mod object;
mod pipeline;
mod source;

pub use object::{EventType, Notification, ObjectEvent, SessionClosed, WatchedKind, WatchedObject, WatchedResource};
pub use pipeline::{PipelineConfig, PipelineHandle, PipelineStatus, SessionError, SessionState, Subscriber, WatchPipeline};
pub use source::{KubeWatchSource, WatchSource, WatchStream, MAX_WATCH_TIMEOUT_SECS};

/// Build a client from the ambient kubeconfig or in-cluster service account.
pub async fn kube_client() -> Result<Client> {
    let client = Client::try_default().await.context("building kube client")?;
    info!(default_ns = %client.default_namespace(), "kube client ready");
    Ok(client)
}
