use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use futures::TryStreamExt;
use kube::api::WatchEvent;
use kube::error::ErrorResponse;
use metrics::{counter, histogram};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{EventType, Notification, ObjectEvent, SessionClosed, WatchSource, WatchedResource};

/// Receives every notification of the pipelines it is subscribed to, one at a time.
#[async_trait::async_trait]
pub trait Subscriber: Send + Sync {
    async fn notify(&self, notification: &Notification);
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Server-side watch timeout requested for each session.
    pub watch_timeout: Duration,
    /// Added to `watch_timeout` to form the absolute session deadline.
    pub session_margin: Duration,
    /// Pause before reopening after a faulted session.
    pub fault_delay: Duration,
    pub queue_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            watch_timeout: Duration::from_secs(280),
            session_margin: Duration::from_secs(5),
            fault_delay: Duration::from_secs(3),
            queue_capacity: 256,
        }
    }
}

impl PipelineConfig {
    pub fn session_deadline(&self) -> Duration {
        self.watch_timeout + self.session_margin
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("opening watch failed: {0}")]
    Open(#[source] kube::Error),
    #[error("watch stream failed: {0}")]
    Stream(#[source] kube::Error),
    #[error("watch error event: {0}")]
    Api(ErrorResponse),
    #[error("session exceeded deadline of {0:?}")]
    Deadline(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum SessionState {
    #[default]
    Idle,
    Requesting,
    Streaming,
    Closed,
    Faulted,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineStatus {
    pub state: SessionState,
    pub sessions: u64,
    pub faults: u64,
    pub events: u64,
    pub ignored: u64,
    pub discarded: u64,
}

/// Read side of a pipeline: lock-free status snapshot plus a session-count watch.
#[derive(Clone)]
pub struct PipelineHandle {
    status: Arc<ArcSwap<PipelineStatus>>,
    sessions_rx: watch::Receiver<u64>,
}

impl PipelineHandle {
    pub fn current(&self) -> Arc<PipelineStatus> {
        self.status.load_full()
    }

    /// Bumped every time a session ends, after subscribers were told about it.
    pub fn subscribe_sessions(&self) -> watch::Receiver<u64> {
        self.sessions_rx.clone()
    }
}

enum SessionOutcome {
    Closed,
    Faulted(SessionError),
    Shutdown,
}

/// List+watch loop for one kind, restarted forever until shutdown.
pub struct WatchPipeline<K> {
    source: Arc<dyn WatchSource<K>>,
    subscribers: Vec<Arc<dyn Subscriber>>,
    config: PipelineConfig,
    status: Arc<ArcSwap<PipelineStatus>>,
    sessions_tx: watch::Sender<u64>,
    sessions_rx: watch::Receiver<u64>,
}

impl<K: WatchedResource> WatchPipeline<K> {
    pub fn new(source: impl WatchSource<K> + 'static, config: PipelineConfig) -> Self {
        let (sessions_tx, sessions_rx) = watch::channel(0u64);
        Self {
            source: Arc::new(source),
            subscribers: Vec::new(),
            config,
            status: Arc::new(ArcSwap::from_pointee(PipelineStatus::default())),
            sessions_tx,
            sessions_rx,
        }
    }

    pub fn subscribe(&mut self, subscriber: Arc<dyn Subscriber>) {
        self.subscribers.push(subscriber);
    }

    pub fn handle(&self) -> PipelineHandle {
        PipelineHandle { status: Arc::clone(&self.status), sessions_rx: self.sessions_rx.clone() }
    }

    /// Run until `shutdown` flips to `true` (or its sender is dropped).
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let kind = K::KIND;
        let subscribers: Arc<[Arc<dyn Subscriber>]> = self.subscribers.clone().into();
        info!(kind = %kind, subscribers = subscribers.len(), "watch pipeline started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let session = Uuid::new_v4();
            let span = info_span!("watch_session", kind = %kind, session = %session);
            let t0 = Instant::now();
            let outcome = self.run_session(&subscribers, &mut shutdown).instrument(span).await;
            histogram!("reflector_watch_session_secs", "kind" => kind.as_str()).record(t0.elapsed().as_secs_f64());
            let faulted = match outcome {
                SessionOutcome::Shutdown => break,
                SessionOutcome::Closed => {
                    info!(kind = %kind, session = %session, took_ms = %t0.elapsed().as_millis(), "watch session closed");
                    self.update_status(|s| s.state = SessionState::Closed);
                    false
                }
                SessionOutcome::Faulted(err) => {
                    warn!(kind = %kind, session = %session, error = %err, "watch session faulted");
                    counter!("reflector_watch_faults_total", "kind" => kind.as_str()).increment(1);
                    self.update_status(|s| {
                        s.state = SessionState::Faulted;
                        s.faults += 1;
                    });
                    true
                }
            };

            let closed = Notification::SessionClosed(SessionClosed { kind, faulted });
            for subscriber in subscribers.iter() {
                subscriber.notify(&closed).await;
            }
            self.sessions_tx.send_modify(|n| *n += 1);

            if faulted {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.fault_delay) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
        self.update_status(|s| s.state = SessionState::Idle);
        info!(kind = %kind, "watch pipeline stopped");
    }

    async fn run_session(
        &self,
        subscribers: &Arc<[Arc<dyn Subscriber>]>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionOutcome {
        self.update_status(|s| {
            s.state = SessionState::Requesting;
            s.sessions += 1;
        });
        counter!("reflector_watch_sessions_total", "kind" => K::KIND.as_str()).increment(1);

        let (tx, rx) = mpsc::channel::<ObjectEvent>(self.config.queue_capacity.max(1));
        let discard = Arc::new(AtomicBool::new(false));
        let consumer = tokio::spawn(consume(rx, Arc::clone(subscribers), Arc::clone(&discard)).in_current_span());

        let deadline = self.config.session_deadline();
        let outcome = tokio::select! {
            res = tokio::time::timeout(deadline, self.produce(tx)) => match res {
                Ok(Ok(())) => SessionOutcome::Closed,
                Ok(Err(e)) => SessionOutcome::Faulted(e),
                Err(_) => SessionOutcome::Faulted(SessionError::Deadline(deadline)),
            },
            _ = shutdown.changed() => SessionOutcome::Shutdown,
        };

        // The producer (and its sender) is gone; whatever is still queued belongs to a dead session.
        discard.store(true, Ordering::Release);
        let discarded = match consumer.await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "watch consumer task failed");
                0
            }
        };
        if discarded > 0 {
            debug!(discarded, "discarded queued events from ended session");
            counter!("reflector_watch_discarded_total", "kind" => K::KIND.as_str()).increment(discarded);
            self.update_status(|s| s.discarded += discarded);
        }
        outcome
    }

    async fn produce(&self, tx: mpsc::Sender<ObjectEvent>) -> Result<(), SessionError> {
        let mut stream = self.source.watch(self.config.watch_timeout).await.map_err(SessionError::Open)?;
        self.update_status(|s| s.state = SessionState::Streaming);
        debug!(kind = %K::KIND, "watch stream opened");

        while let Some(event) = stream.try_next().await.map_err(SessionError::Stream)? {
            let (event_type, object) = match event {
                WatchEvent::Added(o) => (EventType::Added, o),
                WatchEvent::Modified(o) => (EventType::Modified, o),
                WatchEvent::Deleted(o) => (EventType::Deleted, o),
                WatchEvent::Bookmark(_) => continue,
                WatchEvent::Error(e) => return Err(SessionError::Api(e)),
            };
            if object.is_ignored() {
                counter!("reflector_watch_ignored_total", "kind" => K::KIND.as_str()).increment(1);
                self.update_status(|s| s.ignored += 1);
                continue;
            }
            counter!("reflector_watch_events_total", "kind" => K::KIND.as_str()).increment(1);
            self.update_status(|s| s.events += 1);
            // Blocks while the queue is full: backpressure, never drop.
            if tx.send(ObjectEvent { event_type, object: object.into_watched() }).await.is_err() {
                warn!(kind = %K::KIND, "watch consumer gone; ending session");
                break;
            }
        }
        Ok(())
    }

    fn update_status(&self, f: impl Fn(&mut PipelineStatus)) {
        self.status.rcu(|cur| {
            let mut next = PipelineStatus::clone(cur);
            f(&mut next);
            next
        });
    }
}

async fn consume(
    mut rx: mpsc::Receiver<ObjectEvent>,
    subscribers: Arc<[Arc<dyn Subscriber>]>,
    discard: Arc<AtomicBool>,
) -> u64 {
    let mut discarded = 0u64;
    while let Some(event) = rx.recv().await {
        if discard.load(Ordering::Acquire) {
            discarded += 1;
            continue;
        }
        let notification = Notification::Object(event);
        for subscriber in subscribers.iter() {
            subscriber.notify(&notification).await;
        }
    }
    discarded
}
