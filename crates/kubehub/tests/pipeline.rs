#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::{ObjectMeta, WatchEvent};
use kube::error::ErrorResponse;
use reflector_kubehub::{
    Notification, PipelineConfig, PipelineHandle, SessionState, Subscriber, WatchPipeline, WatchSource, WatchStream,
    WatchedResource,
};
use tokio::sync::watch;

enum Step<K> {
    Yield(kube::Result<WatchEvent<K>>),
    /// Hold the stream until the subscriber has received this many object events in total.
    AwaitDelivered(usize),
}

fn ev<K>(e: kube::Result<WatchEvent<K>>) -> Step<K> {
    Step::Yield(e)
}

/// One scripted session: its steps, then either end the stream or hang.
struct Session<K> {
    open_error: bool,
    steps: Vec<Step<K>>,
    hang: bool,
}

impl<K> Session<K> {
    fn ends(steps: Vec<Step<K>>) -> Self {
        Self { open_error: false, steps, hang: false }
    }
    fn hangs(steps: Vec<Step<K>>) -> Self {
        Self { open_error: false, steps, hang: true }
    }
    fn fails_to_open() -> Self {
        Self { open_error: true, steps: Vec::new(), hang: false }
    }
}

struct ScriptedSource<K> {
    sessions: Mutex<VecDeque<Session<K>>>,
    delivered: watch::Receiver<usize>,
}

impl<K> ScriptedSource<K> {
    fn new(sessions: Vec<Session<K>>, recorder: &Recorder) -> Self {
        Self { sessions: Mutex::new(sessions.into()), delivered: recorder.delivered() }
    }
}

fn api_error(code: u16) -> ErrorResponse {
    ErrorResponse { status: "Failure".into(), message: "scripted".into(), reason: "Scripted".into(), code }
}

#[async_trait::async_trait]
impl<K: WatchedResource> WatchSource<K> for ScriptedSource<K> {
    async fn watch(&self, _timeout: Duration) -> kube::Result<WatchStream<K>> {
        let next = self.sessions.lock().unwrap().pop_front();
        let Some(session) = next else {
            // Script exhausted: behave like an idle watch.
            return Ok(futures::stream::pending().boxed());
        };
        if session.open_error {
            return Err(kube::Error::Api(api_error(500)));
        }
        let hang = session.hang;
        let steps = session.steps;
        let mut delivered = self.delivered.clone();
        Ok(async_stream::stream! {
            for step in steps {
                match step {
                    Step::Yield(e) => yield e,
                    Step::AwaitDelivered(n) => {
                        let _ = delivered.wait_for(|seen| *seen >= n).await.map(|_| ());
                    }
                }
            }
            if hang {
                futures::future::pending::<()>().await;
            }
        }
        .boxed())
    }
}

struct Recorder {
    seen: Mutex<Vec<String>>,
    delivered: watch::Sender<usize>,
}

impl Default for Recorder {
    fn default() -> Self {
        Self { seen: Mutex::new(Vec::new()), delivered: watch::channel(0).0 }
    }
}

impl Recorder {
    fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }

    fn delivered(&self) -> watch::Receiver<usize> {
        self.delivered.subscribe()
    }
}

#[async_trait::async_trait]
impl Subscriber for Recorder {
    async fn notify(&self, notification: &Notification) {
        let line = match notification {
            Notification::Object(ev) => format!(
                "{:?} {} {}",
                ev.event_type,
                ev.object.kind(),
                ev.object.id().map(|id| id.to_string()).unwrap_or_default()
            ),
            Notification::SessionClosed(c) => format!("closed {} faulted={}", c.kind, c.faulted),
        };
        self.seen.lock().unwrap().push(line);
        if matches!(notification, Notification::Object(_)) {
            self.delivered.send_modify(|n| *n += 1);
        }
    }
}

/// Sleeps before recording each notification.
struct Slow {
    delay: Duration,
    inner: Recorder,
}

#[async_trait::async_trait]
impl Subscriber for Slow {
    async fn notify(&self, notification: &Notification) {
        tokio::time::sleep(self.delay).await;
        self.inner.notify(notification).await;
    }
}

fn cm(ns: &str, name: &str) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta { name: Some(name.into()), namespace: Some(ns.into()), ..Default::default() },
        ..Default::default()
    }
}

fn secret(ns: &str, name: &str, type_: &str) -> Secret {
    Secret {
        metadata: ObjectMeta { name: Some(name.into()), namespace: Some(ns.into()), ..Default::default() },
        type_: Some(type_.into()),
        ..Default::default()
    }
}

fn bookmark() -> WatchEvent<ConfigMap> {
    serde_json::from_value(serde_json::json!({
        "type": "BOOKMARK",
        "object": { "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "resourceVersion": "12" } }
    }))
    .expect("bookmark event")
}

fn fast_config() -> PipelineConfig {
    PipelineConfig {
        watch_timeout: Duration::from_secs(60),
        session_margin: Duration::from_secs(1),
        fault_delay: Duration::from_millis(10),
        queue_capacity: 4,
    }
}

struct Running {
    handle: PipelineHandle,
    shutdown: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

fn start<K: WatchedResource>(source: ScriptedSource<K>, config: PipelineConfig, recorder: Arc<Recorder>) -> Running {
    let mut pipeline = WatchPipeline::<K>::new(source, config);
    pipeline.subscribe(recorder);
    let handle = pipeline.handle();
    let (shutdown, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(pipeline.run(shutdown_rx));
    Running { handle, shutdown, task }
}

async fn wait_sessions(handle: &PipelineHandle, at_least: u64) {
    let mut rx = handle.subscribe_sessions();
    tokio::time::timeout(Duration::from_secs(5), async {
        while *rx.borrow_and_update() < at_least {
            if rx.changed().await.is_err() {
                break;
            }
        }
    })
    .await
    .expect("sessions did not end in time");
}

async fn stop(running: Running) {
    let _ = running.shutdown.send(true);
    tokio::time::timeout(Duration::from_secs(2), running.task)
        .await
        .expect("pipeline did not stop")
        .expect("pipeline task panicked");
}

#[tokio::test]
async fn delivers_events_in_order_and_announces_session_end() {
    let recorder = Arc::new(Recorder::default());
    let source = ScriptedSource::new(
        vec![Session::ends(vec![
            ev(Ok(WatchEvent::Added(cm("dev", "a")))),
            ev(Ok(bookmark())),
            ev(Ok(WatchEvent::Modified(cm("dev", "a")))),
            ev(Ok(WatchEvent::Deleted(cm("dev", "a")))),
            Step::AwaitDelivered(3),
        ])],
        &recorder,
    );
    let running = start(source, fast_config(), recorder.clone());
    wait_sessions(&running.handle, 1).await;

    assert_eq!(
        recorder.seen(),
        vec![
            "Added ConfigMap dev/a",
            "Modified ConfigMap dev/a",
            "Deleted ConfigMap dev/a",
            "closed ConfigMap faulted=false",
        ]
    );
    let status = running.handle.current();
    assert_eq!(status.events, 3);
    assert_eq!(status.faults, 0);
    assert_eq!(status.discarded, 0);
    stop(running).await;
}

#[tokio::test]
async fn error_event_faults_session_and_reopens() {
    let recorder = Arc::new(Recorder::default());
    let source = ScriptedSource::new(
        vec![
            Session::ends(vec![
                ev(Ok(WatchEvent::Added(cm("dev", "a")))),
                Step::AwaitDelivered(1),
                ev(Ok(WatchEvent::Error(api_error(410)))),
            ]),
            Session::ends(vec![ev(Ok(WatchEvent::Added(cm("dev", "b")))), Step::AwaitDelivered(2)]),
        ],
        &recorder,
    );
    let running = start(source, fast_config(), recorder.clone());
    wait_sessions(&running.handle, 2).await;

    assert_eq!(
        recorder.seen(),
        vec![
            "Added ConfigMap dev/a",
            "closed ConfigMap faulted=true",
            "Added ConfigMap dev/b",
            "closed ConfigMap faulted=false",
        ]
    );
    let status = running.handle.current();
    assert_eq!(status.faults, 1);
    assert!(status.sessions >= 2);
    stop(running).await;
}

#[tokio::test]
async fn stream_and_open_failures_are_faults() {
    let recorder = Arc::new(Recorder::default());
    let source = ScriptedSource::new(
        vec![
            Session::fails_to_open(),
            Session::ends(vec![ev(Err(kube::Error::Api(api_error(500))))]),
            Session::ends(vec![ev(Ok(WatchEvent::Added(cm("dev", "c")))), Step::AwaitDelivered(1)]),
        ],
        &recorder,
    );
    let running = start(source, fast_config(), recorder.clone());
    wait_sessions(&running.handle, 3).await;

    assert_eq!(
        recorder.seen(),
        vec![
            "closed ConfigMap faulted=true",
            "closed ConfigMap faulted=true",
            "Added ConfigMap dev/c",
            "closed ConfigMap faulted=false",
        ]
    );
    assert_eq!(running.handle.current().faults, 2);
    stop(running).await;
}

#[tokio::test]
async fn stuck_session_is_torn_down_at_deadline() {
    let recorder = Arc::new(Recorder::default());
    let source = ScriptedSource::new(vec![Session::hangs(vec![ev(Ok(WatchEvent::Added(cm("dev", "a"))))])], &recorder);
    let config = PipelineConfig {
        watch_timeout: Duration::from_millis(50),
        session_margin: Duration::from_millis(10),
        ..fast_config()
    };
    let running = start(source, config, recorder.clone());
    wait_sessions(&running.handle, 1).await;

    // Later (empty) sessions keep hitting the deadline too; only the first one matters here.
    let seen = recorder.seen();
    assert_eq!(&seen[..2], ["Added ConfigMap dev/a", "closed ConfigMap faulted=true"]);
    stop(running).await;
}

#[tokio::test]
async fn store_bookkeeping_secrets_are_filtered() {
    let recorder = Arc::new(Recorder::default());
    let source = ScriptedSource::new(
        vec![Session::ends(vec![
            ev(Ok(WatchEvent::Added(secret("dev", "token", "kubernetes.io/service-account-token")))),
            ev(Ok(WatchEvent::Added(secret("dev", "creds", "Opaque")))),
            Step::AwaitDelivered(1),
        ])],
        &recorder,
    );
    let running = start(source, fast_config(), recorder.clone());
    wait_sessions(&running.handle, 1).await;

    assert_eq!(recorder.seen(), vec!["Added Secret dev/creds", "closed Secret faulted=false"]);
    assert_eq!(running.handle.current().ignored, 1);
    stop(running).await;
}

#[tokio::test]
async fn shutdown_is_clean_and_not_announced() {
    let recorder = Arc::new(Recorder::default());
    let source = ScriptedSource::new(vec![Session::hangs(vec![ev(Ok(WatchEvent::Added(cm("dev", "a"))))])], &recorder);
    let running = start(source, fast_config(), recorder.clone());

    let mut delivered = recorder.delivered();
    tokio::time::timeout(Duration::from_secs(2), delivered.wait_for(|n| *n >= 1))
        .await
        .expect("first event")
        .expect("recorder alive");

    let handle = running.handle.clone();
    stop(running).await;
    assert_eq!(recorder.seen(), vec!["Added ConfigMap dev/a"]);
    assert_eq!(handle.current().state, SessionState::Idle);
    assert_eq!(handle.current().faults, 0);
}

#[tokio::test]
async fn full_queue_applies_backpressure_without_loss() {
    let slow = Arc::new(Slow { delay: Duration::from_millis(2), inner: Recorder::default() });
    let events = (0..20).map(|i| ev(Ok(WatchEvent::Added(cm("dev", &format!("o{i}")))))).collect();
    let source = ScriptedSource::new(vec![Session::hangs(events)], &slow.inner);
    let mut pipeline = WatchPipeline::<ConfigMap>::new(source, fast_config());
    pipeline.subscribe(slow.clone());
    let handle = pipeline.handle();
    let (shutdown, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(pipeline.run(shutdown_rx));

    let mut delivered = slow.inner.delivered();
    tokio::time::timeout(Duration::from_secs(5), delivered.wait_for(|n| *n >= 20))
        .await
        .expect("all events delivered")
        .expect("recorder alive");

    let expected: Vec<String> = (0..20).map(|i| format!("Added ConfigMap dev/o{i}")).collect();
    assert_eq!(slow.inner.seen(), expected);
    assert_eq!(handle.current().events, 20);
    let _ = shutdown.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(2), task).await;
}

#[tokio::test]
async fn events_still_queued_at_session_end_are_discarded() {
    let slow = Arc::new(Slow { delay: Duration::from_millis(50), inner: Recorder::default() });
    let events = (0..10).map(|i| ev(Ok(WatchEvent::Added(cm("dev", &format!("o{i}")))))).collect();
    // Ends as soon as the last event is queued, while the subscriber is still busy.
    let source = ScriptedSource::new(vec![Session::ends(events)], &slow.inner);
    let mut pipeline = WatchPipeline::<ConfigMap>::new(source, fast_config());
    pipeline.subscribe(slow.clone());
    let handle = pipeline.handle();
    let (shutdown, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(pipeline.run(shutdown_rx));

    wait_sessions(&handle, 1).await;
    let status = handle.current();
    assert!(status.discarded > 0, "nothing was left in the queue");
    assert_eq!(status.events, 10);

    let seen = slow.inner.seen();
    let (objects, rest) = seen.split_at(seen.len() - 1);
    assert_eq!(rest, ["closed ConfigMap faulted=false"]);
    assert_eq!(objects.len() as u64 + status.discarded, 10);
    // Delivery stops at a prefix: nothing after the cut reaches the subscriber.
    let expected: Vec<String> = (0..objects.len()).map(|i| format!("Added ConfigMap dev/o{i}")).collect();
    assert_eq!(objects, expected.as_slice());

    let _ = shutdown.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(2), task).await;
}
