use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Secret};
use kube::api::{Api, ObjectMeta};
use reflector_core::{MirroringProperties, NamespacedName};
use reflector_engine::{ConfigMapAdapter, KubeNamespaces, NamespaceLister, ReflectionEngine, SecretAdapter};
use reflector_kubehub::{kube_client, KubeWatchSource, PipelineConfig, WatchPipeline, MAX_WATCH_TIMEOUT_SECS};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "reflector", version, about = "Mirror ConfigMaps and Secrets across namespaces")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(flatten)]
    tuning: Tuning,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args, Debug)]
struct Tuning {
    /// Server-side watch timeout per session (clamped to 1..=290)
    #[arg(long, env = "REFLECTOR_WATCH_TIMEOUT_SECS", default_value_t = 280, global = true)]
    watch_timeout_secs: u64,
    /// Added to the watch timeout to form the hard session deadline
    #[arg(long, env = "REFLECTOR_SESSION_MARGIN_SECS", default_value_t = 5, global = true)]
    session_margin_secs: u64,
    /// Pause before reopening a faulted watch
    #[arg(long, env = "REFLECTOR_FAULT_DELAY_SECS", default_value_t = 3, global = true)]
    fault_delay_secs: u64,
    /// Bounded event queue per pipeline
    #[arg(long, env = "REFLECTOR_QUEUE_CAPACITY", default_value_t = 256, global = true)]
    queue_capacity: usize,
    /// Do not mirror ConfigMaps
    #[arg(long, env = "REFLECTOR_NO_CONFIGMAPS", action = ArgAction::SetTrue, global = true)]
    no_configmaps: bool,
    /// Do not mirror Secrets
    #[arg(long, env = "REFLECTOR_NO_SECRETS", action = ArgAction::SetTrue, global = true)]
    no_secrets: bool,
}

impl Tuning {
    fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            watch_timeout: Duration::from_secs(self.watch_timeout_secs.clamp(1, MAX_WATCH_TIMEOUT_SECS)),
            session_margin: Duration::from_secs(self.session_margin_secs),
            fault_delay: Duration::from_secs(self.fault_delay_secs),
            queue_capacity: self.queue_capacity.max(1),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Kind { Configmap, Secret }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch the cluster and keep reflections converged (default)
    Run,
    /// Show the reflection policy parsed from one object's annotations
    Inspect {
        kind: Kind,
        /// Object reference, e.g. "dev/app-config"
        object: String,
    },
}

fn init_tracing() {
    let env = std::env::var("REFLECTOR_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("REFLECTOR_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid REFLECTOR_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            init_metrics();
            run(&cli.tuning).await
        }
        Commands::Inspect { kind, object } => inspect(kind, &object, cli.output).await,
    }
}

async fn run(tuning: &Tuning) -> Result<()> {
    if tuning.no_configmaps && tuning.no_secrets {
        anyhow::bail!("both ConfigMaps and Secrets are disabled; nothing to mirror");
    }
    let client = kube_client().await?;
    let config = tuning.pipeline_config();
    info!(
        watch_timeout_secs = config.watch_timeout.as_secs(),
        deadline_secs = config.session_deadline().as_secs(),
        queue_capacity = config.queue_capacity,
        "starting reflector"
    );

    let namespaces: Arc<dyn NamespaceLister> = Arc::new(KubeNamespaces::new(client.clone()));
    let mut namespace_pipeline = WatchPipeline::<Namespace>::new(KubeWatchSource::all(client.clone()), config.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    if !tuning.no_configmaps {
        let engine = Arc::new(ReflectionEngine::new(ConfigMapAdapter::new(client.clone()), Arc::clone(&namespaces)));
        let mut pipeline = WatchPipeline::<ConfigMap>::new(KubeWatchSource::all(client.clone()), config.clone());
        pipeline.subscribe(engine.clone());
        namespace_pipeline.subscribe(engine);
        tasks.push(tokio::spawn(pipeline.run(shutdown_rx.clone())));
    }
    if !tuning.no_secrets {
        let engine = Arc::new(ReflectionEngine::new(SecretAdapter::new(client.clone()), Arc::clone(&namespaces)));
        let mut pipeline = WatchPipeline::<Secret>::new(KubeWatchSource::all(client.clone()), config.clone());
        pipeline.subscribe(engine.clone());
        namespace_pipeline.subscribe(engine);
        tasks.push(tokio::spawn(pipeline.run(shutdown_rx.clone())));
    }
    tasks.push(tokio::spawn(namespace_pipeline.run(shutdown_rx)));

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown requested"),
        Err(e) => warn!(error = %e, "listening for ctrl-c failed; shutting down"),
    }
    let _ = shutdown_tx.send(true);
    for task in tasks {
        if let Err(e) = task.await {
            error!(error = %e, "pipeline task failed");
        }
    }
    info!("reflector stopped");
    Ok(())
}

async fn inspect(kind: Kind, object: &str, output: Output) -> Result<()> {
    let id: NamespacedName = object
        .parse()
        .with_context(|| format!("invalid object reference {object:?}; expected namespace/name"))?;
    let client = kube_client().await?;
    let meta: ObjectMeta = match kind {
        Kind::Configmap => {
            let api: Api<ConfigMap> = Api::namespaced(client, &id.namespace);
            api.get(&id.name).await.with_context(|| format!("fetching ConfigMap {id}"))?.metadata
        }
        Kind::Secret => {
            let api: Api<Secret> = Api::namespaced(client, &id.namespace);
            api.get(&id.name).await.with_context(|| format!("fetching Secret {id}"))?.metadata
        }
    };
    let props = MirroringProperties::from_meta(&meta);
    match output {
        Output::Json => println!("{}", serde_json::to_string_pretty(&props)?),
        Output::Human => print!("{}", describe(&id, &props)),
    }
    Ok(())
}

fn describe(id: &NamespacedName, p: &MirroringProperties) -> String {
    let or_any = |s: &str| if s.is_empty() { "*".to_string() } else { s.to_string() };
    let or_dash = |s: &str| if s.is_empty() { "-".to_string() } else { s.to_string() };
    let mut out = format!("{id} (resource version {})\n", or_dash(&p.resource_version));
    match &p.reflects {
        Some(source) => {
            let how = if p.is_auto_reflection { "auto" } else { "direct" };
            out.push_str(&format!("  reflection of {source} ({how})\n"));
            out.push_str(&format!("  reflected version: {}\n", or_dash(&p.reflected_version)));
            let at = p.reflected_at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".to_string());
            out.push_str(&format!("  reflected at: {at}\n"));
        }
        None => {
            out.push_str(&format!("  reflection allowed: {}\n", p.allowed));
            out.push_str(&format!("  allowed namespaces: {}\n", or_any(p.allowed_namespaces.as_str())));
            out.push_str(&format!("  auto reflection: {}\n", p.auto_enabled));
            out.push_str(&format!("  auto namespaces: {}\n", or_any(p.auto_namespaces.as_str())));
        }
    }
    out
}
