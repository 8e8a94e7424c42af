use std::{
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::{
    api::Api,
    config::{KubeConfigOptions, Kubeconfig},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    runtime::watcher::{self, Event},
    Client,
};
use rustc_hash::FxHashMap;
use spoke_agent::{
    check::{check_manifests, parse_executor, parse_manifests},
    run_workers, should_requeue, AgentConfig, Clients, WorkController, WorkQueue,
};
use spoke_auth::{ExecuteAction, SarValidator};
use spoke_core::{
    hub_hash,
    work::{AppliedManifestWork, ManifestWork, WORK_GROUP, WORK_VERSION},
};
use spoke_kubehub::{
    EventRecorder, KubeAccessReviewer, KubeEventRecorder, KubeImpersonation, KubeObjectClient, KubeTypedClient, LogRecorder,
    ResourceMapper,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(name = "spoke-agent", version, about = "Applies hub ManifestWorks onto this cluster")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch this cluster's ManifestWorks on the hub and reconcile them
    Run {
        /// Hub namespace of this cluster (overrides SPOKE_CLUSTER_NAME)
        #[arg(long = "cluster-name")]
        cluster_name: Option<String>,
        /// Hub kubeconfig (overrides SPOKE_HUB_KUBECONFIG)
        #[arg(long = "hub-kubeconfig")]
        hub_kubeconfig: Option<PathBuf>,
        /// Worker pool size (overrides SPOKE_WORKERS)
        #[arg(long = "workers")]
        workers: Option<usize>,
    },
    /// Check whether an executor may apply (or delete) the manifests in a file
    Check {
        /// Executor service account as <namespace>/<name>
        #[arg(long = "executor")]
        executor: String,
        /// Multi-document YAML file
        #[arg(short = 'f', long = "filename")]
        file: PathBuf,
        /// Check delete permission instead of apply
        #[arg(long = "delete", action = ArgAction::SetTrue)]
        delete: bool,
    },
}

fn init_tracing() {
    let env = std::env::var("SPOKE_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("SPOKE_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid SPOKE_METRICS_ADDR; expected host:port");
        }
    }
}

async fn rest_mapper(client: Client) -> ResourceMapper {
    match ResourceMapper::discover(client).await {
        Ok(m) => {
            debug!(kinds = m.len(), "discovery done");
            m
        }
        Err(e) => {
            warn!(error = %e, "discovery failed; using built-in kinds only");
            ResourceMapper::builtin()
        }
    }
}

fn event_recorder(client: Client) -> Arc<dyn EventRecorder> {
    match (std::env::var("POD_NAME"), std::env::var("POD_NAMESPACE")) {
        (Ok(name), Ok(namespace)) => {
            let reference = ObjectReference {
                api_version: Some("v1".into()),
                kind: Some("Pod".into()),
                name: Some(name),
                namespace: Some(namespace),
                ..Default::default()
            };
            Arc::new(KubeEventRecorder::new(client, "spoke-agent", reference))
        }
        _ => Arc::new(LogRecorder),
    }
}

fn manifest_work_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk(WORK_GROUP, WORK_VERSION, "ManifestWork"), "manifestworks")
}

fn decode_work(obj: &DynamicObject) -> Result<ManifestWork> {
    let raw = serde_json::to_value(obj).context("encoding watched object")?;
    serde_json::from_value(raw).context("decoding ManifestWork")
}

/// Feed the queue from a watch on the cluster namespace. Updates that leave
/// a settled work's spec alone are dropped.
async fn watch_works(api: Api<DynamicObject>, queue: Arc<WorkQueue<String>>, cancel: CancellationToken) {
    let stream = watcher::watcher(api, watcher::Config::default());
    futures::pin_mut!(stream);
    let mut seen: FxHashMap<String, ManifestWork> = FxHashMap::default();
    info!("work watcher started");

    let observe = |obj: &DynamicObject, seen: &mut FxHashMap<String, ManifestWork>| match decode_work(obj) {
        Ok(work) => {
            let name = work.metadata.name.clone();
            let requeue = seen.get(&name).map_or(true, |old| should_requeue(old, &work));
            seen.insert(name.clone(), work);
            if requeue {
                queue.add(name);
            }
        }
        Err(e) => warn!(error = %e, "skipping undecodable ManifestWork"),
    };

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            ev = stream.try_next() => ev,
        };
        match next {
            Ok(Some(Event::Applied(obj))) => observe(&obj, &mut seen),
            Ok(Some(Event::Deleted(obj))) => {
                if let Some(name) = obj.metadata.name {
                    seen.remove(&name);
                    queue.add(name);
                }
            }
            Ok(Some(Event::Restarted(list))) => {
                debug!(count = list.len(), "watch restart");
                for obj in &list {
                    observe(obj, &mut seen);
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "watch error; retrying");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
    info!("work watcher stopped");
}

async fn hub_config(cfg: &AgentConfig, spoke: &kube::Config) -> Result<kube::Config> {
    match &cfg.hub_kubeconfig {
        Some(path) => {
            let kc = Kubeconfig::read_from(path).with_context(|| format!("reading hub kubeconfig {}", path.display()))?;
            kube::Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
                .await
                .context("loading hub kubeconfig")
        }
        None => Ok(spoke.clone()),
    }
}

async fn run(cfg: AgentConfig) -> Result<()> {
    let cluster = cfg.cluster_name.clone().context("SPOKE_CLUSTER_NAME (or --cluster-name) is required")?;
    let timeout = cfg.call_timeout;

    let spoke_config = kube::Config::infer().await.context("loading spoke kubeconfig")?;
    let spoke = Client::try_from(spoke_config.clone()).context("building spoke client")?;
    let hub_config = hub_config(&cfg, &spoke_config).await?;
    let hub_hash = hub_hash(&hub_config.cluster_url.to_string());
    let hub = Client::try_from(hub_config).context("building hub client")?;
    info!(cluster = %cluster, hub_hash = %hub_hash, workers = cfg.workers, "starting work agent");

    let validator = SarValidator::new(
        Arc::new(KubeAccessReviewer::new(spoke.clone(), timeout)),
        Arc::new(KubeImpersonation::new(spoke_config, timeout)),
    )
    .with_requeue(cfg.not_allowed_requeue);
    let clients = Clients {
        works: Arc::new(KubeTypedClient::<ManifestWork>::namespaced(hub.clone(), &cluster, timeout)),
        applied_works: Arc::new(KubeTypedClient::<AppliedManifestWork>::cluster(spoke.clone(), timeout)),
        spoke: Arc::new(KubeObjectClient::new(spoke.clone(), timeout)),
        mapper: Arc::new(rest_mapper(spoke.clone()).await),
        validator: Arc::new(validator),
        recorder: event_recorder(spoke),
    };
    let controller = Arc::new(WorkController::new(hub_hash, clients).with_resync(cfg.resync));

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
            }
            cancel.cancel();
        }
    });

    let queue = WorkQueue::new();
    let api = Api::<DynamicObject>::namespaced_with(hub, &cluster, &manifest_work_resource());
    let watch = tokio::spawn(watch_works(api, queue.clone(), cancel.clone()));
    run_workers(controller, queue, cfg.workers, cfg.resync, cancel).await;
    watch.abort();
    Ok(())
}

async fn check(executor: &str, file: &Path, delete: bool, output: Output, cfg: &AgentConfig) -> Result<bool> {
    let executor = parse_executor(executor)?;
    let yaml = std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let manifests = parse_manifests(&yaml)?;

    let config = kube::Config::infer().await.context("loading kubeconfig")?;
    let client = Client::try_from(config.clone()).context("building client")?;
    let validator = SarValidator::new(
        Arc::new(KubeAccessReviewer::new(client.clone(), cfg.call_timeout)),
        Arc::new(KubeImpersonation::new(config, cfg.call_timeout)),
    )
    .with_requeue(cfg.not_allowed_requeue);
    let mapper = rest_mapper(client).await;
    let action = if delete { ExecuteAction::Delete } else { ExecuteAction::Apply };

    let outcomes = check_manifests(&validator, &mapper, &executor, &manifests, action).await;
    match output {
        Output::Human => {
            for o in &outcomes {
                let verdict = if o.allowed { "allowed" } else { "denied" };
                let key = if o.namespace.is_empty() { o.name.clone() } else { format!("{}/{}", o.namespace, o.name) };
                match &o.reason {
                    Some(reason) => println!("{:<8} {} {} ({})", verdict, o.resource, key, reason),
                    None => println!("{:<8} {} {}", verdict, o.resource, key),
                }
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(&outcomes)?),
    }
    Ok(outcomes.iter().all(|o| o.allowed))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let mut cfg = AgentConfig::from_env();

    match cli.command {
        Commands::Run { cluster_name, hub_kubeconfig, workers } => {
            if cluster_name.is_some() {
                cfg.cluster_name = cluster_name;
            }
            if hub_kubeconfig.is_some() {
                cfg.hub_kubeconfig = hub_kubeconfig;
            }
            if let Some(n) = workers {
                cfg.workers = n.max(1);
            }
            run(cfg).await
        }
        Commands::Check { executor, file, delete } => {
            if !check(&executor, &file, delete, cli.output, &cfg).await? {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}
