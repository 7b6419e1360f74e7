use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use apiwatch_core::{ApiResourceList, ListOptions, ListWatch, ObjectNotifier, ResourceDescriptor, DefinerId, WatchOptions};
use apiwatch_kubehub::{DiscoveryEngine, EngineConfig, InvalidationPolicy, KubeDiscovery, KubeNotifier, MemCacheDiscovery, VirtualListWatcher};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "apiwatchctl", version, about = "Watchable view of a cluster's API resources")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Logical cluster name used in logs and definer ids [default: $APIWATCH_CLUSTER or local]
    #[arg(long = "cluster", global = true)]
    cluster: Option<String>,

    /// Quiet period after the last invalidation before watches are cycled [default: $APIWATCH_SETTLE_SECS or 20]
    #[arg(long = "settle-secs", global = true)]
    settle_secs: Option<u64>,

    /// Definer notifications that force a relist, comma list of add,update,delete [default: $APIWATCH_INVALIDATE_ON or add]
    #[arg(long = "invalidate-on", global = true)]
    invalidate_on: Option<String>,

    /// Invalidate on CustomResourceDefinition changes
    #[arg(long = "crds", global = true, action = ArgAction::SetTrue)]
    crds: bool,

    /// Invalidate on kcp APIBinding changes
    #[arg(long = "apibindings", global = true, action = ArgAction::SetTrue)]
    apibindings: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// List served resource types; with --watch, relist whenever they may have changed
    Resources {
        #[arg(long = "watch", action = ArgAction::SetTrue)]
        watch: bool,
        /// Server-side timeout for each watch
        #[arg(long = "watch-timeout-secs", default_value_t = 300)]
        watch_timeout_secs: u64,
    },
    /// Show which CRDs/APIBindings define which resource types
    Definers,
}

fn init_tracing() {
    let env = std::env::var("APIWATCH_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("APIWATCH_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid APIWATCH_METRICS_ADDR; expected host:port");
        }
    }
}

fn print_list(list: &ApiResourceList, output: Output) -> Result<()> {
    match output {
        Output::Human => {
            println!("# resourceVersion {} ({} types)", list.resource_version, list.items.len());
            for item in list.items.iter() {
                let scope = if item.spec.namespaced { "namespaced" } else { "cluster" };
                let gv = item.spec.descriptor().group_version();
                println!("{} • {} • {} • {}", gv, item.spec.name, item.spec.kind, scope);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(list)?),
    }
    Ok(())
}

/// Flags override the `APIWATCH_*` environment, which overrides the built-in defaults.
fn engine_config(base: EngineConfig, cli: &Cli) -> Result<EngineConfig> {
    let mut config = base;
    if let Some(cluster) = cli.cluster.as_ref() {
        config.cluster = cluster.clone();
    }
    if let Some(secs) = cli.settle_secs {
        config.settle_window = Duration::from_secs(secs);
    }
    if let Some(list) = cli.invalidate_on.as_deref() {
        config.policy = list.parse::<InvalidationPolicy>()?;
    }
    Ok(config)
}

/// List, then Watch at the listed version, and re-List whenever the watch closes.
async fn drive(lw: Arc<VirtualListWatcher>, output: Output, watch: bool, watch_timeout: Duration) -> Result<()> {
    loop {
        let list = lw.list(&ListOptions::default()).await.context("listing API resources")?;
        print_list(&list, output)?;
        if !watch {
            return Ok(());
        }
        let opts = WatchOptions::at(&list.resource_version).with_timeout(watch_timeout);
        let mut session = match lw.watch(&opts) {
            Ok(s) => s,
            Err(e) if e.is_expired() => {
                debug!(error = %e, "watch expired before it started; relisting");
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        tokio::select! {
            _ = session.closed() => info!(generation = lw.generation(), "API resource watch closed; relisting"),
            _ = signal::ctrl_c() => {
                info!("interrupted");
                return Ok(());
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let config = engine_config(EngineConfig::from_env(), &cli)?;
    let cluster = config.cluster.clone();

    let client = kube::Client::try_default().await.context("building kube client")?;
    let discovery = Arc::new(MemCacheDiscovery::new(KubeDiscovery::new(client.clone())));
    let notifier_shutdown = CancellationToken::new();
    let mut kube_notifiers: Vec<Arc<KubeNotifier>> = Vec::new();
    if cli.crds {
        kube_notifiers.push(KubeNotifier::crds(client.clone(), notifier_shutdown.clone()));
    }
    if cli.apibindings {
        kube_notifiers.push(KubeNotifier::api_bindings(client.clone(), notifier_shutdown.clone()));
    }
    let notifiers: Vec<Arc<dyn ObjectNotifier>> =
        kube_notifiers.iter().map(|n| Arc::clone(n) as Arc<dyn ObjectNotifier>).collect();
    let engine = DiscoveryEngine::start(config, discovery, &notifiers);

    let result = match cli.command {
        Commands::Resources { watch, watch_timeout_secs } => {
            info!(watch, cluster = %cluster, "resources invoked");
            drive(engine.source(), cli.output, watch, Duration::from_secs(watch_timeout_secs)).await
        }
        Commands::Definers => {
            if kube_notifiers.is_empty() {
                warn!("no definer notifiers enabled; pass --crds and/or --apibindings");
            }
            for n in kube_notifiers.iter() {
                if !n.wait_synced().await {
                    error!(notifier = %n.name(), "notifier ended before its first listing");
                }
            }
            let rows: Vec<(ResourceDescriptor, Vec<DefinerId>)> = {
                let index = engine.definers();
                let index = index.lock();
                index.descriptors().into_iter().map(|gvr| { let who = index.definers_of(&gvr); (gvr, who) }).collect()
            };
            match cli.output {
                Output::Human => {
                    for (gvr, who) in rows.iter() {
                        let names: Vec<String> = who.iter().map(|d| d.to_string()).collect();
                        println!("{} <- {}", gvr, names.join(", "));
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
            }
            Ok(())
        }
    };

    notifier_shutdown.cancel();
    engine.shutdown().await;
    result
}
