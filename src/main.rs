use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{command, Parser, Subcommand};
use fleetsync::cluster::ClusterPool;
use fleetsync::config::SyncSettings;
use fleetsync::diff::SyncAction;
use fleetsync::kubernetes::KubeClusterClient;
use fleetsync::source::{CachingSource, FilesystemSource};
use fleetsync::{Controller, Error, FleetConfig, RegistryError};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Revisions kept in memory per process.
const SOURCE_CACHE_CAPACITY: usize = 64;

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Fleet configuration listing clusters and applications.
    #[arg(long, global = true, default_value = "fleet.yaml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Continuously reconcile every configured application.
    Reconcile {
        /// Seconds between two sync passes, overriding the configuration.
        #[arg(long)]
        interval: Option<u64>,

        /// Upper bound on concurrent syncs, overriding the configuration.
        #[arg(long)]
        max_concurrent: Option<usize>,
    },

    /// Print what a sync would change, without applying anything.
    Diff {
        /// Only plan this application.
        #[arg(long)]
        app: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = FleetConfig::load(&args.config)?;

    match args.command {
        Command::Reconcile {
            interval,
            max_concurrent,
        } => {
            let mut settings = config.sync.clone();
            if let Some(seconds) = interval {
                settings.interval = Duration::from_secs(seconds.max(1));
            }
            if let Some(max_concurrent) = max_concurrent {
                settings.max_concurrent_syncs = max_concurrent.max(1);
            }

            let controller = controller(&config, &settings).await?;
            controller
                .run(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        error!("failed to listen for shutdown signal: {e}");
                    }
                    info!("shutting down");
                })
                .await;
        }
        Command::Diff { app } => {
            let controller = controller(&config, &config.sync).await?;

            let names: Vec<String> = match app {
                Some(name) if controller.status(&name).is_none() => {
                    return Err(RegistryError::UnknownApplication(name).into())
                }
                Some(name) => vec![name],
                None => controller
                    .applications()
                    .into_iter()
                    .map(|application| application.name)
                    .collect(),
            };

            for name in names {
                print_plan(&controller, &name).await;
            }
        }
    }

    Ok(())
}

async fn controller(config: &FleetConfig, settings: &SyncSettings) -> Result<Controller, Error> {
    let source = CachingSource::new(FilesystemSource::new(), SOURCE_CACHE_CAPACITY);
    let controller = Controller::new(Arc::new(ClusterPool::new()), Arc::new(source), settings);

    for target in &config.clusters {
        let client = KubeClusterClient::connect(target).await?;
        controller.register_cluster(target.clone(), Arc::new(client))?;
    }

    for application in &config.applications {
        controller.register_application(application.clone())?;
    }

    Ok(controller)
}

async fn print_plan(controller: &Controller, name: &str) {
    let plan = match controller.plan(name).await {
        Ok(plan) => plan,
        Err(e) => {
            println!("{name}: {e}");
            return;
        }
    };

    if plan.report.is_converged() && plan.report.orphans.is_empty() {
        println!("{name}: in sync at {}", plan.desired.revision());
        return;
    }

    println!("{name}: changes at {}", plan.desired.revision());
    for entry in plan.report.changes() {
        let key = entry.resource.key();
        match &entry.action {
            SyncAction::Create => println!("  + {key}"),
            SyncAction::Update { drift } => println!("  ~ {key} ({})", drift.join(", ")),
            SyncAction::Delete => println!("  - {key}"),
            SyncAction::NoOp => {}
        }
    }
    for orphan in &plan.report.orphans {
        println!("  ? {orphan} (orphaned, prune disabled)");
    }
}
