//! dockyard CLI
//!
//! Drives rolling replacements of EKS worker ASGs.
//!
//! ```bash
//! # ASGs of the configured cluster, with replacement progress
//! dockyard list
//!
//! # read-only checks before touching anything
//! dockyard preflight
//!
//! # replace old instances two at a time
//! dockyard rollout --asg workers-a --batch-size 2
//! ```

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use dockyard::{
    event_channel, progress_channel, AsgClient, AsgRollout, Config, KubeClient, PreflightChecker,
    DEFAULT_CONFIG_FILE,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "dockyard")]
#[command(about = "In-place rolling replacement of EKS worker ASGs", long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List ASGs with their replacement progress
    List {
        /// List every ASG in the region, not just the cluster's
        #[arg(long)]
        all: bool,
    },

    /// Show rollout state for one ASG
    Status {
        /// ASG name
        #[arg(long)]
        asg: String,
    },

    /// Run read-only cluster checks
    Preflight,

    /// Replace the old instances of one ASG
    Rollout {
        /// ASG name
        #[arg(long)]
        asg: String,

        /// Nodes replaced concurrently per batch
        #[arg(long, default_value_t = 1)]
        batch_size: usize,

        /// Skip the post-rollout cleanup (leave state for a resume)
        #[arg(long)]
        skip_post: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config))?;

    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let asg_client = Arc::new(AsgClient::new(&config.aws).await);

    match cli.command {
        Commands::List { all } => {
            let infos = match (&config.rollout.eks_cluster_name, all) {
                (Some(cluster), false) => asg_client.list_asgs_of_cluster(cluster).await?,
                _ => asg_client.list_asgs().await?,
            };

            println!(
                "{:<40} {:>7} {:>9} {:>8} {:>5}  {}",
                "ASG", "Desired", "Progress", "Min/Max", "EKS", "AMI"
            );
            for info in infos {
                let progress = info
                    .progress_pct
                    .map(|p| format!("{p}%"))
                    .unwrap_or_else(|| "NA".to_string());
                let ami = info.ami_name.or(info.ami_id).unwrap_or_default();
                let eks_version =
                    dockyard::asg::eks_version_from_ami_name(&ami).unwrap_or_default();
                println!(
                    "{:<40} {:>7} {:>9} {:>8} {:>5}  {}",
                    info.name,
                    info.desired,
                    progress,
                    format!("{}/{}", info.min, info.max),
                    eks_version,
                    ami,
                );
            }
        }

        Commands::Status { asg } => {
            let kube_client = Arc::new(KubeClient::new().await?);
            let rollout = AsgRollout::new(
                Arc::clone(&asg_client),
                kube_client,
                config.rollout.clone(),
            );

            let snapshot = asg_client.describe(&asg).await?;
            let classification = asg_client.classify_instances(&snapshot).await?;

            println!("asg:                {}", snapshot.name);
            println!(
                "capacity:           min={} desired={} max={}",
                snapshot.min_size, snapshot.desired_capacity, snapshot.max_size
            );
            println!("healthy:            {}", snapshot.is_healthy());
            println!(
                "instances:          {} old / {} new",
                classification.old.len(),
                classification.new.len()
            );
            println!("upgrade started:    {}", rollout.upgrade_started().await?);
            println!("rollout completed:  {}", rollout.rollout_completed().await?);

            let unclaimed = rollout.bridge().new_nodes(&asg).await?;
            println!("unclaimed nodes:    {}", unclaimed.len());
            for node in unclaimed {
                println!("  {node}");
            }
        }

        Commands::Preflight => {
            let kube_client = KubeClient::new().await?;
            let checker = PreflightChecker::new(
                kube_client.client(),
                config.rollout.private_registry.clone(),
            );
            let report = checker.run().await?;

            println!("all nodes ready:  {}", report.all_nodes_ready);
            println!("pending pods:     {}", report.pending_pods.len());
            for pod in &report.pending_pods {
                println!("  {pod}");
            }
            println!("blocking PDBs:    {}", report.blocked_pdbs.len());
            for pdb in &report.blocked_pdbs {
                println!(
                    "  {}/{} (expected pods {})",
                    pdb.namespace, pdb.name, pdb.expected_pods
                );
            }
            println!("public images:    {}", report.public_images.len());
            for image in &report.public_images {
                println!("  {}/{}: {}", image.namespace, image.deployment, image.image);
            }
        }

        Commands::Rollout {
            asg,
            batch_size,
            skip_post,
        } => {
            let kube_client = Arc::new(KubeClient::new().await?);
            let rollout = Arc::new(AsgRollout::new(
                Arc::clone(&asg_client),
                kube_client,
                config.rollout.clone(),
            ));

            let (event_tx, mut event_rx) = event_channel();
            let (progress_tx, mut progress_rx) = progress_channel();

            let event_printer = tokio::spawn(async move {
                while let Some(event) = event_rx.recv().await {
                    println!("» {event}");
                }
            });
            let progress_printer = tokio::spawn(async move {
                let mut done = 0;
                while let Some(record) = progress_rx.recv().await {
                    done += record.steps_done;
                    println!("progress: {done}/{} (batch size {})", record.total_size, record.steps_size);
                }
            });

            let cancel = CancellationToken::new();
            let canceller = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received, cancelling rollout");
                    canceller.cancel();
                }
            });

            info!(asg = %asg, batch_size, "starting rollout");
            let outcome = rollout
                .start_rollout(&cancel, &asg, batch_size, &event_tx, &progress_tx)
                .await;

            match &outcome {
                Ok(()) => info!(asg = %asg, "rollout loop finished"),
                Err(err) => error!(asg = %asg, error = %err, "rollout aborted"),
            }

            if skip_post {
                warn!(asg = %asg, "skipping post rollout; state left in place for resume");
            } else {
                info!(
                    seconds = config.rollout.period_wait.before_post,
                    "waiting before post rollout"
                );
                tokio::time::sleep(config.rollout.period_wait.before_post()).await;
                rollout
                    .post_rollout(&asg, &event_tx, &progress_tx, outcome.is_ok())
                    .await
                    .context("post rollout failed; it is safe to re-run")?;
            }

            drop(event_tx);
            drop(progress_tx);
            let _ = event_printer.await;
            let _ = progress_printer.await;

            outcome.context("rollout failed; re-invoke to resume from persisted state")?;
        }
    }

    Ok(())
}
