//! recon-agent: resolver reconciliation daemon.
//!
//! Loads a manifest of resolver endpoints and rules and keeps the provider
//! converged on it:
//! - One task per resource, passes capped by `--workers`
//! - Converged resources are re-checked every `--resync-interval`
//! - Failed passes back off exponentially; terminal failures stop

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use recon_agent::clients::{MemoryResolver, ResolverApi};
use recon_agent::{Agent, AgentConfig, Manifest};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// recon agent
#[derive(Parser, Debug)]
#[command(name = "recon-agent", version, about)]
struct Args {
    /// Manifest of desired resources (JSON)
    #[arg(long)]
    manifest: PathBuf,

    /// Maximum reconcile passes in flight
    #[arg(long, default_value = "4")]
    workers: usize,

    /// Seconds between checks of a converged resource
    #[arg(long, default_value = "60")]
    resync_interval: u64,

    /// First retry delay in milliseconds
    #[arg(long, default_value = "500")]
    min_backoff: u64,

    /// Longest retry delay in milliseconds
    #[arg(long, default_value = "60000")]
    max_backoff: u64,

    /// Milliseconds before re-reading a resource after an asynchronous change
    #[arg(long, default_value = "5000")]
    refresh_delay: u64,

    /// Milliseconds between checks of a resource in a transitional status
    #[arg(long, default_value = "15000")]
    settle_delay: u64,

    /// Deadline for one reconcile pass in seconds (0 disables it)
    #[arg(long, default_value = "30")]
    call_timeout: u64,

    /// Exit once every resource has converged or failed terminally
    #[arg(long)]
    once: bool,

    /// Delete every managed resource before exiting
    #[arg(long)]
    teardown: bool,

    /// Region used in resource ARNs
    #[arg(long, default_value = "us-west-2")]
    region: String,

    /// Account id used in resource ARNs
    #[arg(long, default_value = "000000000000")]
    account_id: String,

    /// Items per page returned by list calls
    #[arg(long, default_value = "10")]
    page_size: usize,
}

impl Args {
    fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            workers: self.workers,
            resync_interval: Duration::from_secs(self.resync_interval),
            min_backoff: Duration::from_millis(self.min_backoff),
            max_backoff: Duration::from_millis(self.max_backoff),
            call_timeout: (self.call_timeout > 0).then(|| Duration::from_secs(self.call_timeout)),
            once: self.once,
            refresh_delay: Duration::from_millis(self.refresh_delay),
            settle_delay: Duration::from_millis(self.settle_delay),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "recon_agent=info,recon_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let manifest = Manifest::load(&args.manifest)
        .with_context(|| format!("Failed to load manifest {}", args.manifest.display()))?;
    info!("Loaded manifest: {}", args.manifest.display());

    let client: Arc<dyn ResolverApi> = Arc::new(
        MemoryResolver::new(args.region.clone(), args.account_id.clone())
            .with_page_size(args.page_size),
    );
    let agent = Agent::new(client, manifest, args.agent_config());

    agent
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for ctrl-c: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;

    let summary = agent.status().summary().await;
    println!(
        "{}",
        serde_json::to_string_pretty(&summary).context("Failed to encode status")?
    );

    if args.teardown {
        agent.teardown().await?;
        info!("Teardown complete");
    }

    Ok(())
}
