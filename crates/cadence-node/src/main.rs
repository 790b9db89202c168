use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use cadence_core::{CadenceConfig, SchedulerMode};
use cadence_scheduler::{JobRegistry, SchedulerError, SchedulerService};
use clap::Parser;
use tracing::{info, warn};

mod jobs;

/// Cadence node - runs the job scheduler until interrupted
#[derive(Parser, Debug)]
#[command(name = "cadence-node")]
struct Args {
    /// Config file (or set CADENCE_CONFIG env var)
    #[arg(long, env = "CADENCE_CONFIG")]
    config: Option<String>,

    /// Seconds to wait for running jobs before cancelling them
    #[arg(long, default_value_t = 30)]
    shutdown_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cadence_node=info,cadence_scheduler=info".into()),
        )
        .init();

    // load config: --config / CADENCE_CONFIG > ~/.cadence/cadence.toml
    let args = Args::parse();
    let config = CadenceConfig::load(args.config.as_deref()).context("loading configuration")?;

    if config.scheduler.mode == SchedulerMode::Clustered {
        if let Some(path) = config.store.path.as_deref() {
            ensure_parent_dir(path);
            info!(path, "using shared cluster store");
        }
    }

    // job types are wired once here; the scheduler resolves them by name
    let registry = Arc::new(JobRegistry::new());
    jobs::register_builtin(&registry);

    let scheduler = SchedulerService::new(registry.clone());
    scheduler.start(&config).context("starting scheduler")?;
    for definition in jobs::builtin_definitions() {
        scheduler.register_job(definition)?;
    }
    info!(
        node = ?scheduler.node_id(),
        mode = %config.scheduler.mode,
        job_types = ?registry.job_types(),
        "cadence node running"
    );

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    match scheduler
        .shutdown(Duration::from_secs(args.shutdown_timeout_secs))
        .await
    {
        Ok(()) => {}
        Err(SchedulerError::ShutdownIncomplete { cancelled }) => {
            warn!(cancelled, "some firings were cancelled during shutdown");
        }
        Err(e) => return Err(e.into()),
    }
    info!("cadence node stopped");
    Ok(())
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
