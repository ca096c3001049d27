//! Worker command - consume and execute queued jobs
//!
//! Usage:
//! ```bash
//! erpgate worker
//! erpgate worker --mock-erp
//! ```

use anyhow::{Context, Result};
use clap::Args;
use erpgate_queue::WorkerPool;
use erpgate_upstream::{
    AcumaticaClient, AcumaticaConfig, ErpClient, GovernorConfig, MockErp, RateGovernor,
};
use erpgate_worker::{worker_config_from_env, JobProcessor, ProcessorConfig};
use std::sync::Arc;
use tracing::info;

use super::open_backends;
use crate::print_warning;

/// Arguments for the worker command
#[derive(Args)]
pub struct WorkerArgs {
    /// Execute jobs against an in-process mock instead of the ERP
    #[arg(long)]
    mock_erp: bool,
}

/// Run the worker until Ctrl-C
pub async fn run(database_url: &str, args: WorkerArgs) -> Result<()> {
    let backends = open_backends(database_url).await?;

    let erp: Arc<dyn ErpClient> = if args.mock_erp {
        print_warning("Using the mock ERP; no real calls will be made");
        Arc::new(MockErp::new())
    } else {
        let config = AcumaticaConfig::from_env().context("ERP configuration")?;
        Arc::new(AcumaticaClient::new(config)?)
    };

    let governor = Arc::new(RateGovernor::new(GovernorConfig::from_env()?));
    let processor = Arc::new(JobProcessor::new(
        backends.store.clone(),
        backends.queue.clone(),
        erp.clone(),
        governor,
        ProcessorConfig::from_env()?,
    ));
    let pool = WorkerPool::new_with_arc(backends.queue.clone(), worker_config_from_env()?);

    info!(erp = erp.name(), database_url, "Worker starting");
    pool.run(processor, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            return;
        }
        info!("Shutdown requested");
    })
    .await;

    Ok(())
}
