//! Call command - synchronous protected ERP reads
//!
//! Usage:
//! ```bash
//! erpgate call customer C001
//! erpgate call opportunity OP000123 --raw
//! ```

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use erpgate_gateway::{ErpProxy, GatewayConfig, Limits};
use erpgate_upstream::{AcumaticaClient, AcumaticaConfig, ProtectionConfig, UpstreamGuard};
use std::sync::Arc;

use super::report;

/// Arguments for the call command
#[derive(Args)]
pub struct CallArgs {
    #[command(subcommand)]
    command: CallCommand,

    /// Output compact JSON
    #[arg(long, global = true)]
    raw: bool,
}

#[derive(Subcommand)]
pub enum CallCommand {
    /// Fetch a customer
    #[command(name = "customer")]
    Customer { customer_id: String },

    /// Fetch an opportunity
    #[command(name = "opportunity")]
    Opportunity { opportunity_id: String },
}

/// Run the call command
pub async fn run(args: CallArgs) -> Result<()> {
    let erp = AcumaticaClient::new(AcumaticaConfig::from_env().context("ERP configuration")?)?;
    let gateway = GatewayConfig::from_env()?;
    let proxy = ErpProxy::new(
        Arc::new(erp),
        UpstreamGuard::new(ProtectionConfig::from_env()?),
        Limits::from(&gateway),
    );

    let value = match args.command {
        CallCommand::Customer { customer_id } => proxy.get_customer(&customer_id).await,
        CallCommand::Opportunity { opportunity_id } => {
            proxy.get_opportunity(&opportunity_id).await
        }
    }
    .map_err(report)?;

    if args.raw {
        println!("{}", serde_json::to_string(&value)?);
    } else {
        println!("{}", serde_json::to_string_pretty(&value)?);
    }
    Ok(())
}
