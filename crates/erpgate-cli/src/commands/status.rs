//! Status command - show a job
//!
//! Usage:
//! ```bash
//! erpgate status <job-id>
//! erpgate status <job-id> --json
//! ```

use anyhow::Result;
use clap::Args;
use colored::Colorize;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Cell, Color, Table};
use erpgate_gateway::{AdmissionConfig, AdmissionLimiter, GatewayConfig, JobService, JobView};
use erpgate_queue::JobStatus;
use uuid::Uuid;

use super::{open_backends, report};

/// Arguments for the status command
#[derive(Args)]
pub struct StatusArgs {
    job_id: Uuid,

    /// Output raw JSON (no formatting)
    #[arg(long)]
    json: bool,
}

/// Run the status command
pub async fn run(database_url: &str, args: StatusArgs) -> Result<()> {
    let backends = open_backends(database_url).await?;
    let limiter = AdmissionLimiter::new(backends.store.clone(), AdmissionConfig::default());
    let service = JobService::new(
        backends.store.clone(),
        backends.queue.clone(),
        limiter,
        GatewayConfig::from_env()?,
    );

    let view = service.get_job(args.job_id).await.map_err(report)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&view)?);
    } else {
        print_table(&view)?;
    }
    Ok(())
}

fn status_cell(status: JobStatus) -> Cell {
    let color = match status {
        JobStatus::Queued => Color::Yellow,
        JobStatus::Processing => Color::Blue,
        JobStatus::Succeeded => Color::Green,
        JobStatus::Failed => Color::Red,
    };
    Cell::new(status.as_str()).fg(color)
}

fn print_table(view: &JobView) -> Result<()> {
    println!("{}", format!("Job {}", view.job_id).bold().cyan());

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS);
    table.add_row(vec![Cell::new("Type"), Cell::new(view.job_type.as_str())]);
    table.add_row(vec![Cell::new("Status"), status_cell(view.status)]);
    table.add_row(vec![Cell::new("Attempts"), Cell::new(view.attempts)]);
    table.add_row(vec![Cell::new("Created"), Cell::new(view.created_at.to_rfc3339())]);
    table.add_row(vec![Cell::new("Updated"), Cell::new(view.updated_at.to_rfc3339())]);
    if let Some(error) = &view.error {
        table.add_row(vec![Cell::new("Error"), Cell::new(error).fg(Color::Red)]);
    }
    println!("{table}");

    if let Some(result) = &view.result {
        println!();
        println!("{}", "Result:".bold());
        println!("{}", serde_json::to_string_pretty(result)?);
    }
    Ok(())
}
