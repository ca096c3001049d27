//! erpgate CLI - run the job worker and drive the gateway from a shell
//!
//! # Usage
//!
//! ```bash
//! # Consume jobs until Ctrl-C
//! erpgate worker
//!
//! # Queue work
//! erpgate enqueue job GET_CUSTOMER --customer-id C001
//! erpgate enqueue create --payload '{"Subject":"Kitchen"}' --idempotency-key K1
//! erpgate enqueue update OP000123 --payload '{"Stage":"Won"}'
//!
//! # Inspect a job
//! erpgate status 6f1c2c9e-8d7b-4a53-9b7a-3c1b2f0a9e11
//!
//! # Call the ERP inline through the protection wrapper
//! erpgate call customer C001
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;

mod commands;

use commands::{call, enqueue, status, worker};

/// erpgate - job execution and upstream protection for the ERP
#[derive(Parser)]
#[command(
    name = "erpgate",
    version,
    about = "erpgate CLI - queue, run and inspect ERP jobs",
    long_about = "erpgate turns ERP requests into durable jobs.\n\n\
                  Creates are deduplicated by idempotency key, updates to one\n\
                  opportunity are coalesced, and every ERP call is rate governed."
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Job store and queue database
    #[arg(
        long,
        env = "DATABASE_URL",
        default_value = "sqlite:erpgate.db?mode=rwc",
        global = true
    )]
    database_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the queue consumer
    #[command(name = "worker")]
    Worker(worker::WorkerArgs),

    /// Admit and queue a job
    #[command(name = "enqueue")]
    Enqueue(enqueue::EnqueueArgs),

    /// Show a job's status
    #[command(name = "status")]
    Status(status::StatusArgs),

    /// Call the ERP synchronously
    #[command(name = "call")]
    Call(call::CallArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // The worker is a long-running service; show its lifecycle by default
    let verbosity = match cli.command {
        Commands::Worker(_) => cli.verbose.max(1),
        _ => cli.verbose,
    };
    setup_logging(verbosity);

    match cli.command {
        Commands::Worker(args) => worker::run(&cli.database_url, args).await,
        Commands::Enqueue(args) => enqueue::run(&cli.database_url, args).await,
        Commands::Status(args) => status::run(&cli.database_url, args).await,
        Commands::Call(args) => call::run(args).await,
    }
}

/// Setup logging based on verbosity level
fn setup_logging(verbosity: u8) {
    use tracing_subscriber::EnvFilter;

    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();
}

/// Print a success message with a checkmark
pub fn print_success(msg: &str) {
    println!("{} {}", "✓".green().bold(), msg);
}

/// Print an error message with an X
pub fn print_error(msg: &str) {
    eprintln!("{} {}", "✗".red().bold(), msg);
}

/// Print a warning message
pub fn print_warning(msg: &str) {
    println!("{} {}", "⚠".yellow().bold(), msg);
}
