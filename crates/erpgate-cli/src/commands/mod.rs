//! CLI subcommands

pub mod call;
pub mod enqueue;
pub mod status;
pub mod worker;

use anyhow::{Context, Result};
use erpgate_gateway::GatewayError;
use erpgate_persist::{SqliteQueue, SqliteStore};
use erpgate_worker::broker_config_from_env;
use std::sync::Arc;

use crate::print_error;

/// Store and queue sharing one SQLite database
pub struct Backends {
    pub store: Arc<SqliteStore>,
    pub queue: Arc<SqliteQueue>,
}

pub async fn open_backends(database_url: &str) -> Result<Backends> {
    let store = SqliteStore::new(database_url)
        .await
        .with_context(|| format!("Failed to open database {}", database_url))?;
    let queue = SqliteQueue::new(store.pool().clone(), broker_config_from_env()?);
    Ok(Backends {
        store: Arc::new(store),
        queue: Arc::new(queue),
    })
}

/// Print the error body callers would receive, then fail the command.
pub fn report(err: GatewayError) -> anyhow::Error {
    let body = err.to_response();
    print_error(&format!("{} ({})", body.error.message, err.status()));
    if let Ok(json) = serde_json::to_string_pretty(&body) {
        eprintln!("{}", json);
    }
    anyhow::Error::new(err)
}

pub fn parse_json(raw: &str) -> Result<serde_json::Value> {
    serde_json::from_str(raw).context("Invalid JSON payload")
}
