//! # erpgate worker
//!
//! Consumes job messages and executes them against the ERP.
//!
//! Each delivery is marked `processing`, passes through the shared
//! [`erpgate_upstream::RateGovernor`], and is dispatched by job type. Update
//! jobs go through the coalescing flush in [`coalesce`], so bursts of edits
//! to one entity reach the ERP as a single write of the latest payload.

pub mod coalesce;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod processor;

pub use coalesce::UpdateFlusher;
pub use config::{broker_config_from_env, worker_config_from_env, ProcessorConfig};
pub use dispatcher::JobDispatcher;
pub use error::JobError;
pub use processor::JobProcessor;
