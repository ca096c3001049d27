//! # erpgate gateway
//!
//! The caller-facing side of erpgate: validates requests, applies per-route
//! admission limits, and turns them into queued jobs.
//!
//! - Creates carrying an idempotency key map to exactly one job
//! - Updates to one opportunity are merged while a flush is pending
//! - Errors carry a category code, a status and, when throttled, a retry hint

pub mod admission;
pub mod config;
pub mod error;
pub mod proxy;
pub mod service;
pub mod validation;

pub use admission::{Admitted, AdmissionLimiter};
pub use config::{AdmissionConfig, GatewayConfig, DEFAULT_ROUTE_LIMIT};
pub use error::{ErrorBody, ErrorResponse, GatewayError, GatewayResult};
pub use proxy::ErpProxy;
pub use service::{Accepted, EnqueueRequest, JobService, JobView, OrderJobRequest};
pub use validation::Limits;
