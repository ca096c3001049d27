//! # erpgate upstream
//!
//! Everything that talks to, or shields, the ERP.
//!
//! - [`ErpClient`]: the operations the ERP exposes, with an Acumatica
//!   implementation and a scriptable mock
//! - [`RateGovernor`]: global and per-scope concurrency and token-bucket limits
//! - [`RetryPolicy`]: transient classification and exponential backoff with jitter
//! - [`UpstreamGuard`]: the synchronous `protect(operation, fn)` wrapper

pub mod acumatica;
pub mod bucket;
pub mod client;
pub mod config;
pub mod error;
pub mod governor;
pub mod mock;
pub mod protection;
pub mod retry;

pub use acumatica::{AcumaticaClient, AcumaticaConfig};
pub use bucket::{BucketError, TokenBucket};
pub use client::{AddressContactQuery, ErpClient, ErpOperation, OrderQuery, SummaryQuery};
pub use config::ConfigError;
pub use error::{ErrorCategory, UpstreamError};
pub use self::governor::{GovernorConfig, GovernorError, GovernorLimits, GovernorPermit, RateGovernor, ThrottleWaits};
pub use mock::{ErpCall, MockErp};
pub use protection::{ProtectionConfig, UpstreamGuard};
pub use retry::{with_timeout, RetryPolicy};
