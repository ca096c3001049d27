//! # erpgate queue
//!
//! Job model and message transport for asynchronous ERP work.
//!
//! Features:
//! - Closed `JobType` set and the `JobStatus` state machine
//! - `JobMessage` wire format published for every job
//! - Pluggable peek-lock backend (`QueueBackend`) with an in-memory broker
//! - Worker pool that drives deliveries through a `MessageHandler`

pub mod backend;
pub mod job;
pub mod memory;
pub mod message;
pub mod worker;

pub use backend::{BrokerConfig, Delivery, OutboundMessage, QueueBackend, QueueError};
pub use job::{truncate_error, JobId, JobRecord, JobStatus, JobType, MAX_ERROR_LEN};
pub use memory::MemoryQueue;
pub use message::{publish_job, JobMessage, MessageError};
pub use worker::{Disposition, MessageHandler, WorkerConfig, WorkerPool};
