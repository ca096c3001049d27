//! Enqueue command - admit and queue jobs
//!
//! Usage:
//! ```bash
//! erpgate enqueue job GET_CUSTOMER --customer-id C001
//! erpgate enqueue job ERP_VERIFY_CUSTOMER --customer-id C001 --zip5 12345
//! erpgate enqueue job ERP_GET_PAYMENT_INFO --baid B100 --order-nbrs SO1,SO2
//! erpgate enqueue job ERP_GET_ORDER_SUMMARIES_DELTA --baid B100 --since 2025-01-01T00:00:00Z
//! erpgate enqueue create --payload '{"Subject":"Kitchen"}' --idempotency-key K1
//! erpgate enqueue update OP000123 --payload '{"Stage":"Won"}'
//! ```

use anyhow::{anyhow, Result};
use clap::{Args, Subcommand};
use erpgate_gateway::{
    Accepted, AdmissionConfig, AdmissionLimiter, GatewayConfig, GatewayResult, JobService,
    OrderJobRequest,
};
use erpgate_queue::JobType;

use super::{open_backends, parse_json, report};
use crate::print_success;

/// Arguments for the enqueue command
#[derive(Args)]
pub struct EnqueueArgs {
    #[command(subcommand)]
    command: EnqueueCommand,
}

#[derive(Subcommand)]
pub enum EnqueueCommand {
    /// Queue any job type
    #[command(name = "job")]
    Job {
        /// Job type (GET_CUSTOMER, GET_OPPORTUNITY, ERP_GET_ORDER_HEADER, ...)
        job_type: JobType,

        #[arg(long)]
        customer_id: Option<String>,

        #[arg(long)]
        opportunity_id: Option<String>,

        #[arg(long)]
        order_nbr: Option<String>,

        #[arg(long)]
        zip5: Option<String>,

        /// JSON payload for create and update jobs
        #[arg(long)]
        payload: Option<String>,

        #[command(flatten)]
        order: OrderFlags,
    },

    /// Create an opportunity
    #[command(name = "create")]
    Create {
        /// Opportunity body as JSON
        #[arg(long)]
        payload: String,

        /// Replays with the same key return the original job
        #[arg(long)]
        idempotency_key: Option<String>,
    },

    /// Update an opportunity; edits are coalesced per opportunity
    #[command(name = "update")]
    Update {
        opportunity_id: String,

        /// Changed fields as JSON
        #[arg(long)]
        payload: String,
    },
}

/// Inputs of the order and report jobs
#[derive(Args, Default)]
pub struct OrderFlags {
    /// Buyer account id
    #[arg(long)]
    baid: Option<String>,

    /// Comma-separated order numbers
    #[arg(long, value_delimiter = ',')]
    order_nbrs: Vec<String>,

    /// Lower bound on LastModified for delta listings
    #[arg(long)]
    since: Option<String>,

    #[arg(long)]
    page_size: Option<u32>,

    #[arg(long)]
    max_pages: Option<u32>,

    #[arg(long)]
    use_order_by: bool,

    /// OData literal compared against RequestedOn
    #[arg(long)]
    cutoff_literal: Option<String>,
}

/// Run the enqueue command
pub async fn run(database_url: &str, args: EnqueueArgs) -> Result<()> {
    let backends = open_backends(database_url).await?;
    let limiter = AdmissionLimiter::new(backends.store.clone(), AdmissionConfig::from_env()?);
    let service = JobService::new(
        backends.store.clone(),
        backends.queue.clone(),
        limiter,
        GatewayConfig::from_env()?,
    );

    let result = match args.command {
        EnqueueCommand::Job {
            job_type,
            customer_id,
            opportunity_id,
            order_nbr,
            zip5,
            payload,
            order,
        } => {
            let request = JobRequest {
                customer_id,
                opportunity_id,
                order_nbr,
                zip5,
                payload,
                order,
            };
            enqueue_typed(&service, job_type, request).await?
        }
        EnqueueCommand::Create {
            payload,
            idempotency_key,
        } => {
            service
                .request_create(parse_json(&payload)?, idempotency_key.as_deref())
                .await
        }
        EnqueueCommand::Update {
            opportunity_id,
            payload,
        } => {
            service
                .request_update(&opportunity_id, parse_json(&payload)?)
                .await
        }
    };

    let accepted = result.map_err(report)?;
    print_accepted(&accepted)
}

struct JobRequest {
    customer_id: Option<String>,
    opportunity_id: Option<String>,
    order_nbr: Option<String>,
    zip5: Option<String>,
    payload: Option<String>,
    order: OrderFlags,
}

impl JobRequest {
    fn order_job(self) -> OrderJobRequest {
        OrderJobRequest {
            baid: self.order.baid,
            order_nbrs: self.order.order_nbrs,
            order_nbr: self.order_nbr,
            since: self.order.since,
            page_size: self.order.page_size,
            max_pages: self.order.max_pages,
            use_order_by: self.order.use_order_by,
            cutoff_literal: self.order.cutoff_literal,
            chunk_size: None,
        }
    }
}

fn required(value: Option<String>, flag: &str, job_type: JobType) -> Result<String> {
    value.ok_or_else(|| anyhow!("{} requires --{}", job_type, flag))
}

async fn enqueue_typed(
    service: &JobService,
    job_type: JobType,
    request: JobRequest,
) -> Result<GatewayResult<Accepted>> {
    let result = match job_type {
        JobType::GetCustomer => {
            let customer_id = required(request.customer_id, "customer-id", job_type)?;
            service.request_customer(&customer_id).await
        }
        JobType::GetOpportunity => {
            let opportunity_id = required(request.opportunity_id, "opportunity-id", job_type)?;
            service.request_opportunity(&opportunity_id).await
        }
        JobType::CreateOpportunity => {
            let payload = required(request.payload, "payload", job_type)?;
            service.request_create(parse_json(&payload)?, None).await
        }
        JobType::UpdateOpportunity => {
            let opportunity_id = required(request.opportunity_id, "opportunity-id", job_type)?;
            let payload = required(request.payload, "payload", job_type)?;
            service
                .request_update(&opportunity_id, parse_json(&payload)?)
                .await
        }
        JobType::GetOrderHeader => {
            let order_nbr = required(request.order_nbr, "order-nbr", job_type)?;
            service.request_order_header(&order_nbr).await
        }
        JobType::VerifyCustomer => {
            let customer_id = required(request.customer_id, "customer-id", job_type)?;
            let zip5 = required(request.zip5, "zip5", job_type)?;
            service
                .request_customer_verification(&customer_id, &zip5)
                .await
        }
        JobType::GetPaymentInfo
        | JobType::GetInventoryDetails
        | JobType::GetOrderSummaries
        | JobType::GetOrderSummariesDelta
        | JobType::GetAddressContact
        | JobType::GetOrderLastModified
        | JobType::GetOrderReadyReport
        | JobType::GetCloseoutInventoryReport => {
            service
                .request_order_job(job_type, &request.order_job())
                .await
        }
    };
    Ok(result)
}

fn print_accepted(accepted: &Accepted) -> Result<()> {
    let verb = if accepted.reused { "Reused" } else { "Queued" };
    print_success(&format!("{} job {}", verb, accepted.job_id));
    println!("{}", serde_json::to_string_pretty(accepted)?);
    Ok(())
}
