//! Salesforce Bulk API v2.0 for ingesting large data sets.
//!
//! Records are encoded as CSV, uploaded in pages of at most
//! [`crate::DEFAULT_BULK_PAGE_BYTES`] and processed asynchronously by Salesforce. Insert,
//! update, upsert and delete (including hard delete) jobs are supported.
//!
//! # Example
//!
//! ```no_run
//! use salesforce_toolkit::client;
//! use salesforce_toolkit::bulkapi::{Client as BulkClient, MonitorOptions};
//! use salesforce_toolkit::sobjects::SObject;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let rest_client = client::Builder::new()
//!     .credentials_path("credentials.json".into())
//!     .build()?
//!     .connect()
//!     .await?;
//!
//! let ingest_client = BulkClient::new(rest_client).ingest();
//! let accounts = vec![SObject::new("Account").with("Name", "Acme")];
//! let mut job = ingest_client.insert_bulk(&accounts).await?;
//!
//! let outcome = job.monitor_until_complete(&MonitorOptions::default()).await?;
//! for row in job.failed_results().await? {
//!     eprintln!("{:?}: {:?}", row.fields, row.error);
//! }
//! # let _ = outcome;
//! # Ok(())
//! # }
//! ```

mod client;
pub mod ingest;
pub mod pager;

pub use client::Client;

pub use ingest::{
    parse_results, ColumnDelimiter, CreateIngestJobRequest, GetAllIngestJobsResponse,
    IngestClient, IngestJob, IngestJobInfo, IngestOperation, JobOutcome, JobResultRow, JobState,
    JobType, LineEnding, MonitorOptions,
};
pub use pager::{CsvPager, CsvTable};
