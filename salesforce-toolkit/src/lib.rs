//! Unofficial Rust toolkit for the Salesforce REST and Bulk APIs.
//!
//! This crate provides login flows (sf CLI, SOAP and OAuth2), a self-renewing session,
//! batched sObject collection operations and Bulk API 2.0 ingest jobs.
//!
//! # Examples
//!
//! ```no_run
//! use salesforce_toolkit::client::{self, Credentials};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let client = client::Builder::new()
//!     .credentials(Credentials {
//!         consumer_key: Some("...".to_string()),
//!         consumer_secret: Some("...".to_string()),
//!         domain: Some("mydomain.my".to_string()),
//!         ..Default::default()
//!     })
//!     .build()?
//!     .connect()
//!     .await?;
//! # Ok(())
//! # }
//! ```

/// Default Salesforce API version (Winter '26 - API version 65.0).
pub const DEFAULT_API_VERSION: &str = "65.0";

/// Default login domain (`https://login.salesforce.com`).
pub const DEFAULT_DOMAIN: &str = "login";

/// Default connection timeout for HTTP requests (30 seconds).
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default request timeout for HTTP requests (120 seconds).
///
/// This longer timeout is appropriate for bulk operations which may take longer to process.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;

/// TCP keepalive interval for pooled connections (60 seconds).
pub const DEFAULT_TCP_KEEPALIVE_SECS: u64 = 60;

/// Maximum idle connections kept per host.
pub const DEFAULT_POOL_MAX_IDLE_PER_HOST: usize = 16;

/// Default number of records per sObject collection request.
pub const DEFAULT_BATCH_SIZE: usize = 200;

/// Largest batch the sObject collection endpoints accept.
pub const MAX_BATCH_SIZE: usize = 200;

/// Default number of concurrent requests for batch operations.
pub const DEFAULT_CONCURRENCY: usize = 1;

/// Default upper bound for one Bulk API upload page (100 MB).
pub const DEFAULT_BULK_PAGE_BYTES: usize = 100_000_000;

/// Default interval between Bulk API job status polls (1 second).
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 1;

/// Attempts for a job status poll that fails with a transient error.
pub const MAX_POLL_RETRIES: u32 = 3;

/// HTTP exchange primitives and the pluggable transport.
pub mod transport;

/// Login flows and the self-renewing authenticated session.
pub mod auth;

/// Client construction, credentials and connection management.
pub mod client;

/// Blocking facade over the async client.
pub mod blocking;

/// API usage reported by the `Sforce-Limit-Info` header.
pub mod metrics;

/// Bounded-concurrency execution of independent work units.
pub mod dispatch;

/// sObject records and the collection (batch) operations.
pub mod sobjects;

/// Salesforce Bulk API 2.0 ingest jobs.
pub mod bulkapi;
