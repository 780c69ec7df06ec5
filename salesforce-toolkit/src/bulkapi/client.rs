//! Bulk API v2.0 client that wraps the REST client.

use crate::client;

/// Client for Salesforce Bulk API v2.0.
///
/// This client wraps a [`client::Client`] and shares its session, so tokens are renewed
/// the same way as for REST calls.
///
/// # Example
///
/// ```no_run
/// use salesforce_toolkit::client::{self, Credentials};
/// use salesforce_toolkit::bulkapi::Client as BulkClient;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let rest_client = client::Builder::new()
///     .credentials(Credentials {
///         consumer_key: Some("...".to_string()),
///         consumer_secret: Some("...".to_string()),
///         domain: Some("mydomain.my".to_string()),
///         ..Default::default()
///     })
///     .build()?
///     .connect()
///     .await?;
///
/// let bulk_client = BulkClient::new(rest_client);
/// let ingest_client = bulk_client.ingest();
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct Client {
    rest_client: client::Client,
    page_bytes: usize,
}

impl Client {
    pub fn new(rest_client: client::Client) -> Self {
        Self {
            rest_client,
            page_bytes: crate::DEFAULT_BULK_PAGE_BYTES,
        }
    }

    /// Upper bound for one CSV upload (defaults to [`crate::DEFAULT_BULK_PAGE_BYTES`]).
    ///
    /// Salesforce accepts 150 MB of base64 encoded data per upload, which leaves room
    /// for about 100 MB of CSV.
    pub fn with_page_bytes(mut self, page_bytes: usize) -> Self {
        self.page_bytes = page_bytes;
        self
    }

    pub fn rest_client(&self) -> &client::Client {
        &self.rest_client
    }

    pub fn page_bytes(&self) -> usize {
        self.page_bytes
    }

    /// Creates an ingest client for bulk ingest operations.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub fn ingest(&self) -> super::ingest::IngestClient {
        super::ingest::IngestClient::new(self.clone())
    }

    /// `{data_url}/jobs/ingest`
    pub(crate) async fn base_url(&self) -> Result<String, client::Error> {
        Ok(format!("{}/jobs/ingest", self.rest_client.data_url().await?))
    }
}
