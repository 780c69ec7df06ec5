//! Bulk API v2.0 Ingest operations for loading, updating, or deleting large data sets.
//!
//! An ingest job moves through `Open → UploadComplete → InProgress` and ends in
//! `JobComplete`, `Failed` or `Aborted`. [`IngestClient`] exposes the raw endpoints;
//! [`IngestJob`] tracks one job through its states.

use super::pager::{CsvPager, CsvTable};
use super::Client as BulkClient;
use crate::client;
use crate::sobjects::{self, Record};
use crate::transport::Request;
use reqwest::header::ACCEPT;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Error type for bulk ingest operations.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Request to the Bulk API failed.
    #[error("Bulk API request failed: {source}")]
    Client {
        #[source]
        source: client::Error,
    },
    /// The records cannot be uploaded as one job.
    #[error("Invalid records for ingest job: {source}")]
    Planning {
        #[source]
        source: sobjects::Error,
    },
    /// Nothing to upload.
    #[error("Cannot upload an empty record list")]
    EmptyUpload,
    /// A value has no CSV representation.
    #[error("Column {column} holds a list, which cannot be written to CSV")]
    UnsupportedValue { column: String },
    /// Failed to encode or decode CSV.
    #[error("CSV error: {source}")]
    Csv {
        #[source]
        source: csv::Error,
    },
    /// The job is not in the state the operation needs.
    #[error("Job {job_id} is {actual:?}, expected {expected:?}")]
    InvalidState {
        job_id: String,
        expected: JobState,
        actual: JobState,
    },
    /// Monitoring was stopped through the cancellation token.
    #[error("Monitoring of job {job_id} was cancelled")]
    Cancelled { job_id: String },
    /// The job did not finish before the deadline.
    #[error("Job {job_id} did not finish within {deadline:?}")]
    Timeout { job_id: String, deadline: Duration },
}

impl Error {
    fn is_transient(&self) -> bool {
        matches!(self, Error::Client { source } if source.is_transient())
    }
}

impl From<client::Error> for Error {
    fn from(source: client::Error) -> Self {
        Error::Client { source }
    }
}

/// Lifecycle state of an ingest job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum JobState {
    #[default]
    Open,
    UploadComplete,
    InProgress,
    JobComplete,
    Aborted,
    Failed,
}

impl JobState {
    /// `JobComplete`, `Aborted` and `Failed` are final.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::JobComplete | JobState::Aborted | JobState::Failed
        )
    }

    fn rank(&self) -> u8 {
        match self {
            JobState::Open => 0,
            JobState::UploadComplete => 1,
            JobState::InProgress => 2,
            JobState::JobComplete | JobState::Aborted | JobState::Failed => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IngestOperation {
    Insert,
    Update,
    Upsert,
    Delete,
    HardDelete,
}

impl IngestOperation {
    /// Delete jobs upload only the `Id` column.
    pub fn is_delete(&self) -> bool {
        matches!(self, IngestOperation::Delete | IngestOperation::HardDelete)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ColumnDelimiter {
    Backquote,
    Caret,
    #[default]
    Comma,
    Pipe,
    Semicolon,
    Tab,
}

impl ColumnDelimiter {
    pub fn as_byte(&self) -> u8 {
        match self {
            ColumnDelimiter::Backquote => b'`',
            ColumnDelimiter::Caret => b'^',
            ColumnDelimiter::Comma => b',',
            ColumnDelimiter::Pipe => b'|',
            ColumnDelimiter::Semicolon => b';',
            ColumnDelimiter::Tab => b'\t',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LineEnding {
    #[default]
    Lf,
    Crlf,
}

impl LineEnding {
    pub(crate) fn terminator(&self) -> csv::Terminator {
        match self {
            LineEnding::Lf => csv::Terminator::Any(b'\n'),
            LineEnding::Crlf => csv::Terminator::CRLF,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobType {
    BigObjectIngest,
    Classic,
    V2Ingest,
}

/// Body of the job creation call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateIngestJobRequest {
    pub object: String,
    pub operation: IngestOperation,
    pub content_type: String,
    pub column_delimiter: ColumnDelimiter,
    pub line_ending: LineEnding,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id_field_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignment_rule_id: Option<String>,
}

impl CreateIngestJobRequest {
    pub fn new(object: impl Into<String>, operation: IngestOperation) -> Self {
        Self {
            object: object.into(),
            operation,
            content_type: "CSV".to_string(),
            column_delimiter: ColumnDelimiter::default(),
            line_ending: LineEnding::default(),
            external_id_field_name: None,
            assignment_rule_id: None,
        }
    }

    /// Matching field for upsert jobs.
    pub fn external_id_field(mut self, field: impl Into<String>) -> Self {
        self.external_id_field_name = Some(field.into());
        self
    }

    pub fn column_delimiter(mut self, delimiter: ColumnDelimiter) -> Self {
        self.column_delimiter = delimiter;
        self
    }

    pub fn line_ending(mut self, line_ending: LineEnding) -> Self {
        self.line_ending = line_ending;
        self
    }
}

/// Job details as reported by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestJobInfo {
    pub id: String,
    pub state: JobState,
    #[serde(default)]
    pub object: Option<String>,
    #[serde(default)]
    pub operation: Option<IngestOperation>,
    #[serde(default)]
    pub content_url: Option<String>,
    #[serde(default)]
    pub column_delimiter: Option<ColumnDelimiter>,
    #[serde(default)]
    pub line_ending: Option<LineEnding>,
    #[serde(default)]
    pub external_id_field_name: Option<String>,
    #[serde(default)]
    pub job_type: Option<JobType>,
    #[serde(default)]
    pub api_version: Option<f64>,
    #[serde(default)]
    pub created_date: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub number_records_processed: Option<u64>,
    #[serde(default)]
    pub number_records_failed: Option<u64>,
    #[serde(default)]
    pub retries: Option<u64>,
    #[serde(default)]
    pub total_processing_time: Option<u64>,
}

/// One page of the job list.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetAllIngestJobsResponse {
    pub done: bool,
    #[serde(default)]
    pub records: Vec<IngestJobInfo>,
    #[serde(default)]
    pub next_records_url: Option<String>,
}

/// Client for Bulk API v2.0 Ingest operations.
///
/// Use this client to create and manage ingest jobs for loading, updating,
/// upserting, or deleting large numbers of records in Salesforce.
#[derive(Clone, Debug)]
pub struct IngestClient {
    bulk_client: BulkClient,
}

impl IngestClient {
    pub(crate) fn new(bulk_client: BulkClient) -> Self {
        Self { bulk_client }
    }

    fn rest(&self) -> &client::Client {
        self.bulk_client.rest_client()
    }

    async fn job_url(&self, job_id: &str) -> Result<String, Error> {
        Ok(format!("{}/{job_id}", self.bulk_client.base_url().await?))
    }

    /// Creates a new bulk ingest job.
    ///
    /// After creating the job, you'll need to upload data to it and then close
    /// the job to begin processing.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use salesforce_toolkit::bulkapi::{Client as BulkClient, CreateIngestJobRequest, IngestOperation};
    /// # use salesforce_toolkit::client;
    ///
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// # let rest_client = client::Builder::new().credentials_path("credentials.json".into()).build()?;
    /// let ingest_client = BulkClient::new(rest_client).ingest();
    ///
    /// let job = ingest_client
    ///     .create_job(&CreateIngestJobRequest::new("Account", IngestOperation::Insert))
    ///     .await?;
    ///
    /// println!("Created job: {}", job.id);
    /// # Ok(())
    /// # }
    /// ```
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn create_job(
        &self,
        request: &CreateIngestJobRequest,
    ) -> Result<IngestJobInfo, Error> {
        let url = self.bulk_client.base_url().await?;
        let request = Request::post(url)
            .json(request)
            .map_err(|source| client::Error::Transport { source })?;
        let info: IngestJobInfo = self.rest().send_json(request).await?;
        tracing::info!(job_id = %info.id, state = ?info.state, "created ingest job");
        Ok(info)
    }

    /// Creates a job and returns a handle tracking it.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn open_job(&self, request: &CreateIngestJobRequest) -> Result<IngestJob, Error> {
        let info = self.create_job(request).await?;
        Ok(IngestJob {
            client: self.clone(),
            info,
        })
    }

    /// Retrieves information about an ingest job.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn get_job(&self, job_id: &str) -> Result<IngestJobInfo, Error> {
        let url = self.job_url(job_id).await?;
        Ok(self.rest().send_json(Request::get(url)).await?)
    }

    /// Handle for an existing job.
    pub async fn job(&self, job_id: &str) -> Result<IngestJob, Error> {
        let info = self.get_job(job_id).await?;
        Ok(IngestJob {
            client: self.clone(),
            info,
        })
    }

    /// Uploads one page of CSV data to an ingest job.
    ///
    /// The job must be in the Open state. `content_url` is the job's `contentUrl`,
    /// relative to the instance.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn upload_data(&self, content_url: &str, csv_data: Vec<u8>) -> Result<(), Error> {
        let url = format!(
            "{}/{}",
            self.rest().instance_url().await?,
            content_url.trim_start_matches('/')
        );
        let request = Request::new(Method::PUT, url)
            .body("text/csv", csv_data)
            .header(ACCEPT, "application/json")
            .map_err(|source| client::Error::Transport { source })?;
        self.rest().send(request).await?;
        Ok(())
    }

    /// Marks an ingest job as upload complete and ready for processing.
    ///
    /// After calling this, no more data can be added to the job.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn mark_upload_complete(&self, job_id: &str) -> Result<IngestJobInfo, Error> {
        self.set_state(job_id, JobState::UploadComplete).await
    }

    /// Aborts an ingest job.
    ///
    /// This stops processing of the job but does not delete it.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn abort_job(&self, job_id: &str) -> Result<IngestJobInfo, Error> {
        self.set_state(job_id, JobState::Aborted).await
    }

    async fn set_state(&self, job_id: &str, state: JobState) -> Result<IngestJobInfo, Error> {
        let url = self.job_url(job_id).await?;
        let request = Request::new(Method::PATCH, url)
            .json(&serde_json::json!({ "state": state }))
            .map_err(|source| client::Error::Transport { source })?;
        let info: IngestJobInfo = self.rest().send_json(request).await?;
        Ok(info)
    }

    /// Deletes an ingest job.
    ///
    /// The job must be in UploadComplete, JobComplete, Aborted, or Failed state.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn delete_job(&self, job_id: &str) -> Result<(), Error> {
        let url = self.job_url(job_id).await?;
        self.rest().send(Request::new(Method::DELETE, url)).await?;
        Ok(())
    }

    /// Successfully processed records as CSV, with `sf__Id` and `sf__Created` columns.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn get_successful_results(&self, job_id: &str) -> Result<String, Error> {
        self.get_csv(job_id, "successfulResults").await
    }

    /// Failed records as CSV, with `sf__Id` and `sf__Error` columns.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn get_failed_results(&self, job_id: &str) -> Result<String, Error> {
        self.get_csv(job_id, "failedResults").await
    }

    /// Records never processed by a failed or aborted job, as CSV.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn get_unprocessed_results(&self, job_id: &str) -> Result<String, Error> {
        self.get_csv(job_id, "unprocessedrecords").await
    }

    async fn get_csv(&self, job_id: &str, endpoint: &str) -> Result<String, Error> {
        let url = format!("{}/{endpoint}/", self.job_url(job_id).await?);
        let request = Request::get(url)
            .header(ACCEPT, "text/csv")
            .map_err(|source| client::Error::Transport { source })?;
        Ok(self.rest().send(request).await?.text())
    }

    /// Retrieves information about all ingest jobs.
    ///
    /// Pass the `nextRecordsUrl` locator of a previous page as `query_locator` to continue.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn get_all_jobs(
        &self,
        is_pk_chunking_enabled: Option<bool>,
        job_type: Option<JobType>,
        query_locator: Option<&str>,
    ) -> Result<GetAllIngestJobsResponse, Error> {
        let mut query = url::form_urlencoded::Serializer::new(String::new());
        if let Some(enabled) = is_pk_chunking_enabled {
            query.append_pair("isPkChunkingEnabled", if enabled { "true" } else { "false" });
        }
        if let Some(job_type) = job_type {
            let name = match job_type {
                JobType::BigObjectIngest => "BigObjectIngest",
                JobType::Classic => "Classic",
                JobType::V2Ingest => "V2Ingest",
            };
            query.append_pair("jobType", name);
        }
        if let Some(locator) = query_locator {
            query.append_pair("queryLocator", locator);
        }
        let query = query.finish();

        let mut url = self.bulk_client.base_url().await?;
        if !query.is_empty() {
            url = format!("{url}?{query}");
        }
        Ok(self.rest().send_json(Request::get(url)).await?)
    }

    /// Creates an insert job, uploads `records` and closes the upload.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use salesforce_toolkit::bulkapi::{Client as BulkClient, MonitorOptions};
    /// use salesforce_toolkit::sobjects::SObject;
    /// # use salesforce_toolkit::client;
    ///
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// # let rest_client = client::Builder::new().credentials_path("credentials.json".into()).build()?;
    /// let ingest_client = BulkClient::new(rest_client).ingest();
    /// let records: Vec<_> = (0..10_000)
    ///     .map(|i| SObject::new("Contact").with("LastName", format!("Doe {i}")))
    ///     .collect();
    ///
    /// let mut job = ingest_client.insert_bulk(&records).await?;
    /// let outcome = job.monitor_until_complete(&MonitorOptions::default()).await?;
    /// println!("{outcome:?}");
    /// # Ok(())
    /// # }
    /// ```
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn insert_bulk<R: Record>(&self, records: &[R]) -> Result<IngestJob, Error> {
        self.run_bulk(records, IngestOperation::Insert, None).await
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn update_bulk<R: Record>(&self, records: &[R]) -> Result<IngestJob, Error> {
        self.run_bulk(records, IngestOperation::Update, None).await
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn upsert_bulk<R: Record>(
        &self,
        records: &[R],
        external_id_field: &str,
    ) -> Result<IngestJob, Error> {
        self.run_bulk(records, IngestOperation::Upsert, Some(external_id_field))
            .await
    }

    /// Creates a delete job for the ids of `records`.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn delete_bulk<R: Record>(&self, records: &[R]) -> Result<IngestJob, Error> {
        self.run_bulk(records, IngestOperation::Delete, None).await
    }

    async fn run_bulk<R: Record>(
        &self,
        records: &[R],
        operation: IngestOperation,
        external_id_field: Option<&str>,
    ) -> Result<IngestJob, Error> {
        let first = records.first().ok_or(Error::EmptyUpload)?;
        let all: Vec<usize> = (0..records.len()).collect();
        sobjects::ensure_single_type(records, &all).map_err(|source| Error::Planning { source })?;

        let mut request = CreateIngestJobRequest::new(first.sobject_type(), operation);
        if let Some(field) = external_id_field {
            request = request.external_id_field(field);
        }
        let mut job = self.open_job(&request).await?;
        job.upload(records).await?;
        job.close().await?;
        Ok(job)
    }
}

/// How [`IngestJob::monitor_until_complete`] polls.
#[derive(Debug, Clone)]
pub struct MonitorOptions {
    pub poll_interval: Duration,
    /// Give up after this long.
    pub deadline: Option<Duration>,
    /// Stops monitoring when cancelled. The job itself keeps running.
    pub cancel: CancellationToken,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(crate::DEFAULT_POLL_INTERVAL_SECS),
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }
}

/// How a job ended. Failed and aborted jobs are outcomes, not errors.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Complete(IngestJobInfo),
    Failed(IngestJobInfo),
    Aborted(IngestJobInfo),
}

impl JobOutcome {
    pub fn info(&self) -> &IngestJobInfo {
        match self {
            JobOutcome::Complete(info) | JobOutcome::Failed(info) | JobOutcome::Aborted(info) => {
                info
            }
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, JobOutcome::Complete(_))
    }
}

/// One row of a job result file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobResultRow {
    /// `sf__Id`: the record id assigned or matched by the server.
    pub id: Option<String>,
    /// `sf__Created`, present on successful results.
    pub created: Option<bool>,
    /// `sf__Error`, present on failed results.
    pub error: Option<String>,
    /// The uploaded columns.
    pub fields: BTreeMap<String, String>,
}

/// Parses a result file into rows.
pub fn parse_results(csv_text: &str, delimiter: ColumnDelimiter) -> Result<Vec<JobResultRow>, Error> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter.as_byte())
        .from_reader(csv_text.as_bytes());
    let headers = reader
        .headers()
        .map_err(|source| Error::Csv { source })?
        .clone();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|source| Error::Csv { source })?;
        let mut row = JobResultRow::default();
        for (column, value) in headers.iter().zip(record.iter()) {
            match column {
                "sf__Id" => row.id = Some(value.to_string()).filter(|id| !id.is_empty()),
                "sf__Created" => row.created = Some(value.eq_ignore_ascii_case("true")),
                "sf__Error" => row.error = Some(value.to_string()),
                _ => {
                    row.fields.insert(column.to_string(), value.to_string());
                }
            }
        }
        rows.push(row);
    }
    Ok(rows)
}

/// A job tracked through its states.
#[derive(Debug, Clone)]
pub struct IngestJob {
    client: IngestClient,
    info: IngestJobInfo,
}

impl IngestJob {
    pub fn id(&self) -> &str {
        &self.info.id
    }

    pub fn state(&self) -> JobState {
        self.info.state
    }

    pub fn info(&self) -> &IngestJobInfo {
        &self.info
    }

    fn delimiter(&self) -> ColumnDelimiter {
        self.info.column_delimiter.unwrap_or_default()
    }

    fn expect_state(&self, expected: JobState) -> Result<(), Error> {
        if self.info.state != expected {
            return Err(Error::InvalidState {
                job_id: self.info.id.clone(),
                expected,
                actual: self.info.state,
            });
        }
        Ok(())
    }

    /// Applies server-reported details; a state older than the current one is ignored.
    fn apply(&mut self, info: IngestJobInfo) {
        let previous = self.info.state;
        let mut info = info;
        if info.state.rank() < previous.rank() {
            tracing::warn!(
                job_id = %self.info.id,
                reported = ?info.state,
                current = ?previous,
                "ignoring stale job state"
            );
            info.state = previous;
        }
        if info.state != previous {
            tracing::info!(job_id = %info.id, from = ?previous, to = ?info.state, "ingest job state changed");
        }
        self.info = info;
    }

    /// Fetches the current job details.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn refresh(&mut self) -> Result<&IngestJobInfo, Error> {
        let info = self.client.get_job(&self.info.id).await?;
        self.apply(info);
        Ok(&self.info)
    }

    /// Uploads `records` as CSV pages; returns the number of pages sent.
    ///
    /// Delete jobs send only the `Id` column.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn upload<R: Record>(&mut self, records: &[R]) -> Result<usize, Error> {
        self.expect_state(JobState::Open)?;
        if records.is_empty() {
            return Err(Error::EmptyUpload);
        }
        let all: Vec<usize> = (0..records.len()).collect();
        sobjects::ensure_single_type(records, &all).map_err(|source| Error::Planning { source })?;

        let id_only = self.info.operation.is_some_and(|op| op.is_delete());
        let table = CsvTable::from_records(records, id_only)?;
        let pages = CsvPager::new(self.client.bulk_client.page_bytes())
            .with_delimiter(self.delimiter())
            .with_line_ending(self.info.line_ending.unwrap_or_default())
            .paginate(&table)?;
        self.upload_pages(pages).await
    }

    /// Uploads already encoded CSV pages, each with its own header row.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn upload_pages(&mut self, pages: Vec<Vec<u8>>) -> Result<usize, Error> {
        self.expect_state(JobState::Open)?;
        let content_url = match &self.info.content_url {
            Some(url) => url.clone(),
            None => format!(
                "services/data/v{}/jobs/ingest/{}/batches",
                self.client.rest().api_version(),
                self.info.id
            ),
        };
        let count = pages.len();
        for (index, page) in pages.into_iter().enumerate() {
            tracing::debug!(job_id = %self.info.id, page = index + 1, bytes = page.len(), "uploading csv page");
            self.client.upload_data(&content_url, page).await?;
        }
        Ok(count)
    }

    /// Closes the upload: `Open → UploadComplete`.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn close(&mut self) -> Result<&IngestJobInfo, Error> {
        self.expect_state(JobState::Open)?;
        let info = self.client.mark_upload_complete(&self.info.id).await?;
        self.apply(info);
        Ok(&self.info)
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn abort(&mut self) -> Result<&IngestJobInfo, Error> {
        let info = self.client.abort_job(&self.info.id).await?;
        self.apply(info);
        Ok(&self.info)
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn delete(self) -> Result<(), Error> {
        self.client.delete_job(&self.info.id).await
    }

    /// Terminal outcome, if the job has reached one.
    pub fn outcome(&self) -> Option<JobOutcome> {
        match self.info.state {
            JobState::JobComplete => Some(JobOutcome::Complete(self.info.clone())),
            JobState::Failed => Some(JobOutcome::Failed(self.info.clone())),
            JobState::Aborted => Some(JobOutcome::Aborted(self.info.clone())),
            _ => None,
        }
    }

    /// Polls the job until it reaches a terminal state.
    ///
    /// Transient request failures are retried up to [`crate::MAX_POLL_RETRIES`] times per
    /// poll. Cancelling or running past the deadline leaves the job untouched on the
    /// server.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn monitor_until_complete(
        &mut self,
        options: &MonitorOptions,
    ) -> Result<JobOutcome, Error> {
        let deadline = options
            .deadline
            .map(|limit| (tokio::time::Instant::now() + limit, limit));

        loop {
            if let Some(outcome) = self.outcome() {
                return Ok(outcome);
            }

            let wake = tokio::time::Instant::now() + options.poll_interval;
            self.until_stopped(options, deadline, tokio::time::sleep_until(wake))
                .await?;
            if let Some((at, limit)) = deadline {
                if tokio::time::Instant::now() >= at {
                    return Err(Error::Timeout {
                        job_id: self.info.id.clone(),
                        deadline: limit,
                    });
                }
            }

            self.poll(options, deadline).await?;
            tracing::debug!(job_id = %self.info.id, state = ?self.info.state, "polled ingest job");
        }
    }

    /// Refreshes the job, retrying transient failures with a linear backoff.
    ///
    /// Both the request and the backoff give way to cancellation and the deadline.
    async fn poll(
        &mut self,
        options: &MonitorOptions,
        deadline: Option<(tokio::time::Instant, Duration)>,
    ) -> Result<(), Error> {
        let mut attempt: u32 = 0;
        loop {
            let fetched = self
                .until_stopped(options, deadline, self.client.get_job(&self.info.id))
                .await?;
            match fetched {
                Ok(info) => {
                    self.apply(info);
                    return Ok(());
                }
                Err(error) if error.is_transient() && attempt < crate::MAX_POLL_RETRIES => {
                    attempt += 1;
                    tracing::warn!(
                        job_id = %self.info.id,
                        attempt,
                        error = %error,
                        "job status poll failed, retrying"
                    );
                    self.until_stopped(
                        options,
                        deadline,
                        tokio::time::sleep(options.poll_interval * attempt),
                    )
                    .await?;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Runs `work` unless the monitor is cancelled or its deadline passes first.
    async fn until_stopped<F: std::future::Future>(
        &self,
        options: &MonitorOptions,
        deadline: Option<(tokio::time::Instant, Duration)>,
        work: F,
    ) -> Result<F::Output, Error> {
        let expiry = async {
            match deadline {
                Some((at, _)) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            output = work => Ok(output),
            _ = options.cancel.cancelled() => Err(Error::Cancelled {
                job_id: self.info.id.clone(),
            }),
            _ = expiry => Err(Error::Timeout {
                job_id: self.info.id.clone(),
                deadline: deadline.map(|(_, limit)| limit).unwrap_or_default(),
            }),
        }
    }

    /// Records the job processed successfully.
    pub async fn successful_results(&self) -> Result<Vec<JobResultRow>, Error> {
        let text = self.client.get_successful_results(&self.info.id).await?;
        parse_results(&text, self.delimiter())
    }

    /// Records the job rejected, with the server's error message.
    pub async fn failed_results(&self) -> Result<Vec<JobResultRow>, Error> {
        let text = self.client.get_failed_results(&self.info.id).await?;
        parse_results(&text, self.delimiter())
    }

    /// Records the job never processed.
    pub async fn unprocessed_records(&self) -> Result<Vec<JobResultRow>, Error> {
        let text = self.client.get_unprocessed_results(&self.info.id).await?;
        parse_results(&text, self.delimiter())
    }
}
