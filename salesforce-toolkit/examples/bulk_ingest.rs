//! Example of loading records through sObject collections and Bulk API 2.0.
//!
//! This example demonstrates:
//! - Logging in with credentials from the environment
//! - Inserting and updating a small batch through sObject collections
//! - Loading a larger set through a bulk ingest job and monitoring it
//! - Reading failed rows and cleaning up
//!
//! Run with `RUST_LOG=salesforce_toolkit=debug` to see the request flow.

use salesforce_toolkit::bulkapi::{Client as BulkClient, JobOutcome, MonitorOptions};
use salesforce_toolkit::client::{self, Credentials};
use salesforce_toolkit::sobjects::{SaveOptions, SObject};
use std::env;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let client = client::Builder::new()
        .credentials(Credentials {
            consumer_key: Some(env::var("SALESFORCE_CONSUMER_KEY")?),
            consumer_secret: Some(env::var("SALESFORCE_CONSUMER_SECRET")?),
            domain: env::var("SALESFORCE_DOMAIN").ok(),
            ..Default::default()
        })
        .name("demo")
        .on_token_refresh(|token| info!("New session on {}", token.authority))
        .build()?
        .connect()
        .await?;

    info!("Inserting accounts through sObject collections");
    let mut accounts: Vec<_> = (0..5)
        .map(|i| SObject::new("Account").with("Name", format!("Demo Account {i}")))
        .collect();
    let options = SaveOptions {
        batch_size: 2,
        concurrency: 2,
        ..Default::default()
    };
    let results = client.insert(&mut accounts, &options).await?;
    for result in results.iter().filter(|r| !r.success) {
        error!("Insert failed: {:?}", result.errors);
    }

    info!("Updating only the changed field");
    for account in &mut accounts {
        account.set("Industry", "Technology");
    }
    let options = SaveOptions {
        only_changes: true,
        ..options
    };
    client.update(&mut accounts, &options).await?;

    if let Some(usage) = client.api_usage().and_then(|u| u.api_usage) {
        info!("API usage: {}/{}", usage.used, usage.max);
    }

    info!("Loading contacts through a bulk ingest job");
    let ingest_client = BulkClient::new(client.clone()).ingest();
    let contacts: Vec<_> = (0..1_000)
        .map(|i| {
            SObject::new("Contact")
                .with("LastName", format!("Demo {i}"))
                .with("Email", format!("demo{i}@example.com"))
        })
        .collect();
    let mut job = ingest_client.insert_bulk(&contacts).await?;
    info!("Created job: {}", job.id());

    let monitor = MonitorOptions {
        poll_interval: Duration::from_secs(2),
        deadline: Some(Duration::from_secs(600)),
        ..Default::default()
    };
    match job.monitor_until_complete(&monitor).await? {
        JobOutcome::Complete(info) => info!(
            "Job complete: {:?} processed, {:?} failed",
            info.number_records_processed, info.number_records_failed
        ),
        JobOutcome::Failed(info) => error!("Job failed: {:?}", info.error_message),
        JobOutcome::Aborted(_) => error!("Job was aborted"),
    }

    for row in job.failed_results().await? {
        error!("{:?}: {:?}", row.fields.get("LastName"), row.error);
    }
    let created = job.successful_results().await?;
    info!("Created {} contacts", created.len());

    info!("Cleaning up");
    job.delete().await?;
    client
        .delete(
            &mut accounts,
            &SaveOptions {
                clear_id: true,
                ..Default::default()
            },
        )
        .await?;

    Ok(())
}
