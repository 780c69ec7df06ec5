//! Blocking facade over [`Client`].
//!
//! A [`BlockingClient`] owns a Tokio runtime and drives the async client on it. It shares
//! the session of the client it wraps: a token renewed through either is seen by both.
//! Collection operations dispatch their requests on worker threads instead of futures.
//!
//! Do not call these methods from inside an async context; blocking on the runtime there
//! panics.

use crate::auth::Token;
use crate::client::{self, Client};
use crate::dispatch::dispatch_blocking;
use crate::sobjects::{self, assemble, route_save, Operation, Plan, Record, SaveOptions, SaveResult};
use crate::transport::{Request, Response};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::runtime::Runtime;

/// Errors raised while setting up the blocking client.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Failed to start the runtime.
    #[error("Failed to build runtime: {source}")]
    Runtime {
        #[source]
        source: std::io::Error,
    },
}

/// Synchronous counterpart of [`Client`].
///
/// # Example
///
/// ```no_run
/// use salesforce_toolkit::blocking::BlockingClient;
/// use salesforce_toolkit::client;
/// use salesforce_toolkit::sobjects::{SaveOptions, SObject};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let client = client::Builder::new()
///     .credentials_path("credentials.json".into())
///     .build()?;
/// let blocking = BlockingClient::new(client)?;
/// blocking.connect()?;
///
/// let mut contacts = vec![SObject::new("Contact").with("LastName", "Doe")];
/// let options = SaveOptions { concurrency: 4, ..Default::default() };
/// blocking.insert(&mut contacts, &options)?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct BlockingClient {
    client: Client,
    runtime: Arc<Runtime>,
}

impl BlockingClient {
    pub fn new(client: Client) -> Result<Self, Error> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(|source| Error::Runtime { source })?;
        Ok(Self {
            client,
            runtime: Arc::new(runtime),
        })
    }

    /// The async client sharing this client's session.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Logs in now instead of on the first request.
    pub fn connect(&self) -> Result<(), client::Error> {
        self.runtime.block_on(self.client.token())?;
        Ok(())
    }

    /// See [`Client::reconnect`].
    pub fn reconnect(&self) -> Result<(), client::Error> {
        self.runtime.block_on(self.client.reconnect())
    }

    pub fn token(&self) -> Result<Arc<Token>, client::Error> {
        self.runtime.block_on(self.client.token())
    }

    /// See [`Client::execute`].
    pub fn execute(&self, request: &mut Request) -> Result<Response, client::Error> {
        self.runtime.block_on(self.client.execute(request))
    }

    /// See [`Client::send_json`].
    pub fn send_json<T: DeserializeOwned>(&self, request: Request) -> Result<T, client::Error> {
        self.runtime.block_on(self.client.send_json(request))
    }

    /// See [`Client::insert`].
    pub fn insert<R: Record>(
        &self,
        records: &mut [R],
        options: &SaveOptions,
    ) -> Result<Vec<SaveResult>, sobjects::Error> {
        let all = (0..records.len()).collect();
        self.run_collection(records, vec![(Operation::Insert, all)], options)
    }

    /// See [`Client::update`].
    pub fn update<R: Record>(
        &self,
        records: &mut [R],
        options: &SaveOptions,
    ) -> Result<Vec<SaveResult>, sobjects::Error> {
        let all = (0..records.len()).collect();
        self.run_collection(records, vec![(Operation::Update, all)], options)
    }

    /// See [`Client::upsert`].
    pub fn upsert<R: Record>(
        &self,
        records: &mut [R],
        external_id_field: &str,
        options: &SaveOptions,
    ) -> Result<Vec<SaveResult>, sobjects::Error> {
        let all = (0..records.len()).collect();
        let operation = Operation::Upsert {
            external_id_field: external_id_field.to_string(),
        };
        self.run_collection(records, vec![(operation, all)], options)
    }

    /// See [`Client::delete`].
    pub fn delete<R: Record>(
        &self,
        records: &mut [R],
        options: &SaveOptions,
    ) -> Result<Vec<SaveResult>, sobjects::Error> {
        let all = (0..records.len()).collect();
        self.run_collection(records, vec![(Operation::Delete, all)], options)
    }

    /// See [`Client::save`].
    pub fn save<R: Record>(
        &self,
        records: &mut [R],
        options: &SaveOptions,
    ) -> Result<Vec<SaveResult>, sobjects::Error> {
        let routes = route_save(records, options)?;
        self.run_collection(records, routes, options)
    }

    fn run_collection<R: Record>(
        &self,
        records: &mut [R],
        routes: Vec<(Operation, Vec<usize>)>,
        options: &SaveOptions,
    ) -> Result<Vec<SaveResult>, sobjects::Error> {
        let data_url = self.runtime.block_on(self.client.data_url())?;
        let mut placed = Vec::with_capacity(records.len());
        for (operation, selection) in routes {
            let mut plan = Plan::prepare(operation, records, &selection, options, &data_url)?;
            let (positions, requests) = plan.take_requests();
            let responses = dispatch_blocking(requests, options.concurrency, |request| {
                self.runtime
                    .block_on(self.client.send_json::<Vec<SaveResult>>(request))
            })?;
            placed.extend(plan.reconcile(records, positions, responses, options)?);
        }
        assemble(records.len(), placed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::mock_client;
    use crate::client::{Builder, Credentials};
    use crate::sobjects::tests::{account, collection_server};
    use crate::transport::testing::{json_response, MockTransport};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_blocking_insert_in_order() {
        let transport = collection_server().delayed(Duration::from_millis(5));
        let blocking = BlockingClient::new(mock_client(&transport)).unwrap();
        let mut records: Vec<_> = (0..7).map(|i| account(&format!("acc-{i}"))).collect();

        let options = SaveOptions {
            batch_size: 2,
            concurrency: 3,
            ..Default::default()
        };
        let results = blocking.insert(&mut records, &options).unwrap();

        assert_eq!(results.len(), 7);
        for (record, result) in records.iter().zip(&results) {
            assert!(result.success);
            assert_eq!(record.id(), result.id);
        }
        assert_eq!(transport.requests().len(), 4);
        assert!(transport.max_in_flight() <= 3);
    }

    #[test]
    fn test_blocking_save_routes_like_async() {
        let transport = collection_server();
        let blocking = BlockingClient::new(mock_client(&transport)).unwrap();
        let mut records = vec![account("new"), account("old")];
        records[1].set_id(Some("001OLD".to_string()));

        let results = blocking.save(&mut records, &SaveOptions::default()).unwrap();
        assert_eq!(results[1].id.as_deref(), Some("001OLD"));
        assert!(records[0].id().is_some());
    }

    #[test]
    fn test_blocking_planning_error() {
        let transport = MockTransport::new();
        let blocking = BlockingClient::new(mock_client(&transport)).unwrap();
        let mut records = vec![account("no id")];
        let result = blocking.delete(&mut records, &SaveOptions::default());
        assert!(matches!(result, Err(sobjects::Error::MissingId { .. })));
        assert!(transport.requests().is_empty());
    }

    #[test]
    fn test_blocking_shares_session_with_async_client() {
        let logins = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&logins);
        let transport = MockTransport::with_handler(move |_| {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            json_response(
                200,
                json!({"access_token": format!("T{n}"), "instance_url": "https://h", "token_type": "Bearer"}),
            )
        });
        let client = Builder::new()
            .credentials(Credentials {
                consumer_key: Some("ck".to_string()),
                consumer_secret: Some("cs".to_string()),
                ..Default::default()
            })
            .transport(Arc::new(transport))
            .build()
            .unwrap();
        let blocking = BlockingClient::new(client.clone()).unwrap();

        blocking.connect().unwrap();
        assert_eq!(
            client.session().current_token().unwrap().unwrap().secret,
            "T1"
        );

        blocking.reconnect().unwrap();
        assert_eq!(
            client.session().current_token().unwrap().unwrap().secret,
            "T2"
        );
        assert_eq!(blocking.token().unwrap().secret, "T2");
        assert_eq!(logins.load(Ordering::SeqCst), 2);
    }
}
