//! sObject records and the collection (batch) operations.
//!
//! Insert, update, upsert and delete go through the sObject Collections endpoints
//! (`/composite/sobjects`), which accept at most 200 records of one type per request.
//! Records are cut into chunks by [`ChunkPlanner`], the chunks are sent through the
//! bounded dispatcher and the per-record [`SaveResult`]s are put back in input order.

use crate::client::{self, Client};
use crate::dispatch::dispatch;
use crate::transport::{self, Request};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// Errors raised by collection operations.
///
/// Planning errors are raised before anything is sent.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Update, upsert and delete need records of a single sObject type.
    #[error("All records must be of type {expected}, found {found}")]
    MixedTypes { expected: String, found: String },
    /// The operation needs the record's id but it has none.
    #[error("Record {position} ({sobject_type}) has no id")]
    MissingId {
        position: usize,
        sobject_type: String,
    },
    /// Insert was given a record that already exists.
    #[error("Record {position} already has id {id} and cannot be inserted")]
    AlreadyHasId { position: usize, id: String },
    /// Upsert was given a record without a value for the external id field.
    #[error("Record {position} has no value for external id field {field}")]
    MissingExternalId { position: usize, field: String },
    /// The server answered a chunk with the wrong number of results.
    #[error("Expected {expected} results for the chunk, received {received}")]
    ResultCountMismatch { expected: usize, received: usize },
    /// Failed to build a request.
    #[error("Failed to build request: {source}")]
    Request {
        #[source]
        source: transport::Error,
    },
    /// Login or session renewal failed while dispatching.
    #[error("Authentication error: {source}")]
    Auth {
        #[source]
        source: crate::auth::Error,
    },
    /// A chunk request failed.
    #[error("Dispatch failed: {source}")]
    Dispatch {
        #[source]
        source: client::Error,
    },
}

impl From<client::Error> for Error {
    fn from(source: client::Error) -> Self {
        match source {
            client::Error::Auth { source } => Error::Auth { source },
            other => Error::Dispatch { source: other },
        }
    }
}

/// A record the collection operations can write.
///
/// Implementors expose their fields as a JSON map and track which fields changed since
/// the record was loaded or last saved.
pub trait Record {
    /// sObject API name, e.g. `Account`.
    fn sobject_type(&self) -> &str;

    /// Name of the identity field.
    fn id_field(&self) -> &str {
        "Id"
    }

    /// All field values.
    fn to_map(&self) -> Map<String, Value>;

    /// Names of fields modified since the last load or save.
    fn changed_keys(&self) -> BTreeSet<String>;

    /// Forgets modifications after a successful save.
    fn clear_changed(&mut self);

    /// Writes back the server-assigned id, or removes it after a delete.
    fn set_id(&mut self, id: Option<String>);

    fn id(&self) -> Option<String> {
        self.to_map()
            .get(self.id_field())
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

/// Loosely typed record backed by a JSON map.
#[derive(Debug, Clone, PartialEq)]
pub struct SObject {
    sobject_type: String,
    id_field: String,
    fields: Map<String, Value>,
    changed: BTreeSet<String>,
}

impl SObject {
    pub fn new(sobject_type: impl Into<String>) -> Self {
        Self {
            sobject_type: sobject_type.into(),
            id_field: "Id".to_string(),
            fields: Map::new(),
            changed: BTreeSet::new(),
        }
    }

    /// A record as loaded from the server: no field counts as changed.
    pub fn from_fields(sobject_type: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self {
            fields,
            ..Self::new(sobject_type)
        }
    }

    pub fn with_id_field(mut self, id_field: impl Into<String>) -> Self {
        self.id_field = id_field.into();
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        let key = key.into();
        self.changed.insert(key.clone());
        self.fields.insert(key, value.into());
        self
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let removed = self.fields.remove(key);
        if removed.is_some() {
            self.changed.insert(key.to_string());
        }
        removed
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }
}

impl Record for SObject {
    fn sobject_type(&self) -> &str {
        &self.sobject_type
    }

    fn id_field(&self) -> &str {
        &self.id_field
    }

    fn to_map(&self) -> Map<String, Value> {
        self.fields.clone()
    }

    fn changed_keys(&self) -> BTreeSet<String> {
        self.changed.clone()
    }

    fn clear_changed(&mut self) {
        self.changed.clear();
    }

    fn set_id(&mut self, id: Option<String>) {
        match id {
            Some(id) => {
                self.fields.insert(self.id_field.clone(), Value::String(id));
            }
            None => {
                self.fields.remove(&self.id_field);
            }
        }
    }
}

/// A field-level error reported for one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldError {
    pub status_code: String,
    pub message: String,
    #[serde(default)]
    pub fields: Vec<String>,
}

/// Outcome for one record; failures here are data, not errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveResult {
    #[serde(default)]
    pub id: Option<String>,
    pub success: bool,
    #[serde(default)]
    pub errors: Vec<FieldError>,
    /// Set by upsert: whether the record was created rather than updated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<bool>,
}

impl SaveResult {
    fn unchanged(id: Option<String>) -> Self {
        Self {
            id,
            success: true,
            errors: Vec::new(),
            created: None,
        }
    }
}

/// Tuning for collection operations.
#[derive(Debug, Clone)]
pub struct SaveOptions {
    /// Requests in flight at once.
    pub concurrency: usize,
    /// Records per request, clamped to [`crate::MAX_BATCH_SIZE`].
    pub batch_size: usize,
    /// Roll back the whole request when one record fails.
    pub all_or_none: bool,
    /// Send only modified fields; records without modifications are not sent.
    pub only_changes: bool,
    /// [`Client::save`] refuses records without an id instead of inserting them.
    pub update_only: bool,
    /// [`Client::save`] upserts records that carry a value for this field.
    pub external_id_field: Option<String>,
    /// [`Client::delete`] removes the id from records deleted successfully.
    pub clear_id: bool,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self {
            concurrency: crate::DEFAULT_CONCURRENCY,
            batch_size: crate::DEFAULT_BATCH_SIZE,
            all_or_none: false,
            only_changes: false,
            update_only: false,
            external_id_field: None,
            clear_id: false,
        }
    }
}

/// Records of one sObject type that travel in one request.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk<T> {
    pub sobject_type: String,
    /// Index of each item in the caller's input.
    pub positions: Vec<usize>,
    pub items: Vec<T>,
}

impl Chunk<Value> {
    /// Size of the items serialized as a JSON array.
    pub fn serialized_size(&self) -> usize {
        serde_json::to_vec(&self.items).map_or(0, |bytes| bytes.len())
    }
}

/// Cuts an ordered, possibly mixed-type sequence into chunks.
///
/// A chunk ends when the type changes or it holds `max_per_chunk` items. Items are never
/// regrouped: `A A B A` becomes three chunks.
#[derive(Debug, Clone, Copy)]
pub struct ChunkPlanner {
    max_per_chunk: usize,
}

impl ChunkPlanner {
    pub fn new(max_per_chunk: usize) -> Self {
        let max_per_chunk = if max_per_chunk > crate::MAX_BATCH_SIZE {
            tracing::warn!(
                requested = max_per_chunk,
                max = crate::MAX_BATCH_SIZE,
                "batch size above the collection limit, clamping"
            );
            crate::MAX_BATCH_SIZE
        } else {
            max_per_chunk.max(1)
        };
        Self { max_per_chunk }
    }

    pub fn max_per_chunk(&self) -> usize {
        self.max_per_chunk
    }

    /// Plans `(position, sobject_type, item)` triples in their given order.
    pub fn plan<T>(&self, items: impl IntoIterator<Item = (usize, String, T)>) -> Vec<Chunk<T>> {
        let mut chunks: Vec<Chunk<T>> = Vec::new();
        for (position, sobject_type, item) in items {
            match chunks.last_mut() {
                Some(chunk)
                    if chunk.sobject_type == sobject_type
                        && chunk.items.len() < self.max_per_chunk =>
                {
                    chunk.positions.push(position);
                    chunk.items.push(item);
                }
                _ => chunks.push(Chunk {
                    sobject_type,
                    positions: vec![position],
                    items: vec![item],
                }),
            }
        }
        chunks
    }
}

/// Fails unless every selected record has the same type.
pub fn ensure_single_type<R: Record>(records: &[R], selection: &[usize]) -> Result<(), Error> {
    let mut types = selection.iter().map(|&i| records[i].sobject_type());
    let Some(expected) = types.next() else {
        return Ok(());
    };
    match types.find(|found| *found != expected) {
        Some(found) => Err(Error::MixedTypes {
            expected: expected.to_string(),
            found: found.to_string(),
        }),
        None => Ok(()),
    }
}

/// A collection operation over a selection of the caller's records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Operation {
    Insert,
    Update,
    Upsert { external_id_field: String },
    Delete,
}

impl Operation {
    fn name(&self) -> &'static str {
        match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Upsert { .. } => "upsert",
            Operation::Delete => "delete",
        }
    }
}

/// One request of a planned operation.
pub(crate) struct Unit {
    pub(crate) positions: Vec<usize>,
    pub(crate) request: Request,
}

/// A fully prepared operation: requests to send plus results known without sending.
pub(crate) struct Plan {
    operation: Operation,
    pub(crate) units: Vec<Unit>,
    skipped: Vec<(usize, SaveResult)>,
}

impl Plan {
    pub(crate) fn prepare<R: Record>(
        operation: Operation,
        records: &[R],
        selection: &[usize],
        options: &SaveOptions,
        data_url: &str,
    ) -> Result<Self, Error> {
        if operation != Operation::Insert {
            ensure_single_type(records, selection)?;
        }

        let mut skipped = Vec::new();
        let mut items = Vec::with_capacity(selection.len());
        for &position in selection {
            let record = &records[position];
            let id = record.id();
            match &operation {
                Operation::Insert => {
                    if let Some(id) = &id {
                        return Err(Error::AlreadyHasId {
                            position,
                            id: id.clone(),
                        });
                    }
                }
                Operation::Update | Operation::Delete => {
                    if id.is_none() {
                        return Err(Error::MissingId {
                            position,
                            sobject_type: record.sobject_type().to_string(),
                        });
                    }
                }
                Operation::Upsert { external_id_field } => {
                    let has_value = record
                        .to_map()
                        .get(external_id_field)
                        .is_some_and(|v| !v.is_null());
                    if !has_value {
                        return Err(Error::MissingExternalId {
                            position,
                            field: external_id_field.clone(),
                        });
                    }
                }
            }

            let item = match &operation {
                Operation::Delete => Value::String(id.unwrap_or_default()),
                Operation::Insert => payload(record, None, &[]),
                Operation::Update | Operation::Upsert { .. } => {
                    let changed = options.only_changes.then(|| record.changed_keys());
                    if changed.as_ref().is_some_and(BTreeSet::is_empty) {
                        skipped.push((position, SaveResult::unchanged(id)));
                        continue;
                    }
                    let keep: Vec<&str> = match &operation {
                        Operation::Upsert { external_id_field } => vec![external_id_field.as_str()],
                        _ => vec![record.id_field()],
                    };
                    payload(record, changed.as_ref(), &keep)
                }
            };
            items.push((position, record.sobject_type().to_string(), item));
        }

        let planner = ChunkPlanner::new(options.batch_size);
        let units = planner
            .plan(items)
            .into_iter()
            .map(|chunk| -> Result<Unit, Error> {
                let request = build_request(&operation, &chunk, options.all_or_none, data_url)?;
                Ok(Unit {
                    positions: chunk.positions,
                    request,
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;

        tracing::debug!(
            operation = operation.name(),
            records = selection.len(),
            requests = units.len(),
            skipped = skipped.len(),
            "planned collection operation"
        );
        Ok(Self {
            operation,
            units,
            skipped,
        })
    }

    /// Splits off the requests to send, keeping the positions for [`Plan::reconcile`].
    pub(crate) fn take_requests(&mut self) -> (Vec<Vec<usize>>, Vec<Request>) {
        std::mem::take(&mut self.units)
            .into_iter()
            .map(|unit| (unit.positions, unit.request))
            .unzip()
    }

    /// Pairs each response with its records and writes identities back.
    pub(crate) fn reconcile<R: Record>(
        self,
        records: &mut [R],
        positions: Vec<Vec<usize>>,
        responses: Vec<Vec<SaveResult>>,
        options: &SaveOptions,
    ) -> Result<Vec<(usize, SaveResult)>, Error> {
        let mut placed = self.skipped;
        for (chunk_positions, results) in positions.into_iter().zip(responses) {
            if chunk_positions.len() != results.len() {
                return Err(Error::ResultCountMismatch {
                    expected: chunk_positions.len(),
                    received: results.len(),
                });
            }
            placed.extend(chunk_positions.into_iter().zip(results));
        }

        for (position, result) in &placed {
            if !result.success {
                continue;
            }
            let record = &mut records[*position];
            match &self.operation {
                Operation::Insert | Operation::Upsert { .. } => {
                    if let Some(id) = &result.id {
                        record.set_id(Some(id.clone()));
                    }
                    record.clear_changed();
                }
                Operation::Update => record.clear_changed(),
                Operation::Delete => {
                    if options.clear_id {
                        record.set_id(None);
                    }
                }
            }
        }
        Ok(placed)
    }
}

/// Builds the JSON body entry for one record.
fn payload<R: Record>(record: &R, only: Option<&BTreeSet<String>>, keep: &[&str]) -> Value {
    let mut fields = Map::new();
    fields.insert(
        "attributes".to_string(),
        serde_json::json!({ "type": record.sobject_type() }),
    );
    for (key, value) in record.to_map() {
        if key == "attributes" {
            continue;
        }
        let wanted = match only {
            Some(only) => only.contains(&key) || keep.contains(&key.as_str()),
            None => true,
        };
        if wanted {
            fields.insert(key, value);
        }
    }
    Value::Object(fields)
}

fn build_request(
    operation: &Operation,
    chunk: &Chunk<Value>,
    all_or_none: bool,
    data_url: &str,
) -> Result<Request, Error> {
    let collection_url = format!("{data_url}/composite/sobjects");
    let body = |method: Method, url: String| {
        Request::new(method, url)
            .json(&serde_json::json!({ "allOrNone": all_or_none, "records": chunk.items }))
            .map_err(|source| Error::Request { source })
    };
    match operation {
        Operation::Insert => body(Method::POST, collection_url),
        Operation::Update => body(Method::PATCH, collection_url),
        Operation::Upsert { external_id_field } => body(
            Method::PATCH,
            format!("{collection_url}/{}/{external_id_field}", chunk.sobject_type),
        ),
        Operation::Delete => {
            let ids: Vec<&str> = chunk.items.iter().filter_map(Value::as_str).collect();
            let query = url::form_urlencoded::Serializer::new(String::new())
                .append_pair("ids", &ids.join(","))
                .append_pair("allOrNone", if all_or_none { "true" } else { "false" })
                .finish();
            Ok(Request::new(Method::DELETE, format!("{collection_url}?{query}")))
        }
    }
}

/// Decides, per record, which operation [`Client::save`] performs.
///
/// With an external id field every record is upserted on that field, and a record
/// without a value for it is an error. Otherwise records with an id are updated and the
/// rest inserted, unless `update_only` is set, in which case a missing id is an error.
pub(crate) fn route_save<R: Record>(
    records: &[R],
    options: &SaveOptions,
) -> Result<Vec<(Operation, Vec<usize>)>, Error> {
    if let Some(field) = &options.external_id_field {
        for (position, record) in records.iter().enumerate() {
            let present = record
                .to_map()
                .get(field.as_str())
                .is_some_and(|v| !v.is_null());
            if !present {
                return Err(Error::MissingExternalId {
                    position,
                    field: field.clone(),
                });
            }
        }
        let positions = (0..records.len()).collect::<Vec<_>>();
        if positions.is_empty() {
            return Ok(Vec::new());
        }
        return Ok(vec![(
            Operation::Upsert {
                external_id_field: field.clone(),
            },
            positions,
        )]);
    }

    let mut updates = Vec::new();
    let mut inserts = Vec::new();
    for (position, record) in records.iter().enumerate() {
        match record.id() {
            Some(_) => updates.push(position),
            None if options.update_only => {
                return Err(Error::MissingId {
                    position,
                    sobject_type: record.sobject_type().to_string(),
                })
            }
            None => inserts.push(position),
        }
    }

    let mut routes = Vec::new();
    if !updates.is_empty() {
        routes.push((Operation::Update, updates));
    }
    if !inserts.is_empty() {
        routes.push((Operation::Insert, inserts));
    }
    Ok(routes)
}

/// Orders placed results by input position.
pub(crate) fn assemble(total: usize, placed: Vec<(usize, SaveResult)>) -> Result<Vec<SaveResult>, Error> {
    let mut slots: Vec<Option<SaveResult>> = vec![None; total];
    let received = placed.len();
    for (position, result) in placed {
        slots[position] = Some(result);
    }
    slots
        .into_iter()
        .collect::<Option<Vec<_>>>()
        .ok_or(Error::ResultCountMismatch {
            expected: total,
            received,
        })
}

impl Client {
    /// Creates records, writing the new ids back into them.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use salesforce_toolkit::sobjects::{SaveOptions, SObject};
    /// # use salesforce_toolkit::client;
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// # let client = client::Builder::new().credentials_path("credentials.json".into()).build()?;
    /// let mut accounts = vec![
    ///     SObject::new("Account").with("Name", "Acme"),
    ///     SObject::new("Account").with("Name", "Globex"),
    /// ];
    /// let results = client.insert(&mut accounts, &SaveOptions::default()).await?;
    /// assert_eq!(results.len(), accounts.len());
    /// # Ok(())
    /// # }
    /// ```
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn insert<R: Record>(
        &self,
        records: &mut [R],
        options: &SaveOptions,
    ) -> Result<Vec<SaveResult>, Error> {
        let all = (0..records.len()).collect();
        self.run_collection(records, vec![(Operation::Insert, all)], options)
            .await
    }

    /// Updates records by id.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn update<R: Record>(
        &self,
        records: &mut [R],
        options: &SaveOptions,
    ) -> Result<Vec<SaveResult>, Error> {
        let all = (0..records.len()).collect();
        self.run_collection(records, vec![(Operation::Update, all)], options)
            .await
    }

    /// Inserts or updates records matched on `external_id_field`.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn upsert<R: Record>(
        &self,
        records: &mut [R],
        external_id_field: &str,
        options: &SaveOptions,
    ) -> Result<Vec<SaveResult>, Error> {
        let all = (0..records.len()).collect();
        let operation = Operation::Upsert {
            external_id_field: external_id_field.to_string(),
        };
        self.run_collection(records, vec![(operation, all)], options)
            .await
    }

    /// Deletes records by id.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn delete<R: Record>(
        &self,
        records: &mut [R],
        options: &SaveOptions,
    ) -> Result<Vec<SaveResult>, Error> {
        let all = (0..records.len()).collect();
        self.run_collection(records, vec![(Operation::Delete, all)], options)
            .await
    }

    /// Inserts, updates or upserts each record depending on what identifies it.
    ///
    /// Records with an id are updated, records with a value for
    /// [`SaveOptions::external_id_field`] are upserted and the rest are inserted.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn save<R: Record>(
        &self,
        records: &mut [R],
        options: &SaveOptions,
    ) -> Result<Vec<SaveResult>, Error> {
        let routes = route_save(records, options)?;
        self.run_collection(records, routes, options).await
    }

    async fn run_collection<R: Record>(
        &self,
        records: &mut [R],
        routes: Vec<(Operation, Vec<usize>)>,
        options: &SaveOptions,
    ) -> Result<Vec<SaveResult>, Error> {
        let data_url = self.data_url().await?;
        let mut placed = Vec::with_capacity(records.len());
        for (operation, selection) in routes {
            let mut plan = Plan::prepare(operation, records, &selection, options, &data_url)?;
            let (positions, requests) = plan.take_requests();
            let responses = dispatch(requests, options.concurrency, |request| {
                self.send_json::<Vec<SaveResult>>(request)
            })
            .await?;
            placed.extend(plan.reconcile(records, positions, responses, options)?);
        }
        assemble(records.len(), placed)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::client::tests::mock_client;
    use crate::transport::testing::{json_response, MockTransport};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    pub(crate) fn account(name: &str) -> SObject {
        SObject::new("Account").with("Name", name)
    }

    fn loaded(sobject_type: &str, id: &str) -> SObject {
        let mut fields = Map::new();
        fields.insert("Id".to_string(), json!(id));
        fields.insert("Name".to_string(), json!("existing"));
        SObject::from_fields(sobject_type, fields)
    }

    /// Answers collection requests with one success per record, numbering new ids.
    pub(crate) fn collection_server() -> MockTransport {
        let counter = Arc::new(AtomicUsize::new(0));
        MockTransport::with_handler(move |request| {
            if request.method == Method::DELETE {
                let query = request.url.split_once('?').map(|(_, q)| q).unwrap_or("");
                let ids: Vec<String> = url::form_urlencoded::parse(query.as_bytes())
                    .find(|(k, _)| k == "ids")
                    .map(|(_, v)| v.split(',').map(str::to_string).collect())
                    .unwrap_or_default();
                let results: Vec<_> = ids
                    .iter()
                    .map(|id| json!({"id": id, "success": true, "errors": []}))
                    .collect();
                return json_response(200, Value::Array(results));
            }
            let body: Value = serde_json::from_slice(request.body.as_deref().unwrap()).unwrap();
            let results: Vec<_> = body["records"]
                .as_array()
                .unwrap()
                .iter()
                .map(|record| {
                    let id = match record.get("Id").and_then(Value::as_str) {
                        Some(id) => id.to_string(),
                        None => format!("001{:012}", counter.fetch_add(1, Ordering::SeqCst)),
                    };
                    json!({"id": id, "success": true, "errors": []})
                })
                .collect();
            json_response(200, Value::Array(results))
        })
    }

    fn request_bodies(transport: &MockTransport) -> Vec<Value> {
        transport
            .requests()
            .iter()
            .filter_map(|r| r.body.as_deref())
            .map(|b| serde_json::from_slice(b).unwrap())
            .collect()
    }

    #[test]
    fn test_planner_count_mode() {
        let planner = ChunkPlanner::new(2);
        let items = (0..5).map(|i| (i, "Account".to_string(), i));
        let chunks = planner.plan(items);
        let sizes: Vec<_> = chunks.iter().map(|c| c.items.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(chunks[2].positions, vec![4]);
    }

    #[test]
    fn test_planner_ceil_chunks() {
        for (n, k) in [(1, 1), (7, 3), (200, 200), (401, 200), (10, 10)] {
            let planner = ChunkPlanner::new(k);
            let chunks = planner.plan((0..n).map(|i| (i, "Contact".to_string(), ())));
            assert_eq!(chunks.len(), n.div_ceil(k), "n={n} k={k}");
            assert!(chunks.iter().all(|c| c.items.len() <= k));
        }
    }

    #[test]
    fn test_planner_splits_on_type_change_without_regrouping() {
        let planner = ChunkPlanner::new(10);
        let types = ["Account", "Account", "Contact", "Account"];
        let chunks = planner.plan(types.iter().enumerate().map(|(i, t)| (i, t.to_string(), i)));
        let shape: Vec<_> = chunks
            .iter()
            .map(|c| (c.sobject_type.as_str(), c.positions.clone()))
            .collect();
        assert_eq!(
            shape,
            vec![("Account", vec![0, 1]), ("Contact", vec![2]), ("Account", vec![3])]
        );
    }

    #[test]
    fn test_planner_clamps_batch_size() {
        assert_eq!(ChunkPlanner::new(500).max_per_chunk(), 200);
        assert_eq!(ChunkPlanner::new(0).max_per_chunk(), 1);
        assert_eq!(ChunkPlanner::new(50).max_per_chunk(), 50);
    }

    #[test]
    fn test_chunk_serialized_size() {
        let chunk = Chunk {
            sobject_type: "Account".to_string(),
            positions: vec![0],
            items: vec![json!({"a": 1})],
        };
        assert_eq!(chunk.serialized_size(), r#"[{"a":1}]"#.len());
    }

    #[test]
    fn test_ensure_single_type() {
        let records = vec![loaded("Account", "1"), loaded("Contact", "2")];
        assert!(ensure_single_type(&records, &[0]).is_ok());
        assert!(ensure_single_type(&records, &[]).is_ok());
        assert!(matches!(
            ensure_single_type(&records, &[0, 1]),
            Err(Error::MixedTypes { expected, found }) if expected == "Account" && found == "Contact"
        ));
    }

    #[test]
    fn test_sobject_tracks_changes() {
        let mut record = loaded("Account", "001");
        assert!(record.changed_keys().is_empty());
        record.set("Phone", "555");
        assert_eq!(record.changed_keys(), BTreeSet::from(["Phone".to_string()]));
        assert_eq!(record.id().as_deref(), Some("001"));
        record.clear_changed();
        record.set_id(None);
        assert!(record.id().is_none());
        assert!(record.changed_keys().is_empty());
    }

    #[tokio::test]
    async fn test_insert_writes_back_ids() {
        let transport = collection_server();
        let client = mock_client(&transport);
        let mut records = vec![account("a"), account("b"), account("c")];

        let options = SaveOptions {
            batch_size: 2,
            ..Default::default()
        };
        let results = client.insert(&mut records, &options).await.unwrap();

        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.success));
        assert!(records.iter().all(|r| r.id().is_some() && r.changed_keys().is_empty()));
        assert_eq!(results[2].id, records[2].id());

        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].method, Method::POST);
        assert!(requests[0].url.ends_with("/composite/sobjects"));
        let bodies = request_bodies(&transport);
        assert_eq!(bodies[0]["allOrNone"], false);
        assert_eq!(bodies[0]["records"][0]["attributes"]["type"], "Account");
    }

    #[tokio::test]
    async fn test_insert_rejects_existing_records() {
        let transport = MockTransport::new();
        let client = mock_client(&transport);
        let mut records = vec![account("a"), loaded("Account", "001")];
        let result = client.insert(&mut records, &SaveOptions::default()).await;
        assert!(matches!(result, Err(Error::AlreadyHasId { position: 1, .. })));
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_update_returns_aligned_results() {
        let transport = collection_server();
        let client = mock_client(&transport);
        let mut records: Vec<_> = (0..5).map(|i| loaded("Account", &format!("001{i}"))).collect();

        let options = SaveOptions {
            batch_size: 2,
            concurrency: 3,
            ..Default::default()
        };
        let results = client.update(&mut records, &options).await.unwrap();

        assert_eq!(results.len(), records.len());
        for (record, result) in records.iter().zip(&results) {
            assert_eq!(record.id(), result.id);
        }
        assert_eq!(transport.requests().len(), 3);
        assert!(transport.requests().iter().all(|r| r.method == Method::PATCH));
    }

    #[tokio::test]
    async fn test_update_rejects_mixed_types_before_sending() {
        let transport = MockTransport::new();
        let client = mock_client(&transport);
        let mut records = vec![loaded("Account", "1"), loaded("Contact", "2")];
        let result = client.update(&mut records, &SaveOptions::default()).await;
        assert!(matches!(result, Err(Error::MixedTypes { .. })));
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_update_only_changes() {
        let transport = collection_server();
        let client = mock_client(&transport);
        let mut records: Vec<_> = (0..5).map(|i| loaded("Account", &format!("001{i}"))).collect();
        records[1].set("Phone", "555");
        records[3].set("Name", "renamed");

        let options = SaveOptions {
            only_changes: true,
            ..Default::default()
        };
        let results = client.update(&mut records, &options).await.unwrap();

        assert_eq!(results.len(), 5);
        assert!(results.iter().all(|r| r.success));
        let bodies = request_bodies(&transport);
        assert_eq!(bodies.len(), 1);
        let sent = bodies[0]["records"].as_array().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], json!({"attributes": {"type": "Account"}, "Id": "0011", "Phone": "555"}));
        assert_eq!(sent[1]["Name"], "renamed");
        assert!(records.iter().all(|r| r.changed_keys().is_empty()));
    }

    #[tokio::test]
    async fn test_update_without_id() {
        let transport = MockTransport::new();
        let client = mock_client(&transport);
        let mut records = vec![account("new")];
        let result = client.update(&mut records, &SaveOptions::default()).await;
        assert!(matches!(result, Err(Error::MissingId { position: 0, .. })));
    }

    #[tokio::test]
    async fn test_partial_failures_are_data() {
        let transport = MockTransport::new();
        transport.push_json(
            200,
            json!([
                {"id": "0011", "success": true, "errors": []},
                {"success": false, "errors": [{"statusCode": "REQUIRED_FIELD_MISSING", "message": "Required fields are missing: [Name]", "fields": ["Name"]}]}
            ]),
        );
        let client = mock_client(&transport);
        let mut records = vec![loaded("Account", "0011"), loaded("Account", "0012")];
        records[1].set("Name", "");

        let results = client.update(&mut records, &SaveOptions::default()).await.unwrap();
        assert!(results[0].success);
        assert!(!results[1].success);
        assert_eq!(results[1].errors[0].status_code, "REQUIRED_FIELD_MISSING");
        assert_eq!(results[1].errors[0].fields, vec!["Name"]);
        // Failed records keep their pending changes.
        assert!(!records[1].changed_keys().is_empty());
    }

    #[tokio::test]
    async fn test_result_count_mismatch() {
        let transport = MockTransport::new();
        transport.push_json(200, json!([{"id": "0011", "success": true, "errors": []}]));
        let client = mock_client(&transport);
        let mut records = vec![loaded("Account", "0011"), loaded("Account", "0012")];

        let result = client.update(&mut records, &SaveOptions::default()).await;
        assert!(matches!(
            result,
            Err(Error::ResultCountMismatch { expected: 2, received: 1 })
        ));
    }

    #[tokio::test]
    async fn test_http_failure_names_dispatch_phase() {
        let transport = MockTransport::new();
        transport.push_json(500, json!([{"errorCode": "UNKNOWN_EXCEPTION"}]));
        let client = mock_client(&transport);
        let mut records = vec![loaded("Account", "0011")];

        let result = client.update(&mut records, &SaveOptions::default()).await;
        assert!(matches!(
            result,
            Err(Error::Dispatch { source: client::Error::Api { status: 500, .. } })
        ));
    }

    #[tokio::test]
    async fn test_upsert_request_shape() {
        let transport = MockTransport::new();
        transport.push_json(
            200,
            json!([{"id": "001A", "success": true, "errors": [], "created": true}]),
        );
        let client = mock_client(&transport);
        let mut records = vec![account("a").with("Ext__c", "X-1")];

        let results = client
            .upsert(&mut records, "Ext__c", &SaveOptions::default())
            .await
            .unwrap();
        assert_eq!(results[0].created, Some(true));
        assert_eq!(records[0].id().as_deref(), Some("001A"));

        let request = &transport.requests()[0];
        assert_eq!(request.method, Method::PATCH);
        assert!(request.url.ends_with("/composite/sobjects/Account/Ext__c"));
    }

    #[tokio::test]
    async fn test_upsert_requires_external_id() {
        let transport = MockTransport::new();
        let client = mock_client(&transport);
        let mut records = vec![account("a")];
        let result = client
            .upsert(&mut records, "Ext__c", &SaveOptions::default())
            .await;
        assert!(matches!(result, Err(Error::MissingExternalId { .. })));
    }

    #[tokio::test]
    async fn test_delete_with_clear_id() {
        let transport = collection_server();
        let client = mock_client(&transport);
        let mut records = vec![loaded("Account", "0011"), loaded("Account", "0012")];

        let options = SaveOptions {
            clear_id: true,
            all_or_none: true,
            ..Default::default()
        };
        let results = client.delete(&mut records, &options).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(records.iter().all(|r| r.id().is_none()));

        let request = &transport.requests()[0];
        assert_eq!(request.method, Method::DELETE);
        assert!(request.url.ends_with("/composite/sobjects?ids=0011%2C0012&allOrNone=true"));
    }

    #[tokio::test]
    async fn test_delete_without_id() {
        let transport = MockTransport::new();
        let client = mock_client(&transport);
        let mut records = vec![account("a")];
        let result = client.delete(&mut records, &SaveOptions::default()).await;
        assert!(matches!(result, Err(Error::MissingId { .. })));
    }

    #[tokio::test]
    async fn test_save_routes_mixed_input_in_order() {
        let transport = collection_server();
        let client = mock_client(&transport);
        let mut records = vec![
            account("new-1"),
            loaded("Account", "001X"),
            account("new-2"),
            loaded("Account", "001Y"),
        ];

        let results = client.save(&mut records, &SaveOptions::default()).await.unwrap();

        assert_eq!(results.len(), 4);
        assert_eq!(results[1].id.as_deref(), Some("001X"));
        assert_eq!(results[3].id.as_deref(), Some("001Y"));
        assert!(results[0].id.as_deref().unwrap().starts_with("001000"));
        assert!(records.iter().all(|r| r.id().is_some()));

        let methods: Vec<_> = transport.requests().iter().map(|r| r.method.clone()).collect();
        assert_eq!(methods, vec![Method::PATCH, Method::POST]);
    }

    #[tokio::test]
    async fn test_save_update_only() {
        let transport = MockTransport::new();
        let client = mock_client(&transport);
        let mut records = vec![loaded("Account", "001X"), account("new")];
        let options = SaveOptions {
            update_only: true,
            ..Default::default()
        };
        let result = client.save(&mut records, &options).await;
        assert!(matches!(result, Err(Error::MissingId { position: 1, .. })));
    }

    #[tokio::test]
    async fn test_save_upserts_by_external_id() {
        let transport = collection_server();
        let client = mock_client(&transport);
        let mut records = vec![
            loaded("Account", "001X").with("Ext__c", "E-1"),
            account("b").with("Ext__c", "E-2"),
        ];
        let options = SaveOptions {
            external_id_field: Some("Ext__c".to_string()),
            ..Default::default()
        };
        let results = client.save(&mut records, &options).await.unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id.as_deref(), Some("001X"));
        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method, Method::PATCH);
        assert!(requests[0].url.ends_with("/composite/sobjects/Account/Ext__c"));
    }

    #[test]
    fn test_route_save_external_id_wins_over_id() {
        let records = vec![loaded("Account", "001X").with("Ext__c", "E-1")];
        let options = SaveOptions {
            external_id_field: Some("Ext__c".to_string()),
            ..Default::default()
        };
        let routes = route_save(&records, &options).unwrap();
        assert_eq!(routes.len(), 1);
        assert!(matches!(
            &routes[0].0,
            Operation::Upsert { external_id_field } if external_id_field == "Ext__c"
        ));
        assert_eq!(routes[0].1, vec![0]);
    }

    #[tokio::test]
    async fn test_save_rejects_missing_external_id() {
        let transport = MockTransport::new();
        let client = mock_client(&transport);
        let mut records = vec![
            account("a").with("Ext__c", "E-1"),
            loaded("Account", "001Y").with("Ext__c", Value::Null),
        ];
        let options = SaveOptions {
            external_id_field: Some("Ext__c".to_string()),
            ..Default::default()
        };
        let result = client.save(&mut records, &options).await;
        assert!(matches!(
            result,
            Err(Error::MissingExternalId { position: 1, ref field }) if field == "Ext__c"
        ));
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_concurrency_limit_respected() {
        let transport = collection_server().delayed(Duration::from_millis(20));
        let client = mock_client(&transport);
        let mut records: Vec<_> = (0..10).map(|i| loaded("Account", &format!("001{i}"))).collect();

        let options = SaveOptions {
            batch_size: 1,
            concurrency: 3,
            ..Default::default()
        };
        client.update(&mut records, &options).await.unwrap();
        assert_eq!(transport.requests().len(), 10);
        assert!(transport.max_in_flight() <= 3);
        assert!(transport.max_in_flight() >= 2);
    }

    #[tokio::test]
    async fn test_empty_input() {
        let transport = MockTransport::new();
        let client = mock_client(&transport);
        let mut records: Vec<SObject> = Vec::new();
        let results = client.update(&mut records, &SaveOptions::default()).await.unwrap();
        assert!(results.is_empty());
        assert!(transport.requests().is_empty());
    }

    #[test]
    fn test_save_result_serde() {
        let result: SaveResult =
            serde_json::from_value(json!({"id": "001", "success": true, "errors": []})).unwrap();
        assert_eq!(result, SaveResult::unchanged(Some("001".to_string())));
        assert!(!serde_json::to_string(&result).unwrap().contains("created"));
    }
}
