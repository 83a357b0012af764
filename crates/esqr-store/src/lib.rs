//! Collaborator ports for ESQ Relay (submission source, work queue, document
//! store, mail transport) plus the Postgres/HTTP adapters this deployment
//! ships and in-memory fakes for tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use esqr_core::{CellValue, FlatRecord, RawSubmission};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use sqlx::postgres::PgPoolOptions;
use sqlx::Row;
use thiserror::Error;
use tracing::{info_span, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "esqr-store";

// ---------------------------------------------------------------------------
// Submission source
// ---------------------------------------------------------------------------

/// Date restriction applied to a submission fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateFilter {
    All,
    Exact(NaiveDate),
    Range { start: NaiveDate, end: NaiveDate },
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("submission query failed: {0}")]
    Query(#[from] sqlx::Error),
}

/// Read-only view of the relational submission table. Rows with a null payload
/// or timestamp, unparseable JSON, or a purge marker never surface.
#[async_trait]
pub trait SubmissionSource: Send + Sync {
    /// Submissions for one form type, newest first.
    async fn fetch(
        &self,
        form_type: &str,
        filter: DateFilter,
    ) -> Result<Vec<RawSubmission>, SourceError>;
}

pub struct PgSubmissionSource {
    pool: sqlx::PgPool,
}

const SUBMISSION_QUERY: &str = "SELECT form_id, form_data, form_submitted_date \
     FROM forms \
     WHERE form_type = $1 \
       AND form_data IS NOT NULL \
       AND form_submitted_date IS NOT NULL";

impl PgSubmissionSource {
    pub async fn connect(database_url: &str) -> Result<Self, SourceError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SubmissionSource for PgSubmissionSource {
    async fn fetch(
        &self,
        form_type: &str,
        filter: DateFilter,
    ) -> Result<Vec<RawSubmission>, SourceError> {
        let span = info_span!("fetch_submissions", form_type, ?filter);
        let _guard = span.enter();

        let order = " ORDER BY form_submitted_date DESC";
        let rows = match filter {
            DateFilter::All => {
                sqlx::query(&format!("{SUBMISSION_QUERY}{order}"))
                    .bind(form_type)
                    .fetch_all(&self.pool)
                    .await?
            }
            DateFilter::Exact(date) => {
                sqlx::query(&format!(
                    "{SUBMISSION_QUERY} AND CAST(form_submitted_date AS date) = $2{order}"
                ))
                .bind(form_type)
                .bind(date)
                .fetch_all(&self.pool)
                .await?
            }
            DateFilter::Range { start, end } => {
                sqlx::query(&format!(
                    "{SUBMISSION_QUERY} AND CAST(form_submitted_date AS date) BETWEEN $2 AND $3{order}"
                ))
                .bind(form_type)
                .bind(start)
                .bind(end)
                .fetch_all(&self.pool)
                .await?
            }
        };

        let mut submissions = Vec::with_capacity(rows.len());
        for row in rows {
            let form_id: String = row.try_get("form_id")?;
            let form_data: String = row.try_get("form_data")?;
            let submitted_at: DateTime<Utc> = row.try_get("form_submitted_date")?;

            let payload: JsonValue = match serde_json::from_str(&form_data) {
                Ok(value) => value,
                Err(_) => {
                    warn!(%form_id, "invalid JSON in form_data, skipping row");
                    continue;
                }
            };

            let submission = RawSubmission {
                form_id,
                submitted_at,
                payload,
            };
            if submission.is_purged() {
                continue;
            }
            submissions.push(submission);
        }

        Ok(submissions)
    }
}

/// Fixed set of submissions keyed by form type, for tests and dry runs.
#[derive(Debug, Default)]
pub struct InMemorySubmissionSource {
    submissions: Vec<(String, RawSubmission)>,
}

impl InMemorySubmissionSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, form_type: &str, submission: RawSubmission) {
        self.submissions.push((form_type.to_string(), submission));
    }
}

#[async_trait]
impl SubmissionSource for InMemorySubmissionSource {
    async fn fetch(
        &self,
        form_type: &str,
        filter: DateFilter,
    ) -> Result<Vec<RawSubmission>, SourceError> {
        let mut matching: Vec<RawSubmission> = self
            .submissions
            .iter()
            .filter(|(ft, _)| ft == form_type)
            .map(|(_, s)| s.clone())
            .filter(|s| !s.is_purged())
            .filter(|s| {
                let date = s.submitted_at.date_naive();
                match filter {
                    DateFilter::All => true,
                    DateFilter::Exact(exact) => date == exact,
                    DateFilter::Range { start, end } => date >= start && date <= end,
                }
            })
            .collect();
        matching.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
        Ok(matching)
    }
}

// ---------------------------------------------------------------------------
// Work queue
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("queue response could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("unknown work item {0}")]
    UnknownItem(Uuid),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItemHandle {
    pub id: Uuid,
    pub reference: String,
    /// Set when a pending item with the same reference already existed and no
    /// new item was created.
    pub deduplicated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedItem {
    pub id: Uuid,
    pub reference: String,
    pub data: JsonValue,
}

/// Durable work-item queue. The reference is the dedup boundary: enqueueing a
/// reference that already has a pending item returns that item's handle with
/// `deduplicated` set instead of creating a second one.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn enqueue(&self, reference: &str, data: JsonValue) -> Result<WorkItemHandle, QueueError>;
    async fn pending(&self) -> Result<Vec<QueuedItem>, QueueError>;
    async fn complete(&self, id: Uuid) -> Result<(), QueueError>;
    /// Soft failure: the item is routed to manual handling, not retried here.
    async fn fail(&self, id: Uuid, reason: &str) -> Result<(), QueueError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemState {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
struct StoredItem {
    id: Uuid,
    reference: String,
    data: JsonValue,
    state: ItemState,
    failure: Option<String>,
}

#[derive(Debug, Default)]
pub struct InMemoryWorkQueue {
    items: Mutex<Vec<StoredItem>>,
}

impl InMemoryWorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn completed_references(&self) -> Vec<String> {
        self.items
            .lock()
            .expect("queue mutex poisoned")
            .iter()
            .filter(|item| item.state == ItemState::Completed)
            .map(|item| item.reference.clone())
            .collect()
    }

    pub fn failed_items(&self) -> Vec<(String, String)> {
        self.items
            .lock()
            .expect("queue mutex poisoned")
            .iter()
            .filter(|item| item.state == ItemState::Failed)
            .map(|item| {
                (
                    item.reference.clone(),
                    item.failure.clone().unwrap_or_default(),
                )
            })
            .collect()
    }
}

#[async_trait]
impl WorkQueue for InMemoryWorkQueue {
    async fn enqueue(&self, reference: &str, data: JsonValue) -> Result<WorkItemHandle, QueueError> {
        let mut items = self.items.lock().expect("queue mutex poisoned");
        if let Some(existing) = items
            .iter()
            .find(|item| item.state == ItemState::Pending && item.reference == reference)
        {
            return Ok(WorkItemHandle {
                id: existing.id,
                reference: existing.reference.clone(),
                deduplicated: true,
            });
        }

        let item = StoredItem {
            id: Uuid::new_v4(),
            reference: reference.to_string(),
            data,
            state: ItemState::Pending,
            failure: None,
        };
        let handle = WorkItemHandle {
            id: item.id,
            reference: item.reference.clone(),
            deduplicated: false,
        };
        items.push(item);
        Ok(handle)
    }

    async fn pending(&self) -> Result<Vec<QueuedItem>, QueueError> {
        Ok(self
            .items
            .lock()
            .expect("queue mutex poisoned")
            .iter()
            .filter(|item| item.state == ItemState::Pending)
            .map(|item| QueuedItem {
                id: item.id,
                reference: item.reference.clone(),
                data: item.data.clone(),
            })
            .collect())
    }

    async fn complete(&self, id: Uuid) -> Result<(), QueueError> {
        self.set_state(id, ItemState::Completed, None)
    }

    async fn fail(&self, id: Uuid, reason: &str) -> Result<(), QueueError> {
        self.set_state(id, ItemState::Failed, Some(reason.to_string()))
    }
}

impl InMemoryWorkQueue {
    fn set_state(
        &self,
        id: Uuid,
        state: ItemState,
        failure: Option<String>,
    ) -> Result<(), QueueError> {
        let mut items = self.items.lock().expect("queue mutex poisoned");
        let item = items
            .iter_mut()
            .find(|item| item.id == id)
            .ok_or(QueueError::UnknownItem(id))?;
        item.state = state;
        item.failure = failure;
        Ok(())
    }
}

/// Client for the automation server's queue REST facade.
pub struct HttpWorkQueue {
    api: ApiClient,
    queue_name: String,
}

impl HttpWorkQueue {
    pub fn new(base_url: &str, queue_name: &str, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            api: ApiClient::new(base_url, timeout)?,
            queue_name: queue_name.to_string(),
        })
    }

    fn items_url(&self, tail: &[&str]) -> Url {
        let mut segments: Vec<&str> = vec!["workqueues", &self.queue_name, "items"];
        segments.extend_from_slice(tail);
        self.api.endpoint(&segments)
    }
}

#[async_trait]
impl WorkQueue for HttpWorkQueue {
    async fn enqueue(&self, reference: &str, data: JsonValue) -> Result<WorkItemHandle, QueueError> {
        let url = self.items_url(&[]);
        let body = json!({ "reference": reference, "data": data });
        let response = self
            .api
            .execute(|client| client.post(url.clone()).json(&body))
            .await?;
        let handle = response.json::<WorkItemHandle>().await.map_err(HttpError::from)?;
        Ok(handle)
    }

    async fn pending(&self) -> Result<Vec<QueuedItem>, QueueError> {
        let url = self.items_url(&["pending"]);
        let response = self.api.execute(|client| client.get(url.clone())).await?;
        let items = response.json::<Vec<QueuedItem>>().await.map_err(HttpError::from)?;
        Ok(items)
    }

    async fn complete(&self, id: Uuid) -> Result<(), QueueError> {
        let id_segment = id.to_string();
        let url = self.items_url(&[id_segment.as_str(), "complete"]);
        self.api
            .execute(|client| client.post(url.clone()))
            .await?;
        Ok(())
    }

    async fn fail(&self, id: Uuid, reason: &str) -> Result<(), QueueError> {
        let id_segment = id.to_string();
        let url = self.items_url(&[id_segment.as_str(), "fail"]);
        let body = json!({ "reason": reason });
        self.api
            .execute(|client| client.post(url.clone()).json(&body))
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Document store
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("document store response could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("no such file {folder}/{name}")]
    NotFound { folder: String, name: String },
    #[error("tabular encode failed: {0}")]
    Tabular(#[from] csv::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortKey {
    pub key: String,
    pub ascending: bool,
}

/// Formatting pass applied to a tabular artifact after create or append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormatSpec {
    pub sort_keys: Vec<SortKey>,
    pub bold_rows: Vec<u32>,
    pub align_horizontal: String,
    pub align_vertical: String,
    pub column_width: u32,
    pub freeze_panes: String,
}

/// Folder-scoped document store holding the persistent tabular exports.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn list_files(&self, folder: &str) -> Result<Vec<FileEntry>, StoreError>;
    async fn fetch_file_bytes(&self, folder: &str, name: &str) -> Result<Vec<u8>, StoreError>;
    async fn upload_bytes(&self, folder: &str, name: &str, bytes: &[u8]) -> Result<(), StoreError>;
    async fn append_rows(
        &self,
        folder: &str,
        name: &str,
        sheet: &str,
        rows: &[FlatRecord],
    ) -> Result<(), StoreError>;
    async fn format_and_sort(
        &self,
        folder: &str,
        name: &str,
        sheet: &str,
        format: &FormatSpec,
    ) -> Result<(), StoreError>;
}

/// Document store kept in process memory. Tabular artifacts are CSV text, so
/// appended rows materialize into the stored bytes the same way the real
/// store's append does.
#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    files: Mutex<HashMap<(String, String), Vec<u8>>>,
    format_calls: Mutex<Vec<(String, FormatSpec)>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file_text(&self, folder: &str, name: &str) -> Option<String> {
        self.files
            .lock()
            .expect("store mutex poisoned")
            .get(&(folder.to_string(), name.to_string()))
            .map(|bytes| String::from_utf8_lossy(bytes).to_string())
    }

    pub fn format_calls(&self) -> Vec<(String, FormatSpec)> {
        self.format_calls
            .lock()
            .expect("store mutex poisoned")
            .clone()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn list_files(&self, folder: &str) -> Result<Vec<FileEntry>, StoreError> {
        let files = self.files.lock().expect("store mutex poisoned");
        let mut names: Vec<String> = files
            .keys()
            .filter(|(f, _)| f == folder)
            .map(|(_, name)| name.clone())
            .collect();
        names.sort();
        Ok(names.into_iter().map(|name| FileEntry { name }).collect())
    }

    async fn fetch_file_bytes(&self, folder: &str, name: &str) -> Result<Vec<u8>, StoreError> {
        self.files
            .lock()
            .expect("store mutex poisoned")
            .get(&(folder.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                folder: folder.to_string(),
                name: name.to_string(),
            })
    }

    async fn upload_bytes(&self, folder: &str, name: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.files
            .lock()
            .expect("store mutex poisoned")
            .insert((folder.to_string(), name.to_string()), bytes.to_vec());
        Ok(())
    }

    async fn append_rows(
        &self,
        folder: &str,
        name: &str,
        _sheet: &str,
        rows: &[FlatRecord],
    ) -> Result<(), StoreError> {
        let appended = encode_csv_rows(rows)?;
        let mut files = self.files.lock().expect("store mutex poisoned");
        let content = files
            .get_mut(&(folder.to_string(), name.to_string()))
            .ok_or_else(|| StoreError::NotFound {
                folder: folder.to_string(),
                name: name.to_string(),
            })?;
        if !content.is_empty() && !content.ends_with(b"\n") {
            content.push(b'\n');
        }
        content.extend_from_slice(&appended);
        Ok(())
    }

    async fn format_and_sort(
        &self,
        _folder: &str,
        name: &str,
        _sheet: &str,
        format: &FormatSpec,
    ) -> Result<(), StoreError> {
        self.format_calls
            .lock()
            .expect("store mutex poisoned")
            .push((name.to_string(), format.clone()));
        Ok(())
    }
}

/// Encode records as CSV lines without a header row.
fn encode_csv_rows(rows: &[FlatRecord]) -> Result<Vec<u8>, csv::Error> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    for row in rows {
        let fields: Vec<String> = row.iter().map(|(_, value)| value.render()).collect();
        writer.write_record(&fields)?;
    }
    writer
        .into_inner()
        .map_err(|err| csv::Error::from(err.into_error()))
}

/// Client for the document store's REST facade. Rows are keyed by column
/// label, so object field order does not matter to the receiving side.
pub struct HttpDocumentStore {
    api: ApiClient,
}

impl HttpDocumentStore {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            api: ApiClient::new(base_url, timeout)?,
        })
    }

    fn file_url(&self, folder: &str, tail: &[&str]) -> Url {
        let mut segments: Vec<&str> = vec!["folders", folder, "files"];
        segments.extend_from_slice(tail);
        self.api.endpoint(&segments)
    }
}

fn record_to_labelled_json(record: &FlatRecord) -> JsonValue {
    let mut object = serde_json::Map::new();
    for (label, value) in record.iter() {
        let cell = match value {
            CellValue::Number(n) => json!(n),
            CellValue::Text(s) => json!(s),
            CellValue::Empty => JsonValue::Null,
        };
        object.insert(label.to_string(), cell);
    }
    JsonValue::Object(object)
}

#[async_trait]
impl DocumentStore for HttpDocumentStore {
    async fn list_files(&self, folder: &str) -> Result<Vec<FileEntry>, StoreError> {
        let url = self.file_url(folder, &[]);
        let response = self.api.execute(|client| client.get(url.clone())).await?;
        let entries = response.json::<Vec<FileEntry>>().await.map_err(HttpError::from)?;
        Ok(entries)
    }

    async fn fetch_file_bytes(&self, folder: &str, name: &str) -> Result<Vec<u8>, StoreError> {
        let url = self.file_url(folder, &[name]);
        let response = self.api.execute(|client| client.get(url.clone())).await?;
        let bytes = response.bytes().await.map_err(HttpError::from)?;
        Ok(bytes.to_vec())
    }

    async fn upload_bytes(&self, folder: &str, name: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let url = self.file_url(folder, &[name]);
        let body = bytes.to_vec();
        self.api
            .execute(|client| client.put(url.clone()).body(body.clone()))
            .await?;
        Ok(())
    }

    async fn append_rows(
        &self,
        folder: &str,
        name: &str,
        sheet: &str,
        rows: &[FlatRecord],
    ) -> Result<(), StoreError> {
        let url = self.file_url(folder, &[name, "rows"]);
        let body = json!({
            "sheet": sheet,
            "rows": rows.iter().map(record_to_labelled_json).collect::<Vec<_>>(),
        });
        self.api
            .execute(|client| client.post(url.clone()).json(&body))
            .await?;
        Ok(())
    }

    async fn format_and_sort(
        &self,
        folder: &str,
        name: &str,
        sheet: &str,
        format: &FormatSpec,
    ) -> Result<(), StoreError> {
        let url = self.file_url(folder, &[name, "format"]);
        let body = json!({ "sheet": sheet, "format": format });
        self.api
            .execute(|client| client.post(url.clone()).json(&body))
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Mail transport
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum MailError {
    #[error("transport rejected message: {0}")]
    Rejected(String),
    #[error(transparent)]
    Http(#[from] HttpError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundEmail {
    pub to: String,
    pub from: String,
    pub subject: String,
    pub text_body: String,
    pub html_body: String,
}

/// Outbound email transport. Errors are soft: the consumer marks the work
/// item failed and moves on.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: &OutboundEmail) -> Result<(), MailError>;
}

/// Client for the mail relay facade; the relay owns the actual SMTP session,
/// so host and port ride along in the request.
pub struct HttpMailer {
    api: ApiClient,
    smtp_host: String,
    smtp_port: u16,
}

impl HttpMailer {
    pub fn new(
        base_url: &str,
        smtp_host: &str,
        smtp_port: u16,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            api: ApiClient::new(base_url, timeout)?,
            smtp_host: smtp_host.to_string(),
            smtp_port,
        })
    }
}

#[async_trait]
impl Mailer for HttpMailer {
    async fn send(&self, email: &OutboundEmail) -> Result<(), MailError> {
        let url = self.api.endpoint(&["send"]);
        let body = json!({
            "to": email.to,
            "from": email.from,
            "subject": email.subject,
            "text_body": email.text_body,
            "html_body": email.html_body,
            "smtp_host": self.smtp_host,
            "smtp_port": self.smtp_port,
        });
        self.api
            .execute(|client| client.post(url.clone()).json(&body))
            .await?;
        Ok(())
    }
}

/// Captures every send; optionally rejects configured recipients to exercise
/// the soft-failure path.
#[derive(Debug, Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<OutboundEmail>>,
    rejected: Mutex<Vec<String>>,
}

impl RecordingMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reject_recipient(&self, address: &str) {
        self.rejected
            .lock()
            .expect("mailer mutex poisoned")
            .push(address.to_string());
    }

    pub fn sent(&self) -> Vec<OutboundEmail> {
        self.sent.lock().expect("mailer mutex poisoned").clone()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, email: &OutboundEmail) -> Result<(), MailError> {
        let rejected = self.rejected.lock().expect("mailer mutex poisoned");
        if rejected.iter().any(|address| address == &email.to) {
            return Err(MailError::Rejected(format!(
                "mailbox {} rejected the message",
                email.to
            )));
        }
        drop(rejected);
        self.sent
            .lock()
            .expect("mailer mutex poisoned")
            .push(email.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Shared HTTP plumbing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_transport_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    Status { status: u16, url: String },
}

/// Base-URL-scoped REST client shared by the queue, document-store and mail
/// adapters. Retries retryable statuses and transport faults with capped
/// exponential backoff.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: Url,
    backoff: BackoffPolicy,
}

impl ApiClient {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(timeout)
            .build()
            .context("building http client")?;
        let base_url = Url::parse(base_url).with_context(|| format!("parsing base url {base_url}"))?;
        Ok(Self {
            client,
            base_url,
            backoff: BackoffPolicy::default(),
        })
    }

    /// Base URL joined with path segments; segments are percent-encoded, so
    /// file names with spaces survive.
    pub fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .expect("base url cannot be a base")
            .extend(segments);
        url
    }

    pub async fn execute(
        &self,
        build: impl Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, HttpError> {
        let mut last_transport_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match build(&self.client).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(HttpError::Status {
                        status: status.as_u16(),
                        url: response.url().to_string(),
                    });
                }
                Err(err) => {
                    if classify_transport_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_transport_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(HttpError::Request(err));
                }
            }
        }

        Err(HttpError::Request(
            last_transport_error.expect("retry loop should capture a transport error"),
        ))
    }
}
