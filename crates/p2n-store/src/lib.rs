//! Sync ledger persistence and destination (Notion) transport.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "p2n-store";

/// Notion's content block length limit, with headroom.
pub const BLOCK_CHUNK_LEN: usize = 1800;

/// Hard cap on blocks written to one page, for pathologically long
/// transcripts.
pub const MAX_BLOCKS_PER_PAGE: usize = 40;

// ---------------------------------------------------------------------------
// Sync ledger

/// Identities already written to the destination at least once. Grows
/// monotonically; the only state that outlives a run.
#[derive(Debug, Clone, Default)]
pub struct SyncLedger {
    ids: BTreeSet<String>,
}

/// Current on-disk shape. A bare array of identity strings is also accepted
/// as a legacy shape on read.
#[derive(Debug, Serialize, Deserialize)]
struct LedgerFile {
    ids: Vec<String>,
    #[serde(rename = "updatedAt", skip_serializing_if = "Option::is_none")]
    updated_at: Option<DateTime<Utc>>,
}

impl SyncLedger {
    /// Loads the ledger, returning an empty set for a missing, empty, or
    /// malformed file. A first run must not fail on absent state.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let Ok(text) = std::fs::read_to_string(path) else {
            return Self::default();
        };
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Self::default();
        }
        if let Ok(ids) = serde_json::from_str::<Vec<String>>(trimmed) {
            return Self {
                ids: ids.into_iter().collect(),
            };
        }
        if let Ok(file) = serde_json::from_str::<LedgerFile>(trimmed) {
            return Self {
                ids: file.ids.into_iter().collect(),
            };
        }
        debug!(path = %path.display(), "ledger file unreadable, starting empty");
        Self::default()
    }

    /// Persists the ledger as a sorted array via atomic temp-file rename,
    /// so a crash mid-save never truncates previous state.
    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        let file = LedgerFile {
            ids: self.ids.iter().cloned().collect(),
            updated_at: Some(Utc::now()),
        };
        let bytes = serde_json::to_vec_pretty(&file).context("serializing ledger")?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
        }
        let temp_path: PathBuf = path.with_extension(format!("tmp.{}", Uuid::new_v4()));
        std::fs::write(&temp_path, &bytes)
            .with_context(|| format!("writing {}", temp_path.display()))?;
        std::fs::rename(&temp_path, path).with_context(|| {
            format!("renaming {} -> {}", temp_path.display(), path.display())
        })?;
        Ok(())
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.ids.contains(identity)
    }

    /// Identities are never removed, even if their content later
    /// disqualifies them.
    pub fn insert(&mut self, identity: impl Into<String>) -> bool {
        self.ids.insert(identity.into())
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Destination model

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropertyKind {
    Title,
    Date,
    RichText,
    Url,
    Select,
    Other(String),
}

impl PropertyKind {
    pub fn from_notion(kind: &str) -> Self {
        match kind {
            "title" => Self::Title,
            "date" => Self::Date,
            "rich_text" => Self::RichText,
            "url" => Self::Url,
            "select" => Self::Select,
            other => Self::Other(other.to_string()),
        }
    }
}

/// Property name -> kind, read once per run. The source of truth for what
/// may be written.
pub type DestinationSchema = BTreeMap<String, PropertyKind>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRef {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Title(String),
    RichText(String),
    Url(String),
    Date(DateTime<Utc>),
    Select(String),
}

impl PropertyValue {
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Title(s) | Self::RichText(s) | Self::Url(s) | Self::Select(s) => Some(s),
            Self::Date(_) => None,
        }
    }
}

pub type PropertyPayload = BTreeMap<String, PropertyValue>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentBlock {
    Heading(String),
    Paragraph(String),
}

/// Dedup lookup request. `fragment` is either the `plaud:<identity>`
/// marker prefix (rich-text contains) or the full deep link (url equals).
#[derive(Debug, Clone)]
pub struct MarkerQuery {
    pub property: String,
    pub kind: PropertyKind,
    pub fragment: String,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("destination schema mismatch: {0}")]
    SchemaMismatch(String),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("unexpected response shape: {0}")]
    Shape(String),
}

impl StoreError {
    pub fn is_schema_mismatch(&self) -> bool {
        matches!(self, Self::SchemaMismatch(_))
    }
}

/// The destination knowledge base, seen as a set of fallible remote calls.
/// The reconciler never issues raw network calls itself.
#[async_trait]
pub trait DestinationStore: Send + Sync {
    async fn schema(&self) -> Result<DestinationSchema, StoreError>;
    async fn find_by_marker(&self, query: &MarkerQuery) -> Result<Option<PageRef>, StoreError>;
    async fn create_page(
        &self,
        properties: &PropertyPayload,
        blocks: &[ContentBlock],
    ) -> Result<PageRef, StoreError>;
    async fn update_properties(
        &self,
        page: &PageRef,
        properties: &PropertyPayload,
    ) -> Result<(), StoreError>;
    async fn block_count(&self, page: &PageRef) -> Result<usize, StoreError>;
    async fn append_blocks(&self, page: &PageRef, blocks: &[ContentBlock])
        -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// Retry discipline

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
            base_delay: Duration::from_millis(300),
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

// ---------------------------------------------------------------------------
// Notion client

#[derive(Debug, Clone)]
pub struct NotionConfig {
    pub token: String,
    pub database_id: String,
    pub api_base: String,
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl NotionConfig {
    pub fn new(token: impl Into<String>, database_id: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            database_id: database_id.into(),
            api_base: "https://api.notion.com/v1".to_string(),
            timeout: Duration::from_secs(20),
            backoff: BackoffPolicy::default(),
        }
    }
}

const NOTION_VERSION: &str = "2022-06-28";

pub struct NotionClient {
    client: reqwest::Client,
    config: NotionConfig,
}

impl NotionClient {
    pub fn new(config: NotionConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()
            .context("building reqwest client")?;
        Ok(Self { client, config })
    }

    async fn send_json(
        &self,
        method: Method,
        url: String,
        body: Option<&JsonValue>,
    ) -> Result<JsonValue, StoreError> {
        let backoff = self.config.backoff;
        let mut last_error: Option<StoreError> = None;

        for attempt in 0..=backoff.max_retries {
            let mut request = self
                .client
                .request(method.clone(), &url)
                .bearer_auth(&self.config.token)
                .header("Notion-Version", NOTION_VERSION);
            if let Some(body) = body {
                request = request.json(body);
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return resp.json::<JsonValue>().await.map_err(StoreError::from);
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < backoff.max_retries
                    {
                        debug!(%url, %status, attempt, "retrying destination call");
                        tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                        last_error = Some(StoreError::HttpStatus {
                            status: status.as_u16(),
                            url: url.clone(),
                        });
                        continue;
                    }
                    if status == StatusCode::BAD_REQUEST {
                        // Notion rejects filters naming absent properties
                        // with a validation error; surface that as a schema
                        // mismatch so lookups can fail open.
                        let text = resp.text().await.unwrap_or_default();
                        return Err(StoreError::SchemaMismatch(text));
                    }
                    return Err(StoreError::HttpStatus {
                        status: status.as_u16(),
                        url,
                    });
                }
                Err(err) => {
                    let retryable = err.is_timeout() || err.is_connect() || err.is_request();
                    if retryable && attempt < backoff.max_retries {
                        tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                        last_error = Some(StoreError::Request(err));
                        continue;
                    }
                    return Err(StoreError::Request(err));
                }
            }
        }

        Err(last_error.unwrap_or(StoreError::Shape("retry loop exhausted".into())))
    }
}

pub fn property_to_json(value: &PropertyValue) -> JsonValue {
    match value {
        PropertyValue::Title(s) => json!({"title": [{"text": {"content": s}}]}),
        PropertyValue::RichText(s) => json!({"rich_text": [{"text": {"content": s}}]}),
        PropertyValue::Url(s) => json!({"url": s}),
        PropertyValue::Date(dt) => json!({"date": {"start": dt.to_rfc3339()}}),
        PropertyValue::Select(s) => json!({"select": {"name": s}}),
    }
}

pub fn properties_to_json(properties: &PropertyPayload) -> JsonValue {
    let mut map = serde_json::Map::new();
    for (name, value) in properties {
        map.insert(name.clone(), property_to_json(value));
    }
    JsonValue::Object(map)
}

pub fn blocks_to_json(blocks: &[ContentBlock]) -> JsonValue {
    let children: Vec<JsonValue> = blocks
        .iter()
        .map(|block| match block {
            ContentBlock::Heading(text) => json!({
                "object": "block",
                "type": "heading_2",
                "heading_2": {"rich_text": [{"text": {"content": text}}]},
            }),
            ContentBlock::Paragraph(text) => json!({
                "object": "block",
                "type": "paragraph",
                "paragraph": {"rich_text": [{"text": {"content": text}}]},
            }),
        })
        .collect();
    JsonValue::Array(children)
}

#[async_trait]
impl DestinationStore for NotionClient {
    async fn schema(&self) -> Result<DestinationSchema, StoreError> {
        let url = format!("{}/databases/{}", self.config.api_base, self.config.database_id);
        let body = self.send_json(Method::GET, url, None).await?;
        let properties = body
            .get("properties")
            .and_then(|v| v.as_object())
            .ok_or_else(|| StoreError::Shape("database response missing properties".into()))?;

        let mut schema = DestinationSchema::new();
        for (name, prop) in properties {
            let kind = prop
                .get("type")
                .and_then(|v| v.as_str())
                .map(PropertyKind::from_notion)
                .unwrap_or(PropertyKind::Other("unknown".into()));
            schema.insert(name.clone(), kind);
        }
        Ok(schema)
    }

    async fn find_by_marker(&self, query: &MarkerQuery) -> Result<Option<PageRef>, StoreError> {
        let filter = match query.kind {
            PropertyKind::Url => json!({
                "property": query.property,
                "url": {"equals": query.fragment},
            }),
            _ => json!({
                "property": query.property,
                "rich_text": {"contains": query.fragment},
            }),
        };
        let url = format!(
            "{}/databases/{}/query",
            self.config.api_base, self.config.database_id
        );
        let body = json!({"filter": filter, "page_size": 1});
        let response = self.send_json(Method::POST, url, Some(&body)).await?;
        let first = response
            .get("results")
            .and_then(|v| v.as_array())
            .and_then(|results| results.first());
        Ok(first
            .and_then(|page| page.get("id"))
            .and_then(|id| id.as_str())
            .map(|id| PageRef { id: id.to_string() }))
    }

    async fn create_page(
        &self,
        properties: &PropertyPayload,
        blocks: &[ContentBlock],
    ) -> Result<PageRef, StoreError> {
        let url = format!("{}/pages", self.config.api_base);
        let body = json!({
            "parent": {"database_id": self.config.database_id},
            "properties": properties_to_json(properties),
            "children": blocks_to_json(blocks),
        });
        let response = self.send_json(Method::POST, url, Some(&body)).await?;
        response
            .get("id")
            .and_then(|id| id.as_str())
            .map(|id| PageRef { id: id.to_string() })
            .ok_or_else(|| StoreError::Shape("created page has no id".into()))
    }

    async fn update_properties(
        &self,
        page: &PageRef,
        properties: &PropertyPayload,
    ) -> Result<(), StoreError> {
        let url = format!("{}/pages/{}", self.config.api_base, page.id);
        let body = json!({"properties": properties_to_json(properties)});
        self.send_json(Method::PATCH, url, Some(&body)).await?;
        Ok(())
    }

    async fn block_count(&self, page: &PageRef) -> Result<usize, StoreError> {
        let url = format!(
            "{}/blocks/{}/children?page_size=10",
            self.config.api_base, page.id
        );
        let response = self.send_json(Method::GET, url, None).await?;
        Ok(response
            .get("results")
            .and_then(|v| v.as_array())
            .map(|r| r.len())
            .unwrap_or(0))
    }

    async fn append_blocks(
        &self,
        page: &PageRef,
        blocks: &[ContentBlock],
    ) -> Result<(), StoreError> {
        let url = format!("{}/blocks/{}/children", self.config.api_base, page.id);
        let body = json!({"children": blocks_to_json(blocks)});
        self.send_json(Method::PATCH, url, Some(&body)).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory destination (dry runs + tests)

#[derive(Debug, Clone)]
pub struct MemoryPage {
    pub page: PageRef,
    pub properties: PropertyPayload,
    pub blocks: Vec<ContentBlock>,
}

#[derive(Debug, Default)]
struct MemoryState {
    pages: Vec<MemoryPage>,
    next_id: usize,
}

/// Destination double backed by a vec of pages. Used by `--dry-run` and by
/// the reconciler tests; enforces the same schema rules as the real store.
pub struct MemoryDestination {
    schema: DestinationSchema,
    state: Mutex<MemoryState>,
}

impl MemoryDestination {
    pub fn new(schema: DestinationSchema) -> Self {
        Self {
            schema,
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// Schema matching a stock destination database.
    pub fn with_default_schema() -> Self {
        let mut schema = DestinationSchema::new();
        schema.insert("Name".into(), PropertyKind::Title);
        schema.insert("Created".into(), PropertyKind::Date);
        schema.insert("Source".into(), PropertyKind::RichText);
        schema.insert("Summary".into(), PropertyKind::RichText);
        Self::new(schema)
    }

    pub fn pages(&self) -> Vec<MemoryPage> {
        self.state.lock().expect("memory destination lock").pages.clone()
    }

    pub fn page_count(&self) -> usize {
        self.state.lock().expect("memory destination lock").pages.len()
    }
}

#[async_trait]
impl DestinationStore for MemoryDestination {
    async fn schema(&self) -> Result<DestinationSchema, StoreError> {
        Ok(self.schema.clone())
    }

    async fn find_by_marker(&self, query: &MarkerQuery) -> Result<Option<PageRef>, StoreError> {
        if !self.schema.contains_key(&query.property) {
            return Err(StoreError::SchemaMismatch(format!(
                "no property named {}",
                query.property
            )));
        }
        let state = self.state.lock().expect("memory destination lock");
        for page in &state.pages {
            let Some(value) = page.properties.get(&query.property) else {
                continue;
            };
            let Some(text) = value.text() else { continue };
            let hit = match query.kind {
                PropertyKind::Url => text == query.fragment,
                _ => text.contains(&query.fragment),
            };
            if hit {
                return Ok(Some(page.page.clone()));
            }
        }
        Ok(None)
    }

    async fn create_page(
        &self,
        properties: &PropertyPayload,
        blocks: &[ContentBlock],
    ) -> Result<PageRef, StoreError> {
        for name in properties.keys() {
            if !self.schema.contains_key(name) {
                return Err(StoreError::SchemaMismatch(format!(
                    "create references unknown property {name}"
                )));
            }
        }
        let mut state = self.state.lock().expect("memory destination lock");
        state.next_id += 1;
        let page = PageRef {
            id: format!("page-{}", state.next_id),
        };
        state.pages.push(MemoryPage {
            page: page.clone(),
            properties: properties.clone(),
            blocks: blocks.to_vec(),
        });
        Ok(page)
    }

    async fn update_properties(
        &self,
        page: &PageRef,
        properties: &PropertyPayload,
    ) -> Result<(), StoreError> {
        for name in properties.keys() {
            if !self.schema.contains_key(name) {
                return Err(StoreError::SchemaMismatch(format!(
                    "update references unknown property {name}"
                )));
            }
        }
        let mut state = self.state.lock().expect("memory destination lock");
        let Some(existing) = state.pages.iter_mut().find(|p| p.page == *page) else {
            return Err(StoreError::Shape(format!("no page {}", page.id)));
        };
        for (name, value) in properties {
            existing.properties.insert(name.clone(), value.clone());
        }
        Ok(())
    }

    async fn block_count(&self, page: &PageRef) -> Result<usize, StoreError> {
        let state = self.state.lock().expect("memory destination lock");
        state
            .pages
            .iter()
            .find(|p| p.page == *page)
            .map(|p| p.blocks.len())
            .ok_or_else(|| StoreError::Shape(format!("no page {}", page.id)))
    }

    async fn append_blocks(
        &self,
        page: &PageRef,
        blocks: &[ContentBlock],
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().expect("memory destination lock");
        let Some(existing) = state.pages.iter_mut().find(|p| p.page == *page) else {
            return Err(StoreError::Shape(format!("no page {}", page.id)));
        };
        existing.blocks.extend(blocks.iter().cloned());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_ledger_file_loads_empty() {
        let dir = tempdir().expect("tempdir");
        let ledger = SyncLedger::load(dir.path().join("nope.json"));
        assert!(ledger.is_empty());
    }

    #[test]
    fn malformed_ledger_file_loads_empty() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("ledger.json");
        std::fs::write(&path, "{not json").expect("write");
        assert!(SyncLedger::load(&path).is_empty());
        std::fs::write(&path, "").expect("write");
        assert!(SyncLedger::load(&path).is_empty());
    }

    #[test]
    fn legacy_bare_array_shape_is_accepted() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("ledger.json");
        std::fs::write(&path, r#"["b", "a"]"#).expect("write");
        let ledger = SyncLedger::load(&path);
        assert!(ledger.contains("a"));
        assert!(ledger.contains("b"));
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn save_writes_sorted_ids_and_reloads() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("ledger.json");
        let mut ledger = SyncLedger::default();
        ledger.insert("zeta");
        ledger.insert("alpha");
        ledger.insert("mid");
        ledger.save(&path).expect("save");

        let text = std::fs::read_to_string(&path).expect("read");
        let file: LedgerFile = serde_json::from_str(&text).expect("parse");
        assert_eq!(file.ids, vec!["alpha", "mid", "zeta"]);
        assert!(file.updated_at.is_some());

        let reloaded = SyncLedger::load(&path);
        assert_eq!(reloaded.len(), 3);
        assert!(reloaded.contains("zeta"));
    }

    #[test]
    fn property_kind_mapping_covers_notion_names() {
        assert_eq!(PropertyKind::from_notion("title"), PropertyKind::Title);
        assert_eq!(PropertyKind::from_notion("rich_text"), PropertyKind::RichText);
        assert_eq!(PropertyKind::from_notion("url"), PropertyKind::Url);
        assert_eq!(PropertyKind::from_notion("date"), PropertyKind::Date);
        assert_eq!(
            PropertyKind::from_notion("multi_select"),
            PropertyKind::Other("multi_select".into())
        );
    }

    #[test]
    fn property_json_shapes() {
        let title = property_to_json(&PropertyValue::Title("Weekly Sync".into()));
        assert_eq!(title["title"][0]["text"]["content"], "Weekly Sync");
        let url = property_to_json(&PropertyValue::Url("https://x.test".into()));
        assert_eq!(url["url"], "https://x.test");
    }

    #[tokio::test]
    async fn memory_destination_create_find_update() {
        let dest = MemoryDestination::with_default_schema();
        let mut props = PropertyPayload::new();
        props.insert("Name".into(), PropertyValue::Title("A".into()));
        props.insert(
            "Source".into(),
            PropertyValue::RichText("plaud:abc | https://web.plaud.ai/recordings/abc".into()),
        );
        let page = dest
            .create_page(&props, &[ContentBlock::Paragraph("hello".into())])
            .await
            .expect("create");

        let query = MarkerQuery {
            property: "Source".into(),
            kind: PropertyKind::RichText,
            fragment: "plaud:abc".into(),
        };
        let found = dest.find_by_marker(&query).await.expect("find");
        assert_eq!(found, Some(page.clone()));

        let mut update = PropertyPayload::new();
        update.insert("Name".into(), PropertyValue::Title("B".into()));
        dest.update_properties(&page, &update).await.expect("update");
        assert_eq!(
            dest.pages()[0].properties.get("Name"),
            Some(&PropertyValue::Title("B".into()))
        );
        assert_eq!(dest.block_count(&page).await.expect("count"), 1);
    }

    #[tokio::test]
    async fn lookup_against_absent_property_is_schema_mismatch() {
        let dest = MemoryDestination::new(DestinationSchema::new());
        let query = MarkerQuery {
            property: "Source".into(),
            kind: PropertyKind::RichText,
            fragment: "plaud:abc".into(),
        };
        let err = dest.find_by_marker(&query).await.expect_err("must fail");
        assert!(err.is_schema_mismatch());
    }
}
