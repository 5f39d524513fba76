//! Source adapter and transform contracts, plus the adapters and the
//! field-mapping transform every integration is assembled from.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use mirror_core::{CanonicalRow, JobId, Scope, EXTERNAL_ID_KEY, INTERNAL_ID_KEY};
use mirror_storage::{FetchError, HttpFetcher};
use reqwest::Url;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "mirror-adapters";

/// One page of external records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub items: Vec<Value>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterContext {
    pub job_id: JobId,
    pub scope: Scope,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Paginated read access to one resource type of an external system.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn resource(&self) -> &str;

    async fn fetch_page(
        &self,
        ctx: &AdapterContext,
        cursor: Option<&str>,
    ) -> Result<Page, AdapterError>;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransformError {
    #[error("record {index}: missing external id at `{pointer}`")]
    MissingExternalId { index: usize, pointer: String },
    #[error("record {index}: required field `{field}` is missing at `{pointer}`")]
    MissingField {
        index: usize,
        field: String,
        pointer: String,
    },
    #[error("record {index}: {message}")]
    Invalid { index: usize, message: String },
}

/// Pure mapping from an external record to the canonical row shape.
pub trait RowTransform: Send + Sync {
    fn transform(
        &self,
        scope: &Scope,
        index: usize,
        record: &Value,
    ) -> Result<CanonicalRow, TransformError>;
}

/// Maps every record; the first bad record fails the whole batch.
pub fn transform_all(
    transform: &dyn RowTransform,
    scope: &Scope,
    records: &[Value],
) -> Result<Vec<CanonicalRow>, TransformError> {
    records
        .iter()
        .enumerate()
        .map(|(index, record)| transform.transform(scope, index, record))
        .collect()
}

/// Collapses repeated external ids, keeping the last occurrence in the slot of
/// the first. Every dropped duplicate is logged.
pub fn dedupe_by_external_id(resource: &str, rows: Vec<CanonicalRow>) -> Vec<CanonicalRow> {
    let mut slots: HashMap<String, usize> = HashMap::with_capacity(rows.len());
    let mut out: Vec<CanonicalRow> = Vec::with_capacity(rows.len());
    for row in rows {
        match slots.get(&row.external_id) {
            Some(&slot) => {
                warn!(resource, external_id = %row.external_id, "duplicate external id in snapshot; keeping last");
                out[slot] = row;
            }
            None => {
                slots.insert(row.external_id.clone(), out.len());
                out.push(row);
            }
        }
    }
    out
}

fn default_external_id_key() -> String {
    EXTERNAL_ID_KEY.to_string()
}

fn default_internal_id_key() -> String {
    INTERNAL_ID_KEY.to_string()
}

/// Where and how one resource type is mirrored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSchema {
    /// Logical name, used for checkpoint and metric keys.
    pub name: String,
    /// Row store table holding the mirror.
    pub table: String,
    #[serde(default = "default_external_id_key")]
    pub external_id_key: String,
    #[serde(default = "default_internal_id_key")]
    pub internal_id_key: String,
}

impl ResourceSchema {
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            external_id_key: default_external_id_key(),
            internal_id_key: default_internal_id_key(),
        }
    }
}

/// The adapter + transform + schema triple for one resource type.
#[derive(Clone)]
pub struct ResourceBinding {
    pub schema: ResourceSchema,
    pub adapter: Arc<dyn SourceAdapter>,
    pub transform: Arc<dyn RowTransform>,
}

/// An integration: every resource type synced for one source.
#[derive(Clone)]
pub struct Integration {
    pub source_id: String,
    pub display_name: String,
    pub resources: Vec<ResourceBinding>,
}

/// Declarative mapping from JSON pointers to canonical domain fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMapping {
    /// Pointer to the external id (string or number).
    pub external_id: String,
    /// Domain field name -> JSON pointer.
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    /// Domain fields that must resolve to a non-null value.
    #[serde(default)]
    pub required: Vec<String>,
    /// Copy the whole external record into `raw_metadata`.
    #[serde(default)]
    pub keep_raw: bool,
}

#[derive(Debug, Clone)]
pub struct FieldMapTransform {
    mapping: FieldMapping,
}

impl FieldMapTransform {
    pub fn new(mapping: FieldMapping) -> Self {
        Self { mapping }
    }
}

fn external_id_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

impl RowTransform for FieldMapTransform {
    fn transform(
        &self,
        scope: &Scope,
        index: usize,
        record: &Value,
    ) -> Result<CanonicalRow, TransformError> {
        if !record.is_object() {
            return Err(TransformError::Invalid {
                index,
                message: "record is not a JSON object".to_string(),
            });
        }

        let external_id = record
            .pointer(&self.mapping.external_id)
            .and_then(external_id_text)
            .ok_or_else(|| TransformError::MissingExternalId {
                index,
                pointer: self.mapping.external_id.clone(),
            })?;

        let mut row = CanonicalRow::new(scope, external_id);
        for (field, pointer) in &self.mapping.fields {
            let value = record.pointer(pointer).cloned().unwrap_or(Value::Null);
            if value.is_null() && self.mapping.required.contains(field) {
                return Err(TransformError::MissingField {
                    index,
                    field: field.clone(),
                    pointer: pointer.clone(),
                });
            }
            row.fields.insert(field.clone(), value);
        }
        if self.mapping.keep_raw {
            row.raw_metadata = Some(record.clone());
        }
        Ok(row)
    }
}

/// Serves pages from a fixture: cursors are page indexes.
#[derive(Debug, Clone)]
pub struct FixtureAdapter {
    resource: String,
    pages: Vec<Vec<Value>>,
}

#[derive(Debug, Clone, Deserialize)]
struct FixtureFile {
    pages: Vec<Vec<Value>>,
}

impl FixtureAdapter {
    pub fn from_pages(resource: impl Into<String>, pages: Vec<Vec<Value>>) -> Self {
        Self {
            resource: resource.into(),
            pages,
        }
    }

    pub fn load(resource: impl Into<String>, path: impl AsRef<Path>) -> Result<Self> {
        let file: FixtureFile = read_json_file(path)?;
        Ok(Self::from_pages(resource, file.pages))
    }
}

#[async_trait]
impl SourceAdapter for FixtureAdapter {
    fn resource(&self) -> &str {
        &self.resource
    }

    async fn fetch_page(
        &self,
        _ctx: &AdapterContext,
        cursor: Option<&str>,
    ) -> Result<Page, AdapterError> {
        let index = match cursor {
            None => 0,
            Some(c) => c.parse::<usize>().map_err(|_| {
                AdapterError::Message(format!("fixture cursor `{c}` is not a page index"))
            })?,
        };
        if self.pages.is_empty() && index == 0 {
            return Ok(Page::default());
        }
        let items = self.pages.get(index).cloned().ok_or_else(|| {
            AdapterError::Message(format!(
                "fixture for {} has no page {index}",
                self.resource
            ))
        })?;
        let next_cursor = (index + 1 < self.pages.len()).then(|| (index + 1).to_string());
        Ok(Page { items, next_cursor })
    }
}

/// Settings for a cursor-paginated JSON API resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonApiConfig {
    pub url: String,
    /// Pointer to the item array in each response.
    #[serde(default = "default_items_pointer")]
    pub items_pointer: String,
    /// Pointer to the next-page cursor; absent, null or empty ends the walk.
    #[serde(default = "default_next_cursor_pointer")]
    pub next_cursor_pointer: String,
    #[serde(default = "default_cursor_param")]
    pub cursor_param: String,
    /// Query parameter carrying the scope's site id, when the scope has one.
    #[serde(default)]
    pub site_param: Option<String>,
    /// Environment variable holding a bearer token.
    #[serde(default)]
    pub bearer_token_env: Option<String>,
}

fn default_items_pointer() -> String {
    "/data".to_string()
}

fn default_next_cursor_pointer() -> String {
    "/next_cursor".to_string()
}

fn default_cursor_param() -> String {
    "cursor".to_string()
}

pub struct JsonApiAdapter {
    resource: String,
    config: JsonApiConfig,
    http: Arc<HttpFetcher>,
}

impl JsonApiAdapter {
    pub fn new(resource: impl Into<String>, config: JsonApiConfig, http: Arc<HttpFetcher>) -> Self {
        Self {
            resource: resource.into(),
            config,
            http,
        }
    }

    pub fn page_url(&self, scope: &Scope, cursor: Option<&str>) -> Result<Url, AdapterError> {
        let mut url = Url::parse(&self.config.url)
            .map_err(|err| AdapterError::Message(format!("invalid url {}: {err}", self.config.url)))?;
        {
            let mut pairs = url.query_pairs_mut();
            if let (Some(param), Some(site_id)) = (&self.config.site_param, &scope.site_id) {
                pairs.append_pair(param, site_id);
            }
            if let Some(cursor) = cursor {
                pairs.append_pair(&self.config.cursor_param, cursor);
            }
        }
        // An untouched query serializer leaves a dangling `?`.
        if url.query() == Some("") {
            url.set_query(None);
        }
        Ok(url)
    }

    pub fn parse_page(&self, body: &Value) -> Result<Page, AdapterError> {
        let items = body
            .pointer(&self.config.items_pointer)
            .and_then(Value::as_array)
            .cloned()
            .ok_or_else(|| {
                AdapterError::Message(format!(
                    "{}: response has no item array at `{}`",
                    self.resource, self.config.items_pointer
                ))
            })?;
        let next_cursor = body
            .pointer(&self.config.next_cursor_pointer)
            .and_then(|value| match value {
                Value::String(s) if !s.is_empty() => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            });
        Ok(Page { items, next_cursor })
    }
}

#[async_trait]
impl SourceAdapter for JsonApiAdapter {
    fn resource(&self) -> &str {
        &self.resource
    }

    async fn fetch_page(
        &self,
        ctx: &AdapterContext,
        cursor: Option<&str>,
    ) -> Result<Page, AdapterError> {
        let url = self.page_url(&ctx.scope, cursor)?;
        let token = match &self.config.bearer_token_env {
            Some(var) => Some(std::env::var(var).with_context(|| format!("reading {var}"))?),
            None => None,
        };
        let body = self
            .http
            .get_json(ctx.job_id, &ctx.scope.source_id, url.as_str(), token.as_deref())
            .await?;
        self.parse_page(&body)
    }
}

/// Declarative adapter selection, as written in the connector registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdapterSpec {
    Fixture { path: PathBuf },
    JsonApi(JsonApiConfig),
}

/// Builds the adapter described by `spec`; fixture paths resolve against `base_dir`.
pub fn build_adapter(
    resource: &str,
    spec: &AdapterSpec,
    base_dir: &Path,
    http: &Arc<HttpFetcher>,
) -> Result<Arc<dyn SourceAdapter>> {
    match spec {
        AdapterSpec::Fixture { path } => {
            let path = base_dir.join(path);
            let adapter = FixtureAdapter::load(resource, &path)
                .with_context(|| format!("loading fixture adapter for {resource}"))?;
            Ok(Arc::new(adapter))
        }
        AdapterSpec::JsonApi(config) => Ok(Arc::new(JsonApiAdapter::new(
            resource,
            config.clone(),
            Arc::clone(http),
        ))),
    }
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}
