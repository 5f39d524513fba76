//! Core domain model for connector mirror sync: scopes, jobs, canonical rows,
//! the row filter language and the shared error taxonomy.

use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "mirror-core";

pub const EXTERNAL_ID_KEY: &str = "external_id";
pub const INTERNAL_ID_KEY: &str = "id";
pub const SYNC_ID_KEY: &str = "sync_id";
pub const TENANT_ID_KEY: &str = "tenant_id";
pub const SOURCE_ID_KEY: &str = "source_id";
pub const SITE_ID_KEY: &str = "site_id";
pub const RAW_METADATA_KEY: &str = "raw_metadata";

/// Bookkeeping columns of every mirror row; domain fields may not reuse them.
pub const RESERVED_ROW_KEYS: [&str; 6] = [
    EXTERNAL_ID_KEY,
    SYNC_ID_KEY,
    TENANT_ID_KEY,
    SOURCE_ID_KEY,
    SITE_ID_KEY,
    RAW_METADATA_KEY,
];

pub fn is_reserved_key(key: &str) -> bool {
    RESERVED_ROW_KEYS.contains(&key)
}

/// Job-state keys under this prefix hold pagination checkpoints and are
/// carried from one job of a scope to the next.
pub const CHECKPOINT_STATE_PREFIX: &str = "checkpoint.";

/// A stored record: one JSON object per row.
pub type Row = Map<String, Value>;

/// Opaque per-job key/value state (checkpoints, metrics).
pub type JobState = BTreeMap<String, Value>;

/// Identifier of a sync job; doubles as the generation marker stamped on rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// The `(tenant_id, source_id, site_id?)` tuple identifying one logical mirror.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    pub tenant_id: String,
    pub source_id: String,
    #[serde(default)]
    pub site_id: Option<String>,
}

impl Scope {
    pub fn new(
        tenant_id: impl Into<String>,
        source_id: impl Into<String>,
        site_id: Option<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            source_id: source_id.into(),
            site_id,
        }
    }

    /// Stable textual key, used for locks and logs.
    pub fn key(&self) -> String {
        format!(
            "{}/{}/{}",
            self.tenant_id,
            self.source_id,
            self.site_id.as_deref().unwrap_or("-")
        )
    }

    /// Filter selecting exactly the rows that belong to this scope.
    pub fn filter(&self) -> Filter {
        let filter = Filter::new()
            .eq(TENANT_ID_KEY, self.tenant_id.as_str())
            .eq(SOURCE_ID_KEY, self.source_id.as_str());
        match &self.site_id {
            Some(site_id) => filter.eq(SITE_ID_KEY, site_id.as_str()),
            None => filter.is_null(SITE_ID_KEY),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(SyncError::Config(format!("unknown job status `{other}`"))),
        }
    }
}

/// One sync request. Consumed by exactly one pipeline run and kept for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: JobId,
    #[serde(flatten)]
    pub scope: Scope,
    pub status: JobStatus,
    #[serde(default)]
    pub state: JobState,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SyncJob {
    pub fn new_queued(scope: Scope, state: JobState, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            scope,
            status: JobStatus::Queued,
            state,
            error: None,
            created_at: now,
            started_at: None,
            completed_at: None,
        }
    }
}

/// Integration-agnostic row shape produced by a transform stage.
///
/// Domain fields are flattened next to the bookkeeping columns so the stored
/// record stays one flat object that filters can address directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRow {
    pub external_id: String,
    #[serde(default)]
    pub sync_id: Option<JobId>,
    pub tenant_id: String,
    pub source_id: String,
    #[serde(default)]
    pub site_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_metadata: Option<Value>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl CanonicalRow {
    pub fn new(scope: &Scope, external_id: impl Into<String>) -> Self {
        Self {
            external_id: external_id.into(),
            sync_id: None,
            tenant_id: scope.tenant_id.clone(),
            source_id: scope.source_id.clone(),
            site_id: scope.site_id.clone(),
            raw_metadata: None,
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn with_raw_metadata(mut self, raw: Value) -> Self {
        self.raw_metadata = Some(raw);
        self
    }

    /// Serializes the row flat. A domain field named after a bookkeeping
    /// column is refused rather than allowed to shadow it.
    pub fn into_row(self) -> Result<Row, SyncError> {
        if let Some(key) = self.fields.keys().find(|key| is_reserved_key(key)) {
            return Err(SyncError::Transform {
                resource: String::new(),
                message: format!("domain field `{key}` collides with a reserved column"),
            });
        }
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(other) => Err(SyncError::Transform {
                resource: String::new(),
                message: format!("canonical row serialized to non-object {other}"),
            }),
            Err(err) => Err(SyncError::Transform {
                resource: String::new(),
                message: err.to_string(),
            }),
        }
    }

    pub fn from_row(row: Row) -> Result<Self, SyncError> {
        serde_json::from_value(Value::Object(row)).map_err(|err| SyncError::Storage {
            context: "decoding canonical row".to_string(),
            message: err.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    Neq,
    In,
    NotIn,
    Ilike,
    Gt,
    Lt,
    IsNull,
    NotNull,
}

impl FilterOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Neq => "neq",
            Self::In => "in",
            Self::NotIn => "not.in",
            Self::Ilike => "ilike",
            Self::Gt => "gt",
            Self::Lt => "lt",
            Self::IsNull => "is",
            Self::NotNull => "not.is",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterClause {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl FilterClause {
    pub fn matches(&self, row: &Row) -> bool {
        let actual = row.get(&self.field).unwrap_or(&Value::Null);
        match self.op {
            FilterOp::IsNull => actual.is_null(),
            FilterOp::NotNull => !actual.is_null(),
            FilterOp::Eq => loose_eq(actual, &self.value),
            FilterOp::Neq => {
                !actual.is_null() && !self.value.is_null() && !loose_eq(actual, &self.value)
            }
            FilterOp::In => self
                .value
                .as_array()
                .is_some_and(|items| items.iter().any(|item| loose_eq(actual, item))),
            FilterOp::NotIn => {
                !actual.is_null()
                    && self
                        .value
                        .as_array()
                        .is_some_and(|items| !items.iter().any(|item| loose_eq(actual, item)))
            }
            FilterOp::Ilike => match (scalar_text(actual), scalar_text(&self.value)) {
                (Some(text), Some(pattern)) => ilike_match(&text, &pattern),
                _ => false,
            },
            FilterOp::Gt => ordered(actual, &self.value) == Some(Ordering::Greater),
            FilterOp::Lt => ordered(actual, &self.value) == Some(Ordering::Less),
        }
    }
}

/// Ordered list of `(field, op, value)` clauses, ANDed together.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Filter {
    pub clauses: Vec<FilterClause>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clause(mut self, field: impl Into<String>, op: FilterOp, value: Value) -> Self {
        self.clauses.push(FilterClause {
            field: field.into(),
            op,
            value,
        });
        self
    }

    pub fn eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clause(field, FilterOp::Eq, value.into())
    }

    pub fn neq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clause(field, FilterOp::Neq, value.into())
    }

    pub fn in_list<V: Into<Value>>(
        self,
        field: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        let list = values.into_iter().map(Into::into).collect();
        self.clause(field, FilterOp::In, Value::Array(list))
    }

    pub fn not_in<V: Into<Value>>(
        self,
        field: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        let list = values.into_iter().map(Into::into).collect();
        self.clause(field, FilterOp::NotIn, Value::Array(list))
    }

    pub fn ilike(self, field: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.clause(field, FilterOp::Ilike, Value::String(pattern.into()))
    }

    pub fn gt(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clause(field, FilterOp::Gt, value.into())
    }

    pub fn lt(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clause(field, FilterOp::Lt, value.into())
    }

    pub fn is_null(self, field: impl Into<String>) -> Self {
        self.clause(field, FilterOp::IsNull, Value::Null)
    }

    pub fn not_null(self, field: impl Into<String>) -> Self {
        self.clause(field, FilterOp::NotNull, Value::Null)
    }

    /// Appends every clause of `other` after this filter's clauses.
    pub fn and(mut self, other: Filter) -> Self {
        self.clauses.extend(other.clauses);
        self
    }

    pub fn matches(&self, row: &Row) -> bool {
        self.clauses.iter().all(|clause| clause.matches(row))
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, clause) in self.clauses.iter().enumerate() {
            if idx > 0 {
                f.write_str("&")?;
            }
            let value = match clause.op {
                FilterOp::IsNull | FilterOp::NotNull => "null".to_string(),
                FilterOp::In | FilterOp::NotIn => {
                    let items = clause
                        .value
                        .as_array()
                        .map(|items| {
                            items
                                .iter()
                                .map(|v| scalar_text(v).map(Cow::into_owned).unwrap_or_default())
                                .collect::<Vec<_>>()
                        })
                        .unwrap_or_default();
                    format!("({})", items.join(","))
                }
                _ => scalar_text(&clause.value)
                    .map(Cow::into_owned)
                    .unwrap_or_else(|| clause.value.to_string()),
            };
            write!(f, "{}={}.{}", clause.field, clause.op.as_str(), value)?;
        }
        Ok(())
    }
}

impl FromStr for Filter {
    type Err = SyncError;

    /// Parses the `field=op.value&...` text form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut filter = Filter::new();
        for part in s.split('&').map(str::trim).filter(|p| !p.is_empty()) {
            let (field, expr) = part
                .split_once('=')
                .ok_or_else(|| SyncError::Config(format!("filter clause `{part}` has no `=`")))?;
            let field = field.trim();
            if field.is_empty() {
                return Err(SyncError::Config(format!("filter clause `{part}` has no field")));
            }

            let (op, raw) = if let Some(rest) = expr.strip_prefix("not.in.") {
                (FilterOp::NotIn, rest)
            } else if let Some(rest) = expr.strip_prefix("not.is.") {
                (FilterOp::NotNull, rest)
            } else if let Some((op, rest)) = expr.split_once('.') {
                let op = match op {
                    "eq" => FilterOp::Eq,
                    "neq" => FilterOp::Neq,
                    "in" => FilterOp::In,
                    "ilike" => FilterOp::Ilike,
                    "gt" => FilterOp::Gt,
                    "lt" => FilterOp::Lt,
                    "is" => FilterOp::IsNull,
                    other => {
                        return Err(SyncError::Config(format!("unknown filter operator `{other}`")))
                    }
                };
                (op, rest)
            } else {
                return Err(SyncError::Config(format!("filter clause `{part}` has no operator")));
            };

            let value = match op {
                FilterOp::IsNull | FilterOp::NotNull => {
                    if raw != "null" {
                        return Err(SyncError::Config(format!(
                            "`is` filters only support null, got `{raw}`"
                        )));
                    }
                    Value::Null
                }
                FilterOp::In | FilterOp::NotIn => {
                    let inner = raw
                        .strip_prefix('(')
                        .and_then(|r| r.strip_suffix(')'))
                        .ok_or_else(|| {
                            SyncError::Config(format!("list value `{raw}` must be parenthesized"))
                        })?;
                    Value::Array(
                        inner
                            .split(',')
                            .map(str::trim)
                            .filter(|item| !item.is_empty())
                            .map(|item| Value::String(item.to_string()))
                            .collect(),
                    )
                }
                _ => Value::String(raw.to_string()),
            };
            filter = filter.clause(field, op, value);
        }
        Ok(filter)
    }
}

fn scalar_text(value: &Value) -> Option<Cow<'_, str>> {
    match value {
        Value::String(s) => Some(Cow::Borrowed(s.as_str())),
        Value::Number(n) => Some(Cow::Owned(n.to_string())),
        Value::Bool(b) => Some(Cow::Owned(b.to_string())),
        _ => None,
    }
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Array(_), _) | (Value::Object(_), _) => a == b,
        _ => match (scalar_text(a), scalar_text(b)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        },
    }
}

/// The number a `gt`/`lt` operand stands for: a JSON number or a string
/// holding a finite decimal. Row stores compare numerically whenever the
/// filter value has one, and textually otherwise.
pub fn comparison_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
        _ => None,
    }
}

fn ordered(actual: &Value, bound: &Value) -> Option<Ordering> {
    if actual.is_null() {
        return None;
    }
    match comparison_number(bound) {
        Some(bound) => comparison_number(actual)?.partial_cmp(&bound),
        None => Some(scalar_text(actual)?.as_ref().cmp(scalar_text(bound)?.as_ref())),
    }
}

/// Case-insensitive SQL `LIKE` with `%` and `_` wildcards.
pub fn ilike_match(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.to_lowercase().chars().collect();
    let pattern: Vec<char> = pattern.to_lowercase().chars().collect();

    // dp[j]: pattern[..i] matches text[..j]
    let mut dp = vec![false; text.len() + 1];
    dp[0] = true;
    for p in &pattern {
        let mut next = vec![false; text.len() + 1];
        match p {
            '%' => {
                let mut seen = false;
                for j in 0..=text.len() {
                    seen |= dp[j];
                    next[j] = seen;
                }
            }
            '_' => {
                for j in 1..=text.len() {
                    next[j] = dp[j - 1];
                }
            }
            c => {
                for j in 1..=text.len() {
                    next[j] = dp[j - 1] && text[j - 1] == *c;
                }
            }
        }
        dp = next;
    }
    dp[text.len()]
}

/// Error taxonomy shared by every stage of a sync run.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("adapter error ({resource}): {message}")]
    Adapter { resource: String, message: String },
    #[error("transform error ({resource}): {message}")]
    Transform { resource: String, message: String },
    #[error("storage error while {context}: {message}")]
    Storage { context: String, message: String },
    #[error("reconciliation invariant violated ({resource}): {message}")]
    ReconciliationInvariant { resource: String, message: String },
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },
    #[error("scope {0} already has a sync in progress")]
    ScopeBusy(String),
    #[error("scope conflict: {0}")]
    ScopeConflict(String),
    #[error("job {0} not found")]
    JobNotFound(JobId),
    #[error("job {id} cannot move from {from} to {to}")]
    JobState {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
    #[error("configuration error: {0}")]
    Config(String),
}

impl SyncError {
    pub fn adapter(resource: impl Into<String>, err: impl fmt::Display) -> Self {
        Self::Adapter {
            resource: resource.into(),
            message: err.to_string(),
        }
    }

    pub fn transform(resource: impl Into<String>, err: impl fmt::Display) -> Self {
        Self::Transform {
            resource: resource.into(),
            message: err.to_string(),
        }
    }

    pub fn storage(context: impl Into<String>, err: impl fmt::Display) -> Self {
        Self::Storage {
            context: context.into(),
            message: err.to_string(),
        }
    }

    pub fn invariant(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ReconciliationInvariant {
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// Short machine-friendly label for logs and job records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Adapter { .. } => "adapter",
            Self::Transform { .. } => "transform",
            Self::Storage { .. } => "storage",
            Self::ReconciliationInvariant { .. } => "reconciliation_invariant",
            Self::Timeout { .. } => "timeout",
            Self::ScopeBusy(_) => "scope_busy",
            Self::ScopeConflict(_) => "scope_conflict",
            Self::JobNotFound(_) => "job_not_found",
            Self::JobState { .. } => "job_state",
            Self::Config(_) => "config",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().cloned().expect("object")
    }

    #[test]
    fn comparisons_never_match_null_fields() {
        let r = row(json!({ "sync_id": null, "name": "Acme" }));
        assert!(!Filter::new().neq("sync_id", "job-1").matches(&r));
        assert!(!Filter::new().eq("sync_id", "job-1").matches(&r));
        assert!(!Filter::new().not_in("missing", ["a"]).matches(&r));
        assert!(Filter::new().is_null("sync_id").matches(&r));
        assert!(Filter::new().is_null("missing").matches(&r));
        assert!(Filter::new().not_null("name").matches(&r));
    }

    #[test]
    fn clauses_are_anded() {
        let r = row(json!({ "tenant_id": "t1", "seats": 12, "plan": "Enterprise" }));
        let filter = Filter::new()
            .eq("tenant_id", "t1")
            .gt("seats", 10)
            .in_list("plan", ["Enterprise", "Team"]);
        assert!(filter.matches(&r));
        assert!(!filter.clone().lt("seats", 5).matches(&r));
        assert!(!Filter::new().not_in("plan", ["Enterprise"]).matches(&r));
    }

    #[test]
    fn loose_comparison_accepts_text_numbers() {
        let r = row(json!({ "seats": 12 }));
        assert!(Filter::new().eq("seats", "12").matches(&r));
        assert!(Filter::new().gt("seats", "9.5").matches(&r));
        assert!(!Filter::new().lt("seats", "3").matches(&r));
    }

    #[test]
    fn numeric_bounds_compare_numerically_on_both_sides() {
        let text_seats = row(json!({ "seats": "12", "plan": "gold" }));
        assert!(Filter::new().gt("seats", "9.5").matches(&text_seats));
        assert!(Filter::new().gt("seats", 9.5).matches(&text_seats));
        assert!(Filter::new().lt("seats", "1e2").matches(&text_seats));

        let parsed: Filter = "seats=gt.9.5".parse().expect("parse");
        assert!(parsed.matches(&text_seats));

        // A numeric bound never matches a non-numeric value.
        assert!(!Filter::new().gt("plan", "1").matches(&text_seats));
        assert!(!Filter::new().lt("plan", "1").matches(&text_seats));
        // A non-numeric bound compares text.
        assert!(Filter::new().gt("plan", "bronze").matches(&text_seats));
        assert!(!Filter::new().gt("missing", "bronze").matches(&text_seats));

        assert_eq!(comparison_number(&json!(" 4.5 ")), Some(4.5));
        assert_eq!(comparison_number(&json!("NaN")), None);
        assert_eq!(comparison_number(&json!(true)), None);
    }

    #[test]
    fn ilike_supports_wildcards() {
        assert!(ilike_match("Acme Corporation", "acme%"));
        assert!(ilike_match("Acme", "_CME"));
        assert!(ilike_match("anything", "%"));
        assert!(!ilike_match("Acme", "acme_"));
        assert!(!ilike_match("Globex", "%acme%"));
    }

    #[test]
    fn text_filter_parses_and_renders() {
        let text = "tenant_id=eq.t1&plan=not.in.(free,trial)&site_id=is.null&name=ilike.%acme%";
        let filter: Filter = text.parse().expect("parse");
        assert_eq!(filter.clauses.len(), 4);
        assert_eq!(filter.clauses[1].op, FilterOp::NotIn);
        assert_eq!(filter.clauses[1].value, json!(["free", "trial"]));
        assert_eq!(filter.clauses[2].op, FilterOp::IsNull);
        assert_eq!(filter.to_string(), text);

        let not_null: Filter = "sync_id=not.is.null".parse().expect("parse");
        assert_eq!(not_null.clauses[0].op, FilterOp::NotNull);
        assert!("sync_id=bogus.1".parse::<Filter>().is_err());
        assert!("no-operator".parse::<Filter>().is_err());
    }

    #[test]
    fn scope_filter_pins_missing_site_to_null() {
        let scope = Scope::new("t1", "crm", None);
        let with_site = row(json!({ "tenant_id": "t1", "source_id": "crm", "site_id": "s1" }));
        let without_site = row(json!({ "tenant_id": "t1", "source_id": "crm" }));
        assert!(!scope.filter().matches(&with_site));
        assert!(scope.filter().matches(&without_site));
        assert_eq!(scope.key(), "t1/crm/-");
    }

    #[test]
    fn canonical_row_flattens_domain_fields() {
        let scope = Scope::new("t1", "billing", Some("s1".into()));
        let job = JobId::new();
        let mut canonical = CanonicalRow::new(&scope, "c-42")
            .with_field("name", "Gold plan")
            .with_raw_metadata(json!({ "vendor": { "tier": 3 } }));
        canonical.sync_id = Some(job);

        let stored = canonical.clone().into_row().expect("row");
        assert_eq!(stored["external_id"], json!("c-42"));
        assert_eq!(stored["name"], json!("Gold plan"));
        assert_eq!(stored["sync_id"], json!(job.to_string()));
        assert_eq!(CanonicalRow::from_row(stored).expect("decode"), canonical);
    }

    #[test]
    fn domain_fields_cannot_shadow_bookkeeping_columns() {
        let scope = Scope::new("t1", "billing", None);
        for key in RESERVED_ROW_KEYS {
            let err = CanonicalRow::new(&scope, "u1")
                .with_field(key, "Ann")
                .into_row()
                .expect_err("reserved");
            assert!(err.to_string().contains(key), "{err}");
        }
        assert!(CanonicalRow::new(&scope, "u1").with_field("id", "x").into_row().is_ok());
    }

    #[test]
    fn job_status_round_trips_text() {
        for status in [
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().expect("status"), status);
        }
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }
}
