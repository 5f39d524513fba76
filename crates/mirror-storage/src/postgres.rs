//! Postgres-backed row store and job supervisor.
//!
//! Mirror rows live in one JSONB table keyed by resource; filters are rendered
//! against `data->>field` with every field name and value bound as a parameter.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mirror_core::{
    comparison_number, Filter, FilterOp, JobId, JobState, JobStatus, Row, Scope, SyncError, SyncJob,
};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row as _};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

use crate::{carried_checkpoints, JobSupervisor, RowStore, UpsertCounts};

pub async fn run_migrations(pool: &PgPool) -> Result<(), SyncError> {
    sqlx::migrate!("../../migrations")
        .run(pool)
        .await
        .map_err(|err| SyncError::storage("running migrations", err))
}

/// Decimal text as accepted by [`comparison_number`].
const NUMERIC_TEXT: &str = r"^[[:space:]]*[-+]?([0-9]+[.]?[0-9]*|[.][0-9]+)([eE][-+]?[0-9]+)?[[:space:]]*$";

fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn list_texts(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|items| items.iter().filter_map(value_text).collect())
        .unwrap_or_default()
}

/// Appends ` AND <clause>` for every filter clause.
///
/// Comparisons against a NULL field never match, mirroring SQL semantics.
/// `gt`/`lt` follow [`comparison_number`]: a numeric bound compares
/// numerically and skips non-numeric values, any other bound compares bytes.
pub(crate) fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &Filter) {
    for clause in &filter.clauses {
        qb.push(" AND ");
        let field = clause.field.clone();
        match clause.op {
            FilterOp::IsNull | FilterOp::NotNull => {
                qb.push("(data->>");
                qb.push_bind(field);
                qb.push(if clause.op == FilterOp::IsNull {
                    ") IS NULL"
                } else {
                    ") IS NOT NULL"
                });
            }
            FilterOp::In | FilterOp::NotIn => {
                qb.push("(data->>");
                qb.push_bind(field);
                qb.push(if clause.op == FilterOp::In {
                    ") = ANY("
                } else {
                    ") <> ALL("
                });
                qb.push_bind(list_texts(&clause.value));
                qb.push(")");
            }
            FilterOp::Gt | FilterOp::Lt => {
                let cmp = if clause.op == FilterOp::Gt { " > " } else { " < " };
                if let Some(bound) = comparison_number(&clause.value) {
                    // Stored text that is not a decimal yields NULL instead of a cast error.
                    qb.push("(CASE WHEN (data->>");
                    qb.push_bind(field.clone());
                    qb.push(format!(") ~ '{NUMERIC_TEXT}' THEN (data->>"));
                    qb.push_bind(field);
                    qb.push(")::numeric END)");
                    qb.push(cmp);
                    qb.push("CAST(");
                    qb.push_bind(bound.to_string());
                    qb.push(" AS numeric)");
                } else if let Some(text) = value_text(&clause.value) {
                    qb.push("(jsonb_typeof(data->");
                    qb.push_bind(field.clone());
                    qb.push(") IN ('string', 'number', 'boolean') AND (data->>");
                    qb.push_bind(field);
                    qb.push(") COLLATE \"C\"");
                    qb.push(cmp);
                    qb.push_bind(text);
                    qb.push(")");
                } else {
                    qb.push("FALSE");
                }
            }
            FilterOp::Eq | FilterOp::Neq | FilterOp::Ilike => {
                let Some(text) = value_text(&clause.value) else {
                    qb.push("FALSE");
                    continue;
                };
                let cmp = match clause.op {
                    FilterOp::Eq => " = ",
                    FilterOp::Neq => " <> ",
                    _ => " ILIKE ",
                };
                qb.push("(data->>");
                qb.push_bind(field);
                qb.push(")");
                qb.push(cmp);
                qb.push_bind(text);
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgRowStore {
    pool: PgPool,
}

impl PgRowStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RowStore for PgRowStore {
    async fn select(&self, resource: &str, filter: &Filter) -> Result<Vec<Row>, SyncError> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT data FROM mirror_rows WHERE resource = ");
        qb.push_bind(resource.to_string());
        push_filter(&mut qb, filter);
        qb.push(" ORDER BY row_no");

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|err| SyncError::storage(format!("selecting {resource} rows"), err))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let data: Value = row
                .try_get("data")
                .map_err(|err| SyncError::storage(format!("decoding {resource} row"), err))?;
            match data {
                Value::Object(map) => out.push(map),
                other => {
                    return Err(SyncError::storage(
                        format!("decoding {resource} row"),
                        format!("expected object, found {other}"),
                    ))
                }
            }
        }
        Ok(out)
    }

    async fn upsert(
        &self,
        resource: &str,
        rows: Vec<Row>,
        match_key: &str,
    ) -> Result<UpsertCounts, SyncError> {
        let span = info_span!("pg_upsert", resource, rows = rows.len());
        async move {
            let context = format!("upserting {resource} rows");
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|err| SyncError::storage(&context, err))?;
            let mut counts = UpsertCounts::default();

            for row in rows {
                let key = row.get(match_key).and_then(value_text).ok_or_else(|| {
                    SyncError::storage(&context, format!("row is missing match key `{match_key}`"))
                })?;
                let data = Value::Object(row);

                let updated = sqlx::query(
                    r#"
                    UPDATE mirror_rows
                       SET data = $1, updated_at = now()
                     WHERE resource = $2
                       AND data->>$3 = $4
                    "#,
                )
                .bind(&data)
                .bind(resource)
                .bind(match_key)
                .bind(&key)
                .execute(&mut *tx)
                .await
                .map_err(|err| SyncError::storage(&context, err))?
                .rows_affected();

                if updated == 0 {
                    sqlx::query("INSERT INTO mirror_rows (resource, data) VALUES ($1, $2)")
                        .bind(resource)
                        .bind(&data)
                        .execute(&mut *tx)
                        .await
                        .map_err(|err| SyncError::storage(&context, err))?;
                    counts.inserted += 1;
                } else {
                    counts.updated += 1;
                }
            }

            tx.commit()
                .await
                .map_err(|err| SyncError::storage(&context, err))?;
            debug!(inserted = counts.inserted, updated = counts.updated, "pg upsert committed");
            Ok(counts)
        }
        .instrument(span)
        .await
    }

    async fn delete(&self, resource: &str, filter: &Filter) -> Result<u64, SyncError> {
        let mut qb = QueryBuilder::<Postgres>::new("DELETE FROM mirror_rows WHERE resource = ");
        qb.push_bind(resource.to_string());
        push_filter(&mut qb, filter);
        let result = qb
            .build()
            .execute(&self.pool)
            .await
            .map_err(|err| SyncError::storage(format!("deleting {resource} rows"), err))?;
        Ok(result.rows_affected())
    }

    async fn count(&self, resource: &str, filter: &Filter) -> Result<u64, SyncError> {
        let mut qb =
            QueryBuilder::<Postgres>::new("SELECT COUNT(*) AS n FROM mirror_rows WHERE resource = ");
        qb.push_bind(resource.to_string());
        push_filter(&mut qb, filter);
        let row = qb
            .build()
            .fetch_one(&self.pool)
            .await
            .map_err(|err| SyncError::storage(format!("counting {resource} rows"), err))?;
        let n: i64 = row
            .try_get("n")
            .map_err(|err| SyncError::storage(format!("counting {resource} rows"), err))?;
        Ok(n.max(0) as u64)
    }
}

const JOB_COLUMNS: &str = "id, tenant_id, source_id, site_id, status, state, error, created_at, started_at, completed_at";

fn job_from_row(row: &PgRow) -> Result<SyncJob, SyncError> {
    let decode = |err: sqlx::Error| SyncError::storage("decoding sync job", err);
    let id: Uuid = row.try_get("id").map_err(decode)?;
    let status: String = row.try_get("status").map_err(decode)?;
    let state: Value = row.try_get("state").map_err(decode)?;
    let state: JobState = serde_json::from_value(state)
        .map_err(|err| SyncError::storage("decoding sync job state", err))?;
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(decode)?;
    Ok(SyncJob {
        id: JobId(id),
        scope: Scope {
            tenant_id: row.try_get("tenant_id").map_err(decode)?,
            source_id: row.try_get("source_id").map_err(decode)?,
            site_id: row.try_get("site_id").map_err(decode)?,
        },
        status: status.parse()?,
        state,
        error: row.try_get("error").map_err(decode)?,
        created_at,
        started_at: row.try_get("started_at").map_err(decode)?,
        completed_at: row.try_get("completed_at").map_err(decode)?,
    })
}

#[derive(Debug, Clone)]
pub struct PgJobSupervisor {
    pool: PgPool,
}

impl PgJobSupervisor {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn find_job(&self, id: JobId) -> Result<Option<SyncJob>, SyncError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM sync_jobs WHERE id = $1"))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| SyncError::storage("loading sync job", err))?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn transition_error(&self, id: JobId, to: JobStatus) -> SyncError {
        match self.find_job(id).await {
            Ok(Some(job)) => SyncError::JobState {
                id,
                from: job.status,
                to,
            },
            Ok(None) => SyncError::JobNotFound(id),
            Err(err) => err,
        }
    }
}

#[async_trait]
impl JobSupervisor for PgJobSupervisor {
    async fn create_job(&self, scope: &Scope) -> Result<SyncJob, SyncError> {
        let context = "creating sync job";
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|err| SyncError::storage(context, err))?;

        let previous: Option<Value> = sqlx::query_scalar(
            r#"
            SELECT state
              FROM sync_jobs
             WHERE tenant_id = $1 AND source_id = $2 AND site_id IS NOT DISTINCT FROM $3
             ORDER BY created_at DESC
             LIMIT 1
            "#,
        )
        .bind(&scope.tenant_id)
        .bind(&scope.source_id)
        .bind(&scope.site_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|err| SyncError::storage(context, err))?;

        let state = match previous {
            Some(value) => {
                let previous: JobState = serde_json::from_value(value)
                    .map_err(|err| SyncError::storage(context, err))?;
                carried_checkpoints(&previous)
            }
            None => JobState::new(),
        };
        let job = SyncJob::new_queued(scope.clone(), state, Utc::now());
        let state_json =
            serde_json::to_value(&job.state).map_err(|err| SyncError::storage(context, err))?;

        sqlx::query(
            r#"
            INSERT INTO sync_jobs (id, tenant_id, source_id, site_id, status, state, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(job.id.0)
        .bind(&scope.tenant_id)
        .bind(&scope.source_id)
        .bind(&scope.site_id)
        .bind(job.status.as_str())
        .bind(state_json)
        .bind(job.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|err| SyncError::storage(context, err))?;

        tx.commit()
            .await
            .map_err(|err| SyncError::storage(context, err))?;
        Ok(job)
    }

    async fn load_job(&self, id: JobId) -> Result<SyncJob, SyncError> {
        self.find_job(id).await?.ok_or(SyncError::JobNotFound(id))
    }

    async fn begin_job(&self, id: JobId) -> Result<SyncJob, SyncError> {
        let row = sqlx::query(&format!(
            "UPDATE sync_jobs SET status = 'running', started_at = now() \
             WHERE id = $1 AND status = 'queued' RETURNING {JOB_COLUMNS}"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| SyncError::storage("starting sync job", err))?;

        match row {
            Some(row) => job_from_row(&row),
            None => Err(self.transition_error(id, JobStatus::Running).await),
        }
    }

    async fn mark_job_status(
        &self,
        id: JobId,
        status: JobStatus,
        state: JobState,
        error: Option<String>,
    ) -> Result<(), SyncError> {
        if !status.is_terminal() {
            return Err(self.transition_error(id, status).await);
        }
        let state_json = serde_json::to_value(&state)
            .map_err(|err| SyncError::storage("recording sync job status", err))?;
        let updated = sqlx::query(
            r#"
            UPDATE sync_jobs
               SET status = $2, state = $3, error = $4, completed_at = now()
             WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id.0)
        .bind(status.as_str())
        .bind(state_json)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(|err| SyncError::storage("recording sync job status", err))?
        .rows_affected();

        if updated == 0 {
            return Err(self.transition_error(id, status).await);
        }
        Ok(())
    }

    async fn latest_started_job(&self, scope: &Scope) -> Result<Option<SyncJob>, SyncError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM sync_jobs \
             WHERE tenant_id = $1 AND source_id = $2 AND site_id IS NOT DISTINCT FROM $3 \
               AND started_at IS NOT NULL \
             ORDER BY started_at DESC, created_at DESC LIMIT 1"
        ))
        .bind(&scope.tenant_id)
        .bind(&scope.source_id)
        .bind(&scope.site_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| SyncError::storage("loading latest sync job", err))?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn list_jobs(&self, scope: &Scope, limit: usize) -> Result<Vec<SyncJob>, SyncError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM sync_jobs \
             WHERE tenant_id = $1 AND source_id = $2 AND site_id IS NOT DISTINCT FROM $3 \
             ORDER BY created_at DESC LIMIT $4"
        ))
        .bind(&scope.tenant_id)
        .bind(&scope.source_id)
        .bind(&scope.site_id)
        .bind(limit.min(i64::MAX as usize) as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| SyncError::storage("listing sync jobs", err))?;
        rows.iter().map(job_from_row).collect()
    }
}
