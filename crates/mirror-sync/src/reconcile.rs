//! Converging a mirror table onto an external snapshot: the upsert-and-tag
//! pass and the generational prune that follows a fully successful run.

use std::collections::{HashMap, HashSet};

use mirror_core::{Filter, JobId, Row, Scope, SyncError, SYNC_ID_KEY};
use mirror_storage::{JobSupervisor, RowStore, UpsertCounts};
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

fn external_id_of<'a>(
    resource: &str,
    row: &'a Row,
    external_id_key: &str,
) -> Result<&'a str, SyncError> {
    match row.get(external_id_key) {
        Some(Value::String(id)) if !id.trim().is_empty() => Ok(id),
        Some(other) => Err(SyncError::invariant(
            resource,
            format!("`{external_id_key}` must be a non-blank string, got {other}"),
        )),
        None => Err(SyncError::invariant(
            resource,
            format!("row is missing `{external_id_key}`"),
        )),
    }
}

/// Upserts `rows` into the scoped part of `resource`, tagging each with `job_id`.
///
/// New external ids get a fresh internal id; matched ones keep the stored
/// internal id and have the whole row replaced. Rows absent from the snapshot
/// are left alone.
pub async fn reconcile(
    store: &dyn RowStore,
    resource: &str,
    scope_filter: &Filter,
    rows: Vec<Row>,
    external_id_key: &str,
    internal_id_key: &str,
    job_id: JobId,
) -> Result<UpsertCounts, SyncError> {
    if rows.is_empty() {
        debug!(resource, "empty snapshot; nothing to reconcile");
        return Ok(UpsertCounts::default());
    }

    let mut seen = HashSet::with_capacity(rows.len());
    let mut external_ids = Vec::with_capacity(rows.len());
    for row in &rows {
        let external_id = external_id_of(resource, row, external_id_key)?;
        if !seen.insert(external_id) {
            return Err(SyncError::invariant(
                resource,
                format!("duplicate {external_id_key} `{external_id}` in snapshot"),
            ));
        }
        external_ids.push(external_id.to_string());
    }

    // Only rows sharing an external id with the batch can be matched.
    let candidates = scope_filter
        .clone()
        .and(Filter::new().in_list(external_id_key, external_ids.iter().cloned()));
    let existing = store.select(resource, &candidates).await?;
    let mut known: HashMap<String, Value> = HashMap::with_capacity(existing.len());
    for row in &existing {
        // Locally authored rows may carry no external id at all.
        let Some(Value::String(external_id)) = row.get(external_id_key) else {
            continue;
        };
        let internal_id = row.get(internal_id_key).cloned().ok_or_else(|| {
            SyncError::invariant(
                resource,
                format!("stored row `{external_id}` has no `{internal_id_key}`"),
            )
        })?;
        if known.insert(external_id.clone(), internal_id).is_some() {
            return Err(SyncError::invariant(
                resource,
                format!("mirror already holds several rows for `{external_id}`"),
            ));
        }
    }

    let mut counts = UpsertCounts::default();
    let mut tagged = Vec::with_capacity(rows.len());
    for (mut row, external_id) in rows.into_iter().zip(external_ids) {
        let internal_id = match known.get(&external_id) {
            Some(id) => {
                counts.updated += 1;
                id.clone()
            }
            None => {
                counts.inserted += 1;
                Value::String(Uuid::new_v4().to_string())
            }
        };
        row.insert(internal_id_key.to_string(), internal_id);
        row.insert(SYNC_ID_KEY.to_string(), Value::String(job_id.to_string()));
        if !scope_filter.matches(&row) {
            return Err(SyncError::invariant(
                resource,
                format!("row falls outside the sync scope ({scope_filter})"),
            ));
        }
        tagged.push(row);
    }

    let stored = store.upsert(resource, tagged, internal_id_key).await?;
    info!(
        resource,
        %job_id,
        inserted = counts.inserted,
        updated = counts.updated,
        store_inserted = stored.inserted,
        store_updated = stored.updated,
        "reconciled snapshot"
    );
    Ok(counts)
}

/// Filter for rows of `scope` tagged by any generation other than `job_id`.
pub fn stale_filter(scope: &Scope, job_id: JobId) -> Filter {
    scope
        .filter()
        .not_null(SYNC_ID_KEY)
        .neq(SYNC_ID_KEY, job_id.to_string())
}

/// Refuses to continue unless `job_id` is the most recently started job of `scope`.
pub async fn ensure_latest_job(
    supervisor: &dyn JobSupervisor,
    scope: &Scope,
    job_id: JobId,
) -> Result<(), SyncError> {
    match supervisor.latest_started_job(scope).await? {
        Some(latest) if latest.id == job_id => Ok(()),
        Some(latest) => Err(SyncError::ScopeConflict(format!(
            "job {} started on {scope} after job {job_id}",
            latest.id
        ))),
        None => Err(SyncError::ScopeConflict(format!(
            "job {job_id} is not recorded as started on {scope}"
        ))),
    }
}

/// Deletes rows of `resource` left behind by older generations.
///
/// Rows that were never synced (`sync_id` null) are not touched.
pub async fn prune(
    store: &dyn RowStore,
    supervisor: &dyn JobSupervisor,
    resource: &str,
    scope: &Scope,
    job_id: JobId,
) -> Result<u64, SyncError> {
    ensure_latest_job(supervisor, scope, job_id).await?;
    let deleted = store.delete(resource, &stale_filter(scope, job_id)).await?;
    info!(resource, %job_id, deleted, "pruned stale rows");
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirror_core::{CanonicalRow, EXTERNAL_ID_KEY, INTERNAL_ID_KEY};
    use mirror_storage::{MemoryJobSupervisor, MemoryRowStore};
    use serde_json::json;

    const TABLE: &str = "mirror_contracts";

    fn scope() -> Scope {
        Scope::new("t1", "billing", Some("site-1".into()))
    }

    fn external(ext: &str, name: &str) -> Row {
        CanonicalRow::new(&scope(), ext)
            .with_field("name", name)
            .into_row()
            .expect("row")
    }

    fn stored(ext: &str, id: &str, sync: Option<JobId>) -> Row {
        let mut row = external(ext, "old");
        row.insert(INTERNAL_ID_KEY.into(), json!(id));
        row.insert(
            SYNC_ID_KEY.into(),
            sync.map(|j| json!(j.to_string())).unwrap_or(Value::Null),
        );
        row
    }

    async fn run_reconcile(
        store: &MemoryRowStore,
        rows: Vec<Row>,
        job: JobId,
    ) -> Result<UpsertCounts, SyncError> {
        reconcile(
            store,
            TABLE,
            &scope().filter(),
            rows,
            EXTERNAL_ID_KEY,
            INTERNAL_ID_KEY,
            job,
        )
        .await
    }

    fn by_external_id(rows: &[Row], ext: &str) -> Option<Row> {
        rows.iter()
            .find(|r| r.get(EXTERNAL_ID_KEY) == Some(&json!(ext)))
            .cloned()
    }

    async fn started_job(supervisor: &MemoryJobSupervisor) -> JobId {
        let job = supervisor.create_job(&scope()).await.expect("create");
        supervisor.begin_job(job.id).await.expect("begin").id
    }

    #[tokio::test]
    async fn upsert_then_prune_converges_on_the_snapshot() {
        let store = MemoryRowStore::new();
        let supervisor = MemoryJobSupervisor::new();
        let job0 = JobId::new();
        store
            .insert_raw(TABLE, [stored("1", "a-id", Some(job0)), stored("2", "b-id", Some(job0))])
            .await;

        let job1 = started_job(&supervisor).await;
        let counts = run_reconcile(&store, vec![external("2", "changed"), external("3", "new")], job1)
            .await
            .expect("reconcile");
        assert_eq!(counts, UpsertCounts { inserted: 1, updated: 1 });

        let rows = store.all(TABLE).await;
        let a = by_external_id(&rows, "1").expect("A kept until prune");
        assert_eq!(a[SYNC_ID_KEY], json!(job0.to_string()));
        let b = by_external_id(&rows, "2").expect("B");
        assert_eq!(b[INTERNAL_ID_KEY], json!("b-id"));
        assert_eq!(b["name"], json!("changed"));
        assert_eq!(b[SYNC_ID_KEY], json!(job1.to_string()));
        let c = by_external_id(&rows, "3").expect("C");
        assert!(Uuid::parse_str(c[INTERNAL_ID_KEY].as_str().expect("id")).is_ok());
        assert_eq!(c[SYNC_ID_KEY], json!(job1.to_string()));

        let deleted = prune(&store, &supervisor, TABLE, &scope(), job1)
            .await
            .expect("prune");
        assert_eq!(deleted, 1);
        let rows = store.all(TABLE).await;
        assert!(by_external_id(&rows, "1").is_none());
        assert!(by_external_id(&rows, "2").is_some());
        assert!(by_external_id(&rows, "3").is_some());
    }

    #[tokio::test]
    async fn reconciling_twice_is_the_same_as_once() {
        let store = MemoryRowStore::new();
        let job = JobId::new();
        let snapshot = vec![external("1", "x"), external("2", "y")];

        run_reconcile(&store, snapshot.clone(), job).await.expect("first");
        let once = store.all(TABLE).await;
        let counts = run_reconcile(&store, snapshot, job).await.expect("second");
        assert_eq!(counts, UpsertCounts { inserted: 0, updated: 2 });
        assert_eq!(store.all(TABLE).await, once);
    }

    #[tokio::test]
    async fn empty_snapshot_changes_nothing_and_prune_spares_current_rows() {
        let store = MemoryRowStore::new();
        let supervisor = MemoryJobSupervisor::new();
        let old = JobId::new();
        store.insert_raw(TABLE, [stored("1", "a-id", Some(old))]).await;

        let job = started_job(&supervisor).await;
        let counts = run_reconcile(&store, Vec::new(), job).await.expect("empty");
        assert_eq!(counts, UpsertCounts::default());
        assert_eq!(store.all(TABLE).await.len(), 1);

        run_reconcile(&store, vec![external("2", "fresh")], job)
            .await
            .expect("reconcile");
        prune(&store, &supervisor, TABLE, &scope(), job).await.expect("prune");
        let rows = store.all(TABLE).await;
        assert_eq!(rows.len(), 1);
        assert!(by_external_id(&rows, "2").is_some());
    }

    #[tokio::test]
    async fn locally_authored_and_foreign_scope_rows_survive_prune() {
        let store = MemoryRowStore::new();
        let supervisor = MemoryJobSupervisor::new();
        let old = JobId::new();
        let mut other_site = stored("9", "z-id", Some(old));
        other_site.insert("site_id".into(), json!("site-2"));
        store
            .insert_raw(TABLE, [stored("local", "l-id", None), other_site])
            .await;

        let job = started_job(&supervisor).await;
        let deleted = prune(&store, &supervisor, TABLE, &scope(), job)
            .await
            .expect("prune");
        assert_eq!(deleted, 0);
        assert_eq!(store.all(TABLE).await.len(), 2);
    }

    #[tokio::test]
    async fn prune_refuses_when_a_newer_job_has_started() {
        let store = MemoryRowStore::new();
        let supervisor = MemoryJobSupervisor::new();
        store.insert_raw(TABLE, [stored("1", "a-id", Some(JobId::new()))]).await;

        let first = started_job(&supervisor).await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let _second = started_job(&supervisor).await;

        let err = prune(&store, &supervisor, TABLE, &scope(), first)
            .await
            .expect_err("conflict");
        assert!(matches!(err, SyncError::ScopeConflict(_)));
        assert_eq!(store.all(TABLE).await.len(), 1);
    }

    #[tokio::test]
    async fn invalid_snapshots_are_rejected_before_any_write() {
        let store = MemoryRowStore::new();
        let job = JobId::new();

        let dup = run_reconcile(&store, vec![external("1", "a"), external("1", "b")], job).await;
        assert!(matches!(dup, Err(SyncError::ReconciliationInvariant { .. })));

        let mut blank = external("1", "a");
        blank.insert(EXTERNAL_ID_KEY.into(), json!(" "));
        let blank = run_reconcile(&store, vec![blank], job).await;
        assert!(matches!(blank, Err(SyncError::ReconciliationInvariant { .. })));

        let mut numeric = external("1", "a");
        numeric.insert(EXTERNAL_ID_KEY.into(), json!(7));
        assert!(run_reconcile(&store, vec![numeric], job).await.is_err());

        let foreign = CanonicalRow::new(&Scope::new("t2", "billing", Some("site-1".into())), "5")
            .into_row()
            .expect("row");
        assert!(run_reconcile(&store, vec![foreign], job).await.is_err());

        assert!(store.all(TABLE).await.is_empty());
    }

    #[tokio::test]
    async fn duplicated_mirror_rows_are_an_invariant_violation() {
        let store = MemoryRowStore::new();
        let old = JobId::new();
        store
            .insert_raw(TABLE, [stored("1", "a-id", Some(old)), stored("1", "b-id", Some(old))])
            .await;

        let err = run_reconcile(&store, vec![external("1", "x")], JobId::new())
            .await
            .expect_err("invariant");
        assert!(matches!(err, SyncError::ReconciliationInvariant { .. }));
    }
}
