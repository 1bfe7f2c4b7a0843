use std::time::Instant;

use rusqlite::Connection;
use tracing::{debug, instrument};

use strata_core::{
    Change, ChangeType, Context, ContextError, ContextKey, ContextStore, DeleteRequest, Level, Lineage,
    Payload, Principal, PutRequest, StagedWrite, TransactionError, GLOBAL_CONTEXT_ID,
};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

const CONTEXT_COLUMNS: &str = "level, id, parent_id, payload, version, created_at, updated_at";

/// SQLite-backed context store. Each write and its version record commit in
/// one transaction; optimistic concurrency is enforced in the UPDATE itself.
pub struct SqliteContextStore {
    db: Database,
}

impl SqliteContextStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Number of stored contexts, all levels.
    pub fn count(&self) -> Result<i64, ContextError> {
        self.db.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM contexts", [], |row| row.get(0))
                .map_err(|e| StoreError::from(e).into())
        })
    }
}

impl ContextStore for SqliteContextStore {
    #[instrument(skip(self), fields(key = %key))]
    fn get(&self, key: &ContextKey) -> Result<Context, ContextError> {
        self.db.with_conn(|conn| {
            fetch(conn, key)?.ok_or_else(|| ContextError::NotFound { key: key.clone() })
        })
    }

    #[instrument(skip(self, req), fields(key = %req.key, expected_version = req.expected_version))]
    fn put(&self, req: &PutRequest) -> Result<Vec<Change>, ContextError> {
        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction().map_err(StoreError::from)?;
            let changes = put_in(&tx, req)?;
            tx.commit().map_err(StoreError::from)?;
            Ok(changes)
        })
    }

    #[instrument(skip(self, req), fields(key = %req.key, cascade = req.cascade))]
    fn delete(&self, req: &DeleteRequest) -> Result<Vec<Change>, ContextError> {
        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction().map_err(StoreError::from)?;
            let changes = delete_in(&tx, req)?;
            tx.commit().map_err(StoreError::from)?;
            Ok(changes)
        })
    }

    fn children(&self, key: &ContextKey) -> Result<Vec<Context>, ContextError> {
        self.db.with_conn(|conn| children_of(conn, key))
    }

    fn descendants(&self, key: &ContextKey) -> Result<Vec<Context>, ContextError> {
        self.db.with_conn(|conn| descendants_of(conn, key))
    }

    fn list(&self, level: Level, limit: usize) -> Result<Vec<Context>, ContextError> {
        self.db.with_conn(|conn| {
            let sql = format!("SELECT {CONTEXT_COLUMNS} FROM contexts WHERE level = ?1 ORDER BY id LIMIT ?2");
            let mut stmt = conn.prepare(&sql).map_err(StoreError::from)?;
            let mut rows = stmt
                .query(rusqlite::params![level.as_str(), limit as i64])
                .map_err(StoreError::from)?;
            let mut results = Vec::new();
            while let Some(row) = rows.next().map_err(StoreError::from)? {
                results.push(row_to_context(row)?);
            }
            Ok(results)
        })
    }

    #[instrument(skip(self, writes), fields(writes = writes.len()))]
    fn apply_transaction(
        &self,
        writes: &[StagedWrite],
        deadline: Option<Instant>,
    ) -> Result<Vec<Vec<Change>>, TransactionError> {
        let commit_failure = |e: StoreError| TransactionError {
            index: None,
            error: e.into(),
        };

        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction().map_err(|e| commit_failure(e.into()))?;
            let mut results = Vec::with_capacity(writes.len());
            for (index, write) in writes.iter().enumerate() {
                let applied = match write {
                    StagedWrite::Put(req) => put_in(&tx, req),
                    StagedWrite::Delete(req) => delete_in(&tx, req),
                };
                match applied {
                    Ok(changes) => results.push(changes),
                    Err(error) => {
                        debug!(index, error = %error, "staged write failed, rolling back");
                        // Dropping `tx` rolls back every staged write.
                        return Err(TransactionError {
                            index: Some(index),
                            error,
                        });
                    }
                }
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                debug!("deadline passed before commit, rolling back");
                return Err(TransactionError {
                    index: None,
                    error: ContextError::DeadlineExceeded,
                });
            }
            tx.commit().map_err(|e| commit_failure(e.into()))?;
            Ok(results)
        })
    }
}

fn fetch(conn: &Connection, key: &ContextKey) -> Result<Option<Context>, ContextError> {
    let sql = format!("SELECT {CONTEXT_COLUMNS} FROM contexts WHERE level = ?1 AND id = ?2");
    let mut stmt = conn.prepare_cached(&sql).map_err(StoreError::from)?;
    let mut rows = stmt
        .query(rusqlite::params![key.level.as_str(), key.id])
        .map_err(StoreError::from)?;
    match rows.next().map_err(StoreError::from)? {
        Some(row) => Ok(Some(row_to_context(row)?)),
        None => Ok(None),
    }
}

fn children_of(conn: &Connection, key: &ContextKey) -> Result<Vec<Context>, ContextError> {
    let Some(child_level) = key.level.child() else {
        return Ok(Vec::new());
    };
    let sql = format!(
        "SELECT {CONTEXT_COLUMNS} FROM contexts WHERE level = ?1 AND parent_id = ?2 ORDER BY id"
    );
    let mut stmt = conn.prepare_cached(&sql).map_err(StoreError::from)?;
    let mut rows = stmt
        .query(rusqlite::params![child_level.as_str(), key.id])
        .map_err(StoreError::from)?;
    let mut results = Vec::new();
    while let Some(row) = rows.next().map_err(StoreError::from)? {
        results.push(row_to_context(row)?);
    }
    Ok(results)
}

/// Every descendant of `key`, deepest level first.
fn descendants_of(conn: &Connection, key: &ContextKey) -> Result<Vec<Context>, ContextError> {
    let mut frontier = vec![key.clone()];
    let mut found = Vec::new();
    while let Some(next) = frontier.pop() {
        for child in children_of(conn, &next)? {
            frontier.push(child.key.clone());
            found.push(child);
        }
    }
    found.sort_by(|a, b| b.key.level.cmp(&a.key.level).then_with(|| a.key.id.cmp(&b.key.id)));
    Ok(found)
}

/// Ancestor ids of a stored context, walking `parent_id` upward.
fn lineage_of(conn: &Connection, ctx: &Context) -> Result<Lineage, ContextError> {
    let mut lineage = Lineage::default();
    lineage.set(ctx.key.level, ctx.key.id.clone());
    let mut parent = ctx.parent_key();
    while let Some(key) = parent {
        if key.is_global() {
            break;
        }
        lineage.set(key.level, key.id.clone());
        parent = match fetch(conn, &key)? {
            Some(p) => p.parent_key(),
            None => None,
        };
    }
    Ok(lineage)
}

fn next_sequence(conn: &Connection, key: &ContextKey) -> Result<u64, ContextError> {
    let seq: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(sequence), 0) + 1 FROM context_versions WHERE level = ?1 AND context_id = ?2",
            rusqlite::params![key.level.as_str(), key.id],
            |row| row.get(0),
        )
        .map_err(StoreError::from)?;
    Ok(seq as u64)
}

fn append_version(
    conn: &Connection,
    ctx: &Context,
    version: u64,
    change_type: ChangeType,
    summary: Option<&str>,
    author: &Principal,
) -> Result<u64, ContextError> {
    let sequence = next_sequence(conn, &ctx.key)?;
    let payload = serde_json::to_string(&ctx.payload).map_err(StoreError::from)?;
    conn.execute(
        "INSERT INTO context_versions (level, context_id, sequence, version, change_type, payload, summary, author, timestamp, is_milestone)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0)",
        rusqlite::params![
            ctx.key.level.as_str(),
            ctx.key.id,
            sequence as i64,
            version as i64,
            change_type.to_string(),
            payload,
            summary,
            author.as_str(),
            row_helpers::format_timestamp(row_helpers::now()),
        ],
    )
    .map_err(StoreError::from)?;
    Ok(sequence)
}

fn validate_put(req: &PutRequest) -> Result<(), ContextError> {
    if req.key.id.trim().is_empty() {
        return Err(ContextError::validation(Some(&req.key), "context id must not be empty"));
    }
    if req.key.is_global() && req.key.id != GLOBAL_CONTEXT_ID {
        return Err(ContextError::validation(
            Some(&req.key),
            format!("the global context id is '{GLOBAL_CONTEXT_ID}'"),
        ));
    }
    Ok(())
}

fn put_in(conn: &Connection, req: &PutRequest) -> Result<Vec<Change>, ContextError> {
    validate_put(req)?;
    let existing = fetch(conn, &req.key)?;

    if req.expected_version == 0 {
        if let Some(current) = existing {
            return Err(ContextError::VersionConflict {
                key: req.key.clone(),
                expected: 0,
                actual: current.version,
            });
        }
        return create_in(conn, req);
    }

    let Some(current) = existing else {
        return Err(ContextError::NotFound { key: req.key.clone() });
    };

    let now = row_helpers::now();
    let version = req.expected_version + 1;
    let payload = serde_json::to_string(&req.payload).map_err(StoreError::from)?;
    let updated = conn
        .execute(
            "UPDATE contexts SET payload = ?1, version = ?2, updated_at = ?3
             WHERE level = ?4 AND id = ?5 AND version = ?6",
            rusqlite::params![
                payload,
                version as i64,
                row_helpers::format_timestamp(now),
                req.key.level.as_str(),
                req.key.id,
                req.expected_version as i64,
            ],
        )
        .map_err(StoreError::from)?;

    if updated == 0 {
        return Err(ContextError::VersionConflict {
            key: req.key.clone(),
            expected: req.expected_version,
            actual: current.version,
        });
    }

    let ctx = Context {
        payload: req.payload.clone(),
        version,
        updated_at: now,
        ..current
    };
    let change_type = match req.change_type {
        ChangeType::Rollback => ChangeType::Rollback,
        _ => ChangeType::Update,
    };
    append_version(conn, &ctx, version, change_type, req.summary.as_deref(), &req.author)?;
    let lineage = lineage_of(conn, &ctx)?;
    Ok(vec![Change {
        context: ctx,
        lineage,
        change_type,
        author: req.author.clone(),
    }])
}

fn create_in(conn: &Connection, req: &PutRequest) -> Result<Vec<Change>, ContextError> {
    let mut changes = Vec::new();

    let parent_id = match req.key.level.parent() {
        None => None,
        Some(parent_level) => {
            let parent_id = req.parent_id().ok_or_else(|| {
                ContextError::validation(
                    Some(&req.key),
                    format!("a {} context needs a {parent_level} parent id", req.key.level),
                )
            })?;
            let parent_key = ContextKey::new(parent_level, parent_id);
            if fetch(conn, &parent_key)?.is_none() {
                if !req.auto_create_ancestors || parent_level == Level::Global {
                    return Err(ContextError::MissingAncestor {
                        level: parent_level,
                        id: Some(parent_id.to_string()),
                    });
                }
                debug!(parent = %parent_key, "auto-creating missing ancestor");
                let parent_req = PutRequest::create(parent_key, Payload::new(), req.author.clone())
                    .with_lineage(req.lineage.clone())
                    .with_summary("auto-created ancestor")
                    .auto_create(true);
                changes.extend(create_in(conn, &parent_req)?);
            }
            Some(parent_id.to_string())
        }
    };

    let now = row_helpers::now();
    let ctx = Context {
        key: req.key.clone(),
        parent_id,
        payload: req.payload.clone(),
        version: 1,
        created_at: now,
        updated_at: now,
    };
    let payload = serde_json::to_string(&ctx.payload).map_err(StoreError::from)?;
    let ts = row_helpers::format_timestamp(now);
    conn.execute(
        "INSERT INTO contexts (level, id, parent_id, payload, version, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6)",
        rusqlite::params![ctx.key.level.as_str(), ctx.key.id, ctx.parent_id, payload, ts, ts],
    )
    .map_err(StoreError::from)?;

    append_version(conn, &ctx, 1, ChangeType::Create, req.summary.as_deref(), &req.author)?;
    let lineage = lineage_of(conn, &ctx)?;
    changes.push(Change {
        context: ctx,
        lineage,
        change_type: ChangeType::Create,
        author: req.author.clone(),
    });
    Ok(changes)
}

fn delete_in(conn: &Connection, req: &DeleteRequest) -> Result<Vec<Change>, ContextError> {
    let target = fetch(conn, &req.key)?.ok_or_else(|| ContextError::NotFound { key: req.key.clone() })?;

    let descendants = descendants_of(conn, &req.key)?;
    if !descendants.is_empty() && !req.cascade {
        return Err(ContextError::HasDependents {
            key: req.key.clone(),
            dependents: descendants.len(),
        });
    }

    // Lineages first: they walk parent rows that are about to disappear.
    let mut doomed = Vec::with_capacity(descendants.len() + 1);
    for ctx in descendants.into_iter().chain(std::iter::once(target)) {
        let lineage = lineage_of(conn, &ctx)?;
        doomed.push((ctx, lineage));
    }

    let mut changes = Vec::with_capacity(doomed.len());
    for (mut ctx, lineage) in doomed {
        conn.execute(
            "DELETE FROM contexts WHERE level = ?1 AND id = ?2",
            rusqlite::params![ctx.key.level.as_str(), ctx.key.id],
        )
        .map_err(StoreError::from)?;
        let version = ctx.version + 1;
        append_version(conn, &ctx, version, ChangeType::Delete, None, &req.author)?;
        ctx.version = version;
        changes.push(Change {
            context: ctx,
            lineage,
            change_type: ChangeType::Delete,
            author: req.author.clone(),
        });
    }
    Ok(changes)
}

fn row_to_context(row: &rusqlite::Row<'_>) -> Result<Context, ContextError> {
    let level: String = row_helpers::get(row, 0, "contexts", "level")?;
    let payload: String = row_helpers::get(row, 3, "contexts", "payload")?;
    let created_at: String = row_helpers::get(row, 5, "contexts", "created_at")?;
    let updated_at: String = row_helpers::get(row, 6, "contexts", "updated_at")?;
    let version: i64 = row_helpers::get(row, 4, "contexts", "version")?;

    Ok(Context {
        key: ContextKey::new(
            row_helpers::parse_enum(&level, "contexts", "level")?,
            row_helpers::get::<String>(row, 1, "contexts", "id")?,
        ),
        parent_id: row_helpers::get(row, 2, "contexts", "parent_id")?,
        payload: row_helpers::parse_object(&payload, "contexts", "payload")?,
        version: version as u64,
        created_at: row_helpers::parse_timestamp(&created_at, "contexts", "created_at")?,
        updated_at: row_helpers::parse_timestamp(&updated_at, "contexts", "updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn payload(v: serde_json::Value) -> Payload {
        v.as_object().cloned().unwrap()
    }

    fn alice() -> Principal {
        Principal::new("alice")
    }

    /// Store seeded with global → p1 → b1.
    fn seeded() -> (Database, SqliteContextStore) {
        let db = Database::in_memory().unwrap();
        let store = SqliteContextStore::new(db.clone());
        store
            .put(&PutRequest::create(ContextKey::global(), payload(json!({"org": "Acme"})), alice()))
            .unwrap();
        store
            .put(&PutRequest::create(ContextKey::project("p1"), payload(json!({"name": "Proj1"})), alice()))
            .unwrap();
        store
            .put(&PutRequest::create(ContextKey::branch("b1"), payload(json!({"name": "main"})), alice()).under("p1"))
            .unwrap();
        (db, store)
    }

    #[test]
    fn create_then_get() {
        let (_db, store) = seeded();
        let ctx = store.get(&ContextKey::project("p1")).unwrap();
        assert_eq!(ctx.version, 1);
        assert_eq!(ctx.parent_id.as_deref(), Some(GLOBAL_CONTEXT_ID));
        assert_eq!(ctx.payload["name"], "Proj1");
    }

    #[test]
    fn get_missing_is_not_found() {
        let (_db, store) = seeded();
        let err = store.get(&ContextKey::task("nope")).unwrap_err();
        assert!(matches!(err, ContextError::NotFound { .. }));
    }

    #[test]
    fn update_increments_version() {
        let (_db, store) = seeded();
        let key = ContextKey::project("p1");
        let changes = store
            .put(&PutRequest::update(key.clone(), payload(json!({"name": "renamed"})), 1, alice()))
            .unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].context.version, 2);
        assert_eq!(changes[0].change_type, ChangeType::Update);
        assert_eq!(store.get(&key).unwrap().payload["name"], "renamed");
    }

    #[test]
    fn written_context_matches_the_row_read_back() {
        let (_db, store) = seeded();
        let key = ContextKey::project("p1");
        let changes = store
            .put(&PutRequest::update(key.clone(), payload(json!({"name": "renamed"})), 1, alice()))
            .unwrap();
        assert_eq!(changes[0].context, store.get(&key).unwrap());

        let created = store
            .put(&PutRequest::create(ContextKey::task("t1"), Payload::new(), alice()).under("b1"))
            .unwrap();
        assert_eq!(created[0].context, store.get(&ContextKey::task("t1")).unwrap());
    }

    #[test]
    fn stale_update_is_version_conflict() {
        let (_db, store) = seeded();
        let key = ContextKey::project("p1");
        store
            .put(&PutRequest::update(key.clone(), payload(json!({"v": 2})), 1, alice()))
            .unwrap();
        let err = store
            .put(&PutRequest::update(key.clone(), payload(json!({"v": 3})), 1, alice()))
            .unwrap_err();
        assert!(matches!(
            err,
            ContextError::VersionConflict { expected: 1, actual: 2, .. }
        ));
        assert_eq!(store.get(&key).unwrap().payload["v"], 2);
    }

    #[test]
    fn create_existing_is_version_conflict() {
        let (_db, store) = seeded();
        let err = store
            .put(&PutRequest::create(ContextKey::project("p1"), Payload::new(), alice()))
            .unwrap_err();
        assert!(matches!(err, ContextError::VersionConflict { expected: 0, actual: 1, .. }));
    }

    #[test]
    fn update_missing_is_not_found() {
        let (_db, store) = seeded();
        let err = store
            .put(&PutRequest::update(ContextKey::task("t9"), Payload::new(), 1, alice()))
            .unwrap_err();
        assert!(matches!(err, ContextError::NotFound { .. }));
    }

    #[test]
    fn global_must_use_singleton_id() {
        let db = Database::in_memory().unwrap();
        let store = SqliteContextStore::new(db);
        let err = store
            .put(&PutRequest::create(ContextKey::new(Level::Global, "tenant-2"), Payload::new(), alice()))
            .unwrap_err();
        assert!(matches!(err, ContextError::Validation { .. }));
    }

    #[test]
    fn create_requires_parent_id() {
        let (_db, store) = seeded();
        let err = store
            .put(&PutRequest::create(ContextKey::task("t1"), Payload::new(), alice()))
            .unwrap_err();
        assert!(matches!(err, ContextError::Validation { .. }));
    }

    #[test]
    fn create_with_missing_parent_is_missing_ancestor() {
        let (_db, store) = seeded();
        let err = store
            .put(&PutRequest::create(ContextKey::task("t1"), Payload::new(), alice()).under("b9"))
            .unwrap_err();
        assert!(matches!(
            err,
            ContextError::MissingAncestor { level: Level::Branch, id: Some(ref id) } if id == "b9"
        ));
    }

    #[test]
    fn project_without_global_is_missing_ancestor_even_with_auto_create() {
        let db = Database::in_memory().unwrap();
        let store = SqliteContextStore::new(db);
        let err = store
            .put(&PutRequest::create(ContextKey::project("p1"), Payload::new(), alice()).auto_create(true))
            .unwrap_err();
        assert!(matches!(err, ContextError::MissingAncestor { level: Level::Global, .. }));
    }

    #[test]
    fn auto_create_builds_missing_branch() {
        let (_db, store) = seeded();
        let lineage = Lineage {
            project_id: Some("p1".into()),
            branch_id: Some("b2".into()),
            task_id: None,
        };
        let changes = store
            .put(
                &PutRequest::create(ContextKey::task("t1"), payload(json!({"title": "x"})), alice())
                    .with_lineage(lineage)
                    .auto_create(true),
            )
            .unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].context.key, ContextKey::branch("b2"));
        assert!(changes[0].context.payload.is_empty());
        assert_eq!(changes[1].context.key, ContextKey::task("t1"));
        assert_eq!(changes[1].lineage.project_id.as_deref(), Some("p1"));
        assert_eq!(changes[1].lineage.branch_id.as_deref(), Some("b2"));
        assert_eq!(changes[1].lineage.task_id.as_deref(), Some("t1"));
    }

    #[test]
    fn delete_with_children_requires_cascade() {
        let (_db, store) = seeded();
        let err = store
            .delete(&DeleteRequest::new(ContextKey::project("p1"), alice()))
            .unwrap_err();
        assert!(matches!(err, ContextError::HasDependents { dependents: 1, .. }));
        assert!(store.get(&ContextKey::branch("b1")).is_ok());
    }

    #[test]
    fn cascade_delete_removes_descendants_first() {
        let (db, store) = seeded();
        store
            .put(&PutRequest::create(ContextKey::task("t1"), payload(json!({"title": "a"})), alice()).under("b1"))
            .unwrap();

        let changes = store
            .delete(&DeleteRequest::new(ContextKey::project("p1"), alice()).cascade(true))
            .unwrap();
        let keys: Vec<_> = changes.iter().map(|c| c.context.key.clone()).collect();
        assert_eq!(
            keys,
            vec![ContextKey::task("t1"), ContextKey::branch("b1"), ContextKey::project("p1")]
        );
        assert!(changes.iter().all(|c| c.change_type == ChangeType::Delete));
        assert_eq!(changes[0].lineage.project_id.as_deref(), Some("p1"));

        for key in keys {
            assert!(db.with_conn(|conn| fetch(conn, &key)).unwrap().is_none());
        }
    }

    #[test]
    fn every_write_appends_a_version_record() {
        let (db, store) = seeded();
        let key = ContextKey::project("p1");
        store
            .put(&PutRequest::update(key.clone(), payload(json!({"n": 1})), 1, alice()))
            .unwrap();
        let sequences: Vec<i64> = db
            .with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT sequence FROM context_versions WHERE level = 'project' AND context_id = 'p1' ORDER BY sequence",
                )?;
                let rows = stmt.query_map([], |row| row.get(0))?;
                rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
            })
            .unwrap();
        assert_eq!(sequences, vec![1, 2]);
    }

    #[test]
    fn sequence_keeps_growing_across_recreate() {
        let (db, store) = seeded();
        let key = ContextKey::branch("b1");
        store.delete(&DeleteRequest::new(key.clone(), alice())).unwrap();
        let recreated = store
            .put(&PutRequest::create(key.clone(), Payload::new(), alice()).under("p1"))
            .unwrap();
        assert_eq!(recreated[0].context.version, 1);
        let max_seq: i64 = db
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT MAX(sequence) FROM context_versions WHERE level = 'branch' AND context_id = 'b1'",
                    [],
                    |row| row.get(0),
                )
                .map_err(StoreError::from)
            })
            .unwrap();
        assert_eq!(max_seq, 3);
    }

    #[test]
    fn transaction_rolls_back_everything_on_failure() {
        let (_db, store) = seeded();
        let writes = vec![
            StagedWrite::Put(PutRequest::create(ContextKey::task("t1"), payload(json!({"title": "ok"})), alice()).under("b1")),
            StagedWrite::Put(PutRequest::create(ContextKey::task("t2"), Payload::new(), alice()).under("b-missing")),
        ];
        let err = store.apply_transaction(&writes, None).unwrap_err();
        assert_eq!(err.index, Some(1));
        assert!(matches!(err.error, ContextError::MissingAncestor { .. }));
        assert!(matches!(
            store.get(&ContextKey::task("t1")),
            Err(ContextError::NotFound { .. })
        ));
    }

    #[test]
    fn transaction_commits_all() {
        let (_db, store) = seeded();
        let writes = vec![
            StagedWrite::Put(PutRequest::create(ContextKey::task("t1"), Payload::new(), alice()).under("b1")),
            StagedWrite::Put(PutRequest::update(ContextKey::branch("b1"), payload(json!({"x": 1})), 1, alice())),
        ];
        let results = store.apply_transaction(&writes, None).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(store.get(&ContextKey::branch("b1")).unwrap().version, 2);
    }

    #[test]
    fn transaction_past_deadline_commits_nothing() {
        let (_db, store) = seeded();
        let writes = vec![StagedWrite::Put(
            PutRequest::create(ContextKey::task("t1"), Payload::new(), alice()).under("b1"),
        )];
        let err = store
            .apply_transaction(&writes, Some(Instant::now()))
            .unwrap_err();
        assert_eq!(err.index, None);
        assert!(matches!(err.error, ContextError::DeadlineExceeded));
        assert!(store.get(&ContextKey::task("t1")).is_err());
    }

    #[test]
    fn list_and_children() {
        let (_db, store) = seeded();
        store
            .put(&PutRequest::create(ContextKey::branch("b2"), Payload::new(), alice()).under("p1"))
            .unwrap();
        let children = store.children(&ContextKey::project("p1")).unwrap();
        assert_eq!(children.len(), 2);
        assert_eq!(store.list(Level::Branch, 10).unwrap().len(), 2);
        assert_eq!(store.list(Level::Branch, 1).unwrap().len(), 1);
        assert!(store.children(&ContextKey::task("t1")).unwrap().is_empty());
        assert_eq!(store.count().unwrap(), 4);
    }

    #[test]
    fn concurrent_writers_exactly_one_wins() {
        let (_db, store) = seeded();
        let store = Arc::new(store);
        let key = ContextKey::project("p1");

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                let key = key.clone();
                std::thread::spawn(move || {
                    store.put(&PutRequest::update(key, payload(json!({"writer": i})), 1, Principal::new("w")))
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let wins = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(wins, 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, ContextError::VersionConflict { .. })));
        assert_eq!(store.get(&key).unwrap().version, 2);
    }

    #[test]
    fn malformed_payload_is_corrupt_row() {
        let (db, store) = seeded();
        db.with_conn(|conn| {
            conn.execute(
                "UPDATE contexts SET payload = 'not valid json' WHERE level = 'project' AND id = 'p1'",
                [],
            )
            .map_err(StoreError::from)
        })
        .unwrap();
        let err = store.get(&ContextKey::project("p1")).unwrap_err();
        assert_eq!(err.kind(), "storage_error");
        assert!(err.to_string().contains("contexts.payload"));
    }
}
