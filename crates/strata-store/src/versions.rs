use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::{debug, instrument};

use strata_core::{ContextError, ContextKey, VersionLog, VersionRecord};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

const VERSION_COLUMNS: &str =
    "level, context_id, sequence, version, change_type, payload, summary, author, timestamp, is_milestone";

/// Read and maintenance access to the `context_versions` table. Records are
/// appended by [`crate::SqliteContextStore`] inside its write transactions.
pub struct SqliteVersionLog {
    db: Database,
}

impl SqliteVersionLog {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

impl VersionLog for SqliteVersionLog {
    fn history(&self, key: &ContextKey, limit: usize, offset: usize) -> Result<Vec<VersionRecord>, ContextError> {
        self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {VERSION_COLUMNS} FROM context_versions
                 WHERE level = ?1 AND context_id = ?2
                 ORDER BY sequence ASC LIMIT ?3 OFFSET ?4"
            );
            let mut stmt = conn.prepare_cached(&sql).map_err(StoreError::from)?;
            let mut rows = stmt
                .query(rusqlite::params![key.level.as_str(), key.id, limit as i64, offset as i64])
                .map_err(StoreError::from)?;
            let mut records = Vec::new();
            while let Some(row) = rows.next().map_err(StoreError::from)? {
                records.push(row_to_record(row)?);
            }
            Ok(records)
        })
    }

    fn record_at(&self, key: &ContextKey, sequence: u64) -> Result<VersionRecord, ContextError> {
        self.db.with_conn(|conn| fetch_record(conn, key, sequence))
    }

    #[instrument(skip(self), fields(key = %key))]
    fn mark_milestone(&self, key: &ContextKey, sequence: u64) -> Result<VersionRecord, ContextError> {
        self.db.with_conn(|conn| {
            let updated = conn
                .execute(
                    "UPDATE context_versions SET is_milestone = 1
                     WHERE level = ?1 AND context_id = ?2 AND sequence = ?3",
                    rusqlite::params![key.level.as_str(), key.id, sequence as i64],
                )
                .map_err(StoreError::from)?;
            if updated == 0 {
                return Err(ContextError::VersionNotFound {
                    key: key.clone(),
                    sequence,
                });
            }
            fetch_record(conn, key, sequence)
        })
    }

    #[instrument(skip(self), fields(key = %key))]
    fn prune(&self, key: &ContextKey, keep_milestones: bool, older_than: DateTime<Utc>) -> Result<usize, ContextError> {
        self.db.with_conn(|conn| {
            let milestone_clause = if keep_milestones { " AND is_milestone = 0" } else { "" };
            let sql = format!(
                "DELETE FROM context_versions
                 WHERE level = ?1 AND context_id = ?2 AND timestamp < ?3
                   AND sequence < (SELECT MAX(sequence) FROM context_versions WHERE level = ?1 AND context_id = ?2)
                   {milestone_clause}"
            );
            let removed = conn
                .execute(
                    &sql,
                    rusqlite::params![key.level.as_str(), key.id, row_helpers::format_timestamp(older_than)],
                )
                .map_err(StoreError::from)?;
            debug!(removed, keep_milestones, "pruned version history");
            Ok(removed)
        })
    }
}

fn fetch_record(conn: &Connection, key: &ContextKey, sequence: u64) -> Result<VersionRecord, ContextError> {
    let sql = format!(
        "SELECT {VERSION_COLUMNS} FROM context_versions WHERE level = ?1 AND context_id = ?2 AND sequence = ?3"
    );
    let mut stmt = conn.prepare_cached(&sql).map_err(StoreError::from)?;
    let mut rows = stmt
        .query(rusqlite::params![key.level.as_str(), key.id, sequence as i64])
        .map_err(StoreError::from)?;
    match rows.next().map_err(StoreError::from)? {
        Some(row) => row_to_record(row),
        None => Err(ContextError::VersionNotFound {
            key: key.clone(),
            sequence,
        }),
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> Result<VersionRecord, ContextError> {
    let level: String = row_helpers::get(row, 0, "context_versions", "level")?;
    let context_id: String = row_helpers::get(row, 1, "context_versions", "context_id")?;
    let sequence: i64 = row_helpers::get(row, 2, "context_versions", "sequence")?;
    let version: i64 = row_helpers::get(row, 3, "context_versions", "version")?;
    let change_type: String = row_helpers::get(row, 4, "context_versions", "change_type")?;
    let payload: String = row_helpers::get(row, 5, "context_versions", "payload")?;
    let timestamp: String = row_helpers::get(row, 8, "context_versions", "timestamp")?;
    let is_milestone: i64 = row_helpers::get(row, 9, "context_versions", "is_milestone")?;

    Ok(VersionRecord {
        key: ContextKey::new(row_helpers::parse_enum(&level, "context_versions", "level")?, context_id),
        sequence: sequence as u64,
        version: version as u64,
        change_type: row_helpers::parse_enum(&change_type, "context_versions", "change_type")?,
        payload: row_helpers::parse_object(&payload, "context_versions", "payload")?,
        summary: row_helpers::get(row, 6, "context_versions", "summary")?,
        author: row_helpers::get(row, 7, "context_versions", "author")?,
        timestamp: row_helpers::parse_timestamp(&timestamp, "context_versions", "timestamp")?,
        is_milestone: is_milestone != 0,
    })
}
