//! Persistence seam. The engine is written against these traits; the
//! SQLite implementation lives in `strata-store`.

use std::time::Instant;

use chrono::{DateTime, Utc};

use crate::context::{Change, Context, DeleteRequest, PutRequest};
use crate::errors::{ContextError, Result};
use crate::level::{ContextKey, Level};
use crate::version::VersionRecord;

/// One write staged for an all-or-nothing commit.
#[derive(Clone, Debug)]
pub enum StagedWrite {
    Put(PutRequest),
    Delete(DeleteRequest),
}

impl StagedWrite {
    pub fn key(&self) -> &ContextKey {
        match self {
            Self::Put(req) => &req.key,
            Self::Delete(req) => &req.key,
        }
    }
}

/// Why a staged commit was abandoned. `index` names the staged write that
/// failed; `None` means the commit itself failed.
#[derive(Clone, Debug)]
pub struct TransactionError {
    pub index: Option<usize>,
    pub error: ContextError,
}

/// Durable key-value persistence keyed by `(level, id)`.
///
/// Every successful `put`/`delete` appends its version record before
/// returning, inside the same storage transaction.
pub trait ContextStore: Send + Sync {
    fn get(&self, key: &ContextKey) -> Result<Context>;

    /// Conditional write. Returns every committed change: auto-created
    /// ancestors first, the target last.
    fn put(&self, req: &PutRequest) -> Result<Vec<Change>>;

    /// Returns every deleted context, deepest descendants first.
    fn delete(&self, req: &DeleteRequest) -> Result<Vec<Change>>;

    /// Direct children of `key`.
    fn children(&self, key: &ContextKey) -> Result<Vec<Context>>;

    /// Every context below `key`, deepest level first.
    fn descendants(&self, key: &ContextKey) -> Result<Vec<Context>>;

    fn list(&self, level: Level, limit: usize) -> Result<Vec<Context>>;

    /// Apply every write or none. Results are per staged write, in order.
    /// Past `deadline`, nothing is committed and the error is `DeadlineExceeded`.
    fn apply_transaction(
        &self,
        writes: &[StagedWrite],
        deadline: Option<Instant>,
    ) -> Result<Vec<Vec<Change>>, TransactionError>;
}

/// Read and maintenance side of the append-only version history.
pub trait VersionLog: Send + Sync {
    /// Records in ascending sequence order.
    fn history(&self, key: &ContextKey, limit: usize, offset: usize) -> Result<Vec<VersionRecord>>;

    fn record_at(&self, key: &ContextKey, sequence: u64) -> Result<VersionRecord>;

    fn mark_milestone(&self, key: &ContextKey, sequence: u64) -> Result<VersionRecord>;

    /// Remove records older than `older_than`. Never removes the latest
    /// record of a key; milestones are kept when `keep_milestones` is set.
    fn prune(&self, key: &ContextKey, keep_milestones: bool, older_than: DateTime<Utc>) -> Result<usize>;
}
