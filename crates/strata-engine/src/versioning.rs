use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::instrument;

use strata_core::{
    ChangeType, Context, ContextDiff, ContextError, ContextKey, Principal, PutRequest, Result, VersionLog,
    VersionRecord,
};

/// History queries and rollback planning over a [`VersionLog`]. Records are
/// appended by the store itself; nothing here edits history except pruning.
pub struct VersionManager {
    log: Arc<dyn VersionLog>,
}

impl VersionManager {
    pub fn new(log: Arc<dyn VersionLog>) -> Self {
        Self { log }
    }

    pub fn history(&self, key: &ContextKey, limit: usize, offset: usize) -> Result<Vec<VersionRecord>> {
        self.log.history(key, limit, offset)
    }

    pub fn record_at(&self, key: &ContextKey, sequence: u64) -> Result<VersionRecord> {
        self.log.record_at(key, sequence)
    }

    /// Top-level payload differences from `from_seq` to `to_seq`.
    pub fn diff(&self, key: &ContextKey, from_seq: u64, to_seq: u64) -> Result<ContextDiff> {
        let from = self.log.record_at(key, from_seq)?;
        let to = self.log.record_at(key, to_seq)?;
        Ok(ContextDiff::between(from_seq, &from.payload, to_seq, &to.payload))
    }

    /// The write that restores `target_seq`'s snapshot over `current`.
    /// Executing it is an ordinary conditional put.
    pub fn rollback_request(
        &self,
        current: &Context,
        target_seq: u64,
        reason: Option<&str>,
        author: Principal,
    ) -> Result<PutRequest> {
        let target = self.log.record_at(&current.key, target_seq)?;
        if target.change_type == ChangeType::Delete {
            return Err(ContextError::validation(
                Some(&current.key),
                format!("sequence {target_seq} records a delete and cannot be restored"),
            ));
        }
        let summary = match reason {
            Some(reason) => format!("rollback to #{target_seq}: {reason}"),
            None => format!("rollback to #{target_seq}"),
        };
        let mut req = PutRequest::update(current.key.clone(), target.payload, current.version, author)
            .with_summary(summary);
        req.change_type = ChangeType::Rollback;
        Ok(req)
    }

    #[instrument(skip(self), fields(key = %key))]
    pub fn mark_milestone(&self, key: &ContextKey, sequence: u64) -> Result<VersionRecord> {
        self.log.mark_milestone(key, sequence)
    }

    #[instrument(skip(self), fields(key = %key))]
    pub fn prune(&self, key: &ContextKey, keep_milestones: bool, older_than: DateTime<Utc>) -> Result<usize> {
        self.log.prune(key, keep_milestones, older_than)
    }
}
