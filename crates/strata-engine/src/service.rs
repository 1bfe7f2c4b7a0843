//! `ContextService`: every component built from explicit settings and wired
//! together behind one handle.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use strata_core::{
    Context, ContextDiff, ContextError, ContextKey, ContextStore, DeleteRequest, Level, Lineage, Payload,
    Principal, PutRequest, Result, StrataSettings, SubscriptionId, VersionLog, VersionRecord,
};
use strata_store::{Database, SqliteContextStore, SqliteVersionLog};

use crate::batch::{BatchExecutor, BatchReport, BatchRequest};
use crate::cache::{CacheLayer, CacheStats, MemoryCacheBackend};
use crate::notify::{EventFilter, NotificationPublisher, Subscription, SubscriptionScope};
use crate::resolver::{MergedView, Resolver};
use crate::search::{SearchEngine, SearchHit, SearchQuery};
use crate::versioning::VersionManager;
use crate::write::WritePath;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolveOptions {
    pub include_inherited: bool,
    /// Create missing PROJECT/BRANCH ancestors with empty payloads.
    pub auto_create_ancestors: bool,
    /// Ancestor ids used when a missing ancestor has to be created.
    pub lineage: Lineage,
}

impl ResolveOptions {
    pub fn inherited() -> Self {
        Self {
            include_inherited: true,
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub store_ok: bool,
    pub cache: CacheStats,
    pub subscribers: usize,
}

pub struct ContextService {
    store: Arc<dyn ContextStore>,
    cache: Arc<CacheLayer>,
    writes: Arc<WritePath>,
    batch: BatchExecutor,
    versions: VersionManager,
    publisher: Arc<NotificationPublisher>,
    search: Arc<SearchEngine>,
}

impl ContextService {
    /// Build the service over an open database.
    pub fn init(settings: &StrataSettings, db: Database) -> Self {
        let store: Arc<dyn ContextStore> = Arc::new(SqliteContextStore::new(db.clone()));
        let log: Arc<dyn VersionLog> = Arc::new(SqliteVersionLog::new(db));
        Self::with_parts(settings, store, log)
    }

    /// Build the service over any store and version log.
    pub fn with_parts(settings: &StrataSettings, store: Arc<dyn ContextStore>, log: Arc<dyn VersionLog>) -> Self {
        let cache = Arc::new(CacheLayer::new(
            Arc::clone(&store),
            Resolver::default(),
            Arc::new(MemoryCacheBackend::new()),
            settings.cache.clone(),
        ));
        let publisher = Arc::new(NotificationPublisher::new(settings.notify.subscriber_buffer));
        let writes = Arc::new(WritePath::new(
            Arc::clone(&store),
            Arc::clone(&cache),
            Arc::clone(&publisher),
            settings.validation.clone(),
        ));
        let batch = BatchExecutor::new(
            Arc::clone(&writes),
            settings.batch.max_parallelism,
            settings.batch.default_deadline_ms.map(Duration::from_millis),
        );
        let search = Arc::new(SearchEngine::new(Arc::clone(&store), settings.search.default_limit));
        info!(
            cache_enabled = settings.cache.enabled,
            max_parallelism = settings.batch.max_parallelism,
            "context service initialized"
        );
        Self {
            store,
            cache,
            writes,
            batch,
            versions: VersionManager::new(log),
            publisher,
            search,
        }
    }

    pub fn get(&self, key: &ContextKey) -> Result<Context> {
        self.cache.get(key)
    }

    /// Conditional write. Returns the target context as written.
    pub fn put(&self, req: &PutRequest) -> Result<Context> {
        let changes = self.writes.put(req)?;
        changes
            .into_iter()
            .next_back()
            .map(|change| change.context)
            .ok_or_else(|| ContextError::Storage(format!("put of {} reported no change", req.key)))
    }

    /// Returns the deleted contexts, descendants first.
    pub fn delete(&self, req: &DeleteRequest) -> Result<Vec<Context>> {
        let changes = self.writes.delete(req)?;
        Ok(changes.into_iter().map(|c| c.context).collect())
    }

    /// Own or inherited view of `key`. With `auto_create_ancestors`, each
    /// missing PROJECT/BRANCH ancestor is created empty and resolution retried.
    #[instrument(skip(self, opts), fields(key = %key, inherited = opts.include_inherited))]
    pub fn resolve(&self, key: &ContextKey, opts: &ResolveOptions) -> Result<MergedView> {
        // One retry per ancestor level at most.
        for _ in 0..Level::ALL.len() {
            match self.cache.get_or_resolve(key, opts.include_inherited) {
                Err(ContextError::MissingAncestor { level, id: Some(id) })
                    if opts.auto_create_ancestors && level != Level::Global =>
                {
                    self.create_ancestor(ContextKey::new(level, id), &opts.lineage)?;
                }
                other => return other,
            }
        }
        self.cache.get_or_resolve(key, opts.include_inherited)
    }

    fn create_ancestor(&self, key: ContextKey, lineage: &Lineage) -> Result<()> {
        info!(key = %key, "auto-creating missing ancestor");
        let req = PutRequest::create(key, Payload::new(), Principal::system())
            .with_lineage(lineage.clone())
            .auto_create(true)
            .with_summary("auto-created ancestor");
        match self.writes.put(&req) {
            // Another writer created it first.
            Ok(_) | Err(ContextError::VersionConflict { expected: 0, .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Partial failures of non-transactional batches are reported, not raised.
    pub async fn batch(&self, req: BatchRequest) -> Result<BatchReport> {
        self.batch.execute(req).await
    }

    pub fn subscribe(&self, scope: SubscriptionScope, scope_id: &str, filter: EventFilter) -> Result<Subscription> {
        self.publisher.subscribe(scope, scope_id, filter)
    }

    pub fn unsubscribe(&self, id: &SubscriptionId) -> bool {
        self.publisher.unsubscribe(id)
    }

    pub fn history(&self, key: &ContextKey, limit: usize, offset: usize) -> Result<Vec<VersionRecord>> {
        self.versions.history(key, limit, offset)
    }

    pub fn diff(&self, key: &ContextKey, from_seq: u64, to_seq: u64) -> Result<ContextDiff> {
        self.versions.diff(key, from_seq, to_seq)
    }

    /// Restore the payload recorded at `target_seq` as a new version.
    #[instrument(skip(self, reason, author), fields(key = %key, target_seq))]
    pub fn rollback(
        &self,
        key: &ContextKey,
        target_seq: u64,
        reason: Option<&str>,
        author: Principal,
    ) -> Result<Context> {
        let current = self.cache.get(key)?;
        let req = self.versions.rollback_request(&current, target_seq, reason, author)?;
        self.put(&req)
    }

    pub fn mark_milestone(&self, key: &ContextKey, sequence: u64) -> Result<VersionRecord> {
        self.versions.mark_milestone(key, sequence)
    }

    pub fn prune(&self, key: &ContextKey, keep_milestones: bool, older_than: DateTime<Utc>) -> Result<usize> {
        self.versions.prune(key, keep_milestones, older_than)
    }

    pub async fn search(&self, query: SearchQuery) -> Result<Vec<SearchHit>> {
        let budget = query.deadline_ms.map(Duration::from_millis);
        let deadline = budget.map(|d| Instant::now() + d);
        let engine = Arc::clone(&self.search);
        let task = tokio::task::spawn_blocking(move || engine.search(&query, deadline));
        let joined = match budget {
            Some(budget) => tokio::time::timeout(budget, task)
                .await
                .map_err(|_| ContextError::DeadlineExceeded)?,
            None => task.await,
        };
        joined.map_err(|e| ContextError::Storage(format!("search task failed: {e}")))?
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn health(&self) -> HealthReport {
        let store_ok = match self.store.list(Level::Global, 1) {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "store health probe failed");
                false
            }
        };
        HealthReport {
            store_ok,
            cache: self.cache.stats(),
            subscribers: self.publisher.subscriber_count(),
        }
    }

    pub fn publisher(&self) -> &Arc<NotificationPublisher> {
        &self.publisher
    }

    /// Drop every subscription and empty the cache.
    pub fn shutdown(&self) {
        self.publisher.shutdown();
        self.cache.clear();
        info!("context service shut down");
    }
}
